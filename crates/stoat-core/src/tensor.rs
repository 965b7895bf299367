use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backend::{Backend, BackendDevice, BackendStorage};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// Tensor — a typed, strided handle onto device-resident storage
//
// The handle (Tensor) is separate from the data (TensorInner) so cloning
// is an Arc bump and views can share one buffer. Shape is immutable after
// creation; kernels mutate the buffer in place through the storage lock.
// Tensors never alias across backends — moving data between devices is an
// explicit host round-trip.

struct TensorInner<B: Backend> {
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
}

/// An n-dimensional array on a specific backend.
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={})",
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device.name(),
        )
    }
}

impl<B: Backend> Tensor<B> {
    pub(crate) fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
            }),
        }
    }

    /// Allocate a zero-filled tensor.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    /// Copy host data in. The data length must match the shape's element
    /// count.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// Read access to the underlying storage.
    pub fn storage(&self) -> RwLockReadGuard<'_, B::Storage> {
        self.inner.storage.read().unwrap()
    }

    /// Write access to the underlying storage (kernel outputs).
    pub fn storage_mut(&self) -> RwLockWriteGuard<'_, B::Storage> {
        self.inner.storage.write().unwrap()
    }

    // Views

    /// Transposed view: swaps two dimensions without copying. The view
    /// shares storage with `self`.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let layout = self.inner.layout.transpose(dim0, dim1)?;
        Ok(Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
            }),
        })
    }

    // Host interchange

    /// Copy the tensor's elements out to the host in logical order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.storage();
        B::to_f64_vec(&storage, &self.inner.layout)
    }

    /// Scalar value of a one-element tensor.
    pub fn to_scalar(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::msg(format!(
                "not a scalar: tensor has shape {}",
                self.shape()
            )));
        }
        Ok(self.to_f64_vec()?[0])
    }

    /// Check that storage length covers the layout, a cheap internal
    /// consistency assertion used by kernel entry points.
    pub(crate) fn check_storage(&self) -> Result<()> {
        let len = self.storage().len();
        if len < self.inner.layout.elem_count() {
            return Err(Error::device(format!(
                "storage holds {} elements, layout needs {}",
                len,
                self.inner.layout.elem_count()
            )));
        }
        Ok(())
    }
}
