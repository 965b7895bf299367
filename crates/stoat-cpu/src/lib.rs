//! # stoat-cpu
//!
//! Multi-core host backend for Stoat. Kernels run synchronously on the
//! calling thread, parallelized across cores with rayon where the access
//! pattern allows; a call returns only once results are visible in the
//! output tensor. Window accumulation happens in f64 and is rounded to
//! the tensor dtype on store, which keeps this backend usable as the
//! tighter-tolerance reference path.

mod conv;
mod plan;
mod pool;

use half::f16;
use stoat_core::backend::{Backend, BackendDevice, BackendStorage};
use stoat_core::{ConvLayer, DType, Error, Layout, Plan, PoolLayer, Result, Shape};

/// The host device. Stateless: all host memory belongs to one device.
#[derive(Debug, Clone, Default)]
pub struct CpuDevice;

impl CpuDevice {
    pub fn new() -> Self {
        CpuDevice
    }
}

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }

    fn synchronize(&self) -> Result<()> {
        // Host kernels are synchronous; nothing is ever in flight.
        Ok(())
    }
}

/// Host-side storage: one contiguous Vec per element type.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    F16(Vec<f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl CpuStorage {
    /// Copy the raw buffer out as f64, one entry per storage element.
    pub(crate) fn to_f64_buffer(&self) -> Vec<f64> {
        match self {
            CpuStorage::F16(v) => v.iter().map(|x| x.to_f64()).collect(),
            CpuStorage::F32(v) => v.iter().map(|&x| x as f64).collect(),
            CpuStorage::F64(v) => v.clone(),
        }
    }

    pub(crate) fn from_f64_buffer(data: Vec<f64>, dtype: DType) -> CpuStorage {
        match dtype {
            DType::F16 => CpuStorage::F16(data.iter().map(|&x| f16::from_f64(x)).collect()),
            DType::F32 => CpuStorage::F32(data.iter().map(|&x| x as f32).collect()),
            DType::F64 => CpuStorage::F64(data),
        }
    }
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F16(v) => v.len(),
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
        }
    }
}

/// The host backend marker type.
#[derive(Debug, Clone)]
pub struct CpuBackend;

/// Convenience alias for host tensors.
pub type CpuTensor = stoat_core::Tensor<CpuBackend>;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        Ok(match dtype {
            DType::F16 => CpuStorage::F16(vec![f16::from_f64(0.0); n]),
            DType::F32 => CpuStorage::F32(vec![0.0; n]),
            DType::F64 => CpuStorage::F64(vec![0.0; n]),
        })
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64_buffer(data.to_vec(), dtype))
    }

    fn to_f64_vec(storage: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        let out = match storage {
            CpuStorage::F16(v) => layout.strided_indices().map(|i| v[i].to_f64()).collect(),
            CpuStorage::F32(v) => layout.strided_indices().map(|i| v[i] as f64).collect(),
            CpuStorage::F64(v) => layout.strided_indices().map(|i| v[i]).collect(),
        };
        Ok(out)
    }

    fn fprop_conv(
        desc: &ConvLayer,
        i: &CpuStorage,
        f: &CpuStorage,
        o: &mut CpuStorage,
        _device: &CpuDevice,
    ) -> Result<()> {
        match (i, f, o) {
            (CpuStorage::F16(i), CpuStorage::F16(f), CpuStorage::F16(o)) => {
                conv::fprop(desc, i, f, o)
            }
            (CpuStorage::F32(i), CpuStorage::F32(f), CpuStorage::F32(o)) => {
                conv::fprop(desc, i, f, o)
            }
            _ => Err(mixed_dtype("fprop_conv")),
        }
    }

    fn bprop_conv(
        desc: &ConvLayer,
        f: &CpuStorage,
        e: &CpuStorage,
        b: &mut CpuStorage,
        _device: &CpuDevice,
    ) -> Result<()> {
        match (f, e, b) {
            (CpuStorage::F16(f), CpuStorage::F16(e), CpuStorage::F16(b)) => {
                conv::bprop(desc, f, e, b)
            }
            (CpuStorage::F32(f), CpuStorage::F32(e), CpuStorage::F32(b)) => {
                conv::bprop(desc, f, e, b)
            }
            _ => Err(mixed_dtype("bprop_conv")),
        }
    }

    fn update_conv(
        desc: &ConvLayer,
        i: &CpuStorage,
        e: &CpuStorage,
        u: &mut CpuStorage,
        _device: &CpuDevice,
    ) -> Result<()> {
        match (i, e, u) {
            (CpuStorage::F16(i), CpuStorage::F16(e), CpuStorage::F16(u)) => {
                conv::update(desc, i, e, u)
            }
            (CpuStorage::F32(i), CpuStorage::F32(e), CpuStorage::F32(u)) => {
                conv::update(desc, i, e, u)
            }
            _ => Err(mixed_dtype("update_conv")),
        }
    }

    fn fprop_pool(
        desc: &PoolLayer,
        i: &CpuStorage,
        o: &mut CpuStorage,
        _device: &CpuDevice,
    ) -> Result<()> {
        match (i, o) {
            (CpuStorage::F16(i), CpuStorage::F16(o)) => pool::fprop(desc, i, o),
            (CpuStorage::F32(i), CpuStorage::F32(o)) => pool::fprop(desc, i, o),
            _ => Err(mixed_dtype("fprop_pool")),
        }
    }

    fn bprop_pool(
        desc: &PoolLayer,
        i: &CpuStorage,
        e: &CpuStorage,
        b: &mut CpuStorage,
        _device: &CpuDevice,
    ) -> Result<()> {
        match (i, e, b) {
            (CpuStorage::F16(i), CpuStorage::F16(e), CpuStorage::F16(b)) => {
                pool::bprop(desc, i, e, b)
            }
            (CpuStorage::F32(i), CpuStorage::F32(e), CpuStorage::F32(b)) => {
                pool::bprop(desc, i, e, b)
            }
            _ => Err(mixed_dtype("bprop_pool")),
        }
    }

    fn run_plan(
        plan: &Plan,
        leaves: &[(&CpuStorage, &Layout)],
        _device: &CpuDevice,
    ) -> Result<CpuStorage> {
        plan::run(plan, leaves)
    }
}

fn mixed_dtype(kernel: &str) -> Error {
    Error::unsupported(format!("{kernel}: tensor dtypes disagree with the descriptor"))
}
