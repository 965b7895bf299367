use crate::conv::ConvLayer;
use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::optree::Plan;
use crate::pool::PoolLayer;
use crate::shape::Shape;
use std::fmt;

// Backend — abstraction over the two compute devices
//
// Every backend implements this trait with its own device and storage
// types; callers are generic over `B: Backend` and never branch on which
// device they are talking to. Both implementations must produce
// numerically consistent results for identical logical inputs — that
// contract, not performance, is what the trait surface is shaped around.
//
// All kernel calls are synchronous from the caller's point of view: a
// method returns only once results are visible in the output storage.

/// Identifies a compute device (e.g. "cpu", "cuda:0").
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device.
    fn name(&self) -> String;

    /// Block until all previously issued work on this device is complete.
    /// A no-op on synchronous devices.
    fn synchronize(&self) -> Result<()>;

    /// Whether two handles refer to the same physical device.
    fn same_device(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

/// A storage buffer holding tensor elements on a specific device.
pub trait BackendStorage: Send + Sync + 'static {
    /// The element type stored in this buffer.
    fn dtype(&self) -> DType;

    /// Number of elements in this buffer.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The capability interface both devices implement: allocation, host
/// interchange, the convolution/pooling kernels, and execution of
/// compiled operation-tree plans.
pub trait Backend: Clone + fmt::Debug + Send + Sync + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    // Creation and data movement

    /// Allocate zero-filled storage.
    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Copy host data in, converting to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Copy data out to the host, following the given layout.
    fn to_f64_vec(storage: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;

    // Convolution kernels
    //
    // Tensors are contiguous in the descriptor's dimI/dimF/dimO order; the
    // entry points in `crate::kernels` validate that before dispatching
    // here.

    /// Forward convolution. Overwrites `o` entirely.
    fn fprop_conv(
        desc: &ConvLayer,
        i: &Self::Storage,
        f: &Self::Storage,
        o: &mut Self::Storage,
        device: &Self::Device,
    ) -> Result<()>;

    /// Input-gradient pass. Accumulates into caller-zeroed `b`.
    fn bprop_conv(
        desc: &ConvLayer,
        f: &Self::Storage,
        e: &Self::Storage,
        b: &mut Self::Storage,
        device: &Self::Device,
    ) -> Result<()>;

    /// Filter-gradient pass. Accumulates into caller-zeroed `u`.
    fn update_conv(
        desc: &ConvLayer,
        i: &Self::Storage,
        e: &Self::Storage,
        u: &mut Self::Storage,
        device: &Self::Device,
    ) -> Result<()>;

    // Pooling kernels

    /// Forward pooling. Overwrites `o` entirely.
    fn fprop_pool(
        desc: &PoolLayer,
        i: &Self::Storage,
        o: &mut Self::Storage,
        device: &Self::Device,
    ) -> Result<()>;

    /// Backward pooling. Zeroes `b` before scattering, so repeated calls
    /// with the same inputs produce the same result.
    fn bprop_pool(
        desc: &PoolLayer,
        i: &Self::Storage,
        e: &Self::Storage,
        b: &mut Self::Storage,
        device: &Self::Device,
    ) -> Result<()>;

    // Operation-tree execution

    /// Run a compiled plan against leaf views, returning the storage of
    /// the root slot (contiguous, in the plan's dtype).
    fn run_plan(
        plan: &Plan,
        leaves: &[(&Self::Storage, &Layout)],
        device: &Self::Device,
    ) -> Result<Self::Storage>;
}
