//! # stoat-cuda
//!
//! CUDA accelerator backend for Stoat. All static kernels are compiled to
//! PTX via NVRTC when a device is created; fused elementwise kernels are
//! generated per plan and cached by source hash. Device buffers come from
//! a caching memory pool, and every kernel entry point synchronizes before
//! returning, so results are host-visible when a call completes.
//!
//! The crate builds without a CUDA toolkit (the driver library is loaded
//! at runtime); creating a [`CudaDevice`] on a machine without one fails
//! with a device error rather than at link time.

mod codegen;
mod kernels;
pub mod pool;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cudarc::driver::{CudaSlice, DevicePtr, DeviceSlice, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};
use half::f16;
use log::{debug, trace};

use pool::CudaMemPool;
use stoat_core::backend::{Backend, BackendDevice, BackendStorage};
use stoat_core::{
    ConvLayer, DType, Error, Layout, Plan, PoolLayer, PoolOp, Result, Shape, Step, ValueRef,
};

// CudaDevice

/// An accelerator device handle: the cudarc device, the compiled kernel
/// module, the memory pool, and the fused-kernel cache. Cloning shares
/// all of them.
pub struct CudaDevice {
    dev: Arc<cudarc::driver::CudaDevice>,
    pool: Arc<CudaMemPool>,
    fused: Arc<Mutex<HashMap<u64, String>>>,
    detached: Arc<AtomicBool>,
    ordinal: usize,
}

impl CudaDevice {
    /// Open GPU `ordinal` and compile the kernel module.
    pub fn new(ordinal: usize) -> Result<Self> {
        let dev = cudarc::driver::CudaDevice::new(ordinal)
            .map_err(|e| Error::device(format!("CUDA device creation failed: {e}")))?;

        // Target the device's own architecture with native SASS so the
        // PTX version never outruns the driver.
        let start = std::time::Instant::now();
        let major = dev
            .attribute(cudarc::driver::sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .unwrap_or(8);
        let minor = dev
            .attribute(cudarc::driver::sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .unwrap_or(9);
        let arch: &'static str = Box::leak(format!("sm_{major}{minor}").into_boxed_str());
        let opts = CompileOptions {
            arch: Some(arch),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(kernels::KERNEL_SOURCE, opts)
            .map_err(|e| Error::device(format!("NVRTC compilation failed: {e}")))?;
        dev.load_ptx(ptx, kernels::MODULE_NAME, kernels::KERNEL_NAMES)
            .map_err(|e| Error::device(format!("PTX load failed: {e}")))?;
        debug!(
            "cuda:{ordinal}: compiled {} kernels for sm_{major}{minor} in {:?}",
            kernels::KERNEL_NAMES.len(),
            start.elapsed()
        );

        Ok(CudaDevice {
            dev,
            pool: Arc::new(CudaMemPool::new()),
            fused: Arc::new(Mutex::new(HashMap::new())),
            detached: Arc::new(AtomicBool::new(false)),
            ordinal,
        })
    }

    /// The underlying cudarc device handle.
    pub fn device(&self) -> &Arc<cudarc::driver::CudaDevice> {
        &self.dev
    }

    /// The caching allocator.
    pub fn pool(&self) -> &CudaMemPool {
        &self.pool
    }

    /// Release all cached device memory back to the driver.
    pub fn empty_cache(&self) {
        self.pool.empty_cache();
    }

    pub fn pool_stats(&self) -> pool::PoolStats {
        self.pool.stats()
    }

    /// Return a storage buffer to the pool for future reuse.
    pub fn reclaim(&self, storage: CudaStorage) {
        self.pool.reclaim_storage(storage);
    }

    /// Release device resources. Idempotent: the first call drains the
    /// memory pool and synchronizes outstanding work, later calls are
    /// no-ops.
    pub fn detach(&self) -> Result<()> {
        if self.detached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.dev
            .synchronize()
            .map_err(|e| Error::device(format!("synchronize on detach: {e}")))?;
        self.pool.empty_cache();
        debug!("cuda:{}: detached", self.ordinal);
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(Error::device("device has been detached"));
        }
        Ok(())
    }

    fn get_func(&self, name: &str) -> Result<cudarc::driver::CudaFunction> {
        self.dev
            .get_func(kernels::MODULE_NAME, name)
            .ok_or_else(|| Error::device(format!("CUDA kernel '{name}' not found")))
    }

    /// Compile (or fetch from cache) the fused kernel for one Map step.
    fn fused_func(&self, src: &str) -> Result<cudarc::driver::CudaFunction> {
        let key = codegen::source_hash(src);
        let mut cache = self.fused.lock().unwrap();
        if let Some(module) = cache.get(&key) {
            trace!("fused kernel cache hit: {module}");
            if let Some(func) = self.dev.get_func(module, codegen::FUSED_FN) {
                return Ok(func);
            }
        }
        let module = format!("fused_{key:016x}");
        let ptx = compile_ptx_with_opts(src, CompileOptions::default())
            .map_err(|e| Error::device(format!("NVRTC fused compile failed: {e}")))?;
        self.dev
            .load_ptx(ptx, &module, &[codegen::FUSED_FN])
            .map_err(|e| Error::device(format!("fused PTX load failed: {e}")))?;
        debug!("compiled fused kernel {module}");
        let func = self
            .dev
            .get_func(&module, codegen::FUSED_FN)
            .ok_or_else(|| Error::device("fused kernel vanished after load"))?;
        cache.insert(key, module);
        Ok(func)
    }

    fn htod_i32(&self, vals: Vec<i32>) -> Result<CudaSlice<i32>> {
        self.dev
            .htod_copy(vals)
            .map_err(|e| Error::device(format!("htod: {e}")))
    }

    fn sync(&self) -> Result<()> {
        self.dev
            .synchronize()
            .map_err(|e| Error::device(format!("synchronize: {e}")))
    }
}

impl Clone for CudaDevice {
    fn clone(&self) -> Self {
        CudaDevice {
            dev: self.dev.clone(),
            pool: self.pool.clone(),
            fused: self.fused.clone(),
            detached: self.detached.clone(),
            ordinal: self.ordinal,
        }
    }
}

impl fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CudaDevice(cuda:{})", self.ordinal)
    }
}

impl BackendDevice for CudaDevice {
    fn name(&self) -> String {
        format!("cuda:{}", self.ordinal)
    }

    fn synchronize(&self) -> Result<()> {
        if self.detached.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.sync()
    }
}

// CudaStorage

/// Device-side storage. F16 is stored at the bit level as u16.
pub enum CudaStorage {
    F16(CudaSlice<u16>),
    F32(CudaSlice<f32>),
    F64(CudaSlice<f64>),
}

impl fmt::Debug for CudaStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CudaStorage::F16(s) => write!(f, "CudaStorage::F16(len={})", s.len()),
            CudaStorage::F32(s) => write!(f, "CudaStorage::F32(len={})", s.len()),
            CudaStorage::F64(s) => write!(f, "CudaStorage::F64(len={})", s.len()),
        }
    }
}

impl BackendStorage for CudaStorage {
    fn dtype(&self) -> DType {
        match self {
            CudaStorage::F16(_) => DType::F16,
            CudaStorage::F32(_) => DType::F32,
            CudaStorage::F64(_) => DType::F64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CudaStorage::F16(s) => s.len(),
            CudaStorage::F32(s) => s.len(),
            CudaStorage::F64(s) => s.len(),
        }
    }
}

impl CudaStorage {
    /// Raw device address, for the generated fused kernels.
    fn device_addr(&self) -> u64 {
        match self {
            CudaStorage::F16(s) => *s.device_ptr(),
            CudaStorage::F32(s) => *s.device_ptr(),
            CudaStorage::F64(s) => *s.device_ptr(),
        }
    }
}

/// Standard launch configuration for `n` elements.
fn launch_cfg(n: usize) -> LaunchConfig {
    const BLOCK: u32 = 256;
    let grid = (n as u32).div_ceil(BLOCK);
    LaunchConfig {
        block_dim: (BLOCK, 1, 1),
        grid_dim: (grid.max(1), 1, 1),
        shared_mem_bytes: 0,
    }
}

/// Conv geometry array shared by all three conv kernels.
fn conv_geometry(desc: &ConvLayer) -> Vec<i32> {
    let (d, h, w) = desc.dhw();
    let (t, r, s) = desc.trs();
    let (pd, ph, pw) = desc.padding();
    let (sd, sh, sw) = desc.strides();
    let (m, p, q) = desc.mpq();
    [
        desc.n(),
        desc.c(),
        desc.k(),
        d,
        h,
        w,
        t,
        r,
        s,
        pd,
        ph,
        pw,
        sd,
        sh,
        sw,
        m,
        p,
        q,
    ]
    .iter()
    .map(|&v| v as i32)
    .collect()
}

/// Pool geometry array shared by both pool kernels.
fn pool_geometry(desc: &PoolLayer) -> Vec<i32> {
    let (d, h, w) = desc.dhw();
    let (j, t, r, s) = desc.jtrs();
    let (pj, pd, ph, pw) = desc.padding();
    let (sj, sd, sh, sw) = desc.strides();
    let (k, m, p, q) = desc.kmpq();
    let op = match desc.op() {
        PoolOp::Max => 0,
        PoolOp::Avg => 1,
        PoolOp::L2 => 2,
    };
    let mut g: Vec<i32> = [
        desc.n(),
        desc.c(),
        d,
        h,
        w,
        j,
        t,
        r,
        s,
        pj,
        pd,
        ph,
        pw,
        sj,
        sd,
        sh,
        sw,
        k,
        m,
        p,
        q,
    ]
    .iter()
    .map(|&v| v as i32)
    .collect();
    g.push(op);
    g
}

/// The CUDA backend marker type.
#[derive(Clone, Debug)]
pub struct CudaBackend;

/// Convenience alias for accelerator tensors.
pub type CudaTensor = stoat_core::Tensor<CudaBackend>;

macro_rules! launch3 {
    ($device:expr, $name:expr, $n:expr, $a:expr, $b:expr, $out:expr, $g:expr) => {{
        let func = $device.get_func($name)?;
        unsafe { func.launch(launch_cfg($n), ($a, $b, $out, $g, $n as u32)) }
            .map_err(|e| Error::device(format!("launch {}: {e}", $name)))?;
    }};
}

impl Backend for CudaBackend {
    type Device = CudaDevice;
    type Storage = CudaStorage;

    fn zeros(shape: &Shape, dtype: DType, device: &CudaDevice) -> Result<CudaStorage> {
        device.ensure_active()?;
        let n = shape.elem_count();
        let storage = match dtype {
            DType::F16 => CudaStorage::F16(
                device
                    .pool
                    .alloc_zeros_u16(&device.dev, n)
                    .map_err(|e| Error::device(format!("alloc zeros f16: {e}")))?,
            ),
            DType::F32 => CudaStorage::F32(
                device
                    .pool
                    .alloc_zeros_f32(&device.dev, n)
                    .map_err(|e| Error::device(format!("alloc zeros f32: {e}")))?,
            ),
            DType::F64 => CudaStorage::F64(
                device
                    .pool
                    .alloc_zeros_f64(&device.dev, n)
                    .map_err(|e| Error::device(format!("alloc zeros f64: {e}")))?,
            ),
        };
        Ok(storage)
    }

    fn from_f64_slice(data: &[f64], dtype: DType, device: &CudaDevice) -> Result<CudaStorage> {
        device.ensure_active()?;
        match dtype {
            DType::F16 => {
                let host: Vec<u16> = data.iter().map(|&v| f16::from_f64(v).to_bits()).collect();
                let slice = device
                    .dev
                    .htod_copy(host)
                    .map_err(|e| Error::device(format!("htod f16: {e}")))?;
                Ok(CudaStorage::F16(slice))
            }
            DType::F32 => {
                let host: Vec<f32> = data.iter().map(|&v| v as f32).collect();
                let slice = device
                    .dev
                    .htod_copy(host)
                    .map_err(|e| Error::device(format!("htod f32: {e}")))?;
                Ok(CudaStorage::F32(slice))
            }
            DType::F64 => {
                let slice = device
                    .dev
                    .htod_copy(data.to_vec())
                    .map_err(|e| Error::device(format!("htod f64: {e}")))?;
                Ok(CudaStorage::F64(slice))
            }
        }
    }

    fn to_f64_vec(storage: &CudaStorage, layout: &Layout) -> Result<Vec<f64>> {
        // Copy the whole buffer down, then gather through the layout on
        // the host. Interchange is not a hot path.
        let host: Vec<f64> = match storage {
            CudaStorage::F16(s) => {
                let dev = s.device();
                let bits = dev
                    .dtoh_sync_copy(s)
                    .map_err(|e| Error::device(format!("dtoh f16: {e}")))?;
                bits.iter()
                    .map(|&b| f16::from_bits(b).to_f32() as f64)
                    .collect()
            }
            CudaStorage::F32(s) => {
                let dev = s.device();
                let vals = dev
                    .dtoh_sync_copy(s)
                    .map_err(|e| Error::device(format!("dtoh f32: {e}")))?;
                vals.iter().map(|&v| v as f64).collect()
            }
            CudaStorage::F64(s) => {
                let dev = s.device();
                dev.dtoh_sync_copy(s)
                    .map_err(|e| Error::device(format!("dtoh f64: {e}")))?
            }
        };
        Ok(layout.strided_indices().map(|i| host[i]).collect())
    }

    fn fprop_conv(
        desc: &ConvLayer,
        i: &CudaStorage,
        f: &CudaStorage,
        o: &mut CudaStorage,
        device: &CudaDevice,
    ) -> Result<()> {
        device.ensure_active()?;
        let g = device.htod_i32(conv_geometry(desc))?;
        let n_out = Shape::from(desc.dim_o()).elem_count();
        match (i, f, o) {
            (CudaStorage::F32(i), CudaStorage::F32(f), CudaStorage::F32(o)) => {
                launch3!(device, "conv_fprop_f32", n_out, i, f, o, &g)
            }
            (CudaStorage::F16(i), CudaStorage::F16(f), CudaStorage::F16(o)) => {
                launch3!(device, "conv_fprop_f16", n_out, i, f, o, &g)
            }
            _ => return Err(mixed_dtype("fprop_conv")),
        }
        device.sync()
    }

    fn bprop_conv(
        desc: &ConvLayer,
        f: &CudaStorage,
        e: &CudaStorage,
        b: &mut CudaStorage,
        device: &CudaDevice,
    ) -> Result<()> {
        device.ensure_active()?;
        let g = device.htod_i32(conv_geometry(desc))?;
        let n_in = Shape::from(desc.dim_i()).elem_count();
        match (f, e, b) {
            (CudaStorage::F32(f), CudaStorage::F32(e), CudaStorage::F32(b)) => {
                launch3!(device, "conv_bprop_f32", n_in, f, e, b, &g)
            }
            (CudaStorage::F16(f), CudaStorage::F16(e), CudaStorage::F16(b)) => {
                launch3!(device, "conv_bprop_f16", n_in, f, e, b, &g)
            }
            _ => return Err(mixed_dtype("bprop_conv")),
        }
        device.sync()
    }

    fn update_conv(
        desc: &ConvLayer,
        i: &CudaStorage,
        e: &CudaStorage,
        u: &mut CudaStorage,
        device: &CudaDevice,
    ) -> Result<()> {
        device.ensure_active()?;
        let g = device.htod_i32(conv_geometry(desc))?;
        let n_flt = Shape::from(desc.dim_f()).elem_count();
        match (i, e, u) {
            (CudaStorage::F32(i), CudaStorage::F32(e), CudaStorage::F32(u)) => {
                launch3!(device, "conv_update_f32", n_flt, i, e, u, &g)
            }
            (CudaStorage::F16(i), CudaStorage::F16(e), CudaStorage::F16(u)) => {
                launch3!(device, "conv_update_f16", n_flt, i, e, u, &g)
            }
            _ => return Err(mixed_dtype("update_conv")),
        }
        device.sync()
    }

    fn fprop_pool(
        desc: &PoolLayer,
        i: &CudaStorage,
        o: &mut CudaStorage,
        device: &CudaDevice,
    ) -> Result<()> {
        device.ensure_active()?;
        let g = device.htod_i32(pool_geometry(desc))?;
        let n_out = Shape::from(desc.dim_o()).elem_count();
        match (i, o) {
            (CudaStorage::F32(i), CudaStorage::F32(o)) => {
                let func = device.get_func("pool_fprop_f32")?;
                unsafe { func.launch(launch_cfg(n_out), (i, o, &g, n_out as u32)) }
                    .map_err(|e| Error::device(format!("launch pool_fprop_f32: {e}")))?;
            }
            (CudaStorage::F16(i), CudaStorage::F16(o)) => {
                let func = device.get_func("pool_fprop_f16")?;
                unsafe { func.launch(launch_cfg(n_out), (i, o, &g, n_out as u32)) }
                    .map_err(|e| Error::device(format!("launch pool_fprop_f16: {e}")))?;
            }
            _ => return Err(mixed_dtype("fprop_pool")),
        }
        device.sync()
    }

    fn bprop_pool(
        desc: &PoolLayer,
        i: &CudaStorage,
        e: &CudaStorage,
        b: &mut CudaStorage,
        device: &CudaDevice,
    ) -> Result<()> {
        device.ensure_active()?;
        let g = device.htod_i32(pool_geometry(desc))?;
        let n_in = Shape::from(desc.dim_i()).elem_count();
        match (i, e, b) {
            (CudaStorage::F32(i), CudaStorage::F32(e), CudaStorage::F32(b)) => {
                launch3!(device, "pool_bprop_f32", n_in, i, e, b, &g)
            }
            (CudaStorage::F16(i), CudaStorage::F16(e), CudaStorage::F16(b)) => {
                launch3!(device, "pool_bprop_f16", n_in, i, e, b, &g)
            }
            _ => return Err(mixed_dtype("bprop_pool")),
        }
        device.sync()
    }

    fn run_plan(
        plan: &Plan,
        leaves: &[(&CudaStorage, &Layout)],
        device: &CudaDevice,
    ) -> Result<CudaStorage> {
        device.ensure_active()?;
        let mut slots: Vec<Option<CudaStorage>> = (0..plan.slot_shapes.len()).map(|_| None).collect();

        let addr_of = |source: ValueRef, slots: &[Option<CudaStorage>]| -> Result<u64> {
            match source {
                ValueRef::Leaf(i) => Ok(leaves[i].0.device_addr()),
                ValueRef::Slot(s) => slots[s]
                    .as_ref()
                    .map(|st| st.device_addr())
                    .ok_or_else(|| Error::device(format!("slot {s} read before written"))),
            }
        };

        for step in &plan.steps {
            match step {
                Step::Map(map) => {
                    let src = codegen::map_kernel_source(map, plan.dtype);
                    let func = device.fused_func(&src)?;
                    let addrs: Vec<u64> = map
                        .inputs
                        .iter()
                        .map(|v| addr_of(v.source, &slots))
                        .collect::<Result<_>>()?;
                    let ptrs = device
                        .dev
                        .htod_copy(addrs)
                        .map_err(|e| Error::device(format!("htod ptrs: {e}")))?;
                    let n = map.out_shape.elem_count();
                    let mut out = alloc_storage(device, plan.dtype, n)?;
                    match &mut out {
                        CudaStorage::F16(o) => {
                            unsafe { func.launch(launch_cfg(n), (&ptrs, o, n as u32)) }
                        }
                        CudaStorage::F32(o) => {
                            unsafe { func.launch(launch_cfg(n), (&ptrs, o, n as u32)) }
                        }
                        CudaStorage::F64(o) => {
                            unsafe { func.launch(launch_cfg(n), (&ptrs, o, n as u32)) }
                        }
                    }
                    .map_err(|e| Error::device(format!("launch fused: {e}")))?;
                    slots[map.dst] = Some(out);
                }
                Step::Reduce {
                    op,
                    src,
                    axis,
                    out_shape,
                    dst,
                } => {
                    let rank = src.layout.rank();
                    let mut meta: Vec<i32> = vec![
                        rank as i32,
                        axis.map(|a| a as i32).unwrap_or(-1),
                        reduce_code(*op),
                        src.layout.offset() as i32,
                    ];
                    meta.extend(src.layout.dims().iter().map(|&d| d as i32));
                    meta.extend(src.layout.strides().iter().map(|&s| s as i32));
                    let meta = device.htod_i32(meta)?;
                    let n_out = out_shape.elem_count();
                    let src_storage: &CudaStorage = match src.source {
                        ValueRef::Leaf(i) => leaves[i].0,
                        ValueRef::Slot(s) => slots[s]
                            .as_ref()
                            .ok_or_else(|| Error::device("slot read before written"))?,
                    };
                    let mut out = alloc_storage(device, plan.dtype, n_out)?;
                    match (src_storage, &mut out) {
                        (CudaStorage::F32(s), CudaStorage::F32(o)) => {
                            let func = device.get_func("reduce_f32")?;
                            unsafe { func.launch(launch_cfg(n_out), (s, o, &meta, n_out as u32)) }
                        }
                        (CudaStorage::F64(s), CudaStorage::F64(o)) => {
                            let func = device.get_func("reduce_f64")?;
                            unsafe { func.launch(launch_cfg(n_out), (s, o, &meta, n_out as u32)) }
                        }
                        (CudaStorage::F16(s), CudaStorage::F16(o)) => {
                            let func = device.get_func("reduce_f16")?;
                            unsafe { func.launch(launch_cfg(n_out), (s, o, &meta, n_out as u32)) }
                        }
                        _ => return Err(mixed_dtype("reduce")),
                    }
                    .map_err(|e| Error::device(format!("launch reduce: {e}")))?;
                    slots[*dst] = Some(out);
                }
                Step::Dot {
                    lhs,
                    rhs,
                    out_shape,
                    dst,
                } => {
                    let m = lhs.layout.dims()[0];
                    let k = lhs.layout.dims()[1];
                    let n = rhs.layout.dims()[1];
                    let meta = device.htod_i32(vec![
                        m as i32,
                        k as i32,
                        n as i32,
                        lhs.layout.offset() as i32,
                        lhs.layout.strides()[0] as i32,
                        lhs.layout.strides()[1] as i32,
                        rhs.layout.offset() as i32,
                        rhs.layout.strides()[0] as i32,
                        rhs.layout.strides()[1] as i32,
                    ])?;
                    let n_out = out_shape.elem_count();
                    let l_storage: &CudaStorage = match lhs.source {
                        ValueRef::Leaf(i) => leaves[i].0,
                        ValueRef::Slot(s) => slots[s]
                            .as_ref()
                            .ok_or_else(|| Error::device("slot read before written"))?,
                    };
                    let r_storage: &CudaStorage = match rhs.source {
                        ValueRef::Leaf(i) => leaves[i].0,
                        ValueRef::Slot(s) => slots[s]
                            .as_ref()
                            .ok_or_else(|| Error::device("slot read before written"))?,
                    };
                    let mut out = alloc_storage(device, plan.dtype, n_out)?;
                    match (l_storage, r_storage, &mut out) {
                        (CudaStorage::F32(a), CudaStorage::F32(b), CudaStorage::F32(c)) => {
                            let func = device.get_func("matmul_f32")?;
                            unsafe { func.launch(launch_cfg(n_out), (a, b, c, &meta, n_out as u32)) }
                        }
                        (CudaStorage::F64(a), CudaStorage::F64(b), CudaStorage::F64(c)) => {
                            let func = device.get_func("matmul_f64")?;
                            unsafe { func.launch(launch_cfg(n_out), (a, b, c, &meta, n_out as u32)) }
                        }
                        (CudaStorage::F16(a), CudaStorage::F16(b), CudaStorage::F16(c)) => {
                            let func = device.get_func("matmul_f16")?;
                            unsafe { func.launch(launch_cfg(n_out), (a, b, c, &meta, n_out as u32)) }
                        }
                        _ => return Err(mixed_dtype("dot")),
                    }
                    .map_err(|e| Error::device(format!("launch matmul: {e}")))?;
                    slots[*dst] = Some(out);
                }
            }
        }

        let root = slots[plan.root]
            .take()
            .ok_or_else(|| Error::device("plan produced no root value"))?;
        // Intermediate buffers go back to the pool for the next plan.
        for slot in slots.into_iter().flatten() {
            device.pool.reclaim_storage(slot);
        }
        device.sync()?;
        Ok(root)
    }
}

fn alloc_storage(device: &CudaDevice, dtype: DType, n: usize) -> Result<CudaStorage> {
    Ok(match dtype {
        DType::F16 => CudaStorage::F16(
            device
                .pool
                .alloc_u16(&device.dev, n)
                .map_err(|e| Error::device(format!("alloc f16: {e}")))?,
        ),
        DType::F32 => CudaStorage::F32(
            device
                .pool
                .alloc_f32(&device.dev, n)
                .map_err(|e| Error::device(format!("alloc f32: {e}")))?,
        ),
        DType::F64 => CudaStorage::F64(
            device
                .pool
                .alloc_f64(&device.dev, n)
                .map_err(|e| Error::device(format!("alloc f64: {e}")))?,
        ),
    })
}

fn reduce_code(op: stoat_core::ReduceOp) -> i32 {
    use stoat_core::ReduceOp;
    match op {
        ReduceOp::Sum => 0,
        ReduceOp::Mean => 1,
        ReduceOp::Max => 2,
        ReduceOp::Min => 3,
        ReduceOp::Var => 4,
        ReduceOp::Std => 5,
    }
}

fn mixed_dtype(kernel: &str) -> Error {
    Error::unsupported(format!("{kernel}: tensor dtypes disagree with the descriptor"))
}
