// CUDA memory pool — caching allocator for device buffer reuse
//
// Repeated kernel invocations allocate and release identically sized
// buffers; going through cudaMalloc/cudaFree each time dominates small
// workloads. The pool keeps per-type free lists keyed by element count:
// a released buffer is cached, and the next allocation of the same type
// and size pops it instead of calling into the driver.
//
// `empty_cache` (and device detach) drains every list and actually frees
// the memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use cudarc::driver::{CudaSlice, DeviceSlice};

/// Snapshot of the pool's allocation statistics.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Bytes currently cached (not in use by tensors).
    pub cached_bytes: usize,
    /// Number of buffers currently cached.
    pub cached_buffers: usize,
    /// Allocations served from the cache.
    pub hits: u64,
    /// Allocations that fell through to cudaMalloc.
    pub misses: u64,
}

/// Per-type free list: element count → stack of free buffers.
struct TypedPool<T> {
    buckets: Mutex<HashMap<usize, Vec<CudaSlice<T>>>>,
}

impl<T> TypedPool<T> {
    fn new() -> Self {
        TypedPool {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn try_pop(&self, n: usize) -> Option<CudaSlice<T>> {
        self.buckets.lock().unwrap().get_mut(&n)?.pop()
    }

    fn push(&self, slice: CudaSlice<T>)
    where
        CudaSlice<T>: DeviceSlice<T>,
    {
        let n = slice.len();
        self.buckets.lock().unwrap().entry(n).or_default().push(slice);
    }

    fn drain(&self) {
        self.buckets.lock().unwrap().drain().for_each(drop);
    }

    fn stats(&self) -> (usize, usize) {
        let map = self.buckets.lock().unwrap();
        let mut count = 0usize;
        let mut elems = 0usize;
        for (n, stack) in map.iter() {
            count += stack.len();
            elems += *n * stack.len();
        }
        (count, elems)
    }
}

/// The caching allocator. One free list per storage element type
/// (f16 buffers are stored as u16 device-side).
pub struct CudaMemPool {
    pool_u16: TypedPool<u16>,
    pool_f32: TypedPool<f32>,
    pool_f64: TypedPool<f64>,
    hits: AtomicU64,
    misses: AtomicU64,
}

macro_rules! pool_alloc {
    ($fn_name:ident, $zeros_name:ident, $field:ident, $ty:ty) => {
        /// Allocate `n` elements, reusing a cached buffer when one fits.
        /// The returned buffer content is undefined.
        pub fn $fn_name(
            &self,
            dev: &std::sync::Arc<cudarc::driver::CudaDevice>,
            n: usize,
        ) -> std::result::Result<CudaSlice<$ty>, cudarc::driver::DriverError> {
            if let Some(buf) = self.$field.try_pop(n) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(buf)
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                unsafe { dev.alloc::<$ty>(n) }
            }
        }

        /// Allocate `n` elements and zero them.
        pub fn $zeros_name(
            &self,
            dev: &std::sync::Arc<cudarc::driver::CudaDevice>,
            n: usize,
        ) -> std::result::Result<CudaSlice<$ty>, cudarc::driver::DriverError> {
            if let Some(mut buf) = self.$field.try_pop(n) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                dev.memset_zeros(&mut buf)?;
                Ok(buf)
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                dev.alloc_zeros::<$ty>(n)
            }
        }
    };
}

impl CudaMemPool {
    pub fn new() -> Self {
        CudaMemPool {
            pool_u16: TypedPool::new(),
            pool_f32: TypedPool::new(),
            pool_f64: TypedPool::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pool_alloc!(alloc_u16, alloc_zeros_u16, pool_u16, u16);
    pool_alloc!(alloc_f32, alloc_zeros_f32, pool_f32, f32);
    pool_alloc!(alloc_f64, alloc_zeros_f64, pool_f64, f64);

    pub fn reclaim_u16(&self, s: CudaSlice<u16>) {
        self.pool_u16.push(s);
    }
    pub fn reclaim_f32(&self, s: CudaSlice<f32>) {
        self.pool_f32.push(s);
    }
    pub fn reclaim_f64(&self, s: CudaSlice<f64>) {
        self.pool_f64.push(s);
    }

    /// Return a storage's buffer to the pool for future reuse.
    pub fn reclaim_storage(&self, storage: super::CudaStorage) {
        match storage {
            super::CudaStorage::F16(s) => self.pool_u16.push(s),
            super::CudaStorage::F32(s) => self.pool_f32.push(s),
            super::CudaStorage::F64(s) => self.pool_f64.push(s),
        }
    }

    /// Release all cached buffers back to the driver.
    pub fn empty_cache(&self) {
        self.pool_u16.drain();
        self.pool_f32.drain();
        self.pool_f64.drain();
    }

    pub fn stats(&self) -> PoolStats {
        let (c16, e16) = self.pool_u16.stats();
        let (c32, e32) = self.pool_f32.stats();
        let (c64, e64) = self.pool_f64.stats();
        PoolStats {
            cached_bytes: e16 * 2 + e32 * 4 + e64 * 8,
            cached_buffers: c16 + c32 + c64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for CudaMemPool {
    fn default() -> Self {
        Self::new()
    }
}
