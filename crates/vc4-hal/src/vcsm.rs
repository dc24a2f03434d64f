//! Allocator on top of the VideoCore shared memory service (`libvcsm.so`).
//!
//! Works without root. With the CMA flavour of the driver (`/dev/vcsm-cma`) allocations come
//! from the contiguous memory allocator and the total GPU memory is the CMA pool size.

use std::ffi::{c_int, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::backend::{DeviceMemory, SystemQueries, SystemQuery};
use crate::error::{HalError, HalResult};
use crate::memory::{
    BufferRelease, BufferRequest, CacheType, DeviceBuffer, DevicePointer, HostMemory,
};
use crate::userland::VcsmApi;

pub const VCSM_CMA_DEVICE: &str = "/dev/vcsm-cma";
pub const VCSM_DEVICE: &str = "/dev/vcsm";
pub const MEMINFO_PATH: &str = "/proc/meminfo";

pub mod ffi {
    use std::ffi::c_void;

    /// Clean (flush) the cache lines of a block.
    pub const CACHE_OP_FLUSH: u16 = 3;

    /// `struct vcsm_user_clean_invalid2_s` block entry.
    #[repr(C)]
    #[derive(Debug, Copy, Clone)]
    pub struct CleanInvalidBlock {
        pub invalidate_mode: u16,
        pub block_count: u16,
        pub start_address: *mut c_void,
        pub block_size: u32,
        pub inter_block_stride: u32,
    }

    /// `struct vcsm_user_clean_invalid2_s` header, followed by `op_count` blocks.
    #[repr(C)]
    #[derive(Debug)]
    pub struct CleanInvalidRequest {
        pub op_count: u8,
        pub zero: [u8; 3],
        pub blocks: [CleanInvalidBlock; 0],
    }
}

/// `VCSM_CACHE_TYPE_T`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum VcsmCacheType {
    None = 0,
    Host = 1,
    VideoCore = 2,
    HostAndVideoCore = 3,
}

/// `VCSM_CACHE_TYPE_PINNED`: back the allocation up front instead of on first access.
pub const VCSM_CACHE_TYPE_PINNED: c_int = 0x80;

impl VcsmCacheType {
    /// The value handed to `vcsm_malloc_cache`, with the pinned bit set.
    pub fn pinned_flags(self) -> c_int {
        self as c_int | VCSM_CACHE_TYPE_PINNED
    }
}

impl From<CacheType> for VcsmCacheType {
    fn from(cache: CacheType) -> Self {
        match cache {
            CacheType::Uncached => VcsmCacheType::None,
            CacheType::HostCached => VcsmCacheType::Host,
            CacheType::GpuCached => VcsmCacheType::VideoCore,
            CacheType::BothCached => VcsmCacheType::HostAndVideoCore,
        }
    }
}

/// The shared memory service calls the allocator is built from.
pub trait VcsmDriver: Send + Sync {
    /// Returns the new handle, or 0.
    fn malloc_cache(&self, size: u32, cache: VcsmCacheType, name: &CStr) -> u32;
    /// Returns the bus address of `handle`, or 0.
    fn vc_address(&self, handle: u32) -> u32;
    fn lock(&self, handle: u32) -> Option<NonNull<u8>>;
    /// Unlocks without flushing the host cache (the contents are about to be discarded).
    fn unlock_discard(&self, host: NonNull<u8>) -> bool;
    fn free(&self, handle: u32);
    /// Cleans the host cache lines of every `(start, len)` range.
    fn flush(&self, ranges: &[(NonNull<u8>, u32)]) -> bool;
}

/// [`VcsmDriver`] backed by `libvcsm.so`.
pub struct LibVcsm {
    api: VcsmApi,
}

impl LibVcsm {
    pub fn init(want_cma: bool) -> HalResult<Self> {
        let api = VcsmApi::load()?;
        // SAFETY: -1 lets the library open the device itself.
        let status = unsafe { (api.vcsm_init_ex)(c_int::from(want_cma), -1) };
        if status != 0 {
            return Err(HalError::Firmware {
                call: "vcsm_init_ex",
                status,
            });
        }
        Ok(Self { api })
    }
}

impl Drop for LibVcsm {
    fn drop(&mut self) {
        // SAFETY: paired with the successful `vcsm_init_ex` in `init`.
        unsafe { (self.api.vcsm_exit)() }
    }
}

impl VcsmDriver for LibVcsm {
    fn malloc_cache(&self, size: u32, cache: VcsmCacheType, name: &CStr) -> u32 {
        // SAFETY: `name` is NUL terminated and only read during the call.
        unsafe { (self.api.vcsm_malloc_cache)(size, cache.pinned_flags(), name.as_ptr()) }
    }

    fn vc_address(&self, handle: u32) -> u32 {
        // SAFETY: unknown handles return 0.
        unsafe { (self.api.vcsm_vc_addr_from_hdl)(handle) }
    }

    fn lock(&self, handle: u32) -> Option<NonNull<u8>> {
        // SAFETY: unknown handles return null.
        NonNull::new(unsafe { (self.api.vcsm_lock)(handle) }.cast::<u8>())
    }

    fn unlock_discard(&self, host: NonNull<u8>) -> bool {
        // SAFETY: `host` was returned by `vcsm_lock`.
        unsafe { (self.api.vcsm_unlock_ptr_sp)(host.as_ptr().cast::<c_void>(), 1) == 0 }
    }

    fn free(&self, handle: u32) {
        // SAFETY: `handle` came from `vcsm_malloc_cache` and is freed exactly once.
        unsafe { (self.api.vcsm_free)(handle) }
    }

    fn flush(&self, ranges: &[(NonNull<u8>, u32)]) -> bool {
        use std::alloc::{alloc_zeroed, dealloc, Layout};

        if ranges.is_empty() {
            return true;
        }
        let Ok(op_count) = u8::try_from(ranges.len()) else {
            return ranges.chunks(usize::from(u8::MAX)).all(|chunk| self.flush(chunk));
        };
        let Ok(blocks) = Layout::array::<ffi::CleanInvalidBlock>(ranges.len()) else {
            return false;
        };
        let Ok((layout, blocks_offset)) = Layout::new::<ffi::CleanInvalidRequest>().extend(blocks)
        else {
            return false;
        };
        let layout = layout.pad_to_align();

        // SAFETY: the layout is non-zero sized; the header and blocks are written inside it at
        // the offsets computed by `Layout::extend` before the request is handed to the driver.
        unsafe {
            let raw = alloc_zeroed(layout);
            if raw.is_null() {
                return false;
            }
            let request = raw.cast::<ffi::CleanInvalidRequest>();
            (*request).op_count = op_count;
            let blocks = raw.add(blocks_offset).cast::<ffi::CleanInvalidBlock>();
            for (i, &(start, len)) in ranges.iter().enumerate() {
                blocks.add(i).write(ffi::CleanInvalidBlock {
                    invalidate_mode: ffi::CACHE_OP_FLUSH,
                    block_count: 1,
                    start_address: start.as_ptr().cast::<c_void>(),
                    block_size: len,
                    inter_block_stride: 0,
                });
            }
            let status = (self.api.vcsm_clean_invalid2)(request);
            dealloc(raw, layout);
            status == 0
        }
    }
}

/// Allocator using a [`VcsmDriver`].
pub struct Vcsm {
    driver: Box<dyn VcsmDriver>,
    uses_cma: bool,
    meminfo: PathBuf,
}

impl Vcsm {
    /// Loads `libvcsm.so`, preferring the CMA flavour of the driver when both are present.
    pub fn open(prefer_cma: bool) -> HalResult<Self> {
        let cma = Path::new(VCSM_CMA_DEVICE).exists();
        let legacy = Path::new(VCSM_DEVICE).exists();
        let uses_cma = match (prefer_cma, cma, legacy) {
            (true, true, _) | (false, true, false) => true,
            (_, _, true) => false,
            (_, false, false) => {
                return Err(HalError::DeviceOpen {
                    path: if prefer_cma { VCSM_CMA_DEVICE } else { VCSM_DEVICE }.into(),
                    source: std::io::ErrorKind::NotFound.into(),
                })
            }
        };
        let driver = LibVcsm::init(uses_cma)?;
        tracing::debug!(uses_cma, "initialised VCSM");
        Ok(Self::with_driver(Box::new(driver), uses_cma))
    }

    pub fn with_driver(driver: Box<dyn VcsmDriver>, uses_cma: bool) -> Self {
        Self {
            driver,
            uses_cma,
            meminfo: PathBuf::from(MEMINFO_PATH),
        }
    }

    /// Reads the CMA pool size from `path` instead of `/proc/meminfo`.
    pub fn with_meminfo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.meminfo = path.into();
        self
    }

    pub fn uses_cma(&self) -> bool {
        self.uses_cma
    }

    /// Size of the CMA pool. Only known in CMA mode.
    pub fn total_gpu_memory(&self) -> HalResult<u32> {
        if !self.uses_cma {
            return Err(HalError::Unsupported("total GPU memory without CMA"));
        }
        let meminfo = std::fs::read_to_string(&self.meminfo).map_err(|source| {
            HalError::DeviceOpen {
                path: self.meminfo.clone(),
                source,
            }
        })?;
        let bytes = parse_cma_total(&meminfo)
            .ok_or(HalError::Unsupported("total GPU memory without CmaTotal"))?;
        Ok(u32::try_from(bytes).unwrap_or(u32::MAX))
    }

    /// Writes the host cache lines of `buffers` back to memory.
    pub fn flush_cpu_cache(&self, buffers: &[&DeviceBuffer]) -> bool {
        let ranges: Vec<_> = buffers
            .iter()
            .map(|buffer| (buffer.host_ptr(), buffer.size()))
            .collect();
        self.driver.flush(&ranges)
    }
}

/// `CmaTotal` from `/proc/meminfo`, in bytes.
pub fn parse_cma_total(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("CmaTotal:")?;
        let kib = rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok()?;
        Some(kib * 1024)
    })
}

impl SystemQueries for Vcsm {
    fn read_value(&self, query: SystemQuery) -> Option<u32> {
        if query != SystemQuery::TotalGpuMemoryBytes {
            return None;
        }
        match self.total_gpu_memory() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::warn!(error = %err, "VCSM cannot report the total GPU memory");
                None
            }
        }
    }
}

impl DeviceMemory for Vcsm {
    fn allocate_buffer(
        self: Arc<Self>,
        request: &BufferRequest<'_>,
    ) -> HalResult<Option<DeviceBuffer>> {
        request.validate()?;
        let name = CString::new(request.name).unwrap_or_default();
        let handle = self
            .driver
            .malloc_cache(request.size, request.cache.into(), &name);
        if handle == 0 {
            tracing::debug!(size = request.size, "VCSM allocation failed");
            return Ok(None);
        }

        let Some(host) = self.driver.lock(handle) else {
            tracing::debug!(handle, "failed to lock VCSM allocation");
            self.driver.free(handle);
            return Ok(None);
        };

        let bus_address = self.driver.vc_address(handle);
        if bus_address == 0 || bus_address % request.alignment != 0 {
            tracing::debug!(handle, bus_address, alignment = request.alignment, "unusable VCSM bus address");
            self.driver.unlock_discard(host);
            self.driver.free(handle);
            return Ok(None);
        }

        tracing::debug!(handle, size = request.size, bus_address, "allocated VCSM buffer");
        Ok(Some(DeviceBuffer::new(
            self,
            handle,
            DevicePointer::new(bus_address),
            HostMemory::Borrowed(host),
            request.size,
        )))
    }

    fn deallocate(&self, release: BufferRelease) -> HalResult<bool> {
        let unlocked = self.driver.unlock_discard(release.host_ptr);
        if !unlocked {
            tracing::warn!(handle = release.handle, "failed to unlock VCSM buffer");
        }
        self.driver.free(release.handle);
        Ok(unlocked)
    }
}
