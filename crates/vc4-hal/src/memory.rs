//! GPU-visible memory: bus addresses, allocation requests and the RAII [`DeviceBuffer`].

use std::fmt;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::ptr::NonNull;
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};

use crate::backend::DeviceMemory;
use crate::error::{HalError, HalResult};

/// Allocations are page aligned so they can be mapped into the host address space.
pub const PAGE_ALIGNMENT: u32 = 4096;

/// The top two bits of a VideoCore bus address select the cache alias (L1/L2 cached,
/// L2 coherent, L2 only, uncached). They are not part of the physical address.
pub const BUS_ALIAS_MASK: u32 = 0xC000_0000;

const DEV_MEM: &str = "/dev/mem";

/// A 32-bit VideoCore bus address.
///
/// Distinct from a host pointer on purpose: it is only meaningful to the GPU and must go through
/// [`DevicePointer::to_physical`] before it can be mapped into host memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DevicePointer(u32);

impl DevicePointer {
    pub const NULL: Self = Self(0);

    pub const fn new(bus_address: u32) -> Self {
        Self(bus_address)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Physical ARM address of this bus address (alias bits stripped).
    pub const fn to_physical(self) -> u32 {
        self.0 & !BUS_ALIAS_MASK
    }

    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl From<DevicePointer> for u32 {
    fn from(ptr: DevicePointer) -> Self {
        ptr.0
    }
}

impl fmt::Display for DevicePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Which side(s) of the bus may cache a buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CacheType {
    Uncached = 0,
    HostCached = 1,
    GpuCached = 2,
    #[default]
    BothCached = 3,
}

impl CacheType {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Uncached),
            1 => Some(Self::HostCached),
            2 => Some(Self::GpuCached),
            3 => Some(Self::BothCached),
            _ => None,
        }
    }
}

/// Parameters of one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRequest<'a> {
    pub size: u32,
    /// Must be a power of two. Backends may round it up to [`PAGE_ALIGNMENT`].
    pub alignment: u32,
    pub cache: CacheType,
    /// Debug name; only the VCSM allocator records it.
    pub name: &'a str,
}

impl BufferRequest<'static> {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            alignment: PAGE_ALIGNMENT,
            cache: CacheType::default(),
            name: "vc4-hal",
        }
    }
}

impl<'a> BufferRequest<'a> {
    pub fn with_alignment(mut self, alignment: u32) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_cache(mut self, cache: CacheType) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_name<'b>(self, name: &'b str) -> BufferRequest<'b> {
        BufferRequest {
            size: self.size,
            alignment: self.alignment,
            cache: self.cache,
            name,
        }
    }

    pub(crate) fn validate(&self) -> HalResult<()> {
        if self.size == 0 {
            return Err(HalError::InvalidArgument("buffer size must not be zero".into()));
        }
        if !self.alignment.is_power_of_two() {
            return Err(HalError::InvalidArgument(format!(
                "buffer alignment {} is not a power of two",
                self.alignment
            )));
        }
        Ok(())
    }
}

/// Host-side view of a buffer.
pub enum HostMemory {
    /// A `/dev/mem` mapping owned by the buffer and unmapped before the allocation is released.
    Mapped(MmapRaw),
    /// Memory mapped (or owned) by the allocating backend itself.
    Borrowed(NonNull<u8>),
}

impl HostMemory {
    fn as_ptr(&self) -> NonNull<u8> {
        match self {
            // `MmapRaw` never hands out a null pointer for a successful mapping.
            HostMemory::Mapped(map) => {
                NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling())
            }
            HostMemory::Borrowed(ptr) => *ptr,
        }
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostMemory::Mapped(map) => f.debug_tuple("Mapped").field(&map.as_ptr()).finish(),
            HostMemory::Borrowed(ptr) => f.debug_tuple("Borrowed").field(ptr).finish(),
        }
    }
}

/// Everything a backend needs to release an allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BufferRelease {
    pub handle: u32,
    pub device_ptr: DevicePointer,
    pub host_ptr: NonNull<u8>,
    pub size: u32,
}

/// One GPU allocation, released through its owning backend when dropped.
///
/// The GPU (or the emulator) writes the same memory while a dispatch that uses the buffer runs.
/// Host views must not be held across such a dispatch.
pub struct DeviceBuffer {
    handle: u32,
    device_ptr: DevicePointer,
    host: Option<HostMemory>,
    host_ptr: NonNull<u8>,
    size: u32,
    owner: Option<Arc<dyn DeviceMemory>>,
}

// SAFETY: on the host side the memory is owned by this buffer alone; shared access only hands
// out `&[u8]` and mutation requires `&mut self`. Device-side writes go through raw pointers and
// are ordered by the dispatch contract above. The owner is `Send + Sync` by trait bound.
unsafe impl Send for DeviceBuffer {}
// SAFETY: see above.
unsafe impl Sync for DeviceBuffer {}

impl DeviceBuffer {
    /// Wraps a live allocation. `handle` must not be 0 and `host` must cover `size` bytes.
    pub fn new(
        owner: Arc<dyn DeviceMemory>,
        handle: u32,
        device_ptr: DevicePointer,
        host: HostMemory,
        size: u32,
    ) -> Self {
        debug_assert_ne!(handle, 0, "handle 0 never denotes a live allocation");
        let host_ptr = host.as_ptr();
        Self {
            handle,
            device_ptr,
            host: Some(host),
            host_ptr,
            size,
            owner: Some(owner),
        }
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn device_ptr(&self) -> DevicePointer {
        self.device_ptr
    }

    pub fn host_ptr(&self) -> NonNull<u8> {
        self.host_ptr
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `host_ptr` covers `size` bytes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.host_ptr.as_ptr(), self.size as usize) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access from the host side.
        unsafe { std::slice::from_raw_parts_mut(self.host_ptr.as_ptr(), self.size as usize) }
    }

    /// Writes little-endian words starting at byte `offset`.
    ///
    /// # Panics
    ///
    /// If the words do not fit between `offset` and the end of the buffer.
    pub fn write_words(&mut self, offset: usize, words: &[u32]) {
        let bytes = &mut self.as_mut_slice()[offset..offset + words.len() * 4];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }

    /// Reads the little-endian word at byte `offset`.
    ///
    /// # Panics
    ///
    /// If `offset + 4` is past the end of the buffer.
    pub fn read_word(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.as_slice()[offset..offset + 4]);
        u32::from_le_bytes(word)
    }

    /// Releases the allocation now, reporting whether the backend accepted the release.
    pub fn release(mut self) -> HalResult<bool> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> HalResult<bool> {
        let Some(owner) = self.owner.take() else {
            return Ok(true);
        };
        // Unmap before the backend gives the memory back.
        drop(self.host.take());
        owner.deallocate(BufferRelease {
            handle: self.handle,
            device_ptr: self.device_ptr,
            host_ptr: self.host_ptr,
            size: self.size,
        })
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        match self.release_inner() {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                handle = self.handle,
                device_ptr = %self.device_ptr,
                "backend rejected buffer release"
            ),
            Err(err) => tracing::warn!(
                handle = self.handle,
                error = %err,
                "failed to release buffer"
            ),
        }
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("handle", &self.handle)
            .field("device_ptr", &self.device_ptr)
            .field("host_ptr", &self.host_ptr)
            .field("size", &self.size)
            .finish()
    }
}

/// Maps `len` bytes of physical memory starting at `address` through `/dev/mem`.
///
/// `address` does not need to be page aligned; the returned mapping starts exactly at it.
pub fn map_physical(address: u32, len: usize) -> HalResult<MmapRaw> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(DEV_MEM)
        .map_err(|source| HalError::DeviceOpen {
            path: DEV_MEM.into(),
            source,
        })?;
    MmapOptions::new()
        .offset(u64::from(address))
        .len(len)
        .map_raw(&file)
        .map_err(|source| HalError::Map {
            address,
            len,
            source,
        })
}
