use std::{alloc, ptr::NonNull};

use super::{Accelerator, MIN_ALIGNMENT, MemorySpace, Status, TransferKind};

/// Alignment of host allocations unless configured otherwise. One cache line.
pub const DEFAULT_ALIGNMENT: usize = 64;

/// Fills larger than this are split across threads when `rayon` is enabled.
#[cfg(feature = "rayon")]
const PARALLEL_FILL_BYTES: usize = 1 << 20;

/// Host heap backend. Operations complete before returning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Either [`MemorySpace::Host`] or [`MemorySpace::PinnedHost`].
    space: MemorySpace,
    /// Alignment of every allocation in bytes.
    alignment: usize,
}

impl Host {
    /// Pageable host memory with default alignment.
    #[inline]
    pub fn pageable() -> Self {
        HostBuilder::new().build()
    }

    /// Page-locked host memory with default alignment.
    #[inline]
    pub fn pinned() -> Self {
        HostBuilder::new().pinned(true).build()
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::pageable()
    }
}

impl Accelerator for Host {
    fn name(&self) -> &str {
        match self.space {
            MemorySpace::PinnedHost => "pinned host",
            _ => "host",
        }
    }

    #[inline]
    fn space(&self) -> MemorySpace {
        self.space
    }

    #[inline]
    fn allocate(&self, bytes: usize) -> Result<NonNull<u8>, Status> {
        alloc_raw(bytes, self.alignment)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), Status> {
        unsafe { dealloc_raw(ptr, bytes, self.alignment) }
    }

    #[inline]
    unsafe fn fill(&self, ptr: NonNull<u8>, value: u8, bytes: usize) -> Result<(), Status> {
        unsafe { fill_raw(ptr, value, bytes) };
        Ok(())
    }

    #[inline]
    unsafe fn fill_pattern(
        &self,
        ptr: NonNull<u8>,
        pattern: &[u8],
        count: usize,
    ) -> Result<(), Status> {
        unsafe { fill_pattern_raw(ptr, pattern, count) };
        Ok(())
    }

    unsafe fn copy(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        bytes: usize,
        kind: TransferKind,
    ) -> Result<(), Status> {
        if kind != TransferKind::HostToHost {
            log::error!("host backend cannot perform {kind} transfers");
            return Err(Status::INVALID_VALUE);
        }
        unsafe { std::ptr::copy(src.as_ptr(), dst.as_ptr(), bytes) };
        Ok(())
    }

    #[inline]
    fn synchronize(&self) -> Result<(), Status> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HostBuilder {
    pub pinned: bool,
    pub alignment: usize,
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self {
            pinned: false,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl HostBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    /// Alignment of every allocation. Rounded up to a power of two of at least
    /// [`MIN_ALIGNMENT`].
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn build(self) -> Host {
        let space = if self.pinned {
            MemorySpace::PinnedHost
        } else {
            MemorySpace::Host
        };
        let alignment = self.alignment.max(MIN_ALIGNMENT).next_power_of_two();
        if alignment != self.alignment {
            log::warn!("host alignment {} rounded up to {alignment}", self.alignment);
        }
        Host { space, alignment }
    }
}

/// Allocates zeroed memory from the global allocator.
pub(crate) fn alloc_raw(bytes: usize, alignment: usize) -> Result<NonNull<u8>, Status> {
    let layout =
        alloc::Layout::from_size_align(bytes, alignment).map_err(|_| Status::INVALID_VALUE)?;
    if layout.size() == 0 {
        return Err(Status::INVALID_VALUE);
    }
    // SAFETY: the layout has non-zero size
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    NonNull::new(ptr).ok_or(Status::MEMORY_ALLOCATION)
}

/// # Safety
/// `ptr` must come from [`alloc_raw`] with the same `bytes` and `alignment`.
pub(crate) unsafe fn dealloc_raw(
    ptr: NonNull<u8>,
    bytes: usize,
    alignment: usize,
) -> Result<(), Status> {
    let layout =
        alloc::Layout::from_size_align(bytes, alignment).map_err(|_| Status::INVALID_VALUE)?;
    unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    Ok(())
}

/// # Safety
/// `ptr` must be valid for writes of `bytes` bytes.
pub(crate) unsafe fn fill_raw(ptr: NonNull<u8>, value: u8, bytes: usize) {
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;

        if bytes > PARALLEL_FILL_BYTES {
            let data = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), bytes) };
            data.par_chunks_mut(PARALLEL_FILL_BYTES)
                .for_each(|chunk| chunk.fill(value));
            return;
        }
    }
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), value, bytes) };
}

/// # Safety
/// `ptr` must be valid for writes of `pattern.len() * count` bytes, not overlapping `pattern`.
pub(crate) unsafe fn fill_pattern_raw(ptr: NonNull<u8>, pattern: &[u8], count: usize) {
    if pattern.is_empty() || count == 0 {
        return;
    }
    let data = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), pattern.len() * count) };
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;

        if data.len() > PARALLEL_FILL_BYTES {
            data.par_chunks_exact_mut(pattern.len())
                .for_each(|chunk| chunk.copy_from_slice(pattern));
            return;
        }
    }
    data.chunks_exact_mut(pattern.len())
        .for_each(|chunk| chunk.copy_from_slice(pattern));
}
