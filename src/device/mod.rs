//! The accelerator boundary.
//!
//! Backends implement [`Accelerator`], a narrow set of raw primitives reporting bare [`Status`]
//! codes. Everything above this module goes through the checked wrappers here, which translate
//! those codes into [`MemoryError`] and tie each live buffer to exactly one [`Allocation`].

use std::{fmt, mem::ManuallyDrop, ptr::NonNull, sync::Arc};

use derive_more::{Display, From, Into};

pub use emulated::{Emulated, EmulatedBuildError, EmulatedBuilder};
pub use host::{Host, HostBuilder};

use crate::error::{DeviceOp, MemoryError};

pub mod emulated;
pub mod host;

/// Lower bound on the alignment of every backend allocation, enough for any [`Scalar`].
///
/// [`Scalar`]: crate::num::Scalar
pub const MIN_ALIGNMENT: usize = 16;

/// A raw status code reported by a backend primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, From, Into)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Self = Self(0);
    pub const INVALID_VALUE: Self = Self(1);
    pub const MEMORY_ALLOCATION: Self = Self(2);
    pub const INVALID_DEVICE_POINTER: Self = Self(17);
    pub const DEVICE_UNAVAILABLE: Self = Self(46);
    pub const MISALIGNED_ADDRESS: Self = Self(716);
    pub const UNKNOWN: Self = Self(999);

    pub const fn name(self) -> &'static str {
        match self {
            Self::SUCCESS => "success",
            Self::INVALID_VALUE => "invalid value",
            Self::MEMORY_ALLOCATION => "out of memory",
            Self::INVALID_DEVICE_POINTER => "invalid device pointer",
            Self::DEVICE_UNAVAILABLE => "device unavailable",
            Self::MISALIGNED_ADDRESS => "misaligned address",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.name(), self.0)
    }
}

impl std::error::Error for Status {}

/// The memory space a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum MemorySpace {
    /// Pageable host heap memory.
    Host,
    /// Page-locked host memory, directly reachable by the accelerator.
    PinnedHost,
    /// Accelerator global memory.
    Device,
    /// Memory owned by a foreign API (e.g., a graphics buffer object) and mapped for the
    /// accelerator.
    Interop,
}

impl MemorySpace {
    /// Returns `true` if the host may dereference pointers into this space.
    #[inline]
    pub const fn is_host_accessible(self) -> bool {
        matches!(self, Self::Host | Self::PinnedHost)
    }
}

/// Direction of a transfer between two memory spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TransferKind {
    #[display("host to host")]
    HostToHost,
    #[display("host to device")]
    HostToDevice,
    #[display("device to host")]
    DeviceToHost,
    #[display("device to device")]
    DeviceToDevice,
}

impl TransferKind {
    #[inline]
    pub const fn between(src: MemorySpace, dst: MemorySpace) -> Self {
        match (src.is_host_accessible(), dst.is_host_accessible()) {
            (true, true) => Self::HostToHost,
            (true, false) => Self::HostToDevice,
            (false, true) => Self::DeviceToHost,
            (false, false) => Self::DeviceToDevice,
        }
    }
}

/// Whether an enqueued operation is waited for before returning.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum SyncMode {
    /// Blocks until the operation and all prior work on the stream completed.
    #[default]
    Blocking,
    /// Returns once the operation is enqueued.
    Async,
}

/// Raw primitives of a memory backend.
///
/// Operations other than allocation may be enqueued and run asynchronously, in issue order;
/// [`Accelerator::synchronize`] waits for everything enqueued so far.
pub trait Accelerator: Send + Sync + fmt::Debug {
    /// Human readable name of the backend.
    fn name(&self) -> &str;

    /// The memory space of the buffers this backend allocates.
    fn space(&self) -> MemorySpace;

    /// Allocates `bytes` bytes. `bytes` is never zero.
    fn allocate(&self, bytes: usize) -> Result<NonNull<u8>, Status>;

    /// Releases a buffer.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`Accelerator::allocate`] of this backend with the same
    /// `bytes`, and must not have been released already.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), Status>;

    /// Enqueues setting `bytes` bytes at `ptr` to `value`.
    ///
    /// # Safety
    /// The range must lie within a live buffer of this backend's memory space.
    unsafe fn fill(&self, ptr: NonNull<u8>, value: u8, bytes: usize) -> Result<(), Status>;

    /// Enqueues writing `pattern` `count` times back to back starting at `ptr`.
    ///
    /// # Safety
    /// The range must lie within a live buffer of this backend's memory space.
    unsafe fn fill_pattern(
        &self,
        ptr: NonNull<u8>,
        pattern: &[u8],
        count: usize,
    ) -> Result<(), Status>;

    /// Enqueues copying `bytes` bytes from `src` to `dst`.
    ///
    /// # Safety
    /// Both ranges must be valid for the memory spaces implied by `kind`, and must stay valid
    /// until the copy completes.
    unsafe fn copy(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        bytes: usize,
        kind: TransferKind,
    ) -> Result<(), Status>;

    /// Waits for all enqueued work to complete.
    fn synchronize(&self) -> Result<(), Status>;
}

/// Translates a backend status into a [`MemoryError::DeviceOperation`].
#[inline]
pub(crate) fn check(op: DeviceOp, result: Result<(), Status>) -> Result<(), MemoryError> {
    result.map_err(|status| {
        log::error!("device {op} failed: {status}");
        MemoryError::DeviceOperation { op, status }
    })
}

/// Waits for the backend if `mode` asks to.
#[inline]
pub(crate) fn finish(device: &dyn Accelerator, mode: SyncMode) -> Result<(), MemoryError> {
    match mode {
        SyncMode::Blocking => check(DeviceOp::Synchronize, device.synchronize()),
        SyncMode::Async => Ok(()),
    }
}

/// A uniquely owned buffer. Dropping it returns the memory to its backend.
pub struct Allocation<A: Accelerator + ?Sized> {
    device: Arc<A>,
    ptr: NonNull<u8>,
    bytes: usize,
}

// SAFETY: an allocation is the only handle to its buffer, and the backend is `Send + Sync`.
unsafe impl<A: Accelerator + ?Sized> Send for Allocation<A> {}
unsafe impl<A: Accelerator + ?Sized> Sync for Allocation<A> {}

impl<A: Accelerator + ?Sized> Allocation<A> {
    /// Allocates `bytes` bytes from `device`. Returns `None` for zero bytes.
    pub fn new(device: &Arc<A>, bytes: usize) -> Result<Option<Self>, MemoryError> {
        if bytes == 0 {
            log::trace!("{}: skip allocation of zero bytes", device.name());
            return Ok(None);
        }
        match device.allocate(bytes) {
            Ok(ptr) => {
                log::trace!("{}: allocate {bytes} bytes at {ptr:p}", device.name());
                let device = device.clone();
                Ok(Some(Self { device, ptr, bytes }))
            }
            Err(status) => {
                log::warn!("{}: allocation of {bytes} bytes failed: {status}", device.name());
                Err(MemoryError::Allocation { bytes, status })
            }
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[inline]
    pub fn device(&self) -> &Arc<A> {
        &self.device
    }

    /// Gives up ownership without releasing the buffer. Whoever holds the returned pointer is
    /// responsible for it from now on.
    pub fn leak(self) -> NonNull<u8> {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the `Arc` is read out exactly once.
        drop(unsafe { std::ptr::read(&this.device) });
        this.ptr
    }
}

impl<A: Accelerator + ?Sized> Drop for Allocation<A> {
    fn drop(&mut self) {
        let (device, ptr, bytes) = (&self.device, self.ptr, self.bytes);
        log::trace!("{}: deallocate {bytes} bytes at {ptr:p}", device.name());
        // SAFETY: the pointer came from `allocate` on this device and is released only here.
        if let Err(status) = unsafe { device.deallocate(ptr, bytes) } {
            log::error!("{}: deallocation at {ptr:p} failed: {status}", device.name());
        }
    }
}

impl<A: Accelerator + ?Sized> fmt::Debug for Allocation<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocation")
            .field("device", &self.device.name())
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .finish()
    }
}
