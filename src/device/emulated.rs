use std::{
    collections::BTreeMap,
    ptr::NonNull,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;

use super::{
    Accelerator, MIN_ALIGNMENT, MemorySpace, Status, TransferKind,
    host::{alloc_raw, dealloc_raw, fill_pattern_raw, fill_raw},
};

/// Alignment of device allocations unless configured otherwise.
pub const DEFAULT_ALIGNMENT: usize = 256;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId;

/// An address handed to the stream worker.
#[derive(Debug, Clone, Copy)]
struct Address(NonNull<u8>);

// SAFETY: the worker only dereferences addresses the issuing side vouched for.
unsafe impl Send for Address {}

#[derive(Debug)]
enum Command {
    Fill {
        ptr: Address,
        value: u8,
        bytes: usize,
    },
    Pattern {
        ptr: Address,
        pattern: Box<[u8]>,
        count: usize,
    },
    Copy {
        dst: Address,
        src: Address,
        bytes: usize,
    },
    Fence(flume::Sender<()>),
}

#[derive(Debug)]
struct Inner {
    /// Alignment of every allocation in bytes.
    alignment: usize,
    /// Upper bound of live bytes; allocations beyond fail as out of memory.
    capacity: Option<usize>,
    /// Live allocations: base address to length.
    allocations: Mutex<BTreeMap<usize, usize>>,
    /// Sends commands to the stream worker.
    sender: flume::Sender<Command>,
}

/// An accelerator whose global memory is emulated in host RAM.
///
/// Device memory is a separate [`MemorySpace::Device`] space: the host must not dereference it,
/// and every transfer goes through [`Accelerator::copy`]. Fills and copies run on a single
/// in-order stream worker thread.
#[derive(Debug, Clone)]
pub struct Emulated {
    /// The unique identifier of the device.
    id: uid::Id<DeviceId>,
    name: String,
    inner: Arc<Inner>,
}

impl Emulated {
    #[inline]
    pub fn id(&self) -> usize {
        self.id.get()
    }

    /// Number of bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.allocations().values().sum()
    }

    /// Number of buffers currently allocated.
    pub fn live_allocations(&self) -> usize {
        self.allocations().len()
    }

    #[inline]
    fn allocations(&self) -> MutexGuard<'_, BTreeMap<usize, usize>> {
        self.inner
            .allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks that `bytes` bytes at `ptr` lie within one live allocation.
    fn check_range(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), Status> {
        let address = ptr.as_ptr() as usize;
        let allocations = self.allocations();
        match allocations.range(..=address).next_back() {
            Some((&base, &len)) if address + bytes <= base + len => Ok(()),
            _ => {
                log::error!("{}: {bytes} bytes at {ptr:p} are not device memory", self.name);
                Err(Status::INVALID_DEVICE_POINTER)
            }
        }
    }

    #[inline]
    fn enqueue(&self, command: Command) -> Result<(), Status> {
        self.inner
            .sender
            .send(command)
            .map_err(|_| Status::DEVICE_UNAVAILABLE)
    }
}

impl Accelerator for Emulated {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn space(&self) -> MemorySpace {
        MemorySpace::Device
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self), level = "trace"))]
    fn allocate(&self, bytes: usize) -> Result<NonNull<u8>, Status> {
        let mut allocations = self.allocations();
        let used: usize = allocations.values().sum();
        if self
            .inner
            .capacity
            .is_some_and(|capacity| used.saturating_add(bytes) > capacity)
        {
            return Err(Status::MEMORY_ALLOCATION);
        }
        let ptr = alloc_raw(bytes, self.inner.alignment)?;
        allocations.insert(ptr.as_ptr() as usize, bytes);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), Status> {
        // pending work may still touch the buffer
        self.synchronize()?;

        let address = ptr.as_ptr() as usize;
        let mut allocations = self.allocations();
        match allocations.get(&address) {
            Some(&len) if len == bytes => {
                allocations.remove(&address);
                unsafe { dealloc_raw(ptr, bytes, self.inner.alignment) }
            }
            _ => {
                #[cfg(feature = "strict")]
                panic!("{}: free of unknown allocation at {ptr:p}", self.name);
                #[cfg(not(feature = "strict"))]
                {
                    log::error!("{}: free of unknown allocation at {ptr:p}", self.name);
                    Err(Status::INVALID_DEVICE_POINTER)
                }
            }
        }
    }

    unsafe fn fill(&self, ptr: NonNull<u8>, value: u8, bytes: usize) -> Result<(), Status> {
        self.check_range(ptr, bytes)?;
        let ptr = Address(ptr);
        self.enqueue(Command::Fill { ptr, value, bytes })
    }

    unsafe fn fill_pattern(
        &self,
        ptr: NonNull<u8>,
        pattern: &[u8],
        count: usize,
    ) -> Result<(), Status> {
        self.check_range(ptr, pattern.len() * count)?;
        let ptr = Address(ptr);
        let pattern = pattern.into();
        self.enqueue(Command::Pattern {
            ptr,
            pattern,
            count,
        })
    }

    unsafe fn copy(
        &self,
        dst: NonNull<u8>,
        src: NonNull<u8>,
        bytes: usize,
        kind: TransferKind,
    ) -> Result<(), Status> {
        match kind {
            TransferKind::HostToHost => {}
            TransferKind::HostToDevice => self.check_range(dst, bytes)?,
            TransferKind::DeviceToHost => self.check_range(src, bytes)?,
            TransferKind::DeviceToDevice => {
                self.check_range(dst, bytes)?;
                self.check_range(src, bytes)?;
            }
        }
        let (dst, src) = (Address(dst), Address(src));
        self.enqueue(Command::Copy { dst, src, bytes })
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self), level = "trace"))]
    fn synchronize(&self) -> Result<(), Status> {
        let (sender, receiver) = flume::bounded(1);
        self.enqueue(Command::Fence(sender))?;
        receiver.recv().map_err(|_| Status::DEVICE_UNAVAILABLE)
    }
}

#[derive(Debug, Clone)]
pub struct EmulatedBuilder {
    pub name: String,
    pub capacity: Option<usize>,
    pub alignment: usize,
}

#[derive(Debug, Error)]
pub enum EmulatedBuildError {
    #[error("invalid alignment {0}: must be a power of two")]
    Alignment(usize),
    #[error("failed to spawn stream worker")]
    Spawn(#[from] std::io::Error),
}

impl Default for EmulatedBuilder {
    fn default() -> Self {
        Self {
            name: "emulated".into(),
            capacity: None,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl EmulatedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Limits the number of live bytes.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn build(self) -> Result<Emulated, EmulatedBuildError> {
        let Self {
            name,
            capacity,
            alignment,
        } = self;
        if !alignment.is_power_of_two() {
            return Err(EmulatedBuildError::Alignment(alignment));
        }
        let alignment = alignment.max(MIN_ALIGNMENT);

        let (sender, receiver) = flume::unbounded();
        std::thread::Builder::new()
            .name(format!("{name}-stream"))
            .spawn(move || serve(receiver))?;

        let allocations = Mutex::new(BTreeMap::new());
        let inner = Arc::new(Inner {
            alignment,
            capacity,
            allocations,
            sender,
        });
        let id = uid::Id::new();
        Ok(Emulated { id, name, inner })
    }
}

/// Runs the stream: executes commands one at a time, in the order they were issued.
fn serve(receiver: flume::Receiver<Command>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Fill { ptr, value, bytes } => unsafe { fill_raw(ptr.0, value, bytes) },
            Command::Pattern {
                ptr,
                pattern,
                count,
            } => unsafe { fill_pattern_raw(ptr.0, &pattern, count) },
            Command::Copy { dst, src, bytes } => unsafe {
                std::ptr::copy(src.0.as_ptr(), dst.0.as_ptr(), bytes)
            },
            Command::Fence(sender) => _ = sender.send(()),
        }
    }
    log::trace!("stream closed");
}

#[cfg(test)]
mod tests {
    use std::{error::Error, ptr::NonNull};

    use super::{EmulatedBuildError, EmulatedBuilder};
    use crate::device::{Accelerator, MIN_ALIGNMENT, MemorySpace, Status, TransferKind};

    #[test]
    fn test_build() -> Result<(), Box<dyn Error>> {
        let device = EmulatedBuilder::new().name("test").build()?;
        assert_eq!(device.name(), "test");
        assert_eq!(device.space(), MemorySpace::Device);
        assert!(matches!(
            EmulatedBuilder::new().alignment(96).build(),
            Err(EmulatedBuildError::Alignment(96))
        ));

        let device = EmulatedBuilder::new().alignment(2).build()?;
        let x = device.allocate(3)?;
        assert_eq!(x.align_offset(MIN_ALIGNMENT), 0);
        unsafe { device.deallocate(x, 3) }?;
        Ok(())
    }

    #[test]
    fn test_capacity() -> Result<(), Box<dyn Error>> {
        let device = EmulatedBuilder::new().capacity(1024).build()?;
        let x = device.allocate(768)?;
        assert_eq!(device.allocate(512), Err(Status::MEMORY_ALLOCATION));
        assert_eq!(device.allocated_bytes(), 768);

        unsafe { device.deallocate(x, 768) }?;
        let y = device.allocate(1024)?;
        assert_eq!(device.live_allocations(), 1);
        unsafe { device.deallocate(y, 1024) }?;
        assert_eq!(device.live_allocations(), 0);
        Ok(())
    }

    #[test]
    fn test_stream_order() -> Result<(), Box<dyn Error>> {
        let device = EmulatedBuilder::new().build()?;
        let x = device.allocate(64)?;
        let y = device.allocate(64)?;
        let mut output = [0u8; 64];
        let host = NonNull::new(output.as_mut_ptr()).expect("stack buffer");

        // all of these are asynchronous; the fence in `synchronize` orders the read
        unsafe {
            device.fill(x, 0x11, 64)?;
            device.fill_pattern(y, &[0xaa, 0xbb], 32)?;
            device.copy(x, y, 16, TransferKind::DeviceToDevice)?;
            device.fill(x, 0x7f, 8)?;
            device.copy(host, x, 64, TransferKind::DeviceToHost)?;
        }
        device.synchronize()?;

        assert_eq!(&output[..8], &[0x7f; 8]);
        assert_eq!(&output[8..16], &[0xaa, 0xbb, 0xaa, 0xbb, 0xaa, 0xbb, 0xaa, 0xbb]);
        assert_eq!(&output[16..], &[0x11; 48]);

        unsafe {
            device.deallocate(x, 64)?;
            device.deallocate(y, 64)?;
        }
        Ok(())
    }

    #[test]
    fn test_out_of_range() -> Result<(), Box<dyn Error>> {
        let device = EmulatedBuilder::new().build()?;
        let x = device.allocate(32)?;
        let result = unsafe { device.fill(x, 0, 33) };
        assert_eq!(result, Err(Status::INVALID_DEVICE_POINTER));

        let mut output = [0u8; 4];
        let host = NonNull::new(output.as_mut_ptr()).expect("stack buffer");
        let result = unsafe { device.copy(x, host, 4, TransferKind::DeviceToDevice) };
        assert_eq!(result, Err(Status::INVALID_DEVICE_POINTER));

        unsafe { device.deallocate(x, 32) }?;
        Ok(())
    }

    #[test]
    #[cfg_attr(feature = "strict", should_panic(expected = "unknown allocation"))]
    fn test_unknown_free() {
        let device = EmulatedBuilder::new().build().expect("failed to build device");
        let result = unsafe { device.deallocate(NonNull::dangling(), 16) };
        assert_eq!(result, Err(Status::INVALID_DEVICE_POINTER));
    }
}
