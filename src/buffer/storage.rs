use std::{
    marker::PhantomData,
    ops::{Index, IndexMut},
    ptr::NonNull,
    sync::Arc,
};

use super::{DeviceMemoryReference, DeviceMemoryReferenceMut, host_slice, host_slice_mut, region};
use crate::{
    device::{Accelerator, Allocation, Host, Status},
    error::MemoryError,
    layout::Layout,
    memory::{DeviceMemory, Pointer, PointerMut, Shaped, Storage},
    num::Scalar,
};

/// A buffer of `T` owned by exactly one storage, allocated from `A`.
///
/// Cloning yields a bufferless storage with the same layout and backend. Contents only move
/// through [`copy`](crate::copy::copy). Dropping the storage frees the buffer.
#[derive(Debug, Shaped)]
#[shaped(crate = "crate")]
pub struct DeviceMemoryStorage<T: Scalar, const D: usize, A: Accelerator> {
    #[layout]
    layout: Layout<D>,
    device: Arc<A>,
    allocation: Option<Allocation<A>>,
    phantom: PhantomData<T>,
}

/// A storage in host memory, with checked slice access on top.
pub type HostMemoryStorage<T, const D: usize> = DeviceMemoryStorage<T, D, Host>;

impl<T: Scalar, const D: usize, A: Accelerator> DeviceMemoryStorage<T, D, A> {
    /// A bufferless storage of packed extents `size`.
    pub fn new(device: Arc<A>, size: [usize; D]) -> Self {
        Self {
            layout: Layout::of::<T>(size),
            device,
            allocation: None,
            phantom: PhantomData,
        }
    }

    /// A bufferless storage of `layout`, whose data type must be that of `T`.
    pub fn from_layout(device: Arc<A>, layout: Layout<D>) -> Result<Self, MemoryError> {
        MemoryError::check_congruent(
            (layout.count(), T::DATA_TYPE),
            (layout.count(), layout.data_type()),
        )?;
        Ok(Self {
            layout,
            device,
            allocation: None,
            phantom: PhantomData,
        })
    }

    /// An allocated storage of packed extents `size`.
    pub fn with_size(device: Arc<A>, size: [usize; D]) -> Result<Self, MemoryError> {
        let mut storage = Self::new(device, size);
        storage.alloc()?;
        Ok(storage)
    }

    /// An allocated storage of `layout`.
    pub fn with_layout(device: Arc<A>, layout: Layout<D>) -> Result<Self, MemoryError> {
        let mut storage = Self::from_layout(device, layout)?;
        storage.alloc()?;
        Ok(storage)
    }

    #[inline]
    pub fn device(&self) -> &Arc<A> {
        &self.device
    }

    /// Views the whole buffer.
    #[inline]
    pub fn reference(&self) -> DeviceMemoryReference<'_, T, D, A> {
        DeviceMemoryReference::from_parts(self.layout, self.buffer(), &self.device)
    }

    /// Views the whole buffer mutably.
    #[inline]
    pub fn reference_mut(&mut self) -> DeviceMemoryReferenceMut<'_, T, D, A> {
        DeviceMemoryReferenceMut::from_parts(self.layout, self.buffer(), &self.device)
    }

    /// Views the sub-range of extents `size` starting at `offset`.
    pub fn region(
        &self,
        offset: [usize; D],
        size: [usize; D],
    ) -> Result<DeviceMemoryReference<'_, T, D, A>, MemoryError> {
        let (layout, data) = region(&self.layout, self.buffer(), offset, size)?;
        Ok(DeviceMemoryReference::from_parts(layout, data, &self.device))
    }

    /// Views the sub-range of extents `size` starting at `offset` mutably.
    pub fn region_mut(
        &mut self,
        offset: [usize; D],
        size: [usize; D],
    ) -> Result<DeviceMemoryReferenceMut<'_, T, D, A>, MemoryError> {
        let (layout, data) = region(&self.layout, self.buffer(), offset, size)?;
        Ok(DeviceMemoryReferenceMut::from_parts(layout, data, &self.device))
    }
}

impl<T: Scalar, const D: usize, A: Accelerator> Clone for DeviceMemoryStorage<T, D, A> {
    fn clone(&self) -> Self {
        Self {
            layout: self.layout,
            device: self.device.clone(),
            allocation: None,
            phantom: PhantomData,
        }
    }
}

impl<T: Scalar, const D: usize, A: Accelerator> Pointer<T, D> for DeviceMemoryStorage<T, D, A> {
    #[inline]
    fn buffer(&self) -> Option<NonNull<T>> {
        self.allocation.as_ref().map(|x| x.as_ptr().cast())
    }

    #[inline]
    fn backend(&self) -> &dyn Accelerator {
        self.device.as_ref()
    }
}

impl<T: Scalar, const D: usize, A: Accelerator> PointerMut<T, D> for DeviceMemoryStorage<T, D, A> {}

impl<T: Scalar, const D: usize, A: Accelerator> DeviceMemory<T, D> for DeviceMemoryStorage<T, D, A> {}

impl<T: Scalar, const D: usize, A: Accelerator> Storage<D> for DeviceMemoryStorage<T, D, A> {
    fn alloc(&mut self) -> Result<(), MemoryError> {
        self.free();
        let Some(bytes) = self.layout.data_size() else {
            let name = self.device.name();
            log::warn!("{name}: layout {} overflows the address space", self.layout);
            return Err(MemoryError::Allocation {
                bytes: usize::MAX,
                status: Status::MEMORY_ALLOCATION,
            });
        };
        let allocation = Allocation::new(&self.device, bytes)?;
        if let Some(allocation) = &allocation {
            let ptr = allocation.as_ptr();
            if ptr.align_offset(align_of::<T>()) != 0 {
                let name = self.device.name();
                log::error!("{name}: buffer at {ptr:p} is misaligned for {}", T::DATA_TYPE);
                return Err(MemoryError::Allocation {
                    bytes,
                    status: Status::MISALIGNED_ADDRESS,
                });
            }
        }
        self.allocation = allocation;
        Ok(())
    }

    #[inline]
    fn free(&mut self) {
        drop(self.allocation.take());
    }

    fn init(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let ptr = allocation.leak();
            log::trace!("{}: forget buffer at {ptr:p}", self.device.name());
        }
    }

    #[inline]
    fn is_allocated(&self) -> bool {
        self.allocation.is_some()
    }
}

impl<T: Scalar, const D: usize> HostMemoryStorage<T, D> {
    /// An allocated storage of packed extents `size` holding a copy of `data`.
    pub fn from_slice(device: Arc<Host>, size: [usize; D], data: &[T]) -> Result<Self, MemoryError> {
        let mut storage = Self::new(device, size);
        MemoryError::check_congruent((storage.count(), T::DATA_TYPE), (data.len(), T::DATA_TYPE))?;
        storage.alloc()?;
        storage.as_mut_slice().copy_from_slice(data);
        Ok(storage)
    }

    /// The whole buffer, padding included. Empty if bufferless.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: host memory of `span` elements owned by `self`
        unsafe { host_slice(self.buffer(), self.layout.span()) }
    }

    /// The whole buffer, padding included. Empty if bufferless.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: host memory of `span` elements owned by `self`
        unsafe { host_slice_mut(self.buffer(), self.layout.span()) }
    }

    /// The elements in index order, padding skipped.
    pub fn to_vec(&self) -> Vec<T> {
        let data = self.as_slice();
        if data.is_empty() {
            return vec![];
        }
        self.layout.offsets(0).map(|offset| data[offset]).collect()
    }
}

impl<T: Scalar, const D: usize> Index<usize> for HostMemoryStorage<T, D> {
    type Output = T;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.as_slice()[index]
    }
}

impl<T: Scalar, const D: usize> IndexMut<usize> for HostMemoryStorage<T, D> {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.as_mut_slice()[index]
    }
}

impl<T: Scalar, const D: usize> Index<[usize; D]> for HostMemoryStorage<T, D> {
    type Output = T;

    fn index(&self, index: [usize; D]) -> &Self::Output {
        match self.layout.try_offset(index) {
            Ok(offset) => &self.as_slice()[offset],
            Err(err) => panic!("{err}"),
        }
    }
}

impl<T: Scalar, const D: usize> IndexMut<[usize; D]> for HostMemoryStorage<T, D> {
    fn index_mut(&mut self, index: [usize; D]) -> &mut Self::Output {
        match self.layout.try_offset(index) {
            Ok(offset) => &mut self.as_mut_slice()[offset],
            Err(err) => panic!("{err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error,
        ptr::NonNull,
        sync::{Arc, Mutex},
    };

    use super::{DeviceMemoryStorage, HostMemoryStorage};
    use crate::{
        copy::download,
        device::{
            Accelerator, Emulated, EmulatedBuilder, Host, MemorySpace, Status, SyncMode,
            TransferKind,
        },
        error::MemoryError,
        layout::Layout,
        memory::{DeviceMemory, Pointer, Shaped, Storage},
        num::{DataType, Scalar},
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Allocate(usize),
        Deallocate(usize),
    }

    /// Host memory that records every allocation and release. Buffers start `shift` bytes past
    /// the host allocation.
    #[derive(Debug, Default)]
    struct Recorder {
        host: Host,
        shift: usize,
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Accelerator for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn space(&self) -> MemorySpace {
            self.host.space()
        }

        fn allocate(&self, bytes: usize) -> Result<NonNull<u8>, Status> {
            self.events.lock().unwrap().push(Event::Allocate(bytes));
            let ptr = self.host.allocate(bytes + self.shift)?;
            Ok(unsafe { ptr.add(self.shift) })
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), Status> {
            self.events.lock().unwrap().push(Event::Deallocate(bytes));
            unsafe { self.host.deallocate(ptr.sub(self.shift), bytes + self.shift) }
        }

        unsafe fn fill(&self, ptr: NonNull<u8>, value: u8, bytes: usize) -> Result<(), Status> {
            unsafe { self.host.fill(ptr, value, bytes) }
        }

        unsafe fn fill_pattern(
            &self,
            ptr: NonNull<u8>,
            pattern: &[u8],
            count: usize,
        ) -> Result<(), Status> {
            unsafe { self.host.fill_pattern(ptr, pattern, count) }
        }

        unsafe fn copy(
            &self,
            dst: NonNull<u8>,
            src: NonNull<u8>,
            bytes: usize,
            kind: TransferKind,
        ) -> Result<(), Status> {
            unsafe { self.host.copy(dst, src, bytes, kind) }
        }

        fn synchronize(&self) -> Result<(), Status> {
            Ok(())
        }
    }

    fn emulated() -> Result<Arc<Emulated>, Box<dyn Error>> {
        Ok(Arc::new(EmulatedBuilder::new().build()?))
    }

    #[test]
    fn test_alloc_free() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        let device = emulated()?;
        for _ in 0..16 {
            let size = [(); 3].map(|_| fastrand::usize(1..16));
            let mut buffer = DeviceMemoryStorage::<f32, 3, _>::new(device.clone(), size);
            assert!(buffer.buffer().is_none());

            buffer.alloc()?;
            assert!(buffer.buffer().is_some());
            assert!(buffer.is_allocated());
            assert_eq!(Some(device.allocated_bytes()), buffer.layout().data_size());

            buffer.free();
            assert!(buffer.buffer().is_none());
            assert!(buffer.as_ptr().is_null());
            buffer.free();
            assert!(!buffer.is_allocated());
            assert_eq!(device.live_allocations(), 0);
        }
        Ok(())
    }

    #[test]
    fn test_empty_alloc() -> Result<(), Box<dyn Error>> {
        let device = emulated()?;
        let mut buffer = DeviceMemoryStorage::<u8, 2, _>::with_size(device.clone(), [0, 4])?;
        assert!(buffer.buffer().is_none());
        assert_eq!(device.live_allocations(), 0);

        // filling a bufferless object is a no-op
        buffer.init_mem(0xff, SyncMode::Blocking)?;
        buffer.fill(3, SyncMode::Async)?;
        Ok(())
    }

    #[test]
    fn test_clone_is_bufferless() -> Result<(), Box<dyn Error>> {
        let device = emulated()?;
        let buffer = DeviceMemoryStorage::<u32, 2, _>::with_size(device.clone(), [8, 8])?;
        let clone = buffer.clone();
        assert!(buffer.buffer().is_some());
        assert!(clone.buffer().is_none());
        assert_ne!(buffer.as_ptr(), clone.as_ptr());
        assert_eq!(clone.layout(), buffer.layout());
        assert_eq!(device.live_allocations(), 1);

        drop(buffer);
        drop(clone);
        assert_eq!(device.live_allocations(), 0);
        Ok(())
    }

    #[test]
    fn test_fill_round_trip() -> Result<(), Box<dyn Error>> {
        let device = emulated()?;
        for count in [0, 1, 1024, 1024 * 1024] {
            let mut buffer = DeviceMemoryStorage::<u32, 1, _>::with_size(device.clone(), [count])?;
            for value in [0x00, 0xff, 0x7f] {
                buffer.init_mem(value, SyncMode::Blocking)?;
                let host = download(&buffer)?;
                let bytes: &[u8] = bytemuck::cast_slice(host.as_slice());
                assert_eq!(bytes.len(), count * 4);
                assert!(bytes.iter().all(|&x| x == value), "{count} elements of {value}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_async_fill() -> Result<(), Box<dyn Error>> {
        let device = emulated()?;
        let mut buffer = DeviceMemoryStorage::<f32, 2, _>::with_size(device.clone(), [64, 64])?;
        buffer.fill(1.5, SyncMode::Async)?;
        buffer.synchronize()?;
        let host = download(&buffer)?;
        assert!(host.as_slice().iter().all(|&x| x == 1.5));

        buffer.zero(SyncMode::Async)?;
        buffer.synchronize()?;
        let host = download(&buffer)?;
        assert!(host.as_slice().iter().all(|&x| x == 0.0));
        Ok(())
    }

    #[test]
    fn test_realloc_frees_first() -> Result<(), Box<dyn Error>> {
        let recorder = Arc::new(Recorder::default());
        let mut buffer = DeviceMemoryStorage::<f32, 2, _>::with_size(recorder.clone(), [4, 4])?;
        buffer.alloc_size([8, 8])?;
        assert_eq!(
            recorder.events(),
            vec![Event::Allocate(64), Event::Deallocate(64), Event::Allocate(256)]
        );
        assert_eq!(buffer.size(), [8, 8]);

        // realloc of the same shape still frees before allocating
        buffer.alloc()?;
        drop(buffer);
        assert_eq!(
            recorder.events()[3..],
            [Event::Deallocate(256), Event::Allocate(256), Event::Deallocate(256)]
        );
        Ok(())
    }

    #[test]
    fn test_alloc_failure() -> Result<(), Box<dyn Error>> {
        let device = Arc::new(EmulatedBuilder::new().capacity(1024).build()?);
        let mut buffer = DeviceMemoryStorage::<f32, 2, _>::with_size(device.clone(), [16, 16])?;

        let result = buffer.alloc_size([32, 32]);
        assert!(matches!(
            result,
            Err(MemoryError::Allocation {
                bytes: 4096,
                status: Status::MEMORY_ALLOCATION
            })
        ));
        // the old layout is kept, but the old buffer is gone
        assert_eq!(buffer.size(), [16, 16]);
        assert!(!buffer.is_allocated());
        assert_eq!(device.live_allocations(), 0);

        // retrying is safe
        buffer.alloc()?;
        assert!(buffer.is_allocated());

        let layout = Layout::new(DataType::U8, [16, 16]);
        assert!(matches!(
            buffer.alloc_layout(&layout),
            Err(MemoryError::LayoutMismatch { .. })
        ));
        assert!(buffer.is_allocated());
        Ok(())
    }

    #[test]
    fn test_alloc_overflow() -> Result<(), Box<dyn Error>> {
        let device = emulated()?;
        let size = [1 << (usize::BITS - 2)];
        let result = DeviceMemoryStorage::<f32, 1, _>::with_size(device.clone(), size);
        assert!(matches!(
            result,
            Err(MemoryError::Allocation {
                bytes: usize::MAX,
                status: Status::MEMORY_ALLOCATION
            })
        ));

        let mut buffer = DeviceMemoryStorage::<u8, 2, _>::with_size(device.clone(), [4, 4])?;
        let half = 1 << (usize::BITS / 2);
        assert!(buffer.alloc_size([half, half + 1]).is_err());
        assert_eq!(buffer.size(), [4, 4]);
        assert!(!buffer.is_allocated());
        assert_eq!(device.live_allocations(), 0);
        Ok(())
    }

    #[test]
    fn test_misaligned_alloc() {
        let recorder = Arc::new(Recorder {
            shift: 2,
            ..Default::default()
        });
        let result = DeviceMemoryStorage::<f32, 1, _>::with_size(recorder.clone(), [4]);
        assert!(matches!(
            result,
            Err(MemoryError::Allocation {
                bytes: 16,
                status: Status::MISALIGNED_ADDRESS
            })
        ));
        // the rejected buffer is released right away
        assert_eq!(recorder.events(), vec![Event::Allocate(16), Event::Deallocate(16)]);

        // bytes have no alignment requirement
        let buffer = DeviceMemoryStorage::<u8, 1, _>::with_size(recorder.clone(), [4]);
        assert!(buffer.is_ok_and(|buffer| buffer.is_allocated()));
    }

    #[test]
    fn test_alloc_layout() -> Result<(), Box<dyn Error>> {
        let device = emulated()?;
        let mut buffer = DeviceMemoryStorage::<u16, 2, _>::new(device.clone(), [4, 4]);
        let layout = Layout::with_pitch(u16::DATA_TYPE, [5, 3], 8)?;
        buffer.alloc_layout(&layout)?;
        assert_eq!(buffer.stride(), [1, 8]);
        assert_eq!(device.allocated_bytes(), (1 + 4 + 2 * 8) * 2);

        buffer.fill(9, SyncMode::Blocking)?;
        let host = download(&buffer)?;
        assert_eq!(host.stride(), [1, 5]);
        assert!(host.as_slice().iter().all(|&x| x == 9));
        Ok(())
    }

    #[test]
    fn test_init_forgets() -> Result<(), Box<dyn Error>> {
        let device = emulated()?;
        let mut buffer = DeviceMemoryStorage::<u8, 1, _>::with_size(device.clone(), [32])?;
        let ptr = buffer.buffer().expect("allocated").cast::<u8>();
        buffer.init();
        assert!(!buffer.is_allocated());
        drop(buffer);

        // the buffer now belongs to whoever took the address
        assert_eq!(device.live_allocations(), 1);
        unsafe { device.deallocate(ptr, 32) }?;
        assert_eq!(device.live_allocations(), 0);
        Ok(())
    }

    #[test]
    fn test_host_storage() -> Result<(), Box<dyn Error>> {
        let host = Arc::new(Host::pinned());
        let data = (0..12u32).collect::<Vec<_>>();
        let mut buffer = HostMemoryStorage::from_slice(host.clone(), [4, 3], &data)?;
        assert_eq!(buffer.space(), MemorySpace::PinnedHost);
        assert_eq!(buffer[[2, 1]], 6);
        assert_eq!(buffer[11], 11);
        assert_eq!(unsafe { *buffer.get_unchecked_at([3, 2]) }, 11);

        buffer[[0, 2]] = 100;
        assert_eq!(buffer.as_slice()[8], 100);
        assert!(HostMemoryStorage::<u32, 2>::from_slice(host, [4, 4], &data).is_err());
        Ok(())
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_host_index_out_of_bounds() {
        let host = Arc::new(Host::pageable());
        let buffer = HostMemoryStorage::<f32, 2>::with_size(host, [4, 3]).unwrap();
        let _value = buffer[[4, 0]];
    }
}
