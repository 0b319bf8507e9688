//! Capabilities of memory objects.
//!
//! A concrete buffer type opts into each capability separately:
//! - [`Shaped`]: it has a [`Layout`];
//! - [`Pointer`] / [`PointerMut`]: it exposes the address of a buffer in some [`MemorySpace`];
//! - [`Storage`]: it owns the buffer and can allocate and free it;
//! - [`PointerStorage`]: both of the above, with the address tracking the storage state;
//! - [`DeviceMemory`]: bulk fills and kernel descriptors on top of [`Pointer`].

use std::ptr::NonNull;

pub use memspace_derive::Shaped;

use crate::{
    device::{self, Accelerator, MemorySpace, SyncMode},
    error::{DeviceOp, MemoryError},
    kernel::KernelData,
    layout::Layout,
    num::{DataType, Scalar},
};

/// Types that carry a [`Layout`].
pub trait Shaped<const D: usize> {
    fn layout(&self) -> &Layout<D>;

    #[inline]
    fn size(&self) -> [usize; D] {
        self.layout().size()
    }

    #[inline]
    fn stride(&self) -> [usize; D] {
        self.layout().stride()
    }

    #[inline]
    fn count(&self) -> usize {
        self.layout().count()
    }

    #[inline]
    fn data_type(&self) -> DataType {
        self.layout().data_type()
    }
}

/// Types whose [`Layout`] can be replaced in place.
pub trait ShapedMut<const D: usize>: Shaped<D> {
    /// # Safety
    /// The layout of an object holding a buffer describes that buffer. Callers must not leave a
    /// layout that spans more memory than the buffer holds.
    unsafe fn layout_mut(&mut self) -> &mut Layout<D>;
}

/// Raw access to a buffer of `T`.
///
/// Indexed access is unchecked: callers ensure the buffer is present, lives in a host accessible
/// memory space and that the index lies within the layout.
pub trait Pointer<T: Scalar, const D: usize>: Shaped<D> {
    /// Address of the first element, or `None` if bufferless.
    fn buffer(&self) -> Option<NonNull<T>>;

    /// The backend operating on the buffer.
    fn backend(&self) -> &dyn Accelerator;

    /// The memory space of the buffer.
    #[inline]
    fn space(&self) -> MemorySpace {
        self.backend().space()
    }

    #[inline]
    fn has_buffer(&self) -> bool {
        self.buffer().is_some()
    }

    /// Address of the first element, null if bufferless.
    #[inline]
    fn as_ptr(&self) -> *const T {
        self.buffer()
            .map_or(std::ptr::null(), |ptr| ptr.as_ptr().cast_const())
    }

    /// Address of the element at flat offset `offset`.
    #[inline]
    fn ptr_at(&self, offset: usize) -> *const T {
        self.as_ptr().wrapping_add(offset)
    }

    /// Address of the element at `index`.
    #[inline]
    fn ptr_at_index(&self, index: [usize; D]) -> *const T {
        self.ptr_at(self.layout().offset(index))
    }

    /// # Safety
    /// See the trait level documentation.
    #[inline]
    unsafe fn get_unchecked(&self, offset: usize) -> &T {
        unsafe { &*self.ptr_at(offset) }
    }

    /// # Safety
    /// See the trait level documentation.
    #[inline]
    unsafe fn get_unchecked_at(&self, index: [usize; D]) -> &T {
        unsafe { &*self.ptr_at_index(index) }
    }
}

/// Raw write access to a buffer of `T`.
pub trait PointerMut<T: Scalar, const D: usize>: Pointer<T, D> {
    #[inline]
    fn as_mut_ptr(&mut self) -> *mut T {
        self.buffer().map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    #[inline]
    fn ptr_at_mut(&mut self, offset: usize) -> *mut T {
        self.as_mut_ptr().wrapping_add(offset)
    }

    /// # Safety
    /// See the documentation of [`Pointer`].
    #[inline]
    unsafe fn get_unchecked_mut(&mut self, offset: usize) -> &mut T {
        unsafe { &mut *self.ptr_at_mut(offset) }
    }

    /// # Safety
    /// See the documentation of [`Pointer`].
    #[inline]
    unsafe fn get_unchecked_at_mut(&mut self, index: [usize; D]) -> &mut T {
        let offset = self.layout().offset(index);
        unsafe { &mut *self.ptr_at_mut(offset) }
    }
}

/// The allocation lifecycle of a buffer owner.
///
/// An owner is either uninitialized (no buffer) or allocated (a buffer sized for its current
/// layout). Changing the shape of an allocated owner always frees the old buffer first.
pub trait Storage<const D: usize>: ShapedMut<D> {
    /// Allocates a buffer for the current layout, freeing any buffer held before.
    /// An empty layout succeeds without allocating.
    fn alloc(&mut self) -> Result<(), MemoryError>;

    /// Releases the buffer if there is one. Calling it again is a no-op.
    fn free(&mut self);

    /// Forgets the buffer without releasing it. Only meant for buffers whose ownership moved
    /// elsewhere; otherwise the buffer leaks.
    fn init(&mut self);

    fn is_allocated(&self) -> bool;

    /// Reallocates for new extents with packed strides.
    fn alloc_size(&mut self, size: [usize; D]) -> Result<(), MemoryError> {
        let mut layout = *self.layout();
        layout.set_size(size);
        self.alloc_layout(&layout)
    }

    /// Frees the buffer, commits `layout` and allocates for it.
    /// On failure the previous layout is kept and the owner is left uninitialized.
    fn alloc_layout(&mut self, layout: &Layout<D>) -> Result<(), MemoryError> {
        let current = *self.layout();
        MemoryError::check_congruent(
            (layout.count(), current.data_type()),
            (layout.count(), layout.data_type()),
        )?;

        self.free();
        // SAFETY: the owner is bufferless, so no buffer can disagree with the layout
        unsafe { self.layout_mut().set_layout(layout) };
        if let Err(err) = self.alloc() {
            // SAFETY: still bufferless after a failed allocation
            unsafe { self.layout_mut().set_layout(&current) };
            return Err(err);
        }
        Ok(())
    }
}

/// Memory that is both addressable and owned.
///
/// After a successful [`Storage::alloc`] of a non-empty layout [`Pointer::buffer`] is `Some`;
/// after [`Storage::free`] it is `None`.
pub trait PointerStorage<T: Scalar, const D: usize>: Pointer<T, D> + Storage<D> {}

impl<T: Scalar, const D: usize, S> PointerStorage<T, D> for S where
    S: Pointer<T, D> + Storage<D> + ?Sized
{
}

/// Memory operated on by an accelerator.
pub trait DeviceMemory<T: Scalar, const D: usize>: Pointer<T, D> {
    /// A descriptor of the buffer to hand to a kernel. It borrows `self`, so the buffer cannot be
    /// freed or reallocated while the descriptor is alive.
    #[inline]
    fn kernel_data(&self) -> KernelData<'_, T, D> {
        KernelData::new(self)
    }

    /// Sets every byte of every element to `value`. No-op if bufferless.
    fn init_mem(&mut self, value: u8, mode: SyncMode) -> Result<(), MemoryError>
    where
        Self: PointerMut<T, D>,
    {
        let Some(data) = self.buffer() else {
            return Ok(());
        };
        let device = self.backend();
        for_each_run(self.layout(), data, |ptr, len| {
            let bytes = len * size_of::<T>();
            // SAFETY: every run lies within the buffer described by the layout
            let result = unsafe { device.fill(ptr, value, bytes) };
            device::check(DeviceOp::Fill, result)
        })?;
        device::finish(device, mode)
    }

    /// Sets every element to `value`. No-op if bufferless.
    fn fill(&mut self, value: T, mode: SyncMode) -> Result<(), MemoryError>
    where
        Self: PointerMut<T, D>,
    {
        let Some(data) = self.buffer() else {
            return Ok(());
        };
        let device = self.backend();
        let pattern = value.to_bytes();
        for_each_run(self.layout(), data, |ptr, len| {
            // SAFETY: every run lies within the buffer described by the layout
            let result = unsafe { device.fill_pattern(ptr, pattern, len) };
            device::check(DeviceOp::Fill, result)
        })?;
        device::finish(device, mode)
    }

    /// Sets every element to zero.
    #[inline]
    fn zero(&mut self, mode: SyncMode) -> Result<(), MemoryError>
    where
        Self: PointerMut<T, D>,
    {
        self.fill(T::zero(), mode)
    }

    /// Waits for all work enqueued on the backend.
    #[inline]
    fn synchronize(&self) -> Result<(), MemoryError> {
        device::finish(self.backend(), SyncMode::Blocking)
    }
}

/// Calls `f` with the address and the element count of every gapless run of `layout`.
fn for_each_run<T: Scalar, const D: usize>(
    layout: &Layout<D>,
    data: NonNull<T>,
    mut f: impl FnMut(NonNull<u8>, usize) -> Result<(), MemoryError>,
) -> Result<(), MemoryError> {
    if layout.is_empty() {
        return Ok(());
    }
    let (len, offsets) = layout.runs();
    for offset in offsets {
        // SAFETY: offsets of a layout stay within its span
        let ptr = unsafe { data.add(offset) };
        f(ptr.cast(), len)?;
    }
    Ok(())
}
