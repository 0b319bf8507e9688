use std::{marker::PhantomData, ptr::NonNull, sync::Arc};

use super::{DeviceMemoryReference, DeviceMemoryReferenceMut};
use crate::{
    device::{Accelerator, MemorySpace},
    error::MemoryError,
    layout::Layout,
    memory::{DeviceMemory, Pointer, PointerMut, Shaped},
    num::Scalar,
};

/// A buffer owned outside of this crate, e.g., a graphics buffer object mapped for the
/// accelerator. It is never freed from here.
#[derive(Debug, Shaped)]
#[shaped(crate = "crate", readonly)]
pub struct ForeignMemory<T: Scalar, const D: usize, A: Accelerator> {
    #[layout]
    layout: Layout<D>,
    data: NonNull<T>,
    space: MemorySpace,
    device: Arc<A>,
    phantom: PhantomData<T>,
}

// SAFETY: whoever created the wrapper vouched for the buffer, and the backend is `Send + Sync`.
unsafe impl<T: Scalar, const D: usize, A: Accelerator> Send for ForeignMemory<T, D, A> {}
unsafe impl<T: Scalar, const D: usize, A: Accelerator> Sync for ForeignMemory<T, D, A> {}

impl<T: Scalar, const D: usize, A: Accelerator> ForeignMemory<T, D, A> {
    /// Wraps the buffer at `data`, which lives in `space` and is operated on by `device`.
    ///
    /// # Safety
    /// `data` must be aligned for `T`, valid for `layout.data_size()` bytes in `space` and
    /// reachable by `device`. It must stay valid until the wrapper is dropped and all work
    /// enqueued on it has completed.
    pub unsafe fn from_raw(
        device: Arc<A>,
        data: NonNull<T>,
        layout: Layout<D>,
        space: MemorySpace,
    ) -> Result<Self, MemoryError> {
        MemoryError::check_congruent(
            (layout.count(), T::DATA_TYPE),
            (layout.count(), layout.data_type()),
        )?;
        log::trace!("{}: wrap foreign buffer at {data:p} in {space}", device.name());
        Ok(Self {
            layout,
            data,
            space,
            device,
            phantom: PhantomData,
        })
    }

    /// Gives the address back to its owner.
    #[inline]
    pub fn into_raw(self) -> NonNull<T> {
        self.data
    }

    #[inline]
    pub fn device(&self) -> &Arc<A> {
        &self.device
    }

    #[inline]
    pub fn reference(&self) -> DeviceMemoryReference<'_, T, D, A> {
        DeviceMemoryReference::from_parts(self.layout, Some(self.data), &self.device)
    }

    #[inline]
    pub fn reference_mut(&mut self) -> DeviceMemoryReferenceMut<'_, T, D, A> {
        DeviceMemoryReferenceMut::from_parts(self.layout, Some(self.data), &self.device)
    }
}

impl<T: Scalar, const D: usize, A: Accelerator> Pointer<T, D> for ForeignMemory<T, D, A> {
    #[inline]
    fn buffer(&self) -> Option<NonNull<T>> {
        Some(self.data)
    }

    #[inline]
    fn backend(&self) -> &dyn Accelerator {
        self.device.as_ref()
    }

    #[inline]
    fn space(&self) -> MemorySpace {
        self.space
    }
}

impl<T: Scalar, const D: usize, A: Accelerator> PointerMut<T, D> for ForeignMemory<T, D, A> {}

impl<T: Scalar, const D: usize, A: Accelerator> DeviceMemory<T, D> for ForeignMemory<T, D, A> {}
