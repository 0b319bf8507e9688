use std::{
    marker::PhantomData,
    ops::{Index, IndexMut},
    ptr::NonNull,
};

use super::{host_slice, host_slice_mut, region};
use crate::{
    device::{Accelerator, Host},
    error::MemoryError,
    layout::Layout,
    memory::{DeviceMemory, Pointer, PointerMut, Shaped},
    num::Scalar,
};

/// A shared view of a buffer owned by someone else.
#[derive(Debug, Shaped)]
#[shaped(crate = "crate", readonly)]
pub struct DeviceMemoryReference<'a, T: Scalar, const D: usize, A: Accelerator> {
    #[layout]
    layout: Layout<D>,
    data: Option<NonNull<T>>,
    device: &'a A,
    phantom: PhantomData<&'a T>,
}

/// An exclusive view of a buffer owned by someone else.
#[derive(Debug, Shaped)]
#[shaped(crate = "crate", readonly)]
pub struct DeviceMemoryReferenceMut<'a, T: Scalar, const D: usize, A: Accelerator> {
    #[layout]
    layout: Layout<D>,
    data: Option<NonNull<T>>,
    device: &'a A,
    phantom: PhantomData<&'a mut T>,
}

pub type HostMemoryReference<'a, T, const D: usize> = DeviceMemoryReference<'a, T, D, Host>;
pub type HostMemoryReferenceMut<'a, T, const D: usize> = DeviceMemoryReferenceMut<'a, T, D, Host>;

// SAFETY: the views behave like `&'a [T]` and `&'a mut [T]` respectively.
unsafe impl<T: Scalar, const D: usize, A: Accelerator> Send for DeviceMemoryReference<'_, T, D, A> {}
unsafe impl<T: Scalar, const D: usize, A: Accelerator> Sync for DeviceMemoryReference<'_, T, D, A> {}
unsafe impl<T: Scalar, const D: usize, A: Accelerator> Send
    for DeviceMemoryReferenceMut<'_, T, D, A>
{
}
unsafe impl<T: Scalar, const D: usize, A: Accelerator> Sync
    for DeviceMemoryReferenceMut<'_, T, D, A>
{
}

impl<T: Scalar, const D: usize, A: Accelerator> Clone for DeviceMemoryReference<'_, T, D, A> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Scalar, const D: usize, A: Accelerator> Copy for DeviceMemoryReference<'_, T, D, A> {}

impl<'a, T: Scalar, const D: usize, A: Accelerator> DeviceMemoryReference<'a, T, D, A> {
    #[inline]
    pub(crate) fn from_parts(layout: Layout<D>, data: Option<NonNull<T>>, device: &'a A) -> Self {
        Self {
            layout,
            data,
            device,
            phantom: PhantomData,
        }
    }

    #[inline]
    pub fn device(&self) -> &'a A {
        self.device
    }

    /// Narrows the view to the sub-range of extents `size` starting at `offset`.
    pub fn region(&self, offset: [usize; D], size: [usize; D]) -> Result<Self, MemoryError> {
        let (layout, data) = region(&self.layout, self.data, offset, size)?;
        Ok(Self::from_parts(layout, data, self.device))
    }
}

impl<'a, T: Scalar, const D: usize, A: Accelerator> DeviceMemoryReferenceMut<'a, T, D, A> {
    #[inline]
    pub(crate) fn from_parts(layout: Layout<D>, data: Option<NonNull<T>>, device: &'a A) -> Self {
        Self {
            layout,
            data,
            device,
            phantom: PhantomData,
        }
    }

    #[inline]
    pub fn device(&self) -> &'a A {
        self.device
    }

    /// A shared view of the same memory, for as long as `self` is borrowed.
    #[inline]
    pub fn reborrow(&self) -> DeviceMemoryReference<'_, T, D, A> {
        DeviceMemoryReference::from_parts(self.layout, self.data, self.device)
    }

    pub fn region(
        &self,
        offset: [usize; D],
        size: [usize; D],
    ) -> Result<DeviceMemoryReference<'_, T, D, A>, MemoryError> {
        let (layout, data) = region(&self.layout, self.data, offset, size)?;
        Ok(DeviceMemoryReference::from_parts(layout, data, self.device))
    }

    pub fn region_mut(
        &mut self,
        offset: [usize; D],
        size: [usize; D],
    ) -> Result<DeviceMemoryReferenceMut<'_, T, D, A>, MemoryError> {
        let (layout, data) = region(&self.layout, self.data, offset, size)?;
        Ok(DeviceMemoryReferenceMut::from_parts(layout, data, self.device))
    }
}

impl<T: Scalar, const D: usize, A: Accelerator> Pointer<T, D>
    for DeviceMemoryReference<'_, T, D, A>
{
    #[inline]
    fn buffer(&self) -> Option<NonNull<T>> {
        self.data
    }

    #[inline]
    fn backend(&self) -> &dyn Accelerator {
        self.device
    }
}

impl<T: Scalar, const D: usize, A: Accelerator> DeviceMemory<T, D>
    for DeviceMemoryReference<'_, T, D, A>
{
}

impl<T: Scalar, const D: usize, A: Accelerator> Pointer<T, D>
    for DeviceMemoryReferenceMut<'_, T, D, A>
{
    #[inline]
    fn buffer(&self) -> Option<NonNull<T>> {
        self.data
    }

    #[inline]
    fn backend(&self) -> &dyn Accelerator {
        self.device
    }
}

impl<T: Scalar, const D: usize, A: Accelerator> PointerMut<T, D>
    for DeviceMemoryReferenceMut<'_, T, D, A>
{
}

impl<T: Scalar, const D: usize, A: Accelerator> DeviceMemory<T, D>
    for DeviceMemoryReferenceMut<'_, T, D, A>
{
}

impl<'a, T: Scalar, const D: usize> HostMemoryReference<'a, T, D> {
    /// The memory spanned by the view, padding and gaps included.
    #[inline]
    pub fn as_slice(&self) -> &'a [T] {
        // SAFETY: host memory borrowed from its owner for `'a`
        unsafe { host_slice(self.data, self.layout.span()) }
    }

    /// The elements in index order.
    pub fn to_vec(&self) -> Vec<T> {
        let data = self.as_slice();
        if data.is_empty() {
            return vec![];
        }
        self.layout.offsets(0).map(|offset| data[offset]).collect()
    }
}

impl<T: Scalar, const D: usize> HostMemoryReferenceMut<'_, T, D> {
    /// The memory spanned by the view, padding and gaps included.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: host memory exclusively borrowed from its owner
        unsafe { host_slice(self.data, self.layout.span()) }
    }

    /// The memory spanned by the view, padding and gaps included.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: host memory exclusively borrowed from its owner
        unsafe { host_slice_mut(self.data, self.layout.span()) }
    }
}

impl<T: Scalar, const D: usize> Index<[usize; D]> for HostMemoryReference<'_, T, D> {
    type Output = T;

    fn index(&self, index: [usize; D]) -> &Self::Output {
        match self.layout.try_offset(index) {
            Ok(offset) => &self.as_slice()[offset],
            Err(err) => panic!("{err}"),
        }
    }
}

impl<T: Scalar, const D: usize> Index<[usize; D]> for HostMemoryReferenceMut<'_, T, D> {
    type Output = T;

    fn index(&self, index: [usize; D]) -> &Self::Output {
        match self.layout.try_offset(index) {
            Ok(offset) => &self.as_slice()[offset],
            Err(err) => panic!("{err}"),
        }
    }
}

impl<T: Scalar, const D: usize> IndexMut<[usize; D]> for HostMemoryReferenceMut<'_, T, D> {
    fn index_mut(&mut self, index: [usize; D]) -> &mut Self::Output {
        match self.layout.try_offset(index) {
            Ok(offset) => &mut self.as_mut_slice()[offset],
            Err(err) => panic!("{err}"),
        }
    }
}
