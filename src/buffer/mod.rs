//! Concrete memory objects.
//!
//! [`DeviceMemoryStorage`] owns its buffer. [`DeviceMemoryReference`] and
//! [`DeviceMemoryReferenceMut`] borrow a buffer from its owner, whole or a region of it.
//! [`ForeignMemory`] wraps a buffer owned outside this crate. Only storages ever free.

use std::ptr::NonNull;

pub use foreign::ForeignMemory;
pub use reference::{
    DeviceMemoryReference, DeviceMemoryReferenceMut, HostMemoryReference, HostMemoryReferenceMut,
};
pub use storage::{DeviceMemoryStorage, HostMemoryStorage};

use crate::{error::MemoryError, layout::Layout};

mod foreign;
mod reference;
mod storage;

/// Layout and address of a region of the buffer at `data`, described by `layout`.
fn region<T, const D: usize>(
    layout: &Layout<D>,
    data: Option<NonNull<T>>,
    offset: [usize; D],
    size: [usize; D],
) -> Result<(Layout<D>, Option<NonNull<T>>), MemoryError> {
    let (start, layout) = layout.region(offset, size)?;
    // SAFETY: the region starts within the span of the parent layout
    let data = data.map(|ptr| unsafe { ptr.add(start) });
    Ok((layout, data))
}

/// # Safety
/// If present, `data` must point to `len` initialized elements in host memory, not mutated for
/// `'a`.
#[inline]
unsafe fn host_slice<'a, T>(data: Option<NonNull<T>>, len: usize) -> &'a [T] {
    match data {
        Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) },
        None => &[],
    }
}

/// # Safety
/// If present, `data` must point to `len` initialized elements in host memory, not aliased for
/// `'a`.
#[inline]
unsafe fn host_slice_mut<'a, T>(data: Option<NonNull<T>>, len: usize) -> &'a mut [T] {
    match data {
        Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) },
        None => &mut [],
    }
}
