use std::marker::PhantomData;

use crate::{
    memory::{DeviceMemory, Pointer},
    num::Scalar,
};

/// A by-value description of a buffer as seen by a kernel: its address plus flattened extents
/// and strides.
///
/// The descriptor borrows the memory it was taken from for `'a`, so it cannot outlive the buffer
/// or survive its reallocation. It does not distinguish between read and write access.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KernelData<'a, T, const D: usize> {
    pub data: *mut T,
    pub size: [usize; D],
    pub stride: [usize; D],
    phantom: PhantomData<&'a T>,
}

impl<'a, T: Scalar, const D: usize> KernelData<'a, T, D> {
    pub fn new<P: Pointer<T, D> + ?Sized>(memory: &'a P) -> Self {
        let layout = memory.layout();
        let data = memory
            .buffer()
            .map_or(std::ptr::null_mut(), |ptr| ptr.as_ptr());
        Self {
            data,
            size: layout.size(),
            stride: layout.stride(),
            phantom: PhantomData,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.data.is_null()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.size.iter().product()
    }

    #[inline]
    pub fn offset(&self, index: [usize; D]) -> usize {
        itertools::izip!(&index, &self.stride)
            .map(|(&index, &stride)| index * stride)
            .sum()
    }

    /// Address of the element at `index`. Only host accessible memory may be dereferenced.
    #[inline]
    pub fn ptr_at(&self, index: [usize; D]) -> *mut T {
        self.data.wrapping_add(self.offset(index))
    }
}

/// Memory that can be passed to a kernel.
pub trait KernelArg<T: Scalar, const D: usize> {
    fn kernel_arg(&self) -> KernelData<'_, T, D>;
}

impl<T: Scalar, const D: usize, M> KernelArg<T, D> for M
where
    M: DeviceMemory<T, D> + ?Sized,
{
    #[inline]
    fn kernel_arg(&self) -> KernelData<'_, T, D> {
        self.kernel_data()
    }
}

/// Hands a fresh descriptor of `arg` to `kernel`. The descriptor cannot escape the call.
pub fn launch<T, const D: usize, K, F, R>(arg: &K, kernel: F) -> R
where
    T: Scalar,
    K: KernelArg<T, D> + ?Sized,
    F: for<'a> FnOnce(KernelData<'a, T, D>) -> R,
{
    let data = arg.kernel_arg();
    log::trace!("launch kernel over {:?} at {:p}", data.size, data.data);
    kernel(data)
}
