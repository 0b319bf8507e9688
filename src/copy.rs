//! Transfers between any two addressable memory objects.

use std::sync::Arc;

use crate::{
    buffer::{DeviceMemoryStorage, HostMemoryStorage},
    device::{self, Accelerator, Host, SyncMode, TransferKind},
    error::{DeviceOp, DomainError, MemoryError},
    layout::{Layout, Offsets},
    memory::{Pointer, PointerMut, Storage},
    num::Scalar,
};

/// Copies every element of `src` into `dst` in index order and waits for completion.
///
/// Both sides must hold the same number of elements of the same type; otherwise nothing is
/// written. The transfer direction follows from the memory spaces of both sides.
pub fn copy<T, const D: usize, const E: usize, Dst, Src>(
    dst: &mut Dst,
    src: &Src,
) -> Result<(), MemoryError>
where
    T: Scalar,
    Dst: PointerMut<T, D> + ?Sized,
    Src: Pointer<T, E> + ?Sized,
{
    transfer(dst, src, SyncMode::Blocking)
}

/// Like [`copy`], but returns once the transfer is enqueued if both sides are device memory.
///
/// Transfers touching host memory always complete before returning: the host side is only
/// borrowed for the duration of the call. Device buffers wait for pending work before they are
/// released, so an enqueued device-to-device copy never outlives its buffers.
pub fn copy_async<T, const D: usize, const E: usize, Dst, Src>(
    dst: &mut Dst,
    src: &Src,
) -> Result<(), MemoryError>
where
    T: Scalar,
    Dst: PointerMut<T, D> + ?Sized,
    Src: Pointer<T, E> + ?Sized,
{
    transfer(dst, src, SyncMode::Async)
}

/// Copies `src` into a fresh packed host storage.
pub fn download<T, const D: usize, Src>(src: &Src) -> Result<HostMemoryStorage<T, D>, MemoryError>
where
    T: Scalar,
    Src: Pointer<T, D> + ?Sized,
{
    let host = Arc::new(Host::pageable());
    let mut dst = HostMemoryStorage::<T, D>::with_size(host, src.layout().size())?;
    copy(&mut dst, src)?;
    Ok(dst)
}

/// Copies `src` into a fresh packed storage on `device`.
pub fn upload<T, const D: usize, A, Src>(
    device: Arc<A>,
    src: &Src,
) -> Result<DeviceMemoryStorage<T, D, A>, MemoryError>
where
    T: Scalar,
    A: Accelerator,
    Src: Pointer<T, D> + ?Sized,
{
    let mut dst = DeviceMemoryStorage::<T, D, A>::new(device, src.layout().size());
    dst.alloc()?;
    copy(&mut dst, src)?;
    Ok(dst)
}

fn transfer<T, const D: usize, const E: usize, Dst, Src>(
    dst: &mut Dst,
    src: &Src,
    mode: SyncMode,
) -> Result<(), MemoryError>
where
    T: Scalar,
    Dst: PointerMut<T, D> + ?Sized,
    Src: Pointer<T, E> + ?Sized,
{
    let (dst_layout, src_layout) = (*dst.layout(), *src.layout());
    MemoryError::check_congruent(
        (dst_layout.count(), dst_layout.data_type()),
        (src_layout.count(), src_layout.data_type()),
    )?;
    if dst_layout.is_empty() {
        return Ok(());
    }
    let (Some(dst_data), Some(src_data)) = (dst.buffer(), src.buffer()) else {
        return Err(DomainError::Bufferless.into());
    };

    let kind = TransferKind::between(src.space(), dst.space());
    let mode = match kind {
        TransferKind::DeviceToDevice => mode,
        _ => SyncMode::Blocking,
    };
    let device: &dyn Accelerator = match kind {
        TransferKind::HostToDevice => dst.backend(),
        TransferKind::DeviceToHost => src.backend(),
        TransferKind::HostToHost | TransferKind::DeviceToDevice => dst.backend(),
    };
    let op = DeviceOp::Copy(kind);
    log::trace!(
        "{}: copy {src_layout} into {dst_layout} ({kind})",
        device.name()
    );

    let size = size_of::<T>();
    for (dst_offset, src_offset, len) in paired_runs(&dst_layout, &src_layout) {
        // SAFETY: both runs lie within the spans of their buffers
        let result = unsafe {
            let dst = dst_data.add(dst_offset).cast();
            let src = src_data.add(src_offset).cast();
            device.copy(dst, src, len * size, kind)
        };
        device::check(op, result)?;
    }
    device::finish(device, mode)
}

/// Splits two layouts of the same element count into pairs of gapless runs of equal length,
/// in index order. Yields `(dst_offset, src_offset, len)`.
fn paired_runs<const D: usize, const E: usize>(
    dst: &Layout<D>,
    src: &Layout<E>,
) -> impl Iterator<Item = (usize, usize, usize)> {
    let (dst_len, dst_offsets) = dst.runs();
    let (src_len, src_offsets) = src.runs();
    let len = gcd(dst_len, src_len);
    let dst = split(dst_offsets, dst_len, len);
    let src = split(src_offsets, src_len, len);
    dst.zip(src).map(move |(dst, src)| (dst, src, len))
}

/// Breaks every run of `run` elements into pieces of `len`.
fn split<const D: usize>(
    offsets: Offsets<D>,
    run: usize,
    len: usize,
) -> impl Iterator<Item = usize> {
    offsets.flat_map(move |offset| (0..run / len).map(move |index| offset + index * len))
}

fn gcd(mut x: usize, mut y: usize) -> usize {
    while y != 0 {
        (x, y) = (y, x % y);
    }
    x
}

#[cfg(test)]
mod tests {
    use std::{error::Error, sync::Arc};

    use itertools::Itertools;

    use super::{copy, copy_async, download, paired_runs, upload};
    use crate::{
        buffer::{DeviceMemoryStorage, HostMemoryStorage},
        device::{EmulatedBuilder, Host, SyncMode},
        error::{DomainError, MemoryError},
        layout::Layout,
        memory::{DeviceMemory, Pointer, Shaped, Storage},
        num::{DataType, Scalar},
    };

    #[test]
    fn test_paired_runs() {
        let dst = Layout::new(DataType::U8, [6, 2]);
        let src = Layout::with_pitch(DataType::U8, [3, 4], 5).unwrap();
        let runs = paired_runs(&dst, &src).collect_vec();
        assert_eq!(runs, vec![(0, 0, 3), (3, 5, 3), (6, 10, 3), (9, 15, 3)]);

        let dst = Layout::from_parts_unchecked(DataType::U8, [2, 2], [2, 1]);
        let src = Layout::new(DataType::U8, [4]);
        let runs = paired_runs(&dst, &src).collect_vec();
        assert_eq!(runs, vec![(0, 0, 1), (2, 1, 1), (1, 2, 1), (3, 3, 1)]);
    }

    #[test]
    fn test_round_trip() -> Result<(), Box<dyn Error>> {
        fastrand::seed(7);
        let host = Arc::new(Host::pageable());
        let device = Arc::new(EmulatedBuilder::new().build()?);

        let data = (0..24 * 16).map(|_| fastrand::f32()).collect_vec();
        let source = HostMemoryStorage::from_slice(host, [24, 16], &data)?;
        let buffer = upload(device.clone(), &source)?;
        let mut other = buffer.clone();
        assert!(!other.has_buffer());
        other.alloc_size([16, 24])?;

        copy(&mut other, &buffer)?;
        let result = download(&other)?;
        assert_eq!(result.size(), [16, 24]);
        assert_eq!(result.as_slice(), data);
        Ok(())
    }

    #[test]
    fn test_mismatch_leaves_destination() -> Result<(), Box<dyn Error>> {
        let host = Arc::new(Host::pageable());
        let device = Arc::new(EmulatedBuilder::new().build()?);

        let source = HostMemoryStorage::from_slice(host, [100], &[1u32; 100])?;
        let mut buffer = DeviceMemoryStorage::<u32, 1, _>::with_size(device, [50])?;
        buffer.fill(9, SyncMode::Blocking)?;

        let result = copy(&mut buffer, &source);
        assert!(matches!(
            result,
            Err(MemoryError::LayoutMismatch {
                expected_count: 50,
                found_count: 100,
                ..
            })
        ));
        assert!(download(&buffer)?.as_slice().iter().all(|&x| x == 9));
        Ok(())
    }

    #[test]
    fn test_async_upload_releases_host() -> Result<(), Box<dyn Error>> {
        let host = Arc::new(Host::pinned());
        let device = Arc::new(EmulatedBuilder::new().build()?);

        // keep the stream busy so the transfer cannot finish early by accident
        let mut scratch = DeviceMemoryStorage::<u8, 1, _>::with_size(device.clone(), [64 << 20])?;
        for value in 0..4 {
            scratch.init_mem(value, SyncMode::Async)?;
        }

        let mut buffer = DeviceMemoryStorage::<u32, 1, _>::with_size(device.clone(), [65536])?;
        let source = HostMemoryStorage::from_slice(host.clone(), [65536], &[1u32; 65536])?;
        copy_async(&mut buffer, &source)?;
        drop(source);
        buffer.synchronize()?;
        assert!(download(&buffer)?.as_slice().iter().all(|&x| x == 1));

        // and the other way round: the host side is readable right after the call
        buffer.fill(7, SyncMode::Async)?;
        let mut output = HostMemoryStorage::<u32, 1>::with_size(host, [65536])?;
        copy_async(&mut output, &buffer)?;
        assert!(output.as_slice().iter().all(|&x| x == 7));
        Ok(())
    }

    #[test]
    fn test_async_device_copy() -> Result<(), Box<dyn Error>> {
        let device = Arc::new(EmulatedBuilder::new().build()?);
        let mut source = DeviceMemoryStorage::<f32, 2, _>::with_size(device.clone(), [32, 32])?;
        source.fill(0.5, SyncMode::Async)?;
        let mut buffer = source.clone();
        buffer.alloc()?;
        copy_async(&mut buffer, &source)?;

        // releasing the source waits for the pending copy
        drop(source);
        assert_eq!(device.live_allocations(), 1);
        assert!(download(&buffer)?.as_slice().iter().all(|&x| x == 0.5));
        Ok(())
    }

    #[test]
    fn test_bufferless() -> Result<(), Box<dyn Error>> {
        let host = Arc::new(Host::pageable());
        let source = HostMemoryStorage::<u8, 2>::new(host.clone(), [4, 4]);
        let mut buffer = HostMemoryStorage::<u8, 2>::with_size(host, [4, 4])?;
        assert!(matches!(
            copy(&mut buffer, &source),
            Err(MemoryError::Domain(DomainError::Bufferless))
        ));
        Ok(())
    }

    #[test]
    fn test_strided_copy() -> Result<(), Box<dyn Error>> {
        let host = Arc::new(Host::pinned());
        let device = Arc::new(EmulatedBuilder::new().build()?);

        let data = (0..12u16).collect_vec();
        let source = HostMemoryStorage::from_slice(host.clone(), [4, 3], &data)?;
        let layout = Layout::with_pitch(u16::DATA_TYPE, [4, 3], 6)?;
        let mut pitched = DeviceMemoryStorage::<u16, 2, _>::with_layout(device, layout)?;
        pitched.fill(0xffff, SyncMode::Blocking)?;
        copy_async(&mut pitched, &source)?;
        pitched.synchronize()?;

        let mut padded = HostMemoryStorage::<u16, 2>::with_layout(host, layout)?;
        copy(&mut padded, &pitched)?;
        assert_eq!(padded.to_vec(), data);
        // padding is never touched by the copy
        assert_eq!(padded.as_slice()[4..6], [0, 0]);

        // a column of the device buffer, into a host vector
        let column = pitched.region([1, 0], [1, 3])?;
        let mut output = HostMemoryStorage::<u16, 1>::with_size(Arc::new(Host::pageable()), [3])?;
        copy(&mut output, &column)?;
        assert_eq!(output.as_slice(), &[1, 5, 9]);
        Ok(())
    }
}
