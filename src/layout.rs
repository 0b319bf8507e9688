use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    error::DomainError,
    num::{DataType, Scalar},
};

/// Shape description of an `D`-dimensional array: extents, strides (in elements) and the element
/// type. Owns no memory.
///
/// Dimension `0` is the fastest-varying one. Layouts built through [`Layout::new`],
/// [`Layout::with_pitch`] or [`Layout::from_parts`] satisfy `stride[0] == 1` and
/// `stride[i] >= stride[i - 1] * size[i - 1]`, so no two indices alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(into = "LayoutRepr", try_from = "LayoutRepr")
)]
pub struct Layout<const D: usize> {
    size: [usize; D],
    stride: [usize; D],
    data_type: DataType,
}

impl<const D: usize> Layout<D> {
    /// A packed layout with the given extents.
    #[inline]
    pub fn new(data_type: DataType, size: [usize; D]) -> Self {
        let stride = Self::packed_stride(size);
        Self {
            size,
            stride,
            data_type,
        }
    }

    /// A packed layout for elements of type `T`.
    #[inline]
    pub fn of<T: Scalar>(size: [usize; D]) -> Self {
        Self::new(T::DATA_TYPE, size)
    }

    /// A layout whose rows (dimension `0`) are `pitch` elements apart, as returned by pitched
    /// device allocators. Higher dimensions are packed on top of the padded rows.
    pub fn with_pitch(
        data_type: DataType,
        size: [usize; D],
        pitch: usize,
    ) -> Result<Self, DomainError> {
        if D < 2 {
            return Err(DomainError::Dim {
                expected: 2,
                found: D,
            });
        }
        if pitch < size[0] {
            return Err(DomainError::Pitch {
                pitch,
                row: size[0],
            });
        }
        let mut stride = [1; D];
        stride[1] = pitch;
        for i in 2..D {
            stride[i] = stride[i - 1].saturating_mul(size[i - 1]);
        }
        Ok(Self {
            size,
            stride,
            data_type,
        })
    }

    /// A layout with explicit strides, checked against the no-alias invariant.
    pub fn from_parts(
        data_type: DataType,
        size: [usize; D],
        stride: [usize; D],
    ) -> Result<Self, DomainError> {
        let layout = Self::from_parts_unchecked(data_type, size, stride);
        layout.validate()?;
        Ok(layout)
    }

    /// A layout with arbitrary strides. Meant for views that deliberately alias or reorder
    /// dimensions of an existing buffer.
    #[inline]
    pub const fn from_parts_unchecked(
        data_type: DataType,
        size: [usize; D],
        stride: [usize; D],
    ) -> Self {
        Self {
            size,
            stride,
            data_type,
        }
    }

    /// Strides of a packed array with extents `size`. Saturates at `usize::MAX`.
    pub fn packed_stride(size: [usize; D]) -> [usize; D] {
        let mut stride = [1usize; D];
        for i in 1..D {
            stride[i] = stride[i - 1].saturating_mul(size[i - 1]);
        }
        stride
    }

    fn validate(&self) -> Result<(), DomainError> {
        if D == 0 {
            return Ok(());
        }
        let packed = |i: usize| self.stride[i - 1].saturating_mul(self.size[i - 1]);
        let valid = self.stride[0] == 1 && (1..D).all(|i| self.stride[i] >= packed(i));
        if !valid {
            return Err(DomainError::Stride {
                size: self.size.to_vec(),
                stride: self.stride.to_vec(),
            });
        }
        Ok(())
    }

    #[inline]
    pub const fn size(&self) -> [usize; D] {
        self.size
    }

    #[inline]
    pub const fn stride(&self) -> [usize; D] {
        self.stride
    }

    #[inline]
    pub const fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Number of dimensions.
    #[inline]
    pub const fn dim(&self) -> usize {
        D
    }

    /// Total number of elements, i.e., the product of all extents. Saturates at `usize::MAX`.
    #[inline]
    pub fn count(&self) -> usize {
        self.checked_count().unwrap_or(usize::MAX)
    }

    /// Total number of elements, or `None` if it does not fit into `usize`.
    pub fn checked_count(&self) -> Option<usize> {
        if self.size.contains(&0) {
            return Some(0);
        }
        self.size.iter().try_fold(1usize, |acc, &x| acc.checked_mul(x))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Number of elements a buffer must hold to back this layout, padding included.
    /// Saturates at `usize::MAX`.
    #[inline]
    pub fn span(&self) -> usize {
        self.checked_span().unwrap_or(usize::MAX)
    }

    /// Number of elements a buffer must hold, or `None` if it does not fit into `usize`.
    pub fn checked_span(&self) -> Option<usize> {
        if self.is_empty() {
            return Some(0);
        }
        itertools::izip!(&self.size, &self.stride).try_fold(1usize, |acc, (&size, &stride)| {
            (size - 1).checked_mul(stride)?.checked_add(acc)
        })
    }

    /// Number of bytes a buffer must hold to back this layout, or `None` if it does not fit into
    /// `usize`.
    #[inline]
    pub fn data_size(&self) -> Option<usize> {
        self.checked_span()?.checked_mul(self.data_type.size())
    }

    /// Returns `true` if the elements occupy one gapless block in index order.
    #[inline]
    pub fn is_contiguous(&self) -> bool {
        self.is_empty() || self.stride == Self::packed_stride(self.size)
    }

    /// Replaces the extents and re-derives packed strides. Never touches any buffer.
    #[inline]
    pub fn set_size(&mut self, size: [usize; D]) {
        self.size = size;
        self.stride = Self::packed_stride(size);
    }

    /// Replaces the whole shape description. Never touches any buffer.
    #[inline]
    pub fn set_layout(&mut self, layout: &Layout<D>) {
        *self = *layout;
    }

    /// Flat element offset of `index`: `Σ index[i] * stride[i]`. Unchecked.
    #[inline]
    pub fn offset(&self, index: [usize; D]) -> usize {
        itertools::izip!(&index, &self.stride)
            .map(|(&index, &stride)| index * stride)
            .sum()
    }

    /// Checked variant of [`Layout::offset`].
    pub fn try_offset(&self, index: [usize; D]) -> Result<usize, DomainError> {
        if self.is_empty() {
            return Err(DomainError::Empty);
        }
        if itertools::izip!(&index, &self.size).any(|(index, size)| index >= size) {
            return Err(DomainError::OutOfBounds {
                index: index.to_vec(),
                size: self.size.to_vec(),
            });
        }
        Ok(self.offset(index))
    }

    /// Layout of the sub-range starting at `offset` with extents `size`, sharing this layout's
    /// strides. Returns the flat element offset of the sub-range's first element alongside.
    pub fn region(
        &self,
        offset: [usize; D],
        size: [usize; D],
    ) -> Result<(usize, Layout<D>), DomainError> {
        let fits = itertools::izip!(&offset, &size, &self.size)
            .all(|(&offset, &size, &bound)| offset.checked_add(size).is_some_and(|x| x <= bound));
        if !fits {
            return Err(DomainError::Region {
                offset: offset.to_vec(),
                size: size.to_vec(),
                bound: self.size.to_vec(),
            });
        }
        let start = if size.contains(&0) {
            0
        } else {
            self.offset(offset)
        };
        let layout = Self {
            size,
            stride: self.stride,
            data_type: self.data_type,
        };
        Ok((start, layout))
    }

    /// Flat offsets of every index over dimensions `skip..D`, with dimension `skip` varying
    /// fastest. Dimensions below `skip` are held at `0`.
    #[inline]
    pub fn offsets(&self, skip: usize) -> Offsets<D> {
        let skip = skip.min(D);
        let done = self.size[skip..].contains(&0);
        Offsets {
            layout: *self,
            skip,
            index: [0; D],
            done,
        }
    }

    /// Decomposes the layout into equally long gapless runs of elements.
    /// Returns the run length and the flat offset of each run.
    pub fn runs(&self) -> (usize, Offsets<D>) {
        match (self.is_contiguous(), D > 0 && self.stride[0] == 1) {
            (true, _) => (self.count(), self.offsets(D)),
            (false, true) => (self.size[0], self.offsets(1)),
            (false, false) => (1, self.offsets(0)),
        }
    }
}

impl<const D: usize> std::fmt::Display for Layout<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}]:[{}] {}",
            self.size.iter().format(", "),
            self.stride.iter().format(", "),
            self.data_type
        )
    }
}

/// Iterator returned by [`Layout::offsets`].
#[derive(Debug, Clone)]
pub struct Offsets<const D: usize> {
    layout: Layout<D>,
    skip: usize,
    index: [usize; D],
    done: bool,
}

impl<const D: usize> Iterator for Offsets<D> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let offset = self.layout.offset(self.index);

        let mut dim = self.skip;
        loop {
            if dim == D {
                self.done = true;
                break;
            }
            self.index[dim] += 1;
            if self.index[dim] < self.layout.size[dim] {
                break;
            }
            self.index[dim] = 0;
            dim += 1;
        }
        Some(offset)
    }
}

#[cfg(feature = "serde")]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LayoutRepr {
    size: Vec<usize>,
    stride: Vec<usize>,
    data_type: DataType,
}

#[cfg(feature = "serde")]
impl<const D: usize> From<Layout<D>> for LayoutRepr {
    fn from(value: Layout<D>) -> Self {
        Self {
            size: value.size.to_vec(),
            stride: value.stride.to_vec(),
            data_type: value.data_type,
        }
    }
}

#[cfg(feature = "serde")]
impl<const D: usize> TryFrom<LayoutRepr> for Layout<D> {
    type Error = DomainError;

    fn try_from(value: LayoutRepr) -> Result<Self, Self::Error> {
        let dim = |x: Vec<usize>| {
            <[usize; D]>::try_from(x).map_err(|x| DomainError::Dim {
                expected: D,
                found: x.len(),
            })
        };
        let size = dim(value.size)?;
        let stride = dim(value.stride)?;
        Self::from_parts(value.data_type, size, stride)
    }
}
