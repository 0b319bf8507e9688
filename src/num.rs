use bytemuck::{Pod, Zeroable};
use derive_more::Display;
use half::f16;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Element type tag carried by every [`Layout`](crate::layout::Layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F32,
    F16,
    U8,
    U16,
    U32,
    I32,
    PackedU4x8,
    PackedU8x4,
    PackedF32x4,
    PackedF16x4,
}

impl DataType {
    /// Returns number of element packed in this data type.
    pub const fn count(self) -> usize {
        match self {
            DataType::F32 => 1,
            DataType::F16 => 1,
            DataType::U8 => 1,
            DataType::U16 => 1,
            DataType::U32 => 1,
            DataType::I32 => 1,
            DataType::PackedU4x8 => 8,
            DataType::PackedU8x4 => 4,
            DataType::PackedF32x4 => 4,
            DataType::PackedF16x4 => 4,
        }
    }

    /// Returns the size of one element of this type in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 => 4,
            DataType::I32 => 4,
            DataType::PackedU4x8 => 4,
            DataType::PackedU8x4 => 4,
            DataType::PackedF32x4 => 16,
            DataType::PackedF16x4 => 8,
        }
    }
}

macro_rules! impl_bytemuck {
    ($ty:ty) => {
        unsafe impl ::bytemuck::Zeroable for $ty {}
        unsafe impl ::bytemuck::Pod for $ty {}
    };
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PackedU4x8(pub u32);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PackedU8x4(pub u32);

#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct PackedF32x4(pub [f32; 4]);

#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct PackedF16x4(pub [f16; 4]);

impl_bytemuck!(PackedU4x8);
impl_bytemuck!(PackedU8x4);
impl_bytemuck!(PackedF32x4);
impl_bytemuck!(PackedF16x4);

pub trait Zero {
    fn zero() -> Self;
}

pub trait One {
    fn one() -> Self;
}

macro_rules! impl_zero_one {
    ($ty:ty, $zero:expr, $one:expr) => {
        impl Zero for $ty {
            #[inline]
            fn zero() -> Self {
                $zero
            }
        }

        impl One for $ty {
            #[inline]
            fn one() -> Self {
                $one
            }
        }
    };
}

impl_zero_one!(f32, 0.0, 1.0);
impl_zero_one!(f16, f16::ZERO, f16::ONE);
impl_zero_one!(u8, 0, 1);
impl_zero_one!(u16, 0, 1);
impl_zero_one!(u32, 0, 1);
impl_zero_one!(i32, 0, 1);
impl_zero_one!(PackedU4x8, Self(0), Self(0x11111111));
impl_zero_one!(PackedU8x4, Self(0), Self(0x01010101));
impl_zero_one!(PackedF32x4, Self([0.0; 4]), Self([1.0; 4]));
impl_zero_one!(PackedF16x4, Self([f16::ZERO; 4]), Self([f16::ONE; 4]));

/// An element type that can live in a buffer of any memory space.
pub trait Scalar: Sized + Zeroable + Pod + Zero + One + Send + Sync + sealed::Sealed {
    const DATA_TYPE: DataType;

    /// The in-memory bytes of a single value.
    #[inline]
    fn to_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

macro_rules! impl_scalar {
    ($ty:ty, $data_type:ident) => {
        impl Scalar for $ty {
            const DATA_TYPE: DataType = DataType::$data_type;
        }

        impl sealed::Sealed for $ty {}
    };
}

impl_scalar!(f32, F32);
impl_scalar!(f16, F16);
impl_scalar!(u8, U8);
impl_scalar!(u16, U16);
impl_scalar!(u32, U32);
impl_scalar!(i32, I32);
impl_scalar!(PackedU4x8, PackedU4x8);
impl_scalar!(PackedU8x4, PackedU8x4);
impl_scalar!(PackedF32x4, PackedF32x4);
impl_scalar!(PackedF16x4, PackedF16x4);

mod sealed {
    pub trait Sealed {}
}

#[cfg(test)]
mod tests {
    use half::f16;

    use super::{DataType, One, PackedF16x4, PackedF32x4, PackedU4x8, PackedU8x4, Scalar};

    #[test]
    fn test_data_type_size() {
        fn check<T: Scalar>() {
            assert_eq!(T::DATA_TYPE.size(), size_of::<T>(), "{}", T::DATA_TYPE);
        }
        check::<f32>();
        check::<f16>();
        check::<u8>();
        check::<u16>();
        check::<u32>();
        check::<i32>();
        check::<PackedU4x8>();
        check::<PackedU8x4>();
        check::<PackedF32x4>();
        check::<PackedF16x4>();
    }

    #[test]
    fn test_scalar_bytes() {
        assert_eq!(PackedU8x4::one().to_bytes(), &[1, 1, 1, 1]);
        assert_eq!(1.0f32.to_bytes(), &1.0f32.to_ne_bytes());
        assert_eq!(DataType::PackedF16x4.count(), 4);
    }
}
