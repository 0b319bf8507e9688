use derive_more::Display;
use thiserror::Error;

use crate::{
    device::{Status, TransferKind},
    num::DataType,
};

/// Operations an accelerator performs on behalf of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DeviceOp {
    #[display("fill")]
    Fill,
    #[display("copy ({_0})")]
    Copy(TransferKind),
    #[display("synchronize")]
    Synchronize,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("allocation of {bytes} bytes failed: {status}")]
    Allocation { bytes: usize, status: Status },
    #[error("device {op} failed: {status}")]
    DeviceOperation { op: DeviceOp, status: Status },
    #[error(
        "layout mismatch: expected {expected_count} elements of {expected_type}, found {found_count} elements of {found_type}"
    )]
    LayoutMismatch {
        expected_count: usize,
        expected_type: DataType,
        found_count: usize,
        found_type: DataType,
    },
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
}

/// Failed bound checks on shapes, indices and buffers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("layout is empty")]
    Empty,
    #[error("index {index:?} out of bounds for size {size:?}")]
    OutOfBounds { index: Vec<usize>, size: Vec<usize> },
    #[error("region at {offset:?} of size {size:?} exceeds size {bound:?}")]
    Region {
        offset: Vec<usize>,
        size: Vec<usize>,
        bound: Vec<usize>,
    },
    #[error("strides {stride:?} alias dimensions of size {size:?}")]
    Stride { size: Vec<usize>, stride: Vec<usize> },
    #[error("pitch {pitch} is shorter than row of {row} elements")]
    Pitch { pitch: usize, row: usize },
    #[error("expected {expected} dimensions, found {found}")]
    Dim { expected: usize, found: usize },
    #[error("no buffer is attached")]
    Bufferless,
}

impl MemoryError {
    /// Checks that two layouts hold the same number of elements of the same type.
    pub(crate) fn check_congruent(
        expected: (usize, DataType),
        found: (usize, DataType),
    ) -> Result<(), Self> {
        if expected != found {
            return Err(Self::LayoutMismatch {
                expected_count: expected.0,
                expected_type: expected.1,
                found_count: found.0,
                found_type: found.1,
            });
        }
        Ok(())
    }
}
