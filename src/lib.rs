//! Layout-driven memory storage for hosts and accelerators.
//!
//! ## Key Components
//! 1. **Layouts** (`layout`):
//!    - N-dimensional extents and strides plus an element type tag.
//!    - Offsets, regions and decomposition into gapless runs.
//!
//! 2. **Capabilities** (`memory`):
//!    - `Shaped`, `Pointer`, `Storage` and `DeviceMemory`, implemented separately by each buffer.
//!    - `PointerStorage` for everything both addressable and owned.
//!
//! 3. **Backends** (`device`):
//!    - The `Accelerator` boundary reporting raw status codes, and checked wrappers on top.
//!    - Host memory (pageable or pinned) and an emulated accelerator with its own memory space.
//!
//! 4. **Buffers** (`buffer`):
//!    - Owning storages, borrowed views of whole buffers or regions, and foreign buffers.
//!
//! 5. **Kernels and transfers** (`kernel`, `copy`):
//!    - By-value kernel descriptors tied to a borrow of their buffer.
//!    - Copies between any two memory spaces, strided layouts included.
//!
//! ```
//! use std::sync::Arc;
//!
//! use memspace::{
//!     buffer::{DeviceMemoryStorage, HostMemoryStorage},
//!     copy::{copy, download},
//!     device::{EmulatedBuilder, Host, SyncMode},
//!     memory::{DeviceMemory, Storage},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = Arc::new(EmulatedBuilder::new().build()?);
//! let mut buffer = DeviceMemoryStorage::<f32, 2, _>::with_size(device, [4, 3])?;
//! buffer.fill(1.0, SyncMode::Blocking)?;
//!
//! let host = HostMemoryStorage::from_slice(Arc::new(Host::pageable()), [4], &[2.0f32; 4])?;
//! copy(&mut buffer.region_mut([0, 1], [4, 1])?, &host)?;
//! assert_eq!(download(&buffer)?.to_vec()[..8], [1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0]);
//!
//! buffer.alloc_size([8, 8])?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod copy;
pub mod device;
pub mod error;
pub mod kernel;
pub mod layout;
pub mod memory;
pub mod num;

/// Installs a `tracing` subscriber printing backend spans to stdout.
#[cfg(feature = "trace")]
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .try_init()
}
