//! Flash storage abstraction.
//!
//! Defines the `FlashDevice` trait the slot layer writes through, allowing
//! different backends (in-memory, file-backed image, real hardware).

pub mod file;
pub mod memory;

pub use file::FileFlash;
pub use memory::MemoryFlash;

use std::sync::Arc;
use thiserror::Error;

/// Erase granularity.
pub const SECTOR_SIZE: u32 = 0x1000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    #[error("Access out of bounds: offset 0x{offset:08X} len {len} (flash size {size})")]
    OutOfBounds { offset: u32, len: usize, size: u64 },

    #[error("Erase at 0x{offset:08X} len {len} is not sector aligned")]
    Misaligned { offset: u32, len: u32 },

    #[error("Erase failed at 0x{offset:08X}: {message}")]
    EraseFailed { offset: u32, message: String },

    #[error("Write failed at 0x{offset:08X}: {message}")]
    WriteFailed { offset: u32, message: String },

    #[error("Read failed at 0x{offset:08X}: {message}")]
    ReadFailed { offset: u32, message: String },
}

/// Abstract flash interface.
///
/// Operations are blocking. Callers never issue concurrent writes to the
/// same region.
pub trait FlashDevice: Send + Sync {
    /// Total addressable size in bytes.
    fn size(&self) -> u64;

    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Program `data` at `offset`. The region must have been erased.
    fn write(&self, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erase `len` bytes at `offset`; both must be sector aligned.
    fn erase(&self, offset: u32, len: u32) -> Result<(), FlashError>;

    /// Check that `[offset, offset + len)` lies inside the device.
    fn check_bounds(&self, offset: u32, len: usize) -> Result<(), FlashError> {
        if offset as u64 + len as u64 > self.size() {
            return Err(FlashError::OutOfBounds {
                offset,
                len,
                size: self.size(),
            });
        }
        Ok(())
    }
}

impl<T: FlashDevice + ?Sized> FlashDevice for Arc<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(offset, buf)
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).write(offset, data)
    }

    fn erase(&self, offset: u32, len: u32) -> Result<(), FlashError> {
        (**self).erase(offset, len)
    }
}

pub(crate) fn check_alignment(offset: u32, len: u32) -> Result<(), FlashError> {
    if offset % SECTOR_SIZE != 0 || len % SECTOR_SIZE != 0 {
        return Err(FlashError::Misaligned { offset, len });
    }
    Ok(())
}
