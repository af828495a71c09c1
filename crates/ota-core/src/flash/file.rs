//! File-backed flash image, used by the host runner.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use tracing::info;

use super::{FlashDevice, FlashError, check_alignment};

/// Flash contents stored in a regular file of fixed size.
pub struct FileFlash {
    file: Mutex<File>,
    size: u64,
}

impl FileFlash {
    /// Open the image at `path`, creating an erased one of `size` bytes if missing.
    pub fn open<P: AsRef<Path>>(path: P, size: u64) -> std::io::Result<Self> {
        let path = path.as_ref();
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let current = file.metadata()?.len();
        if !exists || current < size {
            info!(path = %path.display(), size, "Creating erased flash image");
            file.seek(SeekFrom::Start(current))?;
            let fill = vec![0xFF; (size - current) as usize];
            file.write_all(&fill)?;
            file.flush()?;
        }

        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }

    fn with_file<T>(
        &self,
        offset: u32,
        op: impl FnOnce(&mut File) -> std::io::Result<T>,
        fault: impl Fn(u32, String) -> FlashError,
    ) -> Result<T, FlashError> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| fault(offset, "flash lock poisoned".into()))?;
        file.seek(SeekFrom::Start(offset as u64))
            .and_then(|_| op(&mut file))
            .map_err(|e| fault(offset, e.to_string()))
    }
}

impl FlashDevice for FileFlash {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_bounds(offset, buf.len())?;
        self.with_file(offset, |f| f.read_exact(buf), |offset, message| {
            FlashError::ReadFailed { offset, message }
        })
    }

    fn write(&self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.check_bounds(offset, data.len())?;
        self.with_file(offset, |f| f.write_all(data), |offset, message| {
            FlashError::WriteFailed { offset, message }
        })
    }

    fn erase(&self, offset: u32, len: u32) -> Result<(), FlashError> {
        check_alignment(offset, len)?;
        self.check_bounds(offset, len as usize)?;
        let fill = vec![0xFF; len as usize];
        self.with_file(
            offset,
            |f| f.write_all(&fill).and_then(|_| f.flush()),
            |offset, message| FlashError::EraseFailed { offset, message },
        )
    }
}
