//! In-memory flash for testing.

use std::sync::{Arc, Mutex};

use super::{FlashDevice, FlashError, check_alignment};

/// NOR-like flash held in memory.
///
/// Erase sets bytes to `0xFF`; programming can only clear bits. Clones share
/// the same backing store so tests can inspect it after handing one out.
#[derive(Clone)]
pub struct MemoryFlash {
    /// Flash contents.
    data: Arc<Mutex<Vec<u8>>>,
    /// Captured writes as (offset, len).
    write_log: Arc<Mutex<Vec<(u32, usize)>>>,
    /// Remaining bytes before writes start failing.
    write_budget: Arc<Mutex<Option<usize>>>,
    /// Whether erase should fail.
    fail_erase: Arc<Mutex<bool>>,
}

impl MemoryFlash {
    /// Create an erased flash of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0xFF; size])),
            write_log: Arc::new(Mutex::new(Vec::new())),
            write_budget: Arc::new(Mutex::new(None)),
            fail_erase: Arc::new(Mutex::new(false)),
        }
    }

    /// Let the next `bytes` bytes be written, then fail every write.
    pub fn fail_writes_after(&self, bytes: usize) {
        *self.write_budget.lock().unwrap() = Some(bytes);
    }

    /// Simulate an erase failure.
    pub fn fail_erase(&self, fail: bool) {
        *self.fail_erase.lock().unwrap() = fail;
    }

    /// Get all captured writes.
    pub fn writes(&self) -> Vec<(u32, usize)> {
        self.write_log.lock().unwrap().clone()
    }

    /// Total bytes programmed inside `[start, start + len)`.
    pub fn bytes_written_in(&self, start: u32, len: u32) -> usize {
        let end = start as u64 + len as u64;
        self.write_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(offset, _)| (*offset as u64) >= start as u64 && (*offset as u64) < end)
            .map(|(_, n)| n)
            .sum()
    }

    /// Copy out a region.
    pub fn snapshot(&self, offset: u32, len: usize) -> Vec<u8> {
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        data[start..start + len].to_vec()
    }

    /// Overwrite a region directly, bypassing NOR semantics.
    pub fn load(&self, offset: u32, bytes: &[u8]) {
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl FlashDevice for MemoryFlash {
    fn size(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn read(&self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_bounds(offset, buf.len())?;
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, offset: u32, bytes: &[u8]) -> Result<(), FlashError> {
        self.check_bounds(offset, bytes.len())?;

        let mut budget = self.write_budget.lock().unwrap();
        if let Some(remaining) = budget.as_mut() {
            if *remaining < bytes.len() {
                return Err(FlashError::WriteFailed {
                    offset,
                    message: "injected write failure".into(),
                });
            }
            *remaining -= bytes.len();
        }

        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        for (cell, byte) in data[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        self.write_log.lock().unwrap().push((offset, bytes.len()));
        Ok(())
    }

    fn erase(&self, offset: u32, len: u32) -> Result<(), FlashError> {
        check_alignment(offset, len)?;
        self.check_bounds(offset, len as usize)?;
        if *self.fail_erase.lock().unwrap() {
            return Err(FlashError::EraseFailed {
                offset,
                message: "injected erase failure".into(),
            });
        }
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        data[start..start + len as usize].fill(0xFF);
        Ok(())
    }
}
