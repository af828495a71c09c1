//! Write Pipeline - streams approved bytes into the target slot.

use std::fmt;
use tracing::{debug, info, warn};

use crate::error::{OtaError, StorageFault};
use crate::flash::{FlashDevice, SECTOR_SIZE};
use crate::image::{ImageMetadata, VerifiedImage, verify_image};
use crate::slot::Slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Finalized,
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Open => write!(f, "open"),
            SessionState::Finalized => write!(f, "finalized"),
            SessionState::Aborted => write!(f, "aborted"),
        }
    }
}

/// One write attempt into one slot.
#[derive(Debug)]
pub struct UpdateSession {
    target: Slot,
    metadata: ImageMetadata,
    written: u64,
    state: SessionState,
}

impl UpdateSession {
    pub fn target(&self) -> Slot {
        self.target
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    /// Cumulative bytes written.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn ensure_open(&self) -> Result<(), StorageFault> {
        match self.state {
            SessionState::Open => Ok(()),
            other => Err(StorageFault::SessionNotOpen(other)),
        }
    }
}

pub struct WritePipeline<'a, F: FlashDevice> {
    flash: &'a F,
}

impl<'a, F: FlashDevice> WritePipeline<'a, F> {
    pub fn new(flash: &'a F) -> Self {
        Self { flash }
    }

    /// Erase `target` and open a session on it. Only called once the header
    /// has been parsed and approved.
    pub fn open(&self, target: Slot, metadata: ImageMetadata) -> Result<UpdateSession, StorageFault> {
        if !target.is_application() {
            return Err(StorageFault::NotApplication(target));
        }
        let len = target.size.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        info!(slot = %target, size = len, "Erasing update slot");
        self.flash.erase(target.address, len)?;

        Ok(UpdateSession {
            target,
            metadata,
            written: 0,
            state: SessionState::Open,
        })
    }

    /// Append `bytes` right after the previous write. Any failure aborts the session.
    pub fn write(&self, session: &mut UpdateSession, bytes: &[u8]) -> Result<(), StorageFault> {
        session.ensure_open()?;
        let end = session.written + bytes.len() as u64;
        if end > session.target.size as u64 {
            session.state = SessionState::Aborted;
            return Err(StorageFault::SlotOverflow {
                slot: session.target,
                requested: end,
                capacity: session.target.size,
            });
        }

        let offset = session.target.address + session.written as u32;
        if let Err(e) = self.flash.write(offset, bytes) {
            session.state = SessionState::Aborted;
            return Err(e.into());
        }
        session.written = end;
        debug!(written = session.written, "Chunk written");
        Ok(())
    }

    /// Close the session and run the image integrity check over what was
    /// written. The slot is only a boot candidate once this succeeds.
    pub fn finalize(&self, session: &mut UpdateSession) -> Result<VerifiedImage, OtaError> {
        session.ensure_open()?;
        let mut image = vec![0u8; session.written as usize];
        if let Err(e) = self.flash.read(session.target.address, &mut image) {
            session.state = SessionState::Aborted;
            return Err(e.into());
        }

        match verify_image(&image) {
            Ok(verified) => {
                session.state = SessionState::Finalized;
                info!(
                    slot = %session.target,
                    written = session.written,
                    version = %verified.metadata.version,
                    "Image finalized"
                );
                Ok(verified)
            }
            Err(fault) => {
                session.state = SessionState::Aborted;
                warn!(slot = %session.target, written = session.written, %fault, "Image failed validation");
                Err(fault.into())
            }
        }
    }

    /// Release the session without making the slot bootable. Safe to repeat.
    pub fn abort(&self, session: &mut UpdateSession) {
        if session.state == SessionState::Open {
            warn!(slot = %session.target, written = session.written, "Update session aborted");
            session.state = SessionState::Aborted;
        }
    }
}
