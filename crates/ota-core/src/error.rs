//! Fault taxonomy for an update attempt.
//!
//! Every layer has its own error type; they all funnel into [`OtaError`],
//! which is what the boot sequencer reports before forcing a restart.

use std::fmt;
use thiserror::Error;

use crate::flash::FlashError;
use crate::image::{FirmwareVersion, ValidationFault};
use crate::parser::MalformedStream;
use crate::pipeline::SessionState;
use crate::slot::Slot;
use crate::transport::TransportError;

/// Faults raised by the slot layer (flash regions and persistent boot state).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageFault {
    #[error("Flash error: {0}")]
    Flash(#[from] FlashError),

    #[error("Boot state store error: {0}")]
    BootState(String),

    #[error("No slot at address 0x{0:08X}")]
    UnknownSlot(u32),

    #[error("Slot {0} is not an application slot")]
    NotApplication(Slot),

    #[error("Slot {0} is the running slot")]
    TargetIsRunning(Slot),

    #[error("Slot {0} is not the running slot")]
    NotRunning(Slot),

    #[error("Slot {0} is marked invalid")]
    SlotInvalid(Slot),

    #[error("Slot {0} is not pending verification")]
    NotPending(Slot),

    #[error("No update target available")]
    NoUpdateTarget,

    #[error("No known-good slot to fall back to")]
    NoKnownGoodSlot,

    #[error("Slot {slot} overflow: {requested} bytes exceeds capacity {capacity}")]
    SlotOverflow {
        slot: Slot,
        requested: u64,
        capacity: u32,
    },

    #[error("Update session is {0}")]
    SessionNotOpen(SessionState),
}

/// Top-level fault of an update attempt or startup checkpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtaError {
    #[error("Transport fault: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed stream: {0}")]
    MalformedStream(#[from] MalformedStream),

    #[error("Version {version} previously failed to boot and was rolled back")]
    DuplicateOfKnownBadVersion { version: FirmwareVersion },

    #[error("Storage fault: {0}")]
    Storage(#[from] StorageFault),

    #[error("Image validation failed: {0}")]
    Validation(#[from] ValidationFault),

    #[error("No peer attached after {polls} polls")]
    ConnectivityTimeout { polls: u32 },
}

impl From<FlashError> for OtaError {
    fn from(e: FlashError) -> Self {
        OtaError::Storage(StorageFault::Flash(e))
    }
}

/// Coarse fault class used in diagnostics and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transport,
    MalformedStream,
    DuplicateOfKnownBadVersion,
    Storage,
    Validation,
    ConnectivityTimeout,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Transport => write!(f, "TransportFault"),
            FaultKind::MalformedStream => write!(f, "MalformedStream"),
            FaultKind::DuplicateOfKnownBadVersion => write!(f, "DuplicateOfKnownBadVersion"),
            FaultKind::Storage => write!(f, "StorageFault"),
            FaultKind::Validation => write!(f, "ValidationFault"),
            FaultKind::ConnectivityTimeout => write!(f, "ConnectivityTimeout"),
        }
    }
}

impl OtaError {
    pub fn kind(&self) -> FaultKind {
        match self {
            OtaError::Transport(_) => FaultKind::Transport,
            OtaError::MalformedStream(_) => FaultKind::MalformedStream,
            OtaError::DuplicateOfKnownBadVersion { .. } => FaultKind::DuplicateOfKnownBadVersion,
            OtaError::Storage(_) => FaultKind::Storage,
            OtaError::Validation(_) => FaultKind::Validation,
            OtaError::ConnectivityTimeout { .. } => FaultKind::ConnectivityTimeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err: OtaError = TransportError::ConnectionReset.into();
        assert_eq!(err.kind(), FaultKind::Transport);

        let err: OtaError = FlashError::WriteFailed {
            offset: 0x1000,
            message: "stuck bit".into(),
        }
        .into();
        assert_eq!(err.kind(), FaultKind::Storage);

        let err = OtaError::DuplicateOfKnownBadVersion {
            version: FirmwareVersion::new("2.0.0"),
        };
        assert_eq!(err.kind(), FaultKind::DuplicateOfKnownBadVersion);
        assert_eq!(
            err.to_string(),
            "Version 2.0.0 previously failed to boot and was rolled back"
        );
    }
}
