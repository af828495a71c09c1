//! Event system for UI decoupling.
//!
//! Lets the host runner (or any other front end) follow an update attempt
//! without hooking into the sequencer itself.

use std::fmt;

use crate::error::FaultKind;
use crate::image::FirmwareVersion;
use crate::slot::Slot;

/// Phases of one boot cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaPhase {
    /// Waiting for the readiness signal.
    Checkpoint,
    /// Connecting to the update server.
    Connecting,
    /// Receiving and writing the image.
    Downloading,
    /// Running the integrity check.
    Finalizing,
    /// Restart requested.
    Restarting,
    /// Attempt abandoned.
    Failed,
}

impl fmt::Display for OtaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaPhase::Checkpoint => write!(f, "Health Checkpoint"),
            OtaPhase::Connecting => write!(f, "Connecting"),
            OtaPhase::Downloading => write!(f, "Downloading"),
            OtaPhase::Finalizing => write!(f, "Finalizing"),
            OtaPhase::Restarting => write!(f, "Restarting"),
            OtaPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Events emitted by the boot sequencer.
#[derive(Debug, Clone)]
pub enum OtaEvent {
    /// Phase changed.
    PhaseChanged { from: Option<OtaPhase>, to: OtaPhase },
    /// Update target chosen.
    SlotSelected { running: Slot, target: Slot },
    /// Image header parsed from the stream.
    HeaderParsed { version: FirmwareVersion },
    /// Version gate verdict.
    VersionChecked {
        incoming: FirmwareVersion,
        approved: bool,
    },
    /// Bytes written so far.
    Progress { written: u64, total: Option<u64> },
    /// A fault ended the current flow.
    Fault { kind: FaultKind, message: String },
    /// The device must restart onto `slot`.
    Restart { slot: Slot },
}

/// Observer trait for receiving update events.
pub trait OtaObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &OtaEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl OtaObserver for NullObserver {
    fn on_event(&self, _event: &OtaEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl OtaObserver for TracingObserver {
    fn on_event(&self, event: &OtaEvent) {
        match event {
            OtaEvent::PhaseChanged { from, to } => match from {
                Some(from) => tracing::info!(from = %from, to = %to, "Phase changed"),
                None => tracing::info!(to = %to, "Phase changed"),
            },
            OtaEvent::SlotSelected { running, target } => {
                tracing::info!(
                    running = %running,
                    target = %target,
                    address = %format!("0x{:08X}", target.address),
                    "Writing to update slot"
                );
            }
            OtaEvent::HeaderParsed { version } => {
                tracing::info!(version = %version, "New firmware version");
            }
            OtaEvent::VersionChecked { incoming, approved } => {
                tracing::debug!(incoming = %incoming, approved, "Version checked");
            }
            OtaEvent::Progress { written, total } => match total {
                Some(total) if *total > 0 => {
                    let pct = (*written * 100) / *total;
                    tracing::debug!(written, progress = %format!("{}%", pct), "Progress");
                }
                _ => tracing::debug!(written, "Progress"),
            },
            OtaEvent::Fault { kind, message } => {
                tracing::error!(kind = %kind, "Fault: {}", message);
            }
            OtaEvent::Restart { slot } => {
                tracing::info!(slot = %slot, "Prepare to restart system");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl OtaObserver for Recorder {
        fn on_event(&self, event: &OtaEvent) {
            self.0.lock().unwrap().push(format!("{:?}", event));
        }
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(OtaPhase::Checkpoint.to_string(), "Health Checkpoint");
        assert_eq!(OtaPhase::Restarting.to_string(), "Restarting");
    }

    #[test]
    fn test_observer_receives_events() {
        let recorder = Recorder::default();
        let observers: [&dyn OtaObserver; 3] = [&recorder, &NullObserver, &TracingObserver];
        for observer in observers {
            observer.on_event(&OtaEvent::Fault {
                kind: FaultKind::Transport,
                message: "reset".into(),
            });
        }
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }
}
