//! Version Gate - decides whether an incoming image may be written.

use tracing::{info, warn};

use crate::image::FirmwareVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Approve { same_as_running: bool },
    /// The incoming version already failed to boot once.
    Reject { version: FirmwareVersion },
}

impl GateDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, GateDecision::Approve { .. })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VersionGate {
    /// Approve everything, only reporting equality with the running version.
    pub skip_check: bool,
}

impl VersionGate {
    pub fn new(skip_check: bool) -> Self {
        Self { skip_check }
    }

    /// Compare byte-exact over the fixed-width version field.
    pub fn evaluate(
        &self,
        running: Option<&FirmwareVersion>,
        last_invalid: Option<&FirmwareVersion>,
        incoming: &FirmwareVersion,
    ) -> GateDecision {
        let same_as_running = running == Some(incoming);
        info!(
            incoming = %incoming,
            running = %running.map(|v| v.label()).unwrap_or_default(),
            last_invalid = %last_invalid.map(|v| v.label()).unwrap_or_default(),
            "Checking firmware version"
        );

        if self.skip_check {
            if same_as_running {
                info!(version = %incoming, "Incoming version matches running version");
            }
            return GateDecision::Approve { same_as_running };
        }

        if last_invalid == Some(incoming) {
            warn!(version = %incoming, "New version is the same as the invalid version");
            return GateDecision::Reject { version: *incoming };
        }
        if same_as_running {
            warn!(version = %incoming, "Current running version is the same as the new one");
        }
        GateDecision::Approve { same_as_running }
    }
}
