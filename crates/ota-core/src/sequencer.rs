//! Boot Sequencer - startup health checkpoint and the update flow.
//!
//! Neither flow restarts anything itself. Each ends in an [`Outcome`] naming
//! the slot the host must restart onto; only the startup flow can also let
//! the boot proceed.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::thread;

use tracing::{error, info, instrument, warn};

use crate::config::AgentConfig;
use crate::connectivity::{Readiness, wait_for_peer};
use crate::diagnostics;
use crate::error::OtaError;
use crate::events::{OtaEvent, OtaObserver, OtaPhase, TracingObserver};
use crate::flash::FlashDevice;
use crate::gate::{GateDecision, VersionGate};
use crate::image::{FirmwareVersion, VerifiedImage};
use crate::parser::{ImageStreamParser, MalformedStream};
use crate::pipeline::{UpdateSession, WritePipeline};
use crate::slot::{BootStateStore, Slot, SlotHealthState, SlotManager};
use crate::transport::{ImageTransport, StreamStep, TransportError};

/// Why the device is restarting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartCause {
    /// A new image was written and selected.
    UpdateInstalled { version: FirmwareVersion },
    /// The provisional image failed its checkpoint and was marked invalid.
    RolledBack(OtaError),
    /// The checkpoint failed on an already confirmed image.
    CheckpointFailed(OtaError),
    /// The update attempt was abandoned.
    UpdateFailed(OtaError),
}

impl fmt::Display for RestartCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartCause::UpdateInstalled { version } => write!(f, "update to {} installed", version),
            RestartCause::RolledBack(e) => write!(f, "rolled back: {}", e),
            RestartCause::CheckpointFailed(e) => write!(f, "checkpoint failed: {}", e),
            RestartCause::UpdateFailed(e) => write!(f, "update failed: {}", e),
        }
    }
}

/// Terminal state of a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    RestartOnto { slot: Slot, cause: RestartCause },
}

impl Outcome {
    pub fn slot(&self) -> Slot {
        match self {
            Outcome::RestartOnto { slot, .. } => *slot,
        }
    }

    pub fn cause(&self) -> &RestartCause {
        match self {
            Outcome::RestartOnto { cause, .. } => cause,
        }
    }
}

/// Result of the startup flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Startup {
    /// Keep running; `confirmed` is set when a provisional image was just
    /// marked valid.
    Proceed { confirmed: bool },
    Restart(Outcome),
}

pub struct BootSequencer<S: BootStateStore, F: FlashDevice, O: OtaObserver = TracingObserver> {
    config: AgentConfig,
    slots: SlotManager<S, F>,
    gate: VersionGate,
    observer: Arc<O>,
    phase: Cell<Option<OtaPhase>>,
}

impl<S: BootStateStore, F: FlashDevice> BootSequencer<S, F, TracingObserver> {
    /// Create a sequencer with the default tracing observer.
    pub fn new(config: AgentConfig, slots: SlotManager<S, F>) -> Self {
        Self::with_observer(config, slots, Arc::new(TracingObserver))
    }
}

impl<S: BootStateStore, F: FlashDevice, O: OtaObserver> BootSequencer<S, F, O> {
    pub fn with_observer(config: AgentConfig, slots: SlotManager<S, F>, observer: Arc<O>) -> Self {
        let gate = VersionGate::new(config.skip_version_check());
        Self {
            config,
            slots,
            gate,
            observer,
            phase: Cell::new(None),
        }
    }

    pub fn slots(&self) -> &SlotManager<S, F> {
        &self.slots
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Startup checkpoint followed, if the boot may proceed, by one update attempt.
    pub fn run<R, T>(&self, readiness: &R, transport: &mut T) -> Outcome
    where
        R: Readiness + ?Sized,
        T: ImageTransport + ?Sized,
    {
        match self.startup(readiness) {
            Startup::Restart(outcome) => outcome,
            Startup::Proceed { .. } => self.run_update(transport),
        }
    }

    /// Wait for the readiness signal and confirm or roll back the running image.
    #[instrument(skip_all)]
    pub fn startup<R: Readiness + ?Sized>(&self, readiness: &R) -> Startup {
        let running = self.slots.running_slot();
        let pending = match self.slots.health_of(running) {
            Ok(health) => health == SlotHealthState::PendingVerify,
            Err(e) => {
                let err = OtaError::from(e);
                self.emit_fault(&err);
                return Startup::Restart(self.restart(running, RestartCause::CheckpointFailed(err)));
            }
        };
        if pending {
            info!(slot = %running, "Running image is pending verification");
        }

        self.set_phase(OtaPhase::Checkpoint);
        let waited = wait_for_peer(
            readiness,
            self.config.peer_max_polls,
            self.config.peer_poll_interval(),
        );

        match (waited, pending) {
            (Ok(_), false) => Startup::Proceed { confirmed: false },
            (Ok(_), true) => match self.slots.mark_valid_cancel_pending(running) {
                Ok(()) => {
                    info!(slot = %running, "Running image confirmed");
                    Startup::Proceed { confirmed: true }
                }
                Err(e) => {
                    let err = OtaError::from(e);
                    self.emit_fault(&err);
                    Startup::Restart(self.roll_back(running, err))
                }
            },
            (Err(err), true) => {
                error!(slot = %running, "Checkpoint failed, rolling back");
                self.emit_fault(&err);
                Startup::Restart(self.roll_back(running, err))
            }
            (Err(err), false) => {
                self.emit_fault(&err);
                let slot = self.reset_to_last_valid();
                Startup::Restart(self.restart(slot, RestartCause::CheckpointFailed(err)))
            }
        }
    }

    /// Download, gate, write and select a new image.
    ///
    /// Any fault leaves the boot target on a known-good slot and, after the
    /// grace period, asks for a restart onto it.
    #[instrument(skip_all)]
    pub fn run_update<T: ImageTransport + ?Sized>(&self, transport: &mut T) -> Outcome {
        match self.try_update(transport) {
            Ok((target, image)) => {
                let version = image.metadata.version;
                self.restart(target, RestartCause::UpdateInstalled { version })
            }
            Err(err) => {
                self.emit_fault(&err);
                error!("Update attempt failed");
                thread::sleep(self.config.fault_grace());
                let slot = self.reset_to_last_valid();
                self.restart(slot, RestartCause::UpdateFailed(err))
            }
        }
    }

    fn try_update<T: ImageTransport + ?Sized>(
        &self,
        transport: &mut T,
    ) -> Result<(Slot, VerifiedImage), OtaError> {
        diagnostics::log_running_slot(&self.slots)?;
        let running = self.slots.running_slot();
        let target = self.slots.next_update_target()?;
        self.observer
            .on_event(&OtaEvent::SlotSelected { running, target });

        let options = self.config.transport_options()?;
        self.set_phase(OtaPhase::Connecting);
        if let Err(e) = transport.open(&self.config.update_url, &options) {
            transport.close();
            return Err(e.into());
        }

        let pipeline = WritePipeline::new(self.slots.flash());
        let mut session = None;
        let streamed = self.stream(transport, &pipeline, target, &mut session);
        transport.close();

        let image = match streamed {
            Ok(image) => image,
            Err(e) => {
                if let Some(session) = session.as_mut() {
                    pipeline.abort(session);
                }
                return Err(e);
            }
        };

        self.slots.set_boot_target(target)?;
        Ok((target, image))
    }

    fn stream<T: ImageTransport + ?Sized>(
        &self,
        transport: &mut T,
        pipeline: &WritePipeline<'_, F>,
        target: Slot,
        session: &mut Option<UpdateSession>,
    ) -> Result<VerifiedImage, OtaError> {
        let mut parser = ImageStreamParser::new();
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut received = 0u64;
        let total = transport.content_length();
        self.set_phase(OtaPhase::Downloading);

        loop {
            let read = transport.read(&mut buf);
            let step = self
                .config
                .completion
                .classify(&*transport, read, buf.len(), received)?;
            let (len, last) = match step {
                StreamStep::End => break,
                StreamStep::Data { len, last } => (len, last),
            };
            received += len as u64;

            let fed = parser.feed(&buf[..len])?;
            if let Some(metadata) = fed.captured {
                self.observer.on_event(&OtaEvent::HeaderParsed {
                    version: metadata.version,
                });
                self.check_version(&metadata.version)?;
                self.slots.prepare_update(target)?;
                *session = Some(pipeline.open(target, metadata)?);
            }
            if let Some(session) = session.as_mut() {
                pipeline.write(session, fed.bytes)?;
                self.observer.on_event(&OtaEvent::Progress {
                    written: session.written(),
                    total,
                });
            }
            if last {
                break;
            }
        }

        info!(received, "Total binary data length received");
        if received == 0 {
            return Err(MalformedStream::NoData.into());
        }
        if let Some(expected) = total.filter(|&expected| expected != received) {
            return Err(TransportError::Incomplete {
                received,
                expected: Some(expected),
            }
            .into());
        }

        let session = session.as_mut().ok_or(MalformedStream::NoData)?;
        self.set_phase(OtaPhase::Finalizing);
        pipeline.finalize(session)
    }

    fn check_version(&self, incoming: &FirmwareVersion) -> Result<(), OtaError> {
        let running = self
            .slots
            .describe(self.slots.running_slot())?
            .map(|m| m.version);
        let last_invalid = self.slots.last_invalid_version()?;

        let decision = self
            .gate
            .evaluate(running.as_ref(), last_invalid.as_ref(), incoming);
        self.observer.on_event(&OtaEvent::VersionChecked {
            incoming: *incoming,
            approved: decision.is_approved(),
        });
        match decision {
            GateDecision::Approve { .. } => Ok(()),
            GateDecision::Reject { version } => {
                warn!("Previously, there was an attempt to launch the firmware with {} version, but it failed.", version);
                warn!("The firmware has been rolled back to the previous version.");
                Err(OtaError::DuplicateOfKnownBadVersion { version })
            }
        }
    }

    fn roll_back(&self, slot: Slot, err: OtaError) -> Outcome {
        let target = match self.slots.mark_invalid_and_reboot(slot) {
            Ok(target) => target,
            Err(e) => {
                // The bootloader rolls back a slot left pending on the next restart.
                self.emit_fault(&e.into());
                slot
            }
        };
        self.restart(target, RestartCause::RolledBack(err))
    }

    fn reset_to_last_valid(&self) -> Slot {
        self.slots.reset_to_last_valid().unwrap_or_else(|e| {
            self.emit_fault(&e.into());
            self.slots.running_slot()
        })
    }

    fn restart(&self, slot: Slot, cause: RestartCause) -> Outcome {
        self.set_phase(OtaPhase::Restarting);
        self.observer.on_event(&OtaEvent::Restart { slot });
        Outcome::RestartOnto { slot, cause }
    }

    fn emit_fault(&self, err: &OtaError) {
        self.set_phase(OtaPhase::Failed);
        self.observer.on_event(&OtaEvent::Fault {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn set_phase(&self, to: OtaPhase) {
        let from = self.phase.replace(Some(to));
        if from != Some(to) {
            self.observer.on_event(&OtaEvent::PhaseChanged { from, to });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::flash::MemoryFlash;
    use crate::image::ImageBuilder;
    use crate::slot::{MemoryBootStore, SlotLayout};
    use crate::transport::{MockRead, MockTransport};

    struct Never;

    impl Readiness for Never {
        fn is_ready(&self) -> bool {
            false
        }
    }

    struct Always;

    impl Readiness for Always {
        fn is_ready(&self) -> bool {
            true
        }
    }

    fn config() -> AgentConfig {
        AgentConfig {
            update_url: "mock://firmware.bin".into(),
            peer_max_polls: 3,
            peer_poll_interval_ms: 0,
            fault_grace_ms: 0,
            layout: SlotLayout::two_ota(0x1_0000),
            ..Default::default()
        }
    }

    fn sequencer(
        store: MemoryBootStore,
        flash: MemoryFlash,
    ) -> BootSequencer<MemoryBootStore, MemoryFlash, NullObserver> {
        let config = config();
        let slots = SlotManager::boot(config.layout.clone(), store, flash).unwrap();
        BootSequencer::with_observer(config, slots, Arc::new(NullObserver))
    }

    fn setup() -> (MemoryBootStore, MemoryFlash) {
        let layout = config().layout;
        let flash = MemoryFlash::new(layout.flash_size() as usize);
        flash.load(
            layout.factory().unwrap().address,
            &ImageBuilder::new("1.0").build(),
        );
        (MemoryBootStore::new(), flash)
    }

    #[test]
    fn test_checkpoint_timeout_on_confirmed_image() {
        let (store, flash) = setup();
        let seq = sequencer(store, flash);
        let factory = seq.slots().running_slot();

        let outcome = match seq.startup(&Never) {
            Startup::Restart(outcome) => outcome,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(outcome.slot(), factory);
        assert_eq!(
            outcome.cause(),
            &RestartCause::CheckpointFailed(OtaError::ConnectivityTimeout { polls: 3 })
        );
    }

    #[test]
    fn test_connection_reset_aborts() {
        let (store, flash) = setup();
        let image = ImageBuilder::new("2.0").segment(0, vec![0; 3000]).build();
        let mut transport = MockTransport::new().with_content_length(image.len() as u64);
        transport.push(MockRead::Data(image[..1024].to_vec()));
        transport.push(MockRead::Fail(TransportError::ConnectionReset));

        let seq = sequencer(store.clone(), flash);
        let outcome = seq.run(&Always, &mut transport);

        assert_eq!(outcome.slot(), seq.slots().running_slot());
        assert_eq!(
            outcome.cause(),
            &RestartCause::UpdateFailed(OtaError::Transport(TransportError::ConnectionReset))
        );
        assert_eq!(transport.close_count(), 1);
        assert_eq!(store.snapshot().next_boot, Some(seq.slots().running_slot().address));
    }

    #[test]
    fn test_open_failure() {
        let (store, flash) = setup();
        let mut transport = MockTransport::new().fail_open(TransportError::OpenFailed {
            url: "mock://firmware.bin".into(),
            message: "refused".into(),
        });
        let seq = sequencer(store, flash.clone());
        let outcome = seq.run_update(&mut transport);

        assert!(matches!(
            outcome.cause(),
            RestartCause::UpdateFailed(OtaError::Transport(TransportError::OpenFailed { .. }))
        ));
        assert!(flash.writes().is_empty());
    }

    #[test]
    fn test_empty_stream_is_malformed() {
        let (store, flash) = setup();
        let mut transport = MockTransport::new();
        let seq = sequencer(store, flash);
        let outcome = seq.run_update(&mut transport);
        assert_eq!(
            outcome.cause(),
            &RestartCause::UpdateFailed(OtaError::MalformedStream(MalformedStream::NoData))
        );
    }
}
