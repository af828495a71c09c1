//! End-to-end boot cycles against in-memory flash and boot state.

use std::cell::Cell;
use std::sync::{Arc, Mutex};

use ota_core::transport::MockRead;
use ota_core::{
    AgentConfig, BootSequencer, BootStateStore, CompletionPolicy, FirmwareVersion, ImageBuilder, MemoryBootStore,
    MemoryFlash, MockTransport, OtaError, OtaEvent, OtaObserver, Outcome, Readiness,
    RestartCause, SessionState, Slot, SlotHealthState, SlotLayout, SlotManager, Startup,
    TransportError, ValidationFault,
};

struct ReadyAfter {
    polls: Cell<u32>,
    after: u32,
}

impl ReadyAfter {
    fn new(after: u32) -> Self {
        Self {
            polls: Cell::new(0),
            after,
        }
    }
}

impl Readiness for ReadyAfter {
    fn is_ready(&self) -> bool {
        self.polls.set(self.polls.get() + 1);
        self.polls.get() > self.after
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<OtaEvent>>);

impl OtaObserver for Recorder {
    fn on_event(&self, event: &OtaEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

struct Device {
    config: AgentConfig,
    store: MemoryBootStore,
    flash: MemoryFlash,
    recorder: Arc<Recorder>,
}

impl Device {
    /// Factory image `v1` installed, nothing else.
    fn new(completion: CompletionPolicy) -> Self {
        let config = AgentConfig {
            update_url: "mock://firmware.bin".into(),
            completion,
            peer_max_polls: 30,
            peer_poll_interval_ms: 0,
            fault_grace_ms: 0,
            layout: SlotLayout::two_ota(0x1_0000),
            ..Default::default()
        };
        let flash = MemoryFlash::new(config.layout.flash_size() as usize);
        flash.load(factory(&config).address, &image("v1"));
        Self {
            config,
            store: MemoryBootStore::new(),
            flash,
            recorder: Arc::new(Recorder::default()),
        }
    }

    /// Emulate a restart and return the sequencer for the new boot cycle.
    fn boot(&self) -> BootSequencer<MemoryBootStore, MemoryFlash, Recorder> {
        let slots =
            SlotManager::boot(self.config.layout.clone(), self.store.clone(), self.flash.clone())
                .unwrap();
        BootSequencer::with_observer(self.config.clone(), slots, self.recorder.clone())
    }

    fn ota(&self, n: usize) -> Slot {
        self.config.layout.ota_slots()[n]
    }

    fn health(&self, slot: Slot) -> SlotHealthState {
        self.store.snapshot().health(slot.address)
    }

    fn boot_pointer(&self) -> Option<u32> {
        self.store.snapshot().next_boot
    }
}

fn factory(config: &AgentConfig) -> Slot {
    config.layout.factory().unwrap()
}

/// A 2560-byte image.
fn image(version: &str) -> Vec<u8> {
    ImageBuilder::new(version)
        .segment(0, vec![0xA5; 2239])
        .build()
}

fn install(device: &Device, version: &str) -> Outcome {
    let seq = device.boot();
    let mut transport = MockTransport::from_image(&image(version), 1024);
    seq.run(&ReadyAfter::new(0), &mut transport)
}

#[test]
fn scenario_three_chunks() {
    let device = Device::new(CompletionPolicy::ShortChunk);
    let img = image("v2");
    assert_eq!(img.len(), 2560);

    let seq = device.boot();
    let mut transport = MockTransport::new();
    for part in [&img[..1024], &img[1024..2048], &img[2048..]] {
        transport.push(MockRead::Data(part.to_vec()));
    }
    let outcome = seq.run(&ReadyAfter::new(0), &mut transport);

    assert_eq!(
        outcome,
        Outcome::RestartOnto {
            slot: device.ota(0),
            cause: RestartCause::UpdateInstalled {
                version: FirmwareVersion::new("v2")
            },
        }
    );
    assert_eq!(device.flash.bytes_written_in(device.ota(0).address, device.ota(0).size), 2560);
    assert_eq!(device.flash.snapshot(device.ota(0).address, 2560), img);
    assert_eq!(device.boot_pointer(), Some(device.ota(0).address));
    assert_eq!(transport.delivered(), 2560);
    assert_eq!(transport.opened(), vec!["mock://firmware.bin".to_string()]);

    let events = device.recorder.0.lock().unwrap();
    let header_at = events
        .iter()
        .position(|e| matches!(e, OtaEvent::HeaderParsed { .. }))
        .unwrap();
    let first_progress = events
        .iter()
        .position(|e| matches!(e, OtaEvent::Progress { written: 1024, .. }))
        .unwrap();
    assert!(header_at < first_progress);
    assert!(matches!(events.last(), Some(OtaEvent::Restart { .. })));
}

#[test]
fn streaming_length_matches_any_chunking() {
    let img = image("v2");
    for sizes in [vec![288usize, 1000, 1024, 248], vec![1024, 1, 1023, 512], vec![320; 8]] {
        let device = Device::new(CompletionPolicy::ContentComplete);
        let seq = device.boot();
        let mut transport = MockTransport::new().with_content_length(img.len() as u64);
        let mut offset = 0;
        for size in sizes {
            let end = (offset + size).min(img.len());
            transport.push(MockRead::Data(img[offset..end].to_vec()));
            offset = end;
        }

        let outcome = seq.run_update(&mut transport);
        assert_eq!(outcome.slot(), device.ota(0));
        assert_eq!(
            device.flash.bytes_written_in(device.ota(0).address, device.ota(0).size),
            img.len()
        );
    }
}

#[test]
fn trailing_bytes_fail_finalize() {
    let device = Device::new(CompletionPolicy::ShortChunk);
    let mut img = image("v2");
    img.extend_from_slice(&[0u8; 16]);

    let seq = device.boot();
    let mut transport = MockTransport::from_image(&img, 1024);
    let outcome = seq.run_update(&mut transport);

    assert_eq!(
        outcome.cause(),
        &RestartCause::UpdateFailed(OtaError::Validation(ValidationFault::LengthMismatch {
            expected: 2560,
            actual: 2576
        }))
    );
    assert_eq!(outcome.slot(), factory(&device.config));
    assert_eq!(device.boot_pointer(), Some(factory(&device.config).address));
}

#[test]
fn connection_reset_mid_stream_never_finalizes() {
    let device = Device::new(CompletionPolicy::ShortChunk);
    let img = image("v2");

    let seq = device.boot();
    let mut transport = MockTransport::new();
    transport.push(MockRead::Data(img[..1024].to_vec()));
    transport.push(MockRead::Data(img[1024..2048].to_vec()));
    transport.push(MockRead::Fail(TransportError::ConnectionReset));
    let outcome = seq.run_update(&mut transport);

    assert_eq!(
        outcome.cause(),
        &RestartCause::UpdateFailed(OtaError::Transport(TransportError::ConnectionReset))
    );
    assert_eq!(device.health(device.ota(0)), SlotHealthState::Unverified);
    assert_ne!(device.boot_pointer(), Some(device.ota(0).address));

    // A restart still lands on the factory image.
    assert_eq!(device.boot().slots().running_slot(), factory(&device.config));
}

#[test]
fn early_close_without_completion_is_incomplete() {
    let device = Device::new(CompletionPolicy::ContentComplete);
    let img = image("v2");

    let seq = device.boot();
    let mut transport = MockTransport::new().with_content_length(img.len() as u64);
    transport.push(MockRead::Data(img[..1024].to_vec()));
    transport.push(MockRead::Empty);
    let outcome = seq.run_update(&mut transport);

    assert_eq!(
        outcome.cause(),
        &RestartCause::UpdateFailed(OtaError::Transport(TransportError::Incomplete {
            received: 1024,
            expected: Some(2560)
        }))
    );
}

#[test]
fn short_chunk_with_declared_length_mismatch() {
    let device = Device::new(CompletionPolicy::ShortChunk);
    let img = image("v2");

    let seq = device.boot();
    let mut transport = MockTransport::new().with_content_length(img.len() as u64);
    transport.push(MockRead::Data(img[..1024].to_vec()));
    transport.push(MockRead::Data(img[1024..1500].to_vec()));
    let outcome = seq.run_update(&mut transport);

    assert!(matches!(
        outcome.cause(),
        RestartCause::UpdateFailed(OtaError::Transport(TransportError::Incomplete { .. }))
    ));
}

#[test]
fn checkpoint_success_confirms_new_image() {
    let device = Device::new(CompletionPolicy::ContentComplete);
    assert_eq!(install(&device, "v2").slot(), device.ota(0));

    let seq = device.boot();
    assert_eq!(seq.slots().running_slot(), device.ota(0));
    assert_eq!(device.health(device.ota(0)), SlotHealthState::PendingVerify);

    assert_eq!(
        seq.startup(&ReadyAfter::new(5)),
        Startup::Proceed { confirmed: true }
    );
    assert_eq!(device.health(device.ota(0)), SlotHealthState::Valid);
    assert_eq!(device.boot_pointer(), Some(device.ota(0).address));

    // The next update alternates to the other slot.
    assert_eq!(seq.slots().next_update_target().unwrap(), device.ota(1));
}

#[test]
fn checkpoint_timeout_rolls_back() {
    let device = Device::new(CompletionPolicy::ContentComplete);
    install(&device, "v2");

    let seq = device.boot();
    let never = ReadyAfter::new(u32::MAX);
    let outcome = match seq.startup(&never) {
        Startup::Restart(outcome) => outcome,
        other => panic!("unexpected {:?}", other),
    };

    assert_eq!(never.polls.get(), 30);
    assert_eq!(outcome.slot(), factory(&device.config));
    assert_eq!(
        outcome.cause(),
        &RestartCause::RolledBack(OtaError::ConnectivityTimeout { polls: 30 })
    );
    assert_eq!(device.health(device.ota(0)), SlotHealthState::Invalid);
    assert_eq!(device.boot_pointer(), Some(factory(&device.config).address));
    assert_eq!(device.boot().slots().running_slot(), factory(&device.config));
}

#[test]
fn rollback_loop_guard() {
    let device = Device::new(CompletionPolicy::ContentComplete);
    install(&device, "v2");
    let seq = device.boot();
    seq.startup(&ReadyAfter::new(u32::MAX));

    for _ in 0..3 {
        let writes_before = device.flash.writes().len();
        let outcome = install(&device, "v2");

        assert_eq!(outcome.slot(), factory(&device.config));
        assert_eq!(
            outcome.cause(),
            &RestartCause::UpdateFailed(OtaError::DuplicateOfKnownBadVersion {
                version: FirmwareVersion::new("v2")
            })
        );
        assert_eq!(device.flash.writes().len(), writes_before);
        assert_eq!(device.health(device.ota(0)), SlotHealthState::Invalid);
    }

    let events = device.recorder.0.lock().unwrap();
    let fault = events
        .iter()
        .rposition(|e| matches!(e, OtaEvent::Fault { .. }))
        .unwrap();
    let restart = events
        .iter()
        .rposition(|e| matches!(e, OtaEvent::Restart { .. }))
        .unwrap();
    assert!(fault < restart);
}

#[test]
fn skip_check_allows_known_bad_version() {
    let mut device = Device::new(CompletionPolicy::ContentComplete);
    install(&device, "v2");
    device.boot().startup(&ReadyAfter::new(u32::MAX));

    device.config.enforce_known_bad_check = false;
    let outcome = install(&device, "v2");
    assert_eq!(outcome.slot(), device.ota(0));
    assert_eq!(device.health(device.ota(0)), SlotHealthState::Unverified);
}

#[test]
fn new_version_after_rollback_is_accepted() {
    let device = Device::new(CompletionPolicy::ContentComplete);
    install(&device, "v2");
    device.boot().startup(&ReadyAfter::new(u32::MAX));

    let outcome = install(&device, "v3");
    assert_eq!(
        outcome.cause(),
        &RestartCause::UpdateInstalled {
            version: FirmwareVersion::new("v3")
        }
    );
    assert_eq!(outcome.slot(), device.ota(0));
}

#[test]
fn flash_fault_aborts_session() {
    let device = Device::new(CompletionPolicy::ContentComplete);
    device.flash.fail_writes_after(1024);

    let outcome = install(&device, "v2");
    assert!(matches!(
        outcome.cause(),
        RestartCause::UpdateFailed(OtaError::Storage(_))
    ));
    assert_eq!(outcome.slot(), factory(&device.config));
    assert_eq!(device.boot_pointer(), Some(factory(&device.config).address));
}

#[test]
fn failed_write_never_leaves_a_stale_fallback() {
    let device = Device::new(CompletionPolicy::ContentComplete);
    install(&device, "v2");
    install(&device, "v3");

    let seq = device.boot();
    assert_eq!(seq.slots().running_slot(), device.ota(1));
    assert_eq!(
        seq.startup(&ReadyAfter::new(0)),
        Startup::Proceed { confirmed: true }
    );
    assert_eq!(device.health(device.ota(0)), SlotHealthState::Valid);

    let img = image("v4");
    let mut transport = MockTransport::new();
    transport.push(MockRead::Data(img[..1024].to_vec()));
    transport.push(MockRead::Fail(TransportError::ConnectionReset));
    let outcome = seq.run_update(&mut transport);

    assert_eq!(outcome.slot(), device.ota(1));
    assert_eq!(device.health(device.ota(0)), SlotHealthState::Unverified);
    assert_eq!(
        seq.slots().last_known_good(device.ota(1)).unwrap(),
        factory(&device.config)
    );
}

#[test]
fn checkpoint_timeout_without_fallback_keeps_device_bootable() {
    let layout = SlotLayout::new(vec![
        Slot::ota(0, 0x1_0000, 0x1_0000),
        Slot::ota(1, 0x2_0000, 0x1_0000),
    ]);
    let config = AgentConfig {
        update_url: "mock://firmware.bin".into(),
        peer_max_polls: 3,
        peer_poll_interval_ms: 0,
        fault_grace_ms: 0,
        layout: layout.clone(),
        ..Default::default()
    };
    config.validate().unwrap();
    let only = layout.ota_slots()[0];
    let store = MemoryBootStore::new();
    let flash = MemoryFlash::new(layout.flash_size() as usize);
    flash.load(only.address, &image("v1"));

    for _ in 0..2 {
        let slots = SlotManager::boot(layout.clone(), store.clone(), flash.clone()).unwrap();
        assert_eq!(slots.running_slot(), only);
        let seq = BootSequencer::new(config.clone(), slots);
        let outcome = match seq.startup(&ReadyAfter::new(u32::MAX)) {
            Startup::Restart(outcome) => outcome,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(outcome.slot(), only);
        assert_ne!(device_health(&store, only), SlotHealthState::Invalid);
    }
}

fn device_health(store: &MemoryBootStore, slot: Slot) -> SlotHealthState {
    store.load().unwrap().health(slot.address)
}

#[test]
fn session_state_names() {
    assert_eq!(SessionState::Aborted.to_string(), "aborted");
}
