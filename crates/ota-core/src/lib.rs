//! OTA-Core: dual-slot firmware update agent.
//!
//! This crate downloads a firmware image over a byte-stream transport,
//! streams it into the inactive slot and switches the boot pointer, rolling
//! back automatically when the new image fails its post-boot health check.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Image**: Application image format, metadata and integrity check
//! - **Flash**: Storage device abstraction (memory, file)
//! - **Slot**: Slot layout, persistent boot state and the slot manager
//! - **Parser / Gate / Pipeline**: Header capture, version gating, sequential writes
//! - **Transport**: Image download abstraction (HTTP, file, mock)
//! - **Connectivity**: Peer readiness signal for the startup checkpoint
//! - **Events**: Observer pattern for UI decoupling
//! - **Sequencer**: Startup checkpoint and update flow, ending in an [`Outcome`]
//!
//! # Example
//!
//! ```no_run
//! use ota_core::{AgentConfig, BootSequencer, FileBootStore, FileFlash, PeerSignal, SlotManager};
//!
//! let config = AgentConfig::default();
//! let flash = FileFlash::open("flash.bin", config.layout.flash_size()).unwrap();
//! let slots = SlotManager::boot(config.layout.clone(), FileBootStore::new("boot_state.toml"), flash).unwrap();
//!
//! let (signal, _notifier) = PeerSignal::pair();
//! let mut transport = ota_core::transport::for_url(&config.update_url);
//! let outcome = BootSequencer::new(config, slots).run(&signal, &mut transport);
//! println!("restart onto {}", outcome.slot());
//! ```

pub mod config;
pub mod connectivity;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod flash;
pub mod gate;
pub mod image;
pub mod parser;
pub mod pipeline;
pub mod sequencer;
pub mod slot;
pub mod transport;

// Re-exports for convenience
pub use config::{AgentConfig, NetworkConfig};
pub use connectivity::{PeerEvent, PeerNotifier, PeerSignal, Readiness, wait_for_peer};
pub use error::{FaultKind, OtaError, StorageFault};
pub use events::{NullObserver, OtaEvent, OtaObserver, OtaPhase, TracingObserver};
pub use flash::{FileFlash, FlashDevice, FlashError, MemoryFlash};
pub use gate::{GateDecision, VersionGate};
pub use image::{FirmwareVersion, HEADER_MIN_BYTES, ImageBuilder, ImageMetadata, ValidationFault, verify_image};
pub use parser::{ImageStreamParser, MalformedStream, ParserState};
pub use pipeline::{SessionState, UpdateSession, WritePipeline};
pub use sequencer::{BootSequencer, Outcome, RestartCause, Startup};
pub use slot::{
    BootState, BootStateStore, FileBootStore, MemoryBootStore, Slot, SlotHealthState, SlotKind,
    SlotLayout, SlotManager,
};
pub use transport::{
    CompletionPolicy, FileTransport, HttpTransport, ImageTransport, MockTransport, TransportError,
    TransportOptions,
};
