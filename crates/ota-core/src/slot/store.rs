//! Persistent boot state: boot pointer, per-slot health and the last
//! rolled-back image.
//!
//! A store commits the whole record at once, so every update is
//! crash-consistent at record granularity.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::SlotHealthState;
use crate::error::StorageFault;
use crate::image::FirmwareVersion;
use crate::image::constants::VERSION_LEN;

/// Health entry for one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub address: u32,
    pub health: SlotHealthState,
}

/// The slot most recently rolled back, with the version it held at that time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidRecord {
    pub address: u32,
    /// Raw 32-byte version field, hex encoded.
    pub version: Option<String>,
}

impl InvalidRecord {
    pub fn new(address: u32, version: Option<FirmwareVersion>) -> Self {
        Self {
            address,
            version: version.map(|v| hex::encode(v.as_bytes())),
        }
    }

    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        let raw = hex::decode(self.version.as_ref()?).ok()?;
        let raw: [u8; VERSION_LEN] = raw.try_into().ok()?;
        Some(FirmwareVersion::from_raw(raw))
    }
}

/// Everything persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootState {
    /// Address of the slot to boot next.
    pub next_boot: Option<u32>,
    /// Boot pointer value before the last repoint.
    pub previous_boot: Option<u32>,
    pub last_invalid: Option<InvalidRecord>,
    #[serde(default)]
    pub slots: Vec<SlotRecord>,
}

impl BootState {
    pub fn health(&self, address: u32) -> SlotHealthState {
        self.slots
            .iter()
            .find(|r| r.address == address)
            .map(|r| r.health)
            .unwrap_or_default()
    }

    pub fn set_health(&mut self, address: u32, health: SlotHealthState) {
        match self.slots.iter_mut().find(|r| r.address == address) {
            Some(record) => record.health = health,
            None => self.slots.push(SlotRecord { address, health }),
        }
    }

    /// Repoint the boot pointer, remembering the previous target.
    pub fn repoint(&mut self, address: u32) {
        if self.next_boot != Some(address) {
            self.previous_boot = self.next_boot;
            self.next_boot = Some(address);
        }
    }
}

/// Persistent boot-state interface.
///
/// Implementations must make `commit` atomic: after a crash, `load` returns
/// either the previous or the new record, never a mix.
pub trait BootStateStore: Send + Sync {
    fn load(&self) -> Result<BootState, StorageFault>;

    fn commit(&self, state: &BootState) -> Result<(), StorageFault>;

    /// Read-modify-write of the record.
    fn update<F>(&self, f: F) -> Result<BootState, StorageFault>
    where
        F: FnOnce(&mut BootState),
        Self: Sized,
    {
        let mut state = self.load()?;
        f(&mut state);
        self.commit(&state)?;
        Ok(state)
    }

    fn next_boot(&self) -> Result<Option<u32>, StorageFault> {
        Ok(self.load()?.next_boot)
    }

    fn health(&self, address: u32) -> Result<SlotHealthState, StorageFault> {
        Ok(self.load()?.health(address))
    }

    fn last_invalid(&self) -> Result<Option<InvalidRecord>, StorageFault> {
        Ok(self.load()?.last_invalid)
    }
}

/// In-memory store for testing. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBootStore {
    state: Arc<Mutex<BootState>>,
    commits: Arc<Mutex<usize>>,
    fail_commits: Arc<Mutex<bool>>,
}

impl MemoryBootStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: BootState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            ..Self::default()
        }
    }

    /// Simulate a failing persistent store.
    pub fn fail_commits(&self, fail: bool) {
        *self.fail_commits.lock().unwrap() = fail;
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> usize {
        *self.commits.lock().unwrap()
    }

    pub fn snapshot(&self) -> BootState {
        self.state.lock().unwrap().clone()
    }
}

impl BootStateStore for MemoryBootStore {
    fn load(&self) -> Result<BootState, StorageFault> {
        Ok(self.state.lock().unwrap().clone())
    }

    fn commit(&self, state: &BootState) -> Result<(), StorageFault> {
        if *self.fail_commits.lock().unwrap() {
            return Err(StorageFault::BootState("injected commit failure".into()));
        }
        *self.state.lock().unwrap() = state.clone();
        *self.commits.lock().unwrap() += 1;
        Ok(())
    }
}

/// TOML file store. Commits write a sibling temp file and rename it over the
/// original.
pub struct FileBootStore {
    path: PathBuf,
}

impl FileBootStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fault(&self, what: &str, e: impl std::fmt::Display) -> StorageFault {
        StorageFault::BootState(format!("{} {}: {}", what, self.path.display(), e))
    }
}

impl BootStateStore for FileBootStore {
    fn load(&self) -> Result<BootState, StorageFault> {
        if !self.path.exists() {
            return Ok(BootState::default());
        }
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| self.fault("failed to read", e))?;
        toml::from_str(&content).map_err(|e| self.fault("failed to parse", e))
    }

    fn commit(&self, state: &BootState) -> Result<(), StorageFault> {
        let content =
            toml::to_string_pretty(state).map_err(|e| self.fault("failed to encode", e))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content).map_err(|e| self.fault("failed to write", e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.fault("failed to replace", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repoint_tracks_previous() {
        let mut state = BootState::default();
        state.repoint(0x1_0000);
        state.repoint(0x2_0000);
        state.repoint(0x2_0000);
        assert_eq!(state.next_boot, Some(0x2_0000));
        assert_eq!(state.previous_boot, Some(0x1_0000));
    }

    #[test]
    fn test_invalid_record_keeps_padding() {
        let mut raw = *FirmwareVersion::new("2.0").as_bytes();
        raw[31] = 0x7F;
        let version = FirmwareVersion::from_raw(raw);

        let record = InvalidRecord::new(0x2_0000, Some(version));
        assert_eq!(record.firmware_version(), Some(version));
        assert_eq!(InvalidRecord::new(0x2_0000, None).firmware_version(), None);
    }

    #[test]
    fn test_memory_store_failure() {
        let store = MemoryBootStore::new();
        store.update(|s| s.set_health(0x1_0000, SlotHealthState::Valid)).unwrap();
        assert_eq!(store.commit_count(), 1);

        store.fail_commits(true);
        assert!(store.update(|s| s.repoint(0x1_0000)).is_err());
        assert_eq!(store.snapshot().next_boot, None);
        assert_eq!(store.health(0x1_0000).unwrap(), SlotHealthState::Valid);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBootStore::new(dir.path().join("boot_state.toml"));
        assert_eq!(store.load().unwrap(), BootState::default());

        store
            .update(|s| {
                s.repoint(0x11_0000);
                s.set_health(0x11_0000, SlotHealthState::PendingVerify);
                s.last_invalid = Some(InvalidRecord::new(0x21_0000, Some(FirmwareVersion::new("bad"))));
            })
            .unwrap();

        let reopened = FileBootStore::new(store.path());
        let state = reopened.load().unwrap();
        assert_eq!(state.next_boot, Some(0x11_0000));
        assert_eq!(state.health(0x11_0000), SlotHealthState::PendingVerify);
        assert_eq!(
            state.last_invalid.unwrap().firmware_version(),
            Some(FirmwareVersion::new("bad"))
        );
        assert!(!dir.path().join("boot_state.tmp").exists());
    }
}
