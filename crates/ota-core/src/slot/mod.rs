//! Storage slots: static layout, health states, persistent boot state and
//! the slot manager that sequences boot-pointer transitions.

pub mod manager;
pub mod store;

pub use manager::SlotManager;
pub use store::{BootState, BootStateStore, FileBootStore, InvalidRecord, MemoryBootStore};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::flash::SECTOR_SIZE;

/// Application subtype of the factory slot.
pub const SUBTYPE_FACTORY: u8 = 0x00;
/// Application subtype of the first OTA slot; `ota_n` is `SUBTYPE_OTA_MIN + n`.
pub const SUBTYPE_OTA_MIN: u8 = 0x10;
pub const SUBTYPE_OTA_MAX: u8 = 0x1F;

/// What a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotKind {
    Bootloader,
    PartitionTable,
    Application,
}

/// A contiguous storage region defined by the flash layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub address: u32,
    pub size: u32,
    pub kind: SlotKind,
    #[serde(default)]
    pub subtype: u8,
}

impl Slot {
    pub fn bootloader(address: u32, size: u32) -> Self {
        Self {
            address,
            size,
            kind: SlotKind::Bootloader,
            subtype: 0,
        }
    }

    pub fn partition_table(address: u32, size: u32) -> Self {
        Self {
            address,
            size,
            kind: SlotKind::PartitionTable,
            subtype: 0,
        }
    }

    pub fn factory(address: u32, size: u32) -> Self {
        Self {
            address,
            size,
            kind: SlotKind::Application,
            subtype: SUBTYPE_FACTORY,
        }
    }

    pub fn ota(index: u8, address: u32, size: u32) -> Self {
        Self {
            address,
            size,
            kind: SlotKind::Application,
            subtype: SUBTYPE_OTA_MIN + index,
        }
    }

    pub fn is_application(&self) -> bool {
        self.kind == SlotKind::Application
    }

    /// Factory slots are the fallback of last resort and never receive updates.
    pub fn is_factory(&self) -> bool {
        self.is_application() && self.subtype == SUBTYPE_FACTORY
    }

    pub fn ota_index(&self) -> Option<u8> {
        (self.is_application() && (SUBTYPE_OTA_MIN..=SUBTYPE_OTA_MAX).contains(&self.subtype))
            .then(|| self.subtype - SUBTYPE_OTA_MIN)
    }

    /// One past the last byte of the slot.
    pub fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }

    fn overlaps(&self, other: &Slot) -> bool {
        (self.address as u64) < other.end() && (other.address as u64) < self.end()
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.ota_index()) {
            (SlotKind::Bootloader, _) => write!(f, "bootloader"),
            (SlotKind::PartitionTable, _) => write!(f, "partition-table"),
            (SlotKind::Application, Some(n)) => write!(f, "ota_{}", n),
            (SlotKind::Application, None) if self.is_factory() => write!(f, "factory"),
            (SlotKind::Application, None) => write!(f, "app_0x{:02X}", self.subtype),
        }
    }
}

/// Health of an application slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotHealthState {
    /// Written and selected, but never booted.
    #[default]
    Unverified,
    /// Booted once; awaiting the health checkpoint.
    PendingVerify,
    /// Confirmed healthy.
    Valid,
    /// Rolled back; must not be booted again.
    Invalid,
}

impl fmt::Display for SlotHealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotHealthState::Unverified => write!(f, "UNVERIFIED"),
            SlotHealthState::PendingVerify => write!(f, "PENDING_VERIFY"),
            SlotHealthState::Valid => write!(f, "VALID"),
            SlotHealthState::Invalid => write!(f, "INVALID"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Layout needs at least two application slots, found {0}")]
    TooFewApplicationSlots(usize),
    #[error("Slots {0} and {1} overlap")]
    Overlap(Slot, Slot),
    #[error("Slot {0} is not sector aligned")]
    Misaligned(Slot),
    #[error("Duplicate slot {0}")]
    Duplicate(Slot),
}

/// Static partitioning of the flash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLayout {
    pub slots: Vec<Slot>,
}

impl Default for SlotLayout {
    fn default() -> Self {
        Self::two_ota(0x10_0000)
    }
}

impl SlotLayout {
    pub fn new(slots: Vec<Slot>) -> Self {
        Self { slots }
    }

    /// Bootloader, partition table, factory and two OTA slots of `app_size` bytes each.
    pub fn two_ota(app_size: u32) -> Self {
        let factory = 0x1_0000;
        Self::new(vec![
            Slot::bootloader(0x1000, 0x7000),
            Slot::partition_table(0x8000, 0x1000),
            Slot::factory(factory, app_size),
            Slot::ota(0, factory + app_size, app_size),
            Slot::ota(1, factory + 2 * app_size, app_size),
        ])
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        let apps = self.application_slots().count();
        if apps < 2 {
            return Err(LayoutError::TooFewApplicationSlots(apps));
        }
        for (i, a) in self.slots.iter().enumerate() {
            if a.address % SECTOR_SIZE != 0 || a.size % SECTOR_SIZE != 0 {
                return Err(LayoutError::Misaligned(*a));
            }
            for b in &self.slots[i + 1..] {
                if a == b {
                    return Err(LayoutError::Duplicate(*a));
                }
                if a.overlaps(b) {
                    return Err(LayoutError::Overlap(*a, *b));
                }
            }
        }
        Ok(())
    }

    pub fn application_slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter().filter(|s| s.is_application())
    }

    /// OTA slots ordered by index.
    pub fn ota_slots(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self
            .slots
            .iter()
            .filter(|s| s.ota_index().is_some())
            .copied()
            .collect();
        slots.sort_by_key(|s| s.subtype);
        slots
    }

    pub fn factory(&self) -> Option<Slot> {
        self.slots.iter().find(|s| s.is_factory()).copied()
    }

    pub fn find(&self, kind: SlotKind) -> Option<Slot> {
        self.slots.iter().find(|s| s.kind == kind).copied()
    }

    pub fn by_address(&self, address: u32) -> Option<Slot> {
        self.slots.iter().find(|s| s.address == address).copied()
    }

    /// Slot booted when no boot pointer is set: factory, else the first application slot.
    pub fn default_boot(&self) -> Option<Slot> {
        self.factory()
            .or_else(|| self.application_slots().min_by_key(|s| s.subtype).copied())
    }

    /// Bytes of flash the layout spans.
    pub fn flash_size(&self) -> u64 {
        self.slots.iter().map(Slot::end).max().unwrap_or(0)
    }
}
