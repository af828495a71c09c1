//! Slot Manager - running slot, boot pointer and per-slot health transitions.

use tracing::{debug, info, warn};

use super::store::{BootState, BootStateStore, InvalidRecord};
use super::{Slot, SlotHealthState, SlotLayout};
use crate::error::StorageFault;
use crate::flash::FlashDevice;
use crate::image::constants::IMAGE_MAGIC;
use crate::image::{AppDescriptor, FirmwareVersion, HEADER_MIN_BYTES, ImageHeader, ImageMetadata};

/// Owns the boot pointer and slot health for one boot cycle.
pub struct SlotManager<S: BootStateStore, F: FlashDevice> {
    layout: SlotLayout,
    store: S,
    flash: F,
    running: Slot,
}

impl<S: BootStateStore, F: FlashDevice> SlotManager<S, F> {
    /// Manager for a device already running from `running`.
    pub fn new(layout: SlotLayout, store: S, flash: F, running: Slot) -> Self {
        Self {
            layout,
            store,
            flash,
            running,
        }
    }

    /// Resolve the slot a restart lands on, the way the bootloader does, and
    /// return a manager running from it.
    ///
    /// A slot selected through the boot pointer boots provisionally
    /// (`PendingVerify`). With no boot pointer the default slot holds a
    /// serially flashed image, which is taken as valid. Finding a slot still
    /// pending means its previous boot never confirmed itself, so it is marked
    /// invalid and the last known-good slot is booted instead. A pending slot
    /// with nothing to fall back to is retried rather than abandoned.
    pub fn boot(layout: SlotLayout, store: S, flash: F) -> Result<Self, StorageFault> {
        let original = store.load()?;
        let mut state = original.clone();

        let pointed = state
            .next_boot
            .and_then(|address| layout.by_address(address))
            .filter(Slot::is_application);
        let mut serial = pointed.is_none();
        let mut candidate = pointed
            .or_else(|| layout.default_boot())
            .ok_or(StorageFault::NoKnownGoodSlot)?;

        let mut manager = Self::new(layout, store, flash, candidate);

        // Each fallback moves to a different slot; bound the walk by the slot count.
        for _ in 0..=manager.layout.application_slots().count() {
            if candidate.is_factory() {
                break;
            }
            match state.health(candidate.address) {
                SlotHealthState::Valid => break,
                SlotHealthState::Unverified => {
                    if manager.describe(candidate)?.is_some() {
                        if serial {
                            state.set_health(candidate.address, SlotHealthState::Valid);
                            info!(slot = %candidate, "No boot pointer, flashed image taken as valid");
                        } else {
                            state.set_health(candidate.address, SlotHealthState::PendingVerify);
                            info!(slot = %candidate, "Booting new image provisionally");
                        }
                        break;
                    }
                    warn!(slot = %candidate, "No bootable image in slot");
                }
                SlotHealthState::PendingVerify => {
                    let Ok(good) = manager.known_good_in(&state, candidate) else {
                        warn!(slot = %candidate, "Previous boot was never confirmed and no known-good slot exists, retrying");
                        break;
                    };
                    warn!(slot = %candidate, "Previous boot was never confirmed, rolling back");
                    let version = manager.describe(candidate)?.map(|m| m.version);
                    state.set_health(candidate.address, SlotHealthState::Invalid);
                    state.last_invalid = Some(InvalidRecord::new(candidate.address, version));
                    candidate = good;
                    state.repoint(candidate.address);
                    serial = false;
                    continue;
                }
                SlotHealthState::Invalid => {
                    warn!(slot = %candidate, "Boot target is marked invalid");
                }
            }

            candidate = manager.known_good_in(&state, candidate)?;
            state.repoint(candidate.address);
            serial = false;
        }

        if state != original {
            manager.store.commit(&state)?;
        }
        manager.running = candidate;
        info!(slot = %candidate, address = %format!("0x{:08X}", candidate.address), "Booted");
        Ok(manager)
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// The slot the current code executes from.
    pub fn running_slot(&self) -> Slot {
        self.running
    }

    /// The slot the boot pointer names, if any.
    pub fn boot_target(&self) -> Result<Option<Slot>, StorageFault> {
        Ok(self
            .store
            .next_boot()?
            .and_then(|address| self.layout.by_address(address)))
    }

    /// Next OTA slot after the running one, wrapping around. Never the running
    /// slot and never the factory slot.
    pub fn next_update_target(&self) -> Result<Slot, StorageFault> {
        let ota = self.layout.ota_slots();
        let target = match ota.iter().position(|s| *s == self.running) {
            Some(pos) => ota[(pos + 1) % ota.len()],
            None => *ota.first().ok_or(StorageFault::NoUpdateTarget)?,
        };
        if target == self.running {
            return Err(StorageFault::NoUpdateTarget);
        }
        Ok(target)
    }

    /// Health of `slot`. The factory slot is always valid.
    pub fn health_of(&self, slot: Slot) -> Result<SlotHealthState, StorageFault> {
        if slot.is_factory() {
            return Ok(SlotHealthState::Valid);
        }
        self.store.health(slot.address)
    }

    /// Point the next boot at `slot`.
    ///
    /// A slot other than the running one restarts its health cycle as
    /// `Unverified`. Calling this again with the same slot changes nothing.
    pub fn set_boot_target(&self, slot: Slot) -> Result<(), StorageFault> {
        self.ensure_application(slot)?;
        self.modify(|state| {
            state.repoint(slot.address);
            if slot != self.running && !slot.is_factory() {
                state.set_health(slot.address, SlotHealthState::Unverified);
            }
        })?;
        info!(slot = %slot, "Boot target set");
        Ok(())
    }

    /// Reset the health of `slot` before its contents are erased, so a
    /// half-written slot is never taken for a fallback.
    pub fn prepare_update(&self, slot: Slot) -> Result<(), StorageFault> {
        self.ensure_application(slot)?;
        if slot == self.running || slot.is_factory() {
            return Err(StorageFault::NoUpdateTarget);
        }
        self.modify(|state| state.set_health(slot.address, SlotHealthState::Unverified))
    }

    /// Confirm the running slot: `PendingVerify` becomes `Valid`. An already
    /// valid slot is left as is.
    pub fn mark_valid_cancel_pending(&self, slot: Slot) -> Result<(), StorageFault> {
        if slot != self.running {
            return Err(StorageFault::NotRunning(slot));
        }
        match self.health_of(slot)? {
            SlotHealthState::Valid => Ok(()),
            SlotHealthState::Invalid => Err(StorageFault::SlotInvalid(slot)),
            SlotHealthState::Unverified => Err(StorageFault::NotPending(slot)),
            SlotHealthState::PendingVerify => {
                self.modify(|state| state.set_health(slot.address, SlotHealthState::Valid))?;
                info!(slot = %slot, "Image confirmed valid");
                Ok(())
            }
        }
    }

    /// Mark `slot` invalid, remember its version and repoint the boot target to
    /// the last known-good slot. Returns the slot the device must restart onto.
    ///
    /// Without a known-good slot nothing is changed, so the boot target stays
    /// resolvable.
    pub fn mark_invalid_and_reboot(&self, slot: Slot) -> Result<Slot, StorageFault> {
        self.ensure_application(slot)?;
        let target = self.last_known_good(slot)?;
        let version = self.describe(slot).ok().flatten().map(|m| m.version);

        self.modify(|state| {
            state.set_health(slot.address, SlotHealthState::Invalid);
            state.last_invalid = Some(InvalidRecord::new(slot.address, version));
            state.repoint(target.address);
        })?;

        warn!(
            slot = %slot,
            version = %version.map(|v| v.label()).unwrap_or_default(),
            fallback = %target,
            "Slot marked invalid, rolling back"
        );
        Ok(target)
    }

    /// Repoint the boot target at a known-good slot: the running one when it is
    /// healthy, else the last known-good. Returns the slot to restart onto.
    pub fn reset_to_last_valid(&self) -> Result<Slot, StorageFault> {
        let target = match self.health_of(self.running)? {
            SlotHealthState::Valid => self.running,
            _ => self.last_known_good(self.running)?,
        };
        self.modify(|state| state.repoint(target.address))?;
        info!(slot = %target, "Boot target reset to last valid slot");
        Ok(target)
    }

    /// Previously booted slot when still valid, else any valid slot, else factory.
    pub fn last_known_good(&self, excluding: Slot) -> Result<Slot, StorageFault> {
        let state = self.store.load()?;
        self.known_good_in(&state, excluding)
    }

    /// Version of the image most recently rolled back.
    pub fn last_invalid_version(&self) -> Result<Option<FirmwareVersion>, StorageFault> {
        let Some(record) = self.store.last_invalid()? else {
            return Ok(None);
        };
        if let Some(version) = record.firmware_version() {
            return Ok(Some(version));
        }
        match self.layout.by_address(record.address) {
            Some(slot) => Ok(self.describe(slot)?.map(|m| m.version)),
            None => Ok(None),
        }
    }

    /// Metadata of the image stored in `slot`, if its header region parses.
    pub fn describe(&self, slot: Slot) -> Result<Option<ImageMetadata>, StorageFault> {
        if (slot.size as usize) < HEADER_MIN_BYTES {
            return Ok(None);
        }
        let mut buf = vec![0u8; HEADER_MIN_BYTES];
        self.flash.read(slot.address, &mut buf)?;

        let header = match ImageHeader::from_bytes(&buf) {
            Ok(header) if header.magic == IMAGE_MAGIC => header,
            _ => return Ok(None),
        };
        match AppDescriptor::from_image_prefix(&buf) {
            Ok(desc) if desc.is_valid_magic() => {
                debug!(slot = %slot, segments = header.segment_count, version = %desc.version, "Slot described");
                Ok(Some(ImageMetadata::from(&desc)))
            }
            _ => Ok(None),
        }
    }

    fn ensure_application(&self, slot: Slot) -> Result<(), StorageFault> {
        if !slot.is_application() {
            return Err(StorageFault::NotApplication(slot));
        }
        match self.layout.by_address(slot.address) {
            Some(known) if known == slot => Ok(()),
            _ => Err(StorageFault::UnknownSlot(slot.address)),
        }
    }

    fn known_good_in(&self, state: &BootState, excluding: Slot) -> Result<Slot, StorageFault> {
        let good = |slot: &Slot| {
            *slot != excluding
                && slot.is_application()
                && (slot.is_factory() || state.health(slot.address) == SlotHealthState::Valid)
        };
        state
            .previous_boot
            .and_then(|address| self.layout.by_address(address))
            .filter(good)
            .or_else(|| {
                self.layout
                    .application_slots()
                    .filter(|s| !s.is_factory())
                    .copied()
                    .find(|s| good(s))
            })
            .or_else(|| self.layout.factory().filter(good))
            .ok_or(StorageFault::NoKnownGoodSlot)
    }

    /// Single read-modify-write; skips the commit when nothing changed.
    fn modify(&self, f: impl FnOnce(&mut BootState)) -> Result<(), StorageFault> {
        let original = self.store.load()?;
        let mut state = original.clone();
        f(&mut state);
        if state != original {
            self.store.commit(&state)?;
        }
        Ok(())
    }
}
