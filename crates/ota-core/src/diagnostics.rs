//! Boot-time diagnostics: region digests and running-slot details.

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::StorageFault;
use crate::flash::{FlashDevice, SECTOR_SIZE};
use crate::image::verify_image_prefix;
use crate::slot::{BootStateStore, Slot, SlotKind, SlotManager};

/// SHA-256 over the first `len` bytes of `slot`.
pub fn slot_digest<F: FlashDevice + ?Sized>(
    flash: &F,
    slot: Slot,
    len: u32,
) -> Result<[u8; 32], StorageFault> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; SECTOR_SIZE as usize];
    let mut offset = 0u32;
    while offset < len {
        let n = (len - offset).min(SECTOR_SIZE) as usize;
        flash.read(slot.address + offset, &mut buf[..n])?;
        hasher.update(&buf[..n]);
        offset += n as u32;
    }
    Ok(hasher.finalize().into())
}

/// Digest of the image stored in an application slot, or `None` when the
/// slot holds no intact image.
pub fn image_digest<F: FlashDevice + ?Sized>(
    flash: &F,
    slot: Slot,
) -> Result<Option<[u8; 32]>, StorageFault> {
    let mut data = vec![0u8; slot.size as usize];
    flash.read(slot.address, &mut data)?;
    Ok(verify_image_prefix(&data)
        .ok()
        .map(|image| Sha256::digest(&data[..image.length]).into()))
}

/// Log the digests of the partition table, the bootloader and the running
/// image, then the running slot itself.
pub fn log_boot_digests<S: BootStateStore, F: FlashDevice>(
    slots: &SlotManager<S, F>,
) -> Result<(), StorageFault> {
    let layout = slots.layout();
    if let Some(table) = layout.find(SlotKind::PartitionTable) {
        let digest = slot_digest(slots.flash(), table, table.size)?;
        info!(digest = %hex::encode(digest), "SHA-256 for the partition table");
    }
    if let Some(bootloader) = layout.find(SlotKind::Bootloader) {
        let digest = slot_digest(slots.flash(), bootloader, bootloader.size)?;
        info!(digest = %hex::encode(digest), "SHA-256 for bootloader");
    }

    let running = slots.running_slot();
    match image_digest(slots.flash(), running)? {
        Some(digest) => info!(digest = %hex::encode(digest), "SHA-256 for current firmware"),
        None => warn!(slot = %running, "Running slot holds no intact image"),
    }
    Ok(())
}

/// Warn when the boot pointer names a slot other than the running one, and
/// log where the running slot lives.
pub fn log_running_slot<S: BootStateStore, F: FlashDevice>(
    slots: &SlotManager<S, F>,
) -> Result<(), StorageFault> {
    let running = slots.running_slot();
    if let Some(configured) = slots.boot_target()? {
        if configured != running {
            warn!(
                configured = %format!("0x{:08X}", configured.address),
                running = %format!("0x{:08X}", running.address),
                "Configured boot slot is not the running slot"
            );
            warn!("(This can happen if either the boot config data or preferred boot image become corrupted somehow.)");
        }
    }
    info!(
        slot = %running,
        subtype = running.subtype,
        address = %format!("0x{:08X}", running.address),
        "Running partition"
    );
    Ok(())
}
