//! Boot-slot bookkeeping kept in the raw META partition.
//!
//! The bootloader reads the first bytes of META as the active slot label.
//! The record is a fixed-width, zero-padded region with no filesystem framing.

use crate::errors::{ExecStep, InstallError, InstallResult};
use keel_hal::{BlockOps, HalResult, WriteOptions};
use std::fmt;
use std::path::Path;

pub const SLOT_RECORD_LEN: usize = 64;

/// Directory names under the boot mount that a slot may never shadow.
const RESERVED_SLOT_NAMES: &[&str] = &["EFI"];

/// A validated boot slot label such as `A` or `B`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotLabel(String);

impl SlotLabel {
    pub fn new(label: &str) -> InstallResult<Self> {
        if label.is_empty() || label.len() > SLOT_RECORD_LEN {
            return Err(InstallError::planning(format!(
                "slot label must be 1-{} characters, got {:?}",
                SLOT_RECORD_LEN, label
            )));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(InstallError::planning(format!(
                "slot label {:?} must be ASCII alphanumeric",
                label
            )));
        }
        if RESERVED_SLOT_NAMES
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(label))
        {
            return Err(InstallError::planning(format!(
                "slot label {:?} collides with a boot directory",
                label
            )));
        }
        Ok(Self(label.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encoding of the active-slot record.
pub struct BootSlotRecord;

impl BootSlotRecord {
    pub fn encode(label: Option<&SlotLabel>) -> [u8; SLOT_RECORD_LEN] {
        let mut record = [0u8; SLOT_RECORD_LEN];
        if let Some(label) = label {
            let bytes = label.as_str().as_bytes();
            record[..bytes.len()].copy_from_slice(bytes);
        }
        record
    }

    /// Bytes from the first NUL on are padding. A record that does not hold
    /// a slot label (a META partition that was never zeroed) reads as no slot.
    pub fn decode(record: &[u8]) -> InstallResult<Option<SlotLabel>> {
        let end = record.iter().position(|b| *b == 0).unwrap_or(record.len());
        if end == 0 {
            return Ok(None);
        }
        let label = std::str::from_utf8(&record[..end])
            .ok()
            .and_then(|text| SlotLabel::new(text).ok());
        if label.is_none() {
            log::warn!(
                "boot slot record holds no slot label ({} bytes before padding); reading as empty",
                end
            );
        }
        Ok(label)
    }

    /// Read the record stored at byte `offset` of `disk`.
    pub fn read<H: BlockOps + ?Sized>(
        hal: &H,
        disk: &Path,
        offset: u64,
    ) -> InstallResult<Option<SlotLabel>> {
        let mut record = [0u8; SLOT_RECORD_LEN];
        hal.read_raw(disk, offset, &mut record)
            .map_err(|e| InstallError::device(ExecStep::Detect, "META", e))?;
        Self::decode(&record)
    }

    pub fn write<H: BlockOps + ?Sized>(
        hal: &H,
        disk: &Path,
        offset: u64,
        label: Option<&SlotLabel>,
    ) -> HalResult<()> {
        hal.write_raw(
            disk,
            offset,
            &Self::encode(label),
            &WriteOptions::new(false, true),
        )
    }
}

/// Write-ahead pair: the slot that boots today and the slot staged to boot next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSlots {
    active: Option<SlotLabel>,
    pending: Option<SlotLabel>,
}

impl BootSlots {
    pub fn new(active: Option<SlotLabel>) -> Self {
        Self {
            active,
            pending: None,
        }
    }

    pub fn active(&self) -> Option<&SlotLabel> {
        self.active.as_ref()
    }

    pub fn pending(&self) -> Option<&SlotLabel> {
        self.pending.as_ref()
    }

    /// Stage `next` for publication. The running slot cannot be overwritten.
    pub fn stage(&mut self, next: SlotLabel) -> InstallResult<()> {
        if self.active.as_ref() == Some(&next) {
            return Err(InstallError::planning(format!(
                "slot {} is the active slot; pick the other slot",
                next
            )));
        }
        self.pending = Some(next);
        Ok(())
    }

    /// Persist the pending slot as active. This is the only write that flips
    /// which slot the bootloader picks.
    pub fn publish<H: BlockOps + ?Sized>(
        self,
        hal: &H,
        disk: &Path,
        offset: u64,
    ) -> InstallResult<SlotLabel> {
        let pending = self
            .pending
            .ok_or_else(|| InstallError::planning("no boot slot staged for publication"))?;
        BootSlotRecord::write(hal, disk, offset, Some(&pending))
            .map_err(|e| InstallError::device(ExecStep::PublishSlot, "META", e))?;
        log::info!(
            "boot slot {} published (previous: {})",
            pending,
            self.active
                .as_ref()
                .map(SlotLabel::as_str)
                .unwrap_or("none")
        );
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_hal::{DiskGeometry, FakeHal};

    fn slot(label: &str) -> SlotLabel {
        SlotLabel::new(label).unwrap()
    }

    #[test]
    fn slot_labels_are_validated() {
        assert!(SlotLabel::new("A").is_ok());
        assert!(SlotLabel::new("B2").is_ok());
        assert!(SlotLabel::new("").is_err());
        assert!(SlotLabel::new("a/b").is_err());
        assert!(SlotLabel::new("efi").is_err());
        assert!(SlotLabel::new(&"x".repeat(SLOT_RECORD_LEN + 1)).is_err());
    }

    #[test]
    fn record_holds_label_bytes_then_zeroes() {
        let record = BootSlotRecord::encode(Some(&slot("B")));
        assert_eq!(record[0], b'B');
        assert!(record[1..].iter().all(|b| *b == 0));
        assert_eq!(BootSlotRecord::decode(&record).unwrap(), Some(slot("B")));
        assert_eq!(BootSlotRecord::decode(&[0u8; 8]).unwrap(), None);
    }

    #[test]
    fn unzeroed_records_read_as_no_slot() {
        assert_eq!(
            BootSlotRecord::decode(b"A\0garbage").unwrap(),
            Some(slot("A"))
        );
        assert_eq!(BootSlotRecord::decode(b"A?\0").unwrap(), None);
        assert_eq!(BootSlotRecord::decode(&[0xff; SLOT_RECORD_LEN]).unwrap(), None);
    }

    #[test]
    fn staging_the_active_slot_is_rejected() {
        let mut slots = BootSlots::new(Some(slot("A")));
        assert!(slots.stage(slot("A")).is_err());
        slots.stage(slot("B")).unwrap();
        assert_eq!(slots.pending(), Some(&slot("B")));
        assert_eq!(slots.active(), Some(&slot("A")));
    }

    #[test]
    fn publish_writes_pending_label() {
        let hal = FakeHal::new();
        let disk = Path::new("/dev/vda");
        hal.add_disk(disk, DiskGeometry::new(8 * 1024 * 1024, 512));
        let offset = 4096;

        BootSlotRecord::write(&hal, disk, offset, Some(&slot("AB"))).unwrap();

        let mut slots = BootSlots::new(BootSlotRecord::read(&hal, disk, offset).unwrap());
        slots.stage(slot("C")).unwrap();
        assert_eq!(slots.publish(&hal, disk, offset).unwrap(), slot("C"));

        let mut raw = [0u8; 2];
        hal.read_raw(disk, offset, &mut raw).unwrap();
        assert_eq!(&raw, b"C\0");
    }

    #[test]
    fn publish_without_stage_fails() {
        let hal = FakeHal::new();
        let disk = Path::new("/dev/vda");
        hal.add_disk(disk, DiskGeometry::new(1024 * 1024, 512));
        assert!(BootSlots::new(None).publish(&hal, disk, 0).is_err());
    }
}
