//! Classification of what is already on the target disk.

use super::partitions::{spec_for, EPHEMERAL_LABEL, LEGACY_BOOT_LABEL, PARTITION_SPECS};
use crate::errors::{ExecStep, InstallError, InstallResult};
use keel_hal::{BlockOps, PartitionEntry, PartitionTable, PartitionType};
use std::fmt;
use std::path::Path;

/// The two partitions of the historical layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyLayout {
    pub boot: PartitionEntry,
    pub ephemeral: PartitionEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// No GPT signature, or an empty table.
    None,
    /// A prefix (usually all) of the partition catalogue, in order.
    Current(Vec<PartitionEntry>),
    Legacy(LegacyLayout),
}

impl Layout {
    pub fn name(&self) -> &'static str {
        match self {
            Layout::None => "none",
            Layout::Current(_) => "current",
            Layout::Legacy(_) => "legacy",
        }
    }

    /// Existing partition carrying `label` in a current layout.
    pub fn current_entry(&self, label: &str) -> Option<&PartitionEntry> {
        match self {
            Layout::Current(entries) => entries.iter().find(|e| e.name == label),
            _ => None,
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::None => write!(f, "none"),
            Layout::Current(entries) => write!(f, "current ({} partitions)", entries.len()),
            Layout::Legacy(_) => write!(f, "legacy ({} + {})", LEGACY_BOOT_LABEL, EPHEMERAL_LABEL),
        }
    }
}

/// Read the table of `disk` and classify it.
pub fn detect<H: BlockOps + ?Sized>(hal: &H, disk: &Path) -> InstallResult<Layout> {
    let table = hal
        .read_partition_table(disk)
        .map_err(|e| InstallError::device(ExecStep::Detect, disk.display().to_string(), e))?;
    let layout = classify(table.as_ref())?;
    log::info!("detected {} layout on {}", layout, disk.display());
    Ok(layout)
}

/// Pure classification of a partition table.
pub fn classify(table: Option<&PartitionTable>) -> InstallResult<Layout> {
    let entries = match table {
        None => return Ok(Layout::None),
        Some(t) if t.is_empty() => return Ok(Layout::None),
        Some(t) => &t.entries,
    };

    if let Some(legacy) = legacy_shape(entries) {
        return Ok(Layout::Legacy(legacy));
    }

    check_current_shape(entries)?;
    Ok(Layout::Current(entries.clone()))
}

fn legacy_shape(entries: &[PartitionEntry]) -> Option<LegacyLayout> {
    match entries {
        [boot, ephemeral]
            if boot.name == LEGACY_BOOT_LABEL
                && boot.number == 1
                && boot.partition_type == PartitionType::EfiSystem
                && ephemeral.name == EPHEMERAL_LABEL
                && ephemeral.number == 2
                && ephemeral.partition_type == PartitionType::LinuxFilesystem =>
        {
            Some(LegacyLayout {
                boot: boot.clone(),
                ephemeral: ephemeral.clone(),
            })
        }
        _ => None,
    }
}

fn check_current_shape(entries: &[PartitionEntry]) -> InstallResult<()> {
    let mut previous_end: Option<u64> = None;
    for (idx, entry) in entries.iter().enumerate() {
        let spec = spec_for(&entry.name).ok_or_else(|| {
            InstallError::planning(format!(
                "unrecognised partition {} named {:?}; refusing to guess the layout",
                entry.number, entry.name
            ))
        })?;
        if entry.number != spec.number() {
            return Err(InstallError::planning(format!(
                "partition {} is numbered {}, expected {}",
                spec.label,
                entry.number,
                spec.number()
            )));
        }
        if entry.name != PARTITION_SPECS[idx].label {
            return Err(InstallError::planning(format!(
                "partition {} is out of order: expected {} at position {}",
                entry.name,
                PARTITION_SPECS[idx].label,
                idx + 1
            )));
        }
        if entry.partition_type != spec.type_class.partition_type() {
            return Err(InstallError::planning(format!(
                "partition {} has type {}, expected {}",
                entry.name,
                entry.partition_type,
                spec.type_class.partition_type()
            )));
        }
        if let Some(end) = previous_end {
            if entry.first_lba <= end {
                return Err(InstallError::planning(format!(
                    "partition {} starts at LBA {} inside its predecessor",
                    entry.name, entry.first_lba
                )));
            }
        }
        previous_end = Some(entry.last_lba);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::partitions::{BOOT_LABEL, EFI_LABEL, META_LABEL};

    fn entry(number: u32, name: &str, ty: PartitionType, first: u64, last: u64) -> PartitionEntry {
        PartitionEntry {
            number,
            name: name.to_string(),
            partition_type: ty,
            guid: uuid::Uuid::new_v4(),
            first_lba: first,
            last_lba: last,
            attributes: 0,
        }
    }

    fn current_entries() -> Vec<PartitionEntry> {
        PARTITION_SPECS
            .iter()
            .enumerate()
            .map(|(idx, spec)| {
                let first = 2048 + idx as u64 * 4096;
                entry(
                    spec.number(),
                    spec.label,
                    spec.type_class.partition_type(),
                    first,
                    first + 4095,
                )
            })
            .collect()
    }

    #[test]
    fn missing_or_empty_table_is_no_layout() {
        assert_eq!(classify(None).unwrap(), Layout::None);
        assert_eq!(
            classify(Some(&PartitionTable::default())).unwrap(),
            Layout::None
        );
    }

    #[test]
    fn full_catalogue_is_current() {
        let table = PartitionTable::new(current_entries());
        let layout = classify(Some(&table)).unwrap();
        assert_eq!(layout.name(), "current");
        assert_eq!(layout.current_entry(META_LABEL).unwrap().number, 4);
    }

    #[test]
    fn catalogue_prefix_is_current() {
        let mut entries = current_entries();
        entries.truncate(5);
        let layout = classify(Some(&PartitionTable::new(entries))).unwrap();
        assert!(layout.current_entry(EPHEMERAL_LABEL).is_none());
    }

    #[test]
    fn two_partition_legacy_disk_is_recognised() {
        let table = PartitionTable::new(vec![
            entry(1, LEGACY_BOOT_LABEL, PartitionType::EfiSystem, 2048, 206847),
            entry(2, EPHEMERAL_LABEL, PartitionType::LinuxFilesystem, 206848, 8386559),
        ]);
        match classify(Some(&table)).unwrap() {
            Layout::Legacy(legacy) => {
                assert_eq!(legacy.boot.number, 1);
                assert_eq!(legacy.ephemeral.first_lba, 206848);
            }
            other => panic!("expected legacy, got {}", other),
        }
    }

    #[test]
    fn legacy_boot_partition_must_be_an_esp() {
        let table = PartitionTable::new(vec![
            entry(1, LEGACY_BOOT_LABEL, PartitionType::LinuxFilesystem, 2048, 206847),
            entry(2, EPHEMERAL_LABEL, PartitionType::LinuxFilesystem, 206848, 8386559),
        ]);
        assert!(matches!(
            classify(Some(&table)),
            Err(InstallError::Planning(_))
        ));
    }

    #[test]
    fn unknown_names_are_rejected() {
        let table = PartitionTable::new(vec![entry(
            1,
            "root",
            PartitionType::LinuxFilesystem,
            2048,
            4095,
        )]);
        assert!(matches!(
            classify(Some(&table)),
            Err(InstallError::Planning(_))
        ));
    }

    #[test]
    fn misnumbered_or_misordered_partitions_are_rejected() {
        let mut entries = current_entries();
        entries[2].number = 7;
        assert!(classify(Some(&PartitionTable::new(entries))).is_err());

        // BOOT placed where EFI belongs.
        let table = PartitionTable::new(vec![entry(
            3,
            BOOT_LABEL,
            PartitionType::LinuxFilesystem,
            2048,
            4095,
        )]);
        assert!(classify(Some(&table)).is_err());
    }

    #[test]
    fn wrong_type_guid_is_rejected() {
        let mut entries = current_entries();
        entries[0].partition_type = PartitionType::LinuxFilesystem;
        let err = classify(Some(&PartitionTable::new(entries))).unwrap_err();
        assert!(err.to_string().contains(EFI_LABEL));
    }

    #[test]
    fn overlapping_partitions_are_rejected() {
        let mut entries = current_entries();
        entries[1].first_lba = entries[0].last_lba;
        assert!(classify(Some(&PartitionTable::new(entries))).is_err());
    }

    #[test]
    fn detect_reads_the_disk() {
        use keel_hal::{DiskGeometry, FakeHal, WriteOptions};
        let hal = FakeHal::new();
        let disk = Path::new("/dev/vda");
        hal.add_disk(disk, DiskGeometry::new(256 * 1024 * 1024, 512));
        assert_eq!(detect(&hal, disk).unwrap(), Layout::None);

        hal.write_partition_table(
            disk,
            &PartitionTable::new(current_entries()),
            &WriteOptions::new(false, true),
        )
        .unwrap();
        assert_eq!(detect(&hal, disk).unwrap().name(), "current");
    }
}
