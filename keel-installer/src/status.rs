//! Read-only report of what is installed on a disk.

use crate::errors::{ExecStep, InstallError, InstallResult};
use crate::install::layout::{self, Layout};
use crate::install::meta::BootSlotRecord;
use crate::install::mountpoints::MountPointSet;
use crate::install::partitions::META_LABEL;
use keel_hal::BlockOps;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionStatus {
    pub number: u32,
    pub name: String,
    pub type_guid: String,
    pub first_lba: u64,
    pub last_lba: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountStatus {
    pub label: String,
    pub device: PathBuf,
    pub target: PathBuf,
    pub fstype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskStatus {
    pub disk: PathBuf,
    pub size_bytes: u64,
    pub logical_block_size: u64,
    pub layout: String,
    pub active_slot: Option<String>,
    pub partitions: Vec<PartitionStatus>,
    pub mountpoints: Vec<MountStatus>,
}

impl DiskStatus {
    pub fn probe<H: BlockOps + ?Sized>(hal: &H, disk: &Path) -> InstallResult<Self> {
        let geometry = hal
            .disk_geometry(disk)
            .map_err(|e| InstallError::device(ExecStep::Detect, disk.display().to_string(), e))?;
        let lbs = geometry.logical_block_size;
        let layout = layout::detect(hal, disk)?;

        let entries = match &layout {
            Layout::None => Vec::new(),
            Layout::Current(entries) => entries.clone(),
            Layout::Legacy(legacy) => vec![legacy.boot.clone(), legacy.ephemeral.clone()],
        };
        let partitions = entries
            .iter()
            .map(|e| PartitionStatus {
                number: e.number,
                name: e.name.clone(),
                type_guid: e.partition_type.to_string(),
                first_lba: e.first_lba,
                last_lba: e.last_lba,
                size_bytes: e.size_bytes(lbs),
            })
            .collect();

        let active_slot = match layout.current_entry(META_LABEL) {
            Some(meta) => {
                BootSlotRecord::read(hal, disk, meta.offset_bytes(lbs))?.map(|s| s.to_string())
            }
            None => None,
        };

        let mountpoints = match layout {
            Layout::Current(_) => MountPointSet::for_device(hal, disk)?
                .iter()
                .map(|mp| MountStatus {
                    label: mp.label.to_string(),
                    device: mp.device.clone(),
                    target: mp.target.clone(),
                    fstype: mp.fstype.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            disk: disk.to_path_buf(),
            size_bytes: geometry.size_bytes,
            logical_block_size: lbs,
            layout: layout.name().to_string(),
            active_slot,
            partitions,
            mountpoints,
        })
    }
}

impl fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} bytes, {}-byte sectors, {} layout",
            self.disk.display(),
            self.size_bytes,
            self.logical_block_size,
            self.layout
        )?;
        writeln!(
            f,
            "Active slot: {}",
            self.active_slot.as_deref().unwrap_or("none")
        )?;
        for p in &self.partitions {
            writeln!(
                f,
                "  {:>2} {:<10} LBA {:>10}..={:<10} {:>14} bytes  {}",
                p.number, p.name, p.first_lba, p.last_lba, p.size_bytes, p.type_guid
            )?;
        }
        for m in &self.mountpoints {
            writeln!(
                f,
                "  {} -> {} ({})",
                m.device.display(),
                m.target.display(),
                m.fstype
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::install::{Manifest, Sequence};
    use keel_hal::{DiskGeometry, FakeHal};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn blank_disk_reports_no_layout() {
        let hal = FakeHal::new();
        hal.add_disk("/dev/vda", DiskGeometry::new(1 << 30, 512));
        let status = DiskStatus::probe(&hal, Path::new("/dev/vda")).unwrap();
        assert_eq!(status.layout, "none");
        assert!(status.partitions.is_empty());
        assert_eq!(status.active_slot, None);
    }

    #[test]
    fn installed_disk_reports_slot_and_mounts() {
        let dir = tempdir().unwrap();
        let kernel = dir.path().join("vmlinuz");
        fs::write(&kernel, b"LINUX!").unwrap();

        let hal = FakeHal::new();
        hal.add_disk("/dev/vda", DiskGeometry::new(4 << 30, 512));
        let opts = Options {
            disk: PathBuf::from("/dev/vda"),
            kernel: Some(kernel.to_string_lossy().into_owned()),
            ..Default::default()
        };
        Manifest::new("A", Sequence::Install, false, &opts, &hal)
            .unwrap()
            .execute(&hal)
            .unwrap();

        let status = DiskStatus::probe(&hal, Path::new("/dev/vda")).unwrap();
        assert_eq!(status.layout, "current");
        assert_eq!(status.active_slot.as_deref(), Some("A"));
        assert_eq!(status.partitions.len(), 6);
        assert_eq!(status.mountpoints.len(), 4);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["partitions"][1]["name"], "BIOS");
        assert!(status.to_string().contains("Active slot: A"));
    }
}
