//! The manifest: every partition the run touches and what happens to it.

use super::layout::{self, Layout};
use super::meta::{BootSlotRecord, SlotLabel};
use super::mountpoints::MountPointSet;
use super::partitions::{FilesystemKind, PartitionSpec, META_LABEL};
use super::plan::{plan, DiskState};
use crate::assets::{self, Asset};
use crate::config::Options;
use crate::errors::{ExecStep, InstallError, InstallResult};
use keel_hal::{partition_path, BlockOps, DiskGeometry, PartitionEntry};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    Install,
    Upgrade,
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sequence::Install => write!(f, "install"),
            Sequence::Upgrade => write!(f, "upgrade"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetAction {
    CreateFresh,
    /// Left untouched in the table and on disk.
    Reuse,
    MigrateFromLegacy,
}

impl fmt::Display for TargetAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAction::CreateFresh => write!(f, "create"),
            TargetAction::Reuse => write!(f, "reuse"),
            TargetAction::MigrateFromLegacy => write!(f, "migrate"),
        }
    }
}

/// One partition of the resulting layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub spec: &'static PartitionSpec,
    pub number: u32,
    pub first_lba: u64,
    pub length_lbas: u64,
    pub action: TargetAction,
    pub preserve_content: bool,
    /// Table entry kept as-is for `Reuse`.
    pub existing: Option<PartitionEntry>,
    /// Partition whose files are staged and restored into this one.
    pub content_source: Option<PartitionEntry>,
    pub assets: Vec<Asset>,
}

impl Target {
    pub fn label(&self) -> &'static str {
        self.spec.label
    }

    /// Inclusive.
    pub fn last_lba(&self) -> u64 {
        self.first_lba + self.length_lbas - 1
    }

    pub fn size_bytes(&self, logical_block_size: u64) -> u64 {
        self.length_lbas * logical_block_size
    }

    pub fn offset_bytes(&self, logical_block_size: u64) -> u64 {
        self.first_lba * logical_block_size
    }

    pub fn device(&self, disk: &Path) -> PathBuf {
        PathBuf::from(partition_path(&disk.to_string_lossy(), self.number))
    }

    /// Whether the executor creates a filesystem on this partition.
    pub fn needs_format(&self) -> bool {
        self.action != TargetAction::Reuse && self.spec.filesystem != FilesystemKind::Raw
    }

    /// GPT entry to write for this target.
    pub fn partition_entry(&self) -> PartitionEntry {
        if let (TargetAction::Reuse, Some(existing)) = (self.action, &self.existing) {
            return existing.clone();
        }
        PartitionEntry {
            number: self.number,
            name: self.spec.label.to_string(),
            partition_type: self.spec.type_class.partition_type(),
            guid: uuid::Uuid::new_v4(),
            first_lba: self.first_lba,
            last_lba: self.last_lba(),
            attributes: self.spec.attributes,
        }
    }

    /// Place every asset of this target at its destination.
    pub fn save(&self) -> InstallResult<usize> {
        assets::save_all(&self.assets)
    }
}

/// A fully planned run against one disk. Consumed by [`Manifest::execute`].
#[derive(Debug, Clone)]
pub struct Manifest {
    pub disk: PathBuf,
    pub geometry: DiskGeometry,
    pub sequence: Sequence,
    pub layout: Layout,
    pub next_slot: SlotLabel,
    /// Slot active before this run; re-recorded if META is recreated.
    pub previous_slot: Option<SlotLabel>,
    pub bootloader: bool,
    pub force: bool,
    pub preserve: bool,
    pub zero: bool,
    pub legacy_source: bool,
    pub targets: Vec<Target>,
    /// Configuration file inside the legacy boot partition, carried into State.
    pub legacy_config: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
}

impl Manifest {
    /// Inspect `opts.disk` through `hal` and plan the run.
    ///
    /// Reads the partition table and the boot-slot record; never writes.
    pub fn new<H: BlockOps + ?Sized>(
        next_slot: &str,
        sequence: Sequence,
        legacy_source: bool,
        opts: &Options,
        hal: &H,
    ) -> InstallResult<Self> {
        opts.validate()?;
        let next = SlotLabel::new(next_slot)?;
        let disk = opts.disk.as_path();

        let geometry = hal
            .disk_geometry(disk)
            .map_err(|e| InstallError::device(ExecStep::Detect, disk.display().to_string(), e))?;
        let layout = layout::detect(hal, disk)?;
        let active_slot = match layout.current_entry(META_LABEL) {
            Some(meta) => BootSlotRecord::read(
                hal,
                disk,
                meta.offset_bytes(geometry.logical_block_size),
            )?,
            None => None,
        };

        let state = DiskState {
            disk: disk.to_path_buf(),
            geometry,
            layout,
            active_slot,
        };
        plan(next, sequence, legacy_source, &state, opts)
    }

    pub fn target(&self, label: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.label() == label)
    }

    /// Whether the partition table is rewritten.
    pub fn repartitions(&self) -> bool {
        self.targets
            .iter()
            .any(|t| t.action != TargetAction::Reuse)
    }

    /// Byte offset of the boot-slot record.
    pub fn meta_offset(&self) -> InstallResult<u64> {
        self.target(META_LABEL)
            .map(|t| t.offset_bytes(self.geometry.logical_block_size))
            .ok_or_else(|| InstallError::planning("manifest has no META partition"))
    }

    /// The mounts the installed system uses, in mount order.
    pub fn system_mountpoints(&self) -> MountPointSet {
        MountPointSet::from_targets(&self.disk, &self.targets)
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let lbs = self.geometry.logical_block_size;
        let mut lines = Vec::new();
        lines.push(format!(
            "Manifest: {} slot {} on {} ({} bytes, {}-byte sectors)",
            self.sequence,
            self.next_slot,
            self.disk.display(),
            self.geometry.size_bytes,
            lbs
        ));
        lines.push(format!("Detected layout: {}", self.layout));
        lines.push(format!(
            "Previous slot: {}",
            self.previous_slot
                .as_ref()
                .map(SlotLabel::as_str)
                .unwrap_or("none")
        ));
        if self.zero {
            lines.push("Wipe GPT header regions first".to_string());
        }
        for target in &self.targets {
            let mut line = format!(
                "{:>2}. {:<10} {:<8} LBA {}..={} ({} bytes)",
                target.number,
                target.label(),
                target.action,
                target.first_lba,
                target.last_lba(),
                target.size_bytes(lbs)
            );
            if let Some(source) = &target.content_source {
                line.push_str(&format!(", carries content of {}", source.name));
            }
            if !target.assets.is_empty() {
                line.push_str(&format!(", {} assets", target.assets.len()));
            }
            lines.push(line);
        }
        if let Some(config) = &self.legacy_config {
            lines.push(format!("Carry legacy {} into STATE", config.display()));
        }
        lines
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.summary_lines() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::partitions::{spec_for, BOOT_LABEL, EFI_LABEL};
    use keel_hal::{DiskGeometry, FakeHal};
    use std::fs;
    use tempfile::tempdir;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn options() -> Options {
        Options {
            disk: PathBuf::from("/dev/vda"),
            kernel: Some("/srv/vmlinuz".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn new_plans_a_clean_disk() {
        let hal = FakeHal::new();
        hal.add_disk("/dev/vda", DiskGeometry::new(4 * GIB, 512));

        let manifest = Manifest::new("A", Sequence::Install, false, &options(), &hal).unwrap();
        assert_eq!(manifest.targets.len(), 6);
        assert!(manifest.repartitions());
        assert_eq!(manifest.previous_slot, None);
        assert_eq!(manifest.target(EFI_LABEL).unwrap().number, 1);
        assert_eq!(manifest.meta_offset().unwrap() % 512, 0);
        // Planning only reads.
        assert_eq!(hal.operation_count(), 0);
    }

    #[test]
    fn new_rejects_bad_slot_and_unknown_disk() {
        let hal = FakeHal::new();
        hal.add_disk("/dev/vda", DiskGeometry::new(4 * GIB, 512));
        assert!(matches!(
            Manifest::new("../A", Sequence::Install, false, &options(), &hal),
            Err(InstallError::Planning(_))
        ));

        let mut opts = options();
        opts.disk = PathBuf::from("/dev/vdz");
        assert!(matches!(
            Manifest::new("A", Sequence::Install, false, &opts, &hal),
            Err(InstallError::Device {
                step: ExecStep::Detect,
                ..
            })
        ));
    }

    #[test]
    fn summary_lists_every_target() {
        let hal = FakeHal::new();
        hal.add_disk("/dev/vda", DiskGeometry::new(4 * GIB, 512));
        let manifest = Manifest::new("A", Sequence::Install, false, &options(), &hal).unwrap();
        let text = manifest.to_string();
        assert!(text.contains("install slot A on /dev/vda"));
        for spec in crate::install::partitions::PARTITION_SPECS.iter() {
            assert!(text.contains(spec.label));
        }
    }

    #[test]
    fn target_device_and_entry() {
        let target = Target {
            spec: spec_for(BOOT_LABEL).unwrap(),
            number: 3,
            first_lba: 100,
            length_lbas: 10,
            action: TargetAction::CreateFresh,
            preserve_content: false,
            existing: None,
            content_source: None,
            assets: Vec::new(),
        };
        assert_eq!(target.last_lba(), 109);
        assert_eq!(
            target.device(Path::new("/dev/nvme0n1")),
            PathBuf::from("/dev/nvme0n1p3")
        );
        let entry = target.partition_entry();
        assert_eq!(entry.name, BOOT_LABEL);
        assert_eq!((entry.first_lba, entry.last_lba), (100, 109));
        assert!(target.needs_format());
    }

    #[test]
    fn target_save_places_assets() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("kernel");
        fs::write(&src, b"LINUX!").unwrap();
        let dest = dir.path().join("boot/A/vmlinuz");
        let target = Target {
            spec: spec_for(BOOT_LABEL).unwrap(),
            number: 3,
            first_lba: 0,
            length_lbas: 1,
            action: TargetAction::Reuse,
            preserve_content: true,
            existing: None,
            content_source: None,
            assets: vec![Asset::new(src.to_string_lossy(), &dest)],
        };
        assert_eq!(target.save().unwrap(), 1);
        assert_eq!(fs::read(dest).unwrap(), b"LINUX!");
    }
}
