//! Applies a manifest to the disk.
//!
//! Steps run strictly in order. Everything that only reads (staging carried
//! content, capacity checks) happens before the first destructive write, and
//! the boot-slot record is written last.

use super::manifest::{Manifest, Target, TargetAction};
use super::meta::{BootSlotRecord, BootSlots, SlotLabel};
use super::partitions::{FilesystemKind, BOOT_LABEL, CONFIG_FILE, META_LABEL, STATE_LABEL};
use crate::assets::rebase;
use crate::errors::{ExecStep, InstallError, InstallResult};
use keel_hal::{
    tree_size, CopyOptions, FormatOptions, HalError, MountGuard, MountOptions, MsFlags,
    PartitionTable, SystemHal, WriteOptions,
};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Raw partitions created fresh get this many leading bytes zeroed.
const RAW_HEAD_BYTES: u64 = 4096;

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub disk: PathBuf,
    pub active_slot: SlotLabel,
    pub previous_slot: Option<SlotLabel>,
    pub repartitioned: bool,
    /// Labels of partitions whose content was carried across.
    pub migrated: Vec<String>,
    pub assets_written: usize,
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Disk: {}", self.disk.display())?;
        writeln!(
            f,
            "Active slot: {} (previous: {})",
            self.active_slot,
            self.previous_slot
                .as_ref()
                .map(SlotLabel::as_str)
                .unwrap_or("none")
        )?;
        writeln!(f, "Repartitioned: {}", self.repartitioned)?;
        if !self.migrated.is_empty() {
            writeln!(f, "Carried content: {}", self.migrated.join(", "))?;
        }
        writeln!(f, "Assets written: {}", self.assets_written)
    }
}

fn copy_options(kind: FilesystemKind) -> CopyOptions {
    match kind {
        FilesystemKind::Vfat => CopyOptions::vfat_safe(),
        _ => CopyOptions::archive(),
    }
}

fn io_err(step: ExecStep, target: &str, err: std::io::Error) -> InstallError {
    InstallError::device(step, target, HalError::Io(err))
}

/// Content copied off a partition before the table is rewritten.
struct Staged {
    /// Index into the manifest targets.
    target: usize,
    dir: PathBuf,
    size: (u64, u64),
}

struct Executor<'h, H: SystemHal + ?Sized> {
    manifest: Manifest,
    hal: &'h H,
    /// Removed after publish. Kept on disk when a run fails after the first
    /// destructive write.
    workdir: Option<TempDir>,
    root: PathBuf,
    staged: Vec<Staged>,
    legacy_config: Option<PathBuf>,
    destructive: bool,
}

impl<'h, H: SystemHal + ?Sized> Executor<'h, H> {
    fn new(manifest: Manifest, hal: &'h H) -> InstallResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("keel-");
        let workdir = match &manifest.staging_dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|e| io_err(ExecStep::Stage, "staging", e))?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| io_err(ExecStep::Stage, "staging", e))?;

        Ok(Self {
            manifest,
            hal,
            root: workdir.path().to_path_buf(),
            workdir: Some(workdir),
            staged: Vec::new(),
            legacy_config: None,
            destructive: false,
        })
    }

    fn disk(&self) -> &Path {
        &self.manifest.disk
    }

    fn lbs(&self) -> u64 {
        self.manifest.geometry.logical_block_size
    }

    fn confirmed() -> WriteOptions {
        WriteOptions::new(false, true)
    }

    fn run(mut self) -> InstallResult<ExecutionReport> {
        match self.apply() {
            Ok(report) => {
                if let Some(dir) = self.workdir.take() {
                    if let Err(err) = dir.close() {
                        log::warn!("could not remove {}: {}", self.root.display(), err);
                    }
                }
                Ok(report)
            }
            Err(err) if self.destructive && !self.staged.is_empty() => {
                let workdir = match self.workdir.take() {
                    Some(dir) => dir.keep(),
                    None => self.root.clone(),
                };
                log::error!(
                    "{} halted after modifying {}: {}",
                    self.manifest.sequence,
                    self.disk().display(),
                    err
                );
                log::error!("staged partition content kept in {}", workdir.display());
                Err(InstallError::Halted {
                    source: Box::new(err),
                    workdir,
                })
            }
            Err(err) => Err(err),
        }
    }

    fn apply(&mut self) -> InstallResult<ExecutionReport> {
        log::info!(
            "applying {} of slot {} to {}",
            self.manifest.sequence,
            self.manifest.next_slot,
            self.disk().display()
        );

        self.preflight()?;
        self.stage_content()?;
        self.destructive = true;
        if self.manifest.zero {
            self.zero_headers()?;
        }
        let repartitioned = self.manifest.repartitions();
        if repartitioned {
            self.write_table()?;
        }
        self.format()?;
        self.restore_content()?;
        let assets_written = self.place_assets()?;

        if let Err(err) = self.hal.sync() {
            log::warn!("sync failed: {}", err);
        }

        let meta_offset = self.manifest.meta_offset()?;
        let mut slots = BootSlots::new(self.manifest.previous_slot.clone());
        slots.stage(self.manifest.next_slot.clone())?;
        let active_slot = slots.publish(self.hal, self.disk(), meta_offset)?;

        let migrated = self
            .staged
            .iter()
            .map(|s| self.manifest.targets[s.target].label().to_string())
            .collect();
        Ok(ExecutionReport {
            disk: self.manifest.disk.clone(),
            active_slot,
            previous_slot: self.manifest.previous_slot.clone(),
            repartitioned,
            migrated,
            assets_written,
        })
    }

    /// Refuse to repartition or format a disk with mounted partitions.
    fn preflight(&self) -> InstallResult<()> {
        let destructive = self.manifest.zero
            || self.manifest.repartitions()
            || self.manifest.targets.iter().any(Target::needs_format);
        if !destructive {
            return Ok(());
        }
        let disk = self.disk().display().to_string();
        let mounted = self
            .hal
            .mounted_partitions(self.disk())
            .map_err(|e| InstallError::device(ExecStep::Preflight, disk.clone(), e))?;
        if !mounted.is_empty() {
            log::error!(
                "{} has mounted partitions: {}",
                disk,
                mounted
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            return Err(InstallError::device(
                ExecStep::Preflight,
                disk,
                HalError::DiskBusy,
            ));
        }
        Ok(())
    }

    fn mount_dir(&self, step: ExecStep, label: &str) -> InstallResult<PathBuf> {
        let purpose = match step {
            ExecStep::Stage => "source",
            _ => "restore",
        };
        let dir = self.root.join(purpose).join(label);
        fs::create_dir_all(&dir).map_err(|e| io_err(step, label, e))?;
        Ok(dir)
    }

    /// Copy every carried partition into the work directory. Read-only.
    fn stage_content(&mut self) -> InstallResult<()> {
        let lbs = self.lbs();
        for idx in 0..self.manifest.targets.len() {
            let target = &self.manifest.targets[idx];
            let Some(source) = target.content_source.clone() else {
                continue;
            };
            let label = target.label();
            let fstype = target.spec.filesystem.fstype();
            let capacity = target.size_bytes(lbs);
            let from_legacy_boot =
                label == BOOT_LABEL && target.action == TargetAction::MigrateFromLegacy;
            let device = PathBuf::from(keel_hal::partition_path(
                &self.disk().to_string_lossy(),
                source.number,
            ));
            log::info!(
                "staging {} ({}) for {}",
                source.name,
                device.display(),
                label
            );

            let mnt = self.mount_dir(ExecStep::Stage, label)?;
            self.hal
                .mount_device(
                    &device,
                    &mnt,
                    fstype,
                    MountOptions::new().with_flags(MsFlags::MS_RDONLY),
                    false,
                )
                .map_err(|e| InstallError::device(ExecStep::Stage, label, e))?;
            let guard = MountGuard::new(self.hal, &mnt, false);

            let dir = self.root.join("content").join(label);
            self.hal
                .copy_tree_native(&mnt, &dir, &CopyOptions::archive(), &mut |_| true)
                .map_err(|e| InstallError::migration(ExecStep::Stage, label, e))?;
            guard
                .unmount()
                .map_err(|e| InstallError::device(ExecStep::Stage, label, e))?;

            if from_legacy_boot {
                self.split_legacy_config(&dir)?;
            }

            let size =
                tree_size(&dir).map_err(|e| InstallError::migration(ExecStep::Stage, label, e))?;
            if size.0 > capacity {
                return Err(InstallError::migration(
                    ExecStep::Stage,
                    label,
                    format!(
                        "{} bytes of content do not fit in {} bytes",
                        size.0, capacity
                    ),
                ));
            }
            log::info!("staged {} files ({} bytes) for {}", size.1, size.0, label);
            self.staged.push(Staged {
                target: idx,
                dir,
                size,
            });
        }
        Ok(())
    }

    /// The legacy boot partition held the machine config; it moves to State.
    fn split_legacy_config(&mut self, boot_dir: &Path) -> InstallResult<()> {
        let Some(relative) = self.manifest.legacy_config.clone() else {
            return Ok(());
        };
        let found = boot_dir.join(&relative);
        if !found.is_file() {
            log::warn!("legacy boot partition has no {}", relative.display());
            return Ok(());
        }
        let dest = self.root.join("legacy-config");
        fs::create_dir_all(&dest).map_err(|e| io_err(ExecStep::Stage, STATE_LABEL, e))?;
        let dest = dest.join(&relative);
        fs::rename(&found, &dest).map_err(|e| io_err(ExecStep::Stage, STATE_LABEL, e))?;
        self.legacy_config = Some(dest);
        Ok(())
    }

    fn zero_headers(&self) -> InstallResult<()> {
        let geometry = self.manifest.geometry;
        for (offset, len) in [geometry.primary_gpt_region(), geometry.backup_gpt_region()] {
            log::info!("zeroing {} bytes at {} of {}", len, offset, self.disk().display());
            let zeros = vec![0u8; len as usize];
            self.hal
                .write_raw(self.disk(), offset, &zeros, &Self::confirmed())
                .map_err(|e| {
                    InstallError::device(ExecStep::Zero, self.disk().display().to_string(), e)
                })?;
        }
        Ok(())
    }

    fn write_table(&self) -> InstallResult<()> {
        let disk = self.disk().display().to_string();
        let table = PartitionTable::new(
            self.manifest
                .targets
                .iter()
                .map(Target::partition_entry)
                .collect(),
        );
        self.hal
            .write_partition_table(self.disk(), &table, &Self::confirmed())
            .map_err(|e| InstallError::device(ExecStep::PartitionTable, disk.clone(), e))?;
        self.hal
            .reread_partitions(self.disk())
            .map_err(|e| InstallError::device(ExecStep::PartitionTable, disk.clone(), e))?;
        if let Err(err) = self.hal.udev_settle() {
            log::warn!("udev settle failed: {}", err);
        }
        log::info!("wrote partition table with {} entries to {}", table.entries.len(), disk);
        Ok(())
    }

    fn format(&self) -> InstallResult<()> {
        let lbs = self.lbs();
        let opts = FormatOptions::new(false, true);
        for target in &self.manifest.targets {
            if target.action == TargetAction::Reuse {
                continue;
            }
            let label = target.label();
            let device = target.device(self.disk());
            let result = match target.spec.filesystem {
                FilesystemKind::Vfat => self.hal.format_vfat(&device, label, &opts),
                FilesystemKind::Xfs => self.hal.format_xfs(&device, label, &opts),
                FilesystemKind::Raw => {
                    let len = RAW_HEAD_BYTES.min(target.size_bytes(lbs));
                    self.hal.write_raw(
                        self.disk(),
                        target.offset_bytes(lbs),
                        &vec![0u8; len as usize],
                        &Self::confirmed(),
                    )
                }
            };
            result.map_err(|e| InstallError::device(ExecStep::Format, label, e))?;

            // META was just wiped: keep the running slot bootable until publish.
            if label == META_LABEL {
                if let Some(previous) = &self.manifest.previous_slot {
                    BootSlotRecord::write(
                        self.hal,
                        self.disk(),
                        target.offset_bytes(lbs),
                        Some(previous),
                    )
                    .map_err(|e| InstallError::device(ExecStep::Format, META_LABEL, e))?;
                    log::info!("re-recorded previous slot {}", previous);
                }
            }
        }
        Ok(())
    }

    fn restore_content(&self) -> InstallResult<()> {
        for staged in &self.staged {
            let target = &self.manifest.targets[staged.target];
            let label = target.label();
            let mnt = self.mount_dir(ExecStep::Migrate, label)?;
            self.mount_target(target, &mnt, ExecStep::Migrate)?;
            let guard = MountGuard::new(self.hal, &mnt, false);

            self.hal
                .copy_tree_native(
                    &staged.dir,
                    &mnt,
                    &copy_options(target.spec.filesystem),
                    &mut |_| true,
                )
                .map_err(|e| InstallError::migration(ExecStep::Migrate, label, e))?;
            let restored =
                tree_size(&mnt).map_err(|e| InstallError::migration(ExecStep::Migrate, label, e))?;
            if restored != staged.size {
                return Err(InstallError::migration(
                    ExecStep::Migrate,
                    label,
                    format!(
                        "restored {} files ({} bytes), staged {} files ({} bytes)",
                        restored.1, restored.0, staged.size.1, staged.size.0
                    ),
                ));
            }
            guard
                .unmount()
                .map_err(|e| InstallError::device(ExecStep::Migrate, label, e))?;
            log::info!("restored {} files into {}", restored.1, label);
        }

        if let Some(config) = &self.legacy_config {
            let target = self
                .manifest
                .target(STATE_LABEL)
                .ok_or_else(|| InstallError::planning("manifest has no STATE partition"))?;
            let mnt = self.mount_dir(ExecStep::Migrate, STATE_LABEL)?;
            self.mount_target(target, &mnt, ExecStep::Migrate)?;
            let guard = MountGuard::new(self.hal, &mnt, false);
            fs::copy(config, mnt.join(CONFIG_FILE))
                .map_err(|e| InstallError::migration(ExecStep::Migrate, STATE_LABEL, e))?;
            guard
                .unmount()
                .map_err(|e| InstallError::device(ExecStep::Migrate, STATE_LABEL, e))?;
            log::info!("carried legacy machine config into {}", STATE_LABEL);
        }
        Ok(())
    }

    fn mount_target(&self, target: &Target, mnt: &Path, step: ExecStep) -> InstallResult<()> {
        self.hal
            .mount_device(
                &target.device(self.disk()),
                mnt,
                target.spec.filesystem.fstype(),
                MountOptions::new(),
                false,
            )
            .map_err(|e| InstallError::device(step, target.label(), e))
    }

    /// Mount the system tree under the work directory and write every asset.
    fn place_assets(&self) -> InstallResult<usize> {
        if self.manifest.targets.iter().all(|t| t.assets.is_empty()) {
            return Ok(0);
        }
        let root = self.root.join("root");
        let mounted = self.manifest.system_mountpoints().with_prefix(&root).mount(self.hal)?;

        let boot = self
            .manifest
            .target(BOOT_LABEL)
            .and_then(|t| t.spec.mount_path)
            .ok_or_else(|| InstallError::planning("manifest has no BOOT partition"))?;
        let slot_dir = rebase(&root, &Path::new(boot).join(self.manifest.next_slot.as_str()));
        if slot_dir.exists() {
            log::info!("removing stale {}", slot_dir.display());
            fs::remove_dir_all(&slot_dir)
                .map_err(|e| io_err(ExecStep::Assets, BOOT_LABEL, e))?;
        }

        let mut written = 0;
        for target in &self.manifest.targets {
            for asset in &target.assets {
                asset.rebased(&root).save()?;
                written += 1;
            }
        }
        mounted.unmount()?;
        Ok(written)
    }
}

impl Manifest {
    /// Apply the manifest. Consumes it: a manifest describes exactly one run.
    pub fn execute<H: SystemHal + ?Sized>(self, hal: &H) -> InstallResult<ExecutionReport> {
        Executor::new(self, hal)?.run()
    }
}
