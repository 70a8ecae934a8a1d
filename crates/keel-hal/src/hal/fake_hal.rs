//! Fake HAL implementation for testing.
//!
//! Disks live in memory: a structured partition table, sparse raw bytes and one
//! backing directory per formatted filesystem. Mounting copies the backing
//! directory into the mount target and unmounting syncs it back, so callers can
//! exercise real file content without root privileges or hardware.

use super::{
    copy_tree, BlockOps, CopyOps, CopyOptions, CopyProgress, DiskGeometry, FormatOps,
    FormatOptions, MountOps, MountOptions, PartitionTable, SystemOps, WriteOptions,
};
use crate::{partition_path, HalError, HalResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Operation records for testing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Mount {
        device: PathBuf,
        target: PathBuf,
        fstype: Option<String>,
    },
    Unmount {
        target: PathBuf,
    },
    FormatVfat {
        device: PathBuf,
        label: String,
    },
    FormatXfs {
        device: PathBuf,
        label: String,
    },
    WritePartitionTable {
        disk: PathBuf,
        partitions: usize,
    },
    WriteRaw {
        disk: PathBuf,
        offset: u64,
        len: usize,
    },
    CopyTree {
        src: PathBuf,
        dst: PathBuf,
    },
    Sync,
    RereadPartitions {
        disk: PathBuf,
    },
    UdevSettle,
}

/// Failures FakeHal can be told to inject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeFailure {
    /// Formatting a filesystem with this label fails.
    Format { label: String },
    /// Mounting this device fails.
    Mount { device: PathBuf },
    /// The `attempt`-th mount of this device since the last `clear()` fails (1-based).
    MountAttempt { device: PathBuf, attempt: usize },
    /// The next unmount of a target mounted from this device fails, once.
    Unmount { device: PathBuf },
    /// Every partition table write fails.
    WritePartitionTable,
}

const CHUNK_SIZE: u64 = 64 * 1024;

#[derive(Debug)]
struct FakeFilesystem {
    fstype: &'static str,
    label: String,
    backing: PathBuf,
}

#[derive(Debug)]
struct FakeDisk {
    geometry: DiskGeometry,
    table: Option<PartitionTable>,
    chunks: BTreeMap<u64, Vec<u8>>,
    /// Keyed by the `(first_lba, last_lba)` of the partition holding them.
    filesystems: BTreeMap<(u64, u64), FakeFilesystem>,
}

impl FakeDisk {
    fn read(&self, offset: u64, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            let pos = offset + i as u64;
            *byte = self
                .chunks
                .get(&(pos / CHUNK_SIZE))
                .map(|chunk| chunk[(pos % CHUNK_SIZE) as usize])
                .unwrap_or(0);
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let pos = offset + i as u64;
            let chunk = self
                .chunks
                .entry(pos / CHUNK_SIZE)
                .or_insert_with(|| vec![0u8; CHUNK_SIZE as usize]);
            chunk[(pos % CHUNK_SIZE) as usize] = *byte;
        }

        let lbs = self.geometry.logical_block_size;
        let end = offset + data.len() as u64;

        // Clobbering the primary header destroys the table signature.
        if offset < 2 * lbs && end > lbs {
            self.table = None;
        }
        self.filesystems.retain(|(first, last), _| {
            let fs_start = first * lbs;
            let fs_end = (last + 1) * lbs;
            end <= fs_start || offset >= fs_end
        });
    }
}

/// A live mount: the device it came from and the backing directory it syncs to.
#[derive(Debug)]
struct FakeMount {
    device: PathBuf,
    backing: PathBuf,
}

/// Shared state for FakeHal operations.
#[derive(Debug, Default)]
struct FakeHalState {
    /// All operations that were recorded
    operations: Vec<Operation>,
    disks: BTreeMap<PathBuf, FakeDisk>,
    mounts: BTreeMap<PathBuf, FakeMount>,
    mount_attempts: BTreeMap<PathBuf, usize>,
    failures: Vec<FakeFailure>,
    backing_root: Option<tempfile::TempDir>,
    next_fs_id: u64,
}

impl FakeHalState {
    /// Resolve a partition device path to its disk and LBA key.
    fn locate(&self, device: &Path) -> HalResult<(PathBuf, (u64, u64))> {
        for (disk_path, disk) in &self.disks {
            let Some(table) = &disk.table else {
                continue;
            };
            let disk_str = disk_path.to_string_lossy();
            for entry in &table.entries {
                if Path::new(&partition_path(&disk_str, entry.number)) == device {
                    return Ok((disk_path.clone(), (entry.first_lba, entry.last_lba)));
                }
            }
        }
        Err(HalError::DeviceNotFound(device.display().to_string()))
    }

    fn disk(&self, disk: &Path) -> HalResult<&FakeDisk> {
        self.disks
            .get(disk)
            .ok_or_else(|| HalError::DeviceNotFound(disk.display().to_string()))
    }

    fn disk_mut(&mut self, disk: &Path) -> HalResult<&mut FakeDisk> {
        self.disks
            .get_mut(disk)
            .ok_or_else(|| HalError::DeviceNotFound(disk.display().to_string()))
    }

    fn new_backing_dir(&mut self) -> HalResult<PathBuf> {
        if self.backing_root.is_none() {
            self.backing_root = Some(tempfile::Builder::new().prefix("fake-hal-").tempdir()?);
        }
        let root = match &self.backing_root {
            Some(root) => root.path().to_path_buf(),
            None => return Err(HalError::Other("fake backing root missing".to_string())),
        };
        self.next_fs_id += 1;
        let dir = root.join(format!("fs-{}", self.next_fs_id));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn check_bounds(geometry: &DiskGeometry, offset: u64, len: usize) -> HalResult<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= geometry.size_bytes => Ok(()),
        _ => Err(HalError::ValidationFailed(format!(
            "raw access {}+{} beyond end of {}-byte disk",
            offset, len, geometry.size_bytes
        ))),
    }
}

fn validate_table(geometry: &DiskGeometry, table: &PartitionTable) -> HalResult<()> {
    let first_usable = geometry.first_usable_lba();
    let last_usable = geometry.last_usable_lba();
    let mut previous_end: Option<u64> = None;
    let mut sorted: Vec<_> = table.entries.iter().collect();
    sorted.sort_by_key(|e| e.first_lba);
    for entry in sorted {
        if entry.first_lba < first_usable
            || entry.last_lba > last_usable
            || entry.last_lba < entry.first_lba
        {
            return Err(HalError::ValidationFailed(format!(
                "partition {} ({}..={}) outside usable range {}..={}",
                entry.name, entry.first_lba, entry.last_lba, first_usable, last_usable
            )));
        }
        if let Some(end) = previous_end {
            if entry.first_lba <= end {
                return Err(HalError::ValidationFailed(format!(
                    "partition {} overlaps its predecessor",
                    entry.name
                )));
            }
        }
        previous_end = Some(entry.last_lba);
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> HalResult<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.symlink_metadata()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Fake HAL implementation backed by in-memory disks.
///
/// This is designed for testing and CI environments where real system
/// operations would fail or be dangerous.
#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
}

impl FakeHal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeHalState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a blank disk (no partition table, all zero bytes).
    pub fn add_disk(&self, disk: impl Into<PathBuf>, geometry: DiskGeometry) {
        self.lock().disks.insert(
            disk.into(),
            FakeDisk {
                geometry,
                table: None,
                chunks: BTreeMap::new(),
                filesystems: BTreeMap::new(),
            },
        );
    }

    /// Make a future operation fail.
    pub fn fail_on(&self, failure: FakeFailure) {
        self.lock().failures.push(failure);
    }

    /// Get all recorded operations.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    /// Get the number of operations recorded.
    pub fn operation_count(&self) -> usize {
        self.lock().operations.len()
    }

    /// Check if a specific operation was recorded.
    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.lock().operations.iter().any(check)
    }

    /// Clear all recorded operations and injected failures.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.operations.clear();
        state.failures.clear();
        state.mount_attempts.clear();
    }

    /// Filesystem type and label currently on `device`, if formatted.
    pub fn filesystem(&self, device: &Path) -> Option<(String, String)> {
        let state = self.lock();
        let (disk, key) = state.locate(device).ok()?;
        let fs = state.disks.get(&disk)?.filesystems.get(&key)?;
        Some((fs.fstype.to_string(), fs.label.clone()))
    }

    /// Currently mounted targets.
    pub fn mounted_targets(&self) -> Vec<PathBuf> {
        self.lock().mounts.keys().cloned().collect()
    }

    fn record_operation(&self, op: Operation) {
        self.lock().operations.push(op);
    }

    fn format(
        &self,
        device: &Path,
        fstype: &'static str,
        label: &str,
        opts: &FormatOptions,
    ) -> HalResult<()> {
        if !opts.dry_run && !opts.confirmed {
            return Err(HalError::SafetyLock);
        }

        if opts.dry_run {
            log::info!("FAKE HAL DRY RUN: mkfs.{} {}", fstype, device.display());
            return Ok(());
        }

        log::info!("FAKE HAL: mkfs.{} {} ({})", fstype, device.display(), label);

        let mut state = self.lock();
        let injected = FakeFailure::Format {
            label: label.to_string(),
        };
        if state.failures.contains(&injected) {
            return Err(HalError::CommandFailed {
                program: format!("mkfs.{}", fstype),
                code: Some(1),
                stderr: "injected failure".to_string(),
            });
        }

        let (disk, key) = state.locate(device)?;
        let backing = state.new_backing_dir()?;
        let previous = state.disk_mut(&disk)?.filesystems.insert(
            key,
            FakeFilesystem {
                fstype,
                label: label.to_string(),
                backing,
            },
        );
        if let Some(old) = previous {
            let _ = fs::remove_dir_all(&old.backing);
        }

        let op = match fstype {
            "vfat" => Operation::FormatVfat {
                device: device.to_path_buf(),
                label: label.to_string(),
            },
            _ => Operation::FormatXfs {
                device: device.to_path_buf(),
                label: label.to_string(),
            },
        };
        state.operations.push(op);
        Ok(())
    }
}

impl BlockOps for FakeHal {
    fn disk_geometry(&self, disk: &Path) -> HalResult<DiskGeometry> {
        Ok(self.lock().disk(disk)?.geometry)
    }

    fn read_partition_table(&self, disk: &Path) -> HalResult<Option<PartitionTable>> {
        Ok(self.lock().disk(disk)?.table.clone())
    }

    fn write_partition_table(
        &self,
        disk: &Path,
        table: &PartitionTable,
        opts: &WriteOptions,
    ) -> HalResult<()> {
        if !opts.dry_run && !opts.confirmed {
            return Err(HalError::SafetyLock);
        }

        if opts.dry_run {
            log::info!("FAKE HAL DRY RUN: write GPT to {}", disk.display());
            return Ok(());
        }

        log::info!(
            "FAKE HAL: write GPT with {} partitions to {}",
            table.entries.len(),
            disk.display()
        );

        let mut state = self.lock();
        if state.failures.contains(&FakeFailure::WritePartitionTable) {
            return Err(HalError::Gpt("injected failure".to_string()));
        }

        let fake = state.disk_mut(disk)?;
        validate_table(&fake.geometry, table)?;
        let keep: Vec<(u64, u64)> = table
            .entries
            .iter()
            .map(|e| (e.first_lba, e.last_lba))
            .collect();
        fake.filesystems.retain(|key, _| keep.contains(key));
        fake.table = Some(PartitionTable::new(table.entries.clone()));

        state.operations.push(Operation::WritePartitionTable {
            disk: disk.to_path_buf(),
            partitions: table.entries.len(),
        });
        Ok(())
    }

    fn read_raw(&self, disk: &Path, offset: u64, buf: &mut [u8]) -> HalResult<()> {
        let state = self.lock();
        let fake = state.disk(disk)?;
        check_bounds(&fake.geometry, offset, buf.len())?;
        fake.read(offset, buf);
        Ok(())
    }

    fn write_raw(
        &self,
        disk: &Path,
        offset: u64,
        data: &[u8],
        opts: &WriteOptions,
    ) -> HalResult<()> {
        if !opts.dry_run && !opts.confirmed {
            return Err(HalError::SafetyLock);
        }

        if opts.dry_run {
            log::info!(
                "FAKE HAL DRY RUN: write {} bytes at {} of {}",
                data.len(),
                offset,
                disk.display()
            );
            return Ok(());
        }

        let mut state = self.lock();
        let fake = state.disk_mut(disk)?;
        check_bounds(&fake.geometry, offset, data.len())?;
        fake.write(offset, data);
        state.operations.push(Operation::WriteRaw {
            disk: disk.to_path_buf(),
            offset,
            len: data.len(),
        });
        Ok(())
    }
}

impl MountOps for FakeHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        _options: MountOptions,
        dry_run: bool,
    ) -> HalResult<()> {
        if dry_run {
            log::info!(
                "FAKE HAL DRY RUN: mount {} -> {}",
                device.display(),
                target.display()
            );
            return Ok(());
        }

        log::info!(
            "FAKE HAL: mount {} -> {} (type: {:?})",
            device.display(),
            target.display(),
            fstype
        );

        let mut state = self.lock();
        let attempts = state
            .mount_attempts
            .entry(device.to_path_buf())
            .or_insert(0);
        *attempts += 1;
        let attempt = *attempts;
        let injected = state.failures.iter().any(|f| match f {
            FakeFailure::Mount { device: d } => d == device,
            FakeFailure::MountAttempt { device: d, attempt: n } => d == device && *n == attempt,
            _ => false,
        });
        if injected {
            return Err(HalError::Nix(nix::errno::Errno::EIO));
        }
        if state.mounts.contains_key(target) {
            return Err(HalError::DiskBusy);
        }
        if !target.is_dir() {
            return Err(HalError::Nix(nix::errno::Errno::ENOENT));
        }

        let (disk, key) = state.locate(device)?;
        let fs = state
            .disk(&disk)?
            .filesystems
            .get(&key)
            .ok_or_else(|| {
                HalError::ValidationFailed(format!("no filesystem on {}", device.display()))
            })?;
        if let Some(requested) = fstype {
            if requested != fs.fstype {
                return Err(HalError::ValidationFailed(format!(
                    "{} holds {}, not {}",
                    device.display(),
                    fs.fstype,
                    requested
                )));
            }
        }
        let backing = fs.backing.clone();

        copy_tree(&backing, target, &CopyOptions::archive(), &mut |_| true)?;
        state.mounts.insert(
            target.to_path_buf(),
            FakeMount {
                device: device.to_path_buf(),
                backing,
            },
        );
        state.operations.push(Operation::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.map(String::from),
        });

        Ok(())
    }

    fn unmount(&self, target: &Path, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("FAKE HAL DRY RUN: unmount {}", target.display());
            return Ok(());
        }

        log::info!("FAKE HAL: unmount {}", target.display());

        let mut state = self.lock();
        if state
            .mounts
            .keys()
            .any(|mp| mp != target && mp.starts_with(target))
        {
            return Err(HalError::DiskBusy);
        }
        let device = state
            .mounts
            .get(target)
            .map(|m| m.device.clone())
            .ok_or_else(|| HalError::NotMounted(target.display().to_string()))?;
        let injected = FakeFailure::Unmount { device };
        if let Some(idx) = state.failures.iter().position(|f| *f == injected) {
            state.failures.remove(idx);
            return Err(HalError::Nix(nix::errno::Errno::EBUSY));
        }
        let backing = match state.mounts.remove(target) {
            Some(mount) => mount.backing,
            None => return Err(HalError::NotMounted(target.display().to_string())),
        };

        clear_dir(&backing)?;
        copy_tree(target, &backing, &CopyOptions::archive(), &mut |_| true)?;
        clear_dir(target)?;

        state.operations.push(Operation::Unmount {
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn unmount_recursive(&self, target: &Path, dry_run: bool) -> HalResult<()> {
        let mut below: Vec<PathBuf> = self
            .lock()
            .mounts
            .keys()
            .filter(|mp| mp.starts_with(target))
            .cloned()
            .collect();
        below.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        for mp in below {
            self.unmount(&mp, dry_run)?;
        }
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        let is_mounted = self.lock().mounts.contains_key(path);
        log::info!("FAKE HAL: is_mounted({}) = {}", path.display(), is_mounted);
        Ok(is_mounted)
    }

    fn mounted_partitions(&self, disk: &Path) -> HalResult<Vec<PathBuf>> {
        let state = self.lock();
        let fake = state.disk(disk)?;
        let backings: Vec<&PathBuf> = fake.filesystems.values().map(|fs| &fs.backing).collect();
        Ok(state
            .mounts
            .iter()
            .filter(|(_, mount)| backings.contains(&&mount.backing))
            .map(|(target, _)| target.clone())
            .collect())
    }
}

impl FormatOps for FakeHal {
    fn format_vfat(&self, device: &Path, label: &str, opts: &FormatOptions) -> HalResult<()> {
        self.format(device, "vfat", label, opts)
    }

    fn format_xfs(&self, device: &Path, label: &str, opts: &FormatOptions) -> HalResult<()> {
        self.format(device, "xfs", label, opts)
    }
}

impl CopyOps for FakeHal {
    fn copy_tree_native(
        &self,
        src: &Path,
        dst: &Path,
        opts: &CopyOptions,
        on_progress: &mut dyn FnMut(CopyProgress) -> bool,
    ) -> HalResult<()> {
        self.record_operation(Operation::CopyTree {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
        copy_tree(src, dst, opts, on_progress)
    }
}

impl SystemOps for FakeHal {
    fn sync(&self) -> HalResult<()> {
        self.record_operation(Operation::Sync);
        Ok(())
    }

    fn reread_partitions(&self, disk: &Path) -> HalResult<()> {
        self.record_operation(Operation::RereadPartitions {
            disk: disk.to_path_buf(),
        });
        Ok(())
    }

    fn udev_settle(&self) -> HalResult<()> {
        self.record_operation(Operation::UdevSettle);
        Ok(())
    }
}
