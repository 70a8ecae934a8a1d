//! Linux HAL implementation using real system calls.

use super::{
    copy_tree, BlockOps, CopyOps, CopyOptions, CopyProgress, DiskGeometry, FormatOps,
    FormatOptions, MountOps, MountOptions, PartitionEntry, PartitionTable, PartitionType,
    SystemOps, WriteOptions,
};
use crate::procfs::mountinfo;
use crate::sysfs::block as sysfs_block;
use crate::{HalError, HalResult};
use gpt::disk::LogicalBlockSize;
use gpt::partition_types;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Real HAL implementation for Linux systems.
#[derive(Debug, Clone, Default)]
pub struct LinuxHal;

impl LinuxHal {
    pub fn new() -> Self {
        Self
    }
}

const SYNC_TIMEOUT: Duration = Duration::from_secs(60);
const FORMAT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const REREAD_TIMEOUT: Duration = Duration::from_secs(30);

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

fn map_command_err(program: &str, err: std::io::Error) -> HalError {
    if err.kind() == std::io::ErrorKind::NotFound {
        return HalError::CommandNotFound(program.to_string());
    }
    HalError::Io(err)
}

fn output_failed(program: &str, output: &Output) -> HalError {
    HalError::CommandFailed {
        program: program.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn output_with_timeout(program: &str, cmd: &mut Command, timeout: Duration) -> HalResult<Output> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| map_command_err(program, e))?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    // Drain pipes concurrently to avoid deadlocks on large output.
    let stdout_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout.take() {
            let _ = out.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr.take() {
            let _ = err.read_to_end(&mut buf);
        }
        buf
    });

    let status = match child.wait_timeout(timeout).map_err(HalError::Io)? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout_handle.join();
            let _ = stderr_handle.join();
            return Err(HalError::CommandTimeout {
                program: program.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

fn status_with_timeout(program: &str, cmd: &mut Command, timeout: Duration) -> HalResult<()> {
    let output = output_with_timeout(program, cmd, timeout)?;
    if !output.status.success() {
        return Err(output_failed(program, &output));
    }
    Ok(())
}

fn map_nix_err(err: nix::errno::Errno) -> HalError {
    use nix::errno::Errno;
    match err {
        Errno::EBUSY => HalError::DiskBusy,
        Errno::EACCES | Errno::EPERM => HalError::PermissionDenied,
        other => HalError::Nix(other),
    }
}

fn gpt_err(err: impl std::fmt::Display) -> HalError {
    HalError::Gpt(err.to_string())
}

fn open_disk(disk: &Path, write: bool) -> HalResult<File> {
    OpenOptions::new()
        .read(true)
        .write(write)
        .open(disk)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HalError::DeviceNotFound(disk.display().to_string()),
            std::io::ErrorKind::PermissionDenied => HalError::PermissionDenied,
            _ => HalError::Io(e),
        })
}

fn is_block_device(disk: &Path) -> HalResult<bool> {
    Ok(fs::metadata(disk)?.file_type().is_block_device())
}

fn gpt_block_size(geometry: &DiskGeometry) -> HalResult<LogicalBlockSize> {
    match geometry.logical_block_size {
        512 => Ok(LogicalBlockSize::Lb512),
        4096 => Ok(LogicalBlockSize::Lb4096),
        other => Err(HalError::ValidationFailed(format!(
            "unsupported logical block size {}",
            other
        ))),
    }
}

fn partition_type_from_gpt(t: &partition_types::Type) -> PartitionType {
    if *t == partition_types::EFI {
        PartitionType::EfiSystem
    } else if *t == partition_types::BIOS {
        PartitionType::BiosBoot
    } else if *t == partition_types::LINUX_FS {
        PartitionType::LinuxFilesystem
    } else {
        PartitionType::from_guid(&t.guid.to_string())
    }
}

fn partition_type_to_gpt(t: &PartitionType) -> HalResult<partition_types::Type> {
    match t {
        PartitionType::EfiSystem => Ok(partition_types::EFI),
        PartitionType::BiosBoot => Ok(partition_types::BIOS),
        PartitionType::LinuxFilesystem => Ok(partition_types::LINUX_FS),
        PartitionType::Other(guid) => Err(HalError::ValidationFailed(format!(
            "refusing to write unknown partition type {}",
            guid
        ))),
    }
}

impl BlockOps for LinuxHal {
    fn disk_geometry(&self, disk: &Path) -> HalResult<DiskGeometry> {
        if is_block_device(disk)? {
            let sys_dir =
                sysfs_block::sysfs_dir_for(Path::new(sysfs_block::SYS_CLASS_BLOCK), disk)?;
            let size_bytes = sysfs_block::block_device_size_bytes(&sys_dir)?;
            let lbs = sysfs_block::logical_block_size(&sys_dir)?;
            return Ok(DiskGeometry::new(size_bytes, lbs));
        }

        // Disk images are treated as 512-byte sector devices.
        let mut file = open_disk(disk, false)?;
        let size_bytes = file.seek(SeekFrom::End(0))?;
        Ok(DiskGeometry::new(size_bytes, 512))
    }

    fn read_partition_table(&self, disk: &Path) -> HalResult<Option<PartitionTable>> {
        let geometry = self.disk_geometry(disk)?;
        if geometry.total_lbas() < geometry.reserved_lbas() {
            return Ok(None);
        }

        let mut signature = [0u8; 8];
        self.read_raw(disk, geometry.logical_block_size, &mut signature)?;
        if &signature != GPT_SIGNATURE {
            log::debug!("no GPT signature on {}", disk.display());
            return Ok(None);
        }

        let file = open_disk(disk, false)?;
        let gdisk = gpt::GptConfig::new()
            .writable(false)
            .logical_block_size(gpt_block_size(&geometry)?)
            .open_from_device(Box::new(file))
            .map_err(gpt_err)?;

        let entries = gdisk
            .partitions()
            .iter()
            .filter(|(_, part)| part.is_used())
            .map(|(number, part)| PartitionEntry {
                number: *number,
                name: part.name.clone(),
                partition_type: partition_type_from_gpt(&part.part_type_guid),
                guid: part.part_guid,
                first_lba: part.first_lba,
                last_lba: part.last_lba,
                attributes: part.flags,
            })
            .collect();

        Ok(Some(PartitionTable::new(entries)))
    }

    fn write_partition_table(
        &self,
        disk: &Path,
        table: &PartitionTable,
        opts: &WriteOptions,
    ) -> HalResult<()> {
        if opts.dry_run {
            log::info!(
                "DRY RUN: write GPT with {} partitions to {}",
                table.entries.len(),
                disk.display()
            );
            return Ok(());
        }

        if !opts.confirmed {
            return Err(HalError::SafetyLock);
        }

        let geometry = self.disk_geometry(disk)?;
        let block_size = gpt_block_size(&geometry)?;

        let mut partitions = BTreeMap::new();
        for entry in &table.entries {
            partitions.insert(
                entry.number,
                gpt::partition::Partition {
                    part_type_guid: partition_type_to_gpt(&entry.partition_type)?,
                    part_guid: entry.guid,
                    first_lba: entry.first_lba,
                    last_lba: entry.last_lba,
                    flags: entry.attributes,
                    name: entry.name.clone(),
                },
            );
        }

        let mut file = open_disk(disk, true)?;
        let mbr_lbas = u32::try_from(geometry.total_lbas().saturating_sub(1)).unwrap_or(u32::MAX);
        gpt::mbr::ProtectiveMBR::with_lb_size(mbr_lbas)
            .overwrite_lba0(&mut file)
            .map_err(gpt_err)?;

        let mut gdisk = gpt::GptConfig::new()
            .writable(true)
            .initialized(false)
            .logical_block_size(block_size)
            .create_from_device(Box::new(file), None)
            .map_err(gpt_err)?;
        gdisk.update_partitions(partitions).map_err(gpt_err)?;
        let mut device = gdisk.write().map_err(gpt_err)?;
        device.flush()?;

        log::info!(
            "wrote GPT with {} partitions to {}",
            table.entries.len(),
            disk.display()
        );
        Ok(())
    }

    fn read_raw(&self, disk: &Path, offset: u64, buf: &mut [u8]) -> HalResult<()> {
        let mut file = open_disk(disk, false)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_raw(
        &self,
        disk: &Path,
        offset: u64,
        data: &[u8],
        opts: &WriteOptions,
    ) -> HalResult<()> {
        if opts.dry_run {
            log::info!(
                "DRY RUN: write {} bytes at offset {} of {}",
                data.len(),
                offset,
                disk.display()
            );
            return Ok(());
        }

        if !opts.confirmed {
            return Err(HalError::SafetyLock);
        }

        let mut file = open_disk(disk, true)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }
}

impl MountOps for LinuxHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: MountOptions,
        dry_run: bool,
    ) -> HalResult<()> {
        if dry_run {
            log::info!(
                "DRY RUN: mount {} -> {}",
                device.display(),
                target.display()
            );
            return Ok(());
        }

        nix::mount::mount(
            Some(device),
            target,
            fstype,
            options.flags(),
            options.data.as_deref(),
        )
        .map_err(map_nix_err)?;

        Ok(())
    }

    fn unmount(&self, target: &Path, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("DRY RUN: unmount {}", target.display());
            return Ok(());
        }

        nix::mount::umount2(target, nix::mount::MntFlags::empty()).map_err(map_nix_err)?;

        Ok(())
    }

    fn unmount_recursive(&self, target: &Path, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("DRY RUN: unmount -R {}", target.display());
            return Ok(());
        }

        let content = fs::read_to_string("/proc/self/mountinfo")?;
        let entries = mountinfo::parse_mountinfo(&content);

        for mp in mountinfo::mounts_below(target, &entries) {
            match nix::mount::umount2(&mp, nix::mount::MntFlags::empty()) {
                Ok(()) | Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => {}
                Err(err) => return Err(map_nix_err(err)),
            }
        }

        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        let content = fs::read_to_string("/proc/self/mountinfo")?;
        let entries = mountinfo::parse_mountinfo(&content);
        Ok(mountinfo::is_mounted_from_info(path, &entries))
    }

    fn mounted_partitions(&self, disk: &Path) -> HalResult<Vec<PathBuf>> {
        let content = fs::read_to_string("/proc/self/mountinfo")?;
        let entries = mountinfo::parse_mountinfo(&content);
        Ok(mountinfo::mounted_under_device(&entries, disk))
    }
}

impl LinuxHal {
    fn run_mkfs(
        &self,
        program: &str,
        base_args: &[&str],
        device: &Path,
        label: &str,
        opts: &FormatOptions,
    ) -> HalResult<()> {
        if opts.dry_run {
            log::info!("DRY RUN: {} {} ({})", program, device.display(), label);
            return Ok(());
        }

        if !opts.confirmed {
            return Err(HalError::SafetyLock);
        }

        let mut args: Vec<String> = base_args.iter().map(|s| s.to_string()).collect();
        args.extend(opts.extra_args.iter().cloned());
        args.push(device.display().to_string());

        let mut cmd = Command::new(program);
        cmd.args(&args);
        let output = output_with_timeout(program, &mut cmd, FORMAT_TIMEOUT)?;

        if !output.status.success() {
            return Err(output_failed(program, &output));
        }

        Ok(())
    }
}

impl FormatOps for LinuxHal {
    fn format_vfat(&self, device: &Path, label: &str, opts: &FormatOptions) -> HalResult<()> {
        self.run_mkfs("mkfs.vfat", &["-F", "32", "-n", label], device, label, opts)
    }

    fn format_xfs(&self, device: &Path, label: &str, opts: &FormatOptions) -> HalResult<()> {
        self.run_mkfs("mkfs.xfs", &["-f", "-L", label], device, label, opts)
    }
}

impl CopyOps for LinuxHal {
    fn copy_tree_native(
        &self,
        src: &Path,
        dst: &Path,
        opts: &CopyOptions,
        on_progress: &mut dyn FnMut(CopyProgress) -> bool,
    ) -> HalResult<()> {
        log::debug!("copy tree {} -> {}", src.display(), dst.display());
        copy_tree(src, dst, opts, on_progress)
    }
}

impl SystemOps for LinuxHal {
    fn sync(&self) -> HalResult<()> {
        let mut cmd = Command::new("sync");
        status_with_timeout("sync", &mut cmd, SYNC_TIMEOUT)
    }

    fn reread_partitions(&self, disk: &Path) -> HalResult<()> {
        if !is_block_device(disk)? {
            log::debug!("{} is not a block device; skipping re-read", disk.display());
            return Ok(());
        }
        let mut cmd = Command::new("blockdev");
        cmd.arg("--rereadpt").arg(disk);
        status_with_timeout("blockdev", &mut cmd, REREAD_TIMEOUT)
    }

    fn udev_settle(&self) -> HalResult<()> {
        let mut cmd = Command::new("udevadm");
        cmd.arg("settle");
        status_with_timeout("udevadm", &mut cmd, SYNC_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MIB: u64 = 1024 * 1024;

    fn image(size: u64) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let file = File::create(&path).unwrap();
        file.set_len(size).unwrap();
        (dir, path)
    }

    fn entry(
        number: u32,
        name: &str,
        kind: PartitionType,
        first: u64,
        last: u64,
    ) -> PartitionEntry {
        PartitionEntry {
            number,
            name: name.to_string(),
            partition_type: kind,
            guid: uuid::Uuid::new_v4(),
            first_lba: first,
            last_lba: last,
            attributes: 0,
        }
    }

    #[test]
    fn format_requires_confirmation() {
        let hal = LinuxHal::new();
        let err = hal
            .format_xfs(
                Path::new("/dev/null"),
                "STATE",
                &FormatOptions::new(false, false),
            )
            .unwrap_err();
        assert!(matches!(err, HalError::SafetyLock));
    }

    #[test]
    fn image_geometry_uses_file_length() {
        let (_dir, path) = image(64 * MIB);
        let geo = LinuxHal::new().disk_geometry(&path).unwrap();
        assert_eq!(geo, DiskGeometry::new(64 * MIB, 512));
    }

    #[test]
    fn blank_image_has_no_partition_table() {
        let (_dir, path) = image(16 * MIB);
        assert_eq!(LinuxHal::new().read_partition_table(&path).unwrap(), None);
    }

    #[test]
    fn raw_writes_round_trip_and_need_confirmation() {
        let hal = LinuxHal::new();
        let (_dir, path) = image(MIB);

        let err = hal
            .write_raw(&path, 4096, b"B", &WriteOptions::new(false, false))
            .unwrap_err();
        assert!(matches!(err, HalError::SafetyLock));

        hal.write_raw(&path, 4096, b"B", &WriteOptions::new(false, true))
            .unwrap();
        let mut buf = [0u8; 2];
        hal.read_raw(&path, 4096, &mut buf).unwrap();
        assert_eq!(&buf, b"B\0");
    }

    #[test]
    fn gpt_written_to_image_reads_back() {
        let hal = LinuxHal::new();
        let (_dir, path) = image(64 * MIB);
        let mut bios = entry(2, "BIOS", PartitionType::BiosBoot, 2048 + 20480, 2048 + 20480 + 2047);
        bios.attributes = crate::ATTR_LEGACY_BIOS_BOOTABLE;
        let table = PartitionTable::new(vec![
            entry(1, "EFI", PartitionType::EfiSystem, 2048, 2048 + 20479),
            bios,
        ]);

        hal.write_partition_table(&path, &table, &WriteOptions::new(false, true))
            .unwrap();

        let read = hal.read_partition_table(&path).unwrap().unwrap();
        assert_eq!(read.entries.len(), 2);
        let efi = read.find("EFI").unwrap();
        assert_eq!(efi.partition_type, PartitionType::EfiSystem);
        assert_eq!((efi.first_lba, efi.last_lba), (2048, 2048 + 20479));
        let bios = read.find("BIOS").unwrap();
        assert_eq!(bios.number, 2);
        assert_eq!(bios.partition_type, PartitionType::BiosBoot);
        assert_eq!(bios.attributes, crate::ATTR_LEGACY_BIOS_BOOTABLE);
    }
}
