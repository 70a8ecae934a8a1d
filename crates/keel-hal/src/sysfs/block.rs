//! Helpers related to block devices in sysfs.

use crate::{HalError, HalResult};
use std::fs;
use std::path::{Path, PathBuf};

pub const SYS_CLASS_BLOCK: &str = "/sys/class/block";

pub fn device_basename(path: &Path) -> HalResult<String> {
    let name = path
        .file_name()
        .ok_or_else(|| {
            HalError::ValidationFailed(format!("invalid device path {}", path.display()))
        })?
        .to_string_lossy()
        .to_string();
    Ok(name)
}

/// sysfs directory for a `/dev` node, e.g. `/sys/class/block/sda`.
pub fn sysfs_dir_for(sys_class_block: &Path, device: &Path) -> HalResult<PathBuf> {
    Ok(sys_class_block.join(device_basename(device)?))
}

fn read_u64(path: &Path) -> HalResult<u64> {
    let raw = fs::read_to_string(path)?;
    raw.trim()
        .parse()
        .map_err(|e| HalError::Parse(format!("{}: {}", path.display(), e)))
}

/// Reads the block device size from `<sysfs dir>/size`.
///
/// The `size` file is expressed in 512-byte sectors.
pub fn block_device_size_bytes(sys_block_dev_dir: &Path) -> HalResult<u64> {
    let sectors = read_u64(&sys_block_dev_dir.join("size"))?;
    Ok(sectors.saturating_mul(512))
}

/// Reads `<sysfs dir>/queue/logical_block_size`.
pub fn logical_block_size(sys_block_dev_dir: &Path) -> HalResult<u64> {
    let size = read_u64(&sys_block_dev_dir.join("queue/logical_block_size"))?;
    if size == 0 || !size.is_power_of_two() {
        return Err(HalError::Parse(format!(
            "bogus logical block size {} for {}",
            size,
            sys_block_dev_dir.display()
        )));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn block_device_size_bytes_reads_sectors() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("size"), "8\n").unwrap();
        assert_eq!(block_device_size_bytes(tmp.path()).unwrap(), 4096);
    }

    #[test]
    fn logical_block_size_reads_queue_attribute() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("queue")).unwrap();
        fs::write(tmp.path().join("queue/logical_block_size"), "4096\n").unwrap();
        assert_eq!(logical_block_size(tmp.path()).unwrap(), 4096);

        fs::write(tmp.path().join("queue/logical_block_size"), "1000\n").unwrap();
        assert!(logical_block_size(tmp.path()).is_err());
    }

    #[test]
    fn device_basename_extracts_filename() {
        assert_eq!(
            device_basename(Path::new("/dev/sda")).unwrap(),
            "sda".to_string()
        );
        assert_eq!(
            sysfs_dir_for(Path::new(SYS_CLASS_BLOCK), Path::new("/dev/nvme0n1")).unwrap(),
            PathBuf::from("/sys/class/block/nvme0n1")
        );
    }
}
