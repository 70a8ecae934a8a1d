use crate::MountOps;
use std::path::{Path, PathBuf};

/// RAII guard that unmounts a target path when dropped.
#[derive(Debug)]
pub struct MountGuard<'a, H: MountOps + ?Sized> {
    hal: &'a H,
    target: PathBuf,
    dry_run: bool,
    active: bool,
}

impl<'a, H: MountOps + ?Sized> MountGuard<'a, H> {
    pub fn new(hal: &'a H, target: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            hal,
            target: target.into(),
            dry_run,
            active: true,
        }
    }

    /// Unmount now and surface the error instead of logging it on drop.
    ///
    /// On failure the guard stays armed and tries once more when dropped.
    pub fn unmount(mut self) -> crate::HalResult<()> {
        self.hal.unmount_recursive(&self.target, self.dry_run)?;
        self.active = false;
        Ok(())
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl<'a, H: MountOps + ?Sized> Drop for MountGuard<'a, H> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.hal.unmount_recursive(&self.target, self.dry_run) {
            log::warn!(
                "mount guard failed to unmount {}: {}",
                self.target.display(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BlockOps, DiskGeometry, FakeFailure, FakeHal, FormatOps, FormatOptions, MountOptions,
        PartitionEntry, PartitionTable, PartitionType, WriteOptions,
    };
    use std::fs;
    use tempfile::tempdir;

    fn hal_with_formatted_partition() -> FakeHal {
        let hal = FakeHal::new();
        hal.add_disk("/dev/vda", DiskGeometry::new(64 * 1024 * 1024, 512));
        let table = PartitionTable::new(vec![PartitionEntry {
            number: 1,
            name: "DATA".to_string(),
            partition_type: PartitionType::LinuxFilesystem,
            guid: uuid::Uuid::new_v4(),
            first_lba: 2048,
            last_lba: 4095,
            attributes: 0,
        }]);
        hal.write_partition_table(Path::new("/dev/vda"), &table, &WriteOptions::new(false, true))
            .unwrap();
        hal.format_xfs(Path::new("/dev/vda1"), "DATA", &FormatOptions::new(false, true))
            .unwrap();
        hal
    }

    #[test]
    fn mount_guard_unmounts_on_drop() {
        let hal = hal_with_formatted_partition();
        let mnt = tempdir().unwrap();

        hal.mount_device(
            Path::new("/dev/vda1"),
            mnt.path(),
            Some("xfs"),
            MountOptions::new(),
            false,
        )
        .unwrap();
        assert!(hal.is_mounted(mnt.path()).unwrap());

        {
            let _guard = MountGuard::new(&hal, mnt.path(), false);
        }

        assert!(!hal.is_mounted(mnt.path()).unwrap());
    }

    #[test]
    fn explicit_unmount_reports_result() {
        let hal = hal_with_formatted_partition();
        let mnt = tempdir().unwrap();

        hal.mount_device(Path::new("/dev/vda1"), mnt.path(), None, MountOptions::new(), false)
            .unwrap();
        let guard = MountGuard::new(&hal, mnt.path(), false);
        guard.unmount().unwrap();
        assert!(!hal.is_mounted(mnt.path()).unwrap());
    }

    #[test]
    fn failed_explicit_unmount_retries_on_drop() {
        let hal = hal_with_formatted_partition();
        let mnt = tempdir().unwrap();

        hal.mount_device(Path::new("/dev/vda1"), mnt.path(), None, MountOptions::new(), false)
            .unwrap();
        fs::write(mnt.path().join("kept"), b"data").unwrap();
        hal.fail_on(FakeFailure::Unmount {
            device: PathBuf::from("/dev/vda1"),
        });

        let guard = MountGuard::new(&hal, mnt.path(), false);
        assert!(guard.unmount().is_err());
        assert!(!hal.is_mounted(mnt.path()).unwrap());

        hal.mount_device(Path::new("/dev/vda1"), mnt.path(), None, MountOptions::new(), false)
            .unwrap();
        assert_eq!(fs::read(mnt.path().join("kept")).unwrap(), b"data");
        MountGuard::new(&hal, mnt.path(), false).unmount().unwrap();
    }
}
