//! Mounts of the installed system, derived from the manifest or from a disk.

use super::layout::{self, Layout};
use super::manifest::Target;
use super::partitions::{spec_for, PartitionSpec};
use crate::assets::rebase;
use crate::errors::{ExecStep, InstallError, InstallResult};
use keel_hal::{partition_path, BlockOps, MountGuard, MountOps, MountOptions, MsFlags};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub label: &'static str,
    pub device: PathBuf,
    pub target: PathBuf,
    pub fstype: &'static str,
    pub flags: MsFlags,
    pub data: Option<String>,
}

impl MountPoint {
    fn new(spec: &'static PartitionSpec, device: PathBuf) -> Option<Self> {
        let target = spec.mount_path?;
        let fstype = spec.filesystem.fstype()?;
        let flags = match fstype {
            "vfat" => MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            _ => MsFlags::MS_NOATIME,
        };
        Some(Self {
            label: spec.label,
            device,
            target: PathBuf::from(target),
            fstype,
            flags,
            data: None,
        })
    }

    fn options(&self) -> MountOptions {
        let opts = MountOptions::new().with_flags(self.flags);
        match &self.data {
            Some(data) => opts.with_data(data.clone()),
            None => opts,
        }
    }

    fn depth(&self) -> usize {
        self.target.components().count()
    }
}

/// Ordered mount list: a mount nested inside another always comes after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPointSet {
    entries: Vec<MountPoint>,
}

impl MountPointSet {
    fn from_entries(mut entries: Vec<MountPoint>) -> Self {
        entries.sort_by_key(MountPoint::depth);
        Self { entries }
    }

    /// One mount per target with a mountable filesystem. Performs no I/O.
    pub fn from_targets(disk: &Path, targets: &[Target]) -> Self {
        let entries = targets
            .iter()
            .filter_map(|t| MountPoint::new(t.spec, t.device(disk)))
            .collect();
        Self::from_entries(entries)
    }

    /// Rebuild the set from the partition table of an installed disk.
    pub fn for_device<H: BlockOps + ?Sized>(hal: &H, disk: &Path) -> InstallResult<Self> {
        let entries = match layout::detect(hal, disk)? {
            Layout::Current(entries) => entries,
            other => {
                return Err(InstallError::planning(format!(
                    "{} holds a {} layout, not an installed system",
                    disk.display(),
                    other.name()
                )))
            }
        };
        let disk_str = disk.to_string_lossy();
        let mounts = entries
            .iter()
            .filter_map(|e| {
                let spec = spec_for(&e.name)?;
                MountPoint::new(spec, PathBuf::from(partition_path(&disk_str, e.number)))
            })
            .collect();
        Ok(Self::from_entries(mounts))
    }

    pub fn entries(&self) -> &[MountPoint] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, label: &str) -> Option<&MountPoint> {
        self.entries.iter().find(|m| m.label == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MountPoint> {
        self.entries.iter()
    }

    /// Re-root every target under `prefix`.
    pub fn prefix_targets(&mut self, prefix: &Path) {
        for mp in &mut self.entries {
            mp.target = rebase(prefix, &mp.target);
        }
    }

    pub fn with_prefix(mut self, prefix: &Path) -> Self {
        self.prefix_targets(prefix);
        self
    }

    /// Mount every entry in order, creating target directories.
    ///
    /// The returned handle unmounts in reverse order when dropped; on error the
    /// mounts made so far are unwound the same way.
    pub fn mount<'a, H: MountOps + ?Sized>(&self, hal: &'a H) -> InstallResult<MountedSet<'a, H>> {
        let mut mounted = MountedSet {
            guards: Vec::with_capacity(self.entries.len()),
        };
        for mp in &self.entries {
            fs::create_dir_all(&mp.target).map_err(|e| {
                InstallError::device(ExecStep::Assets, mp.label, keel_hal::HalError::Io(e))
            })?;
            hal.mount_device(&mp.device, &mp.target, Some(mp.fstype), mp.options(), false)
                .map_err(|e| InstallError::device(ExecStep::Assets, mp.label, e))?;
            log::debug!("mounted {} at {}", mp.device.display(), mp.target.display());
            mounted.guards.push((mp.label, MountGuard::new(hal, &mp.target, false)));
        }
        Ok(mounted)
    }

    /// Unmount every entry, children first.
    pub fn unmount<H: MountOps + ?Sized>(&self, hal: &H) -> InstallResult<()> {
        for mp in self.entries.iter().rev() {
            if hal
                .is_mounted(&mp.target)
                .map_err(|e| InstallError::device(ExecStep::Assets, mp.label, e))?
            {
                hal.unmount(&mp.target, false)
                    .map_err(|e| InstallError::device(ExecStep::Assets, mp.label, e))?;
            }
        }
        Ok(())
    }
}

/// Live mounts created by [`MountPointSet::mount`].
pub struct MountedSet<'a, H: MountOps + ?Sized> {
    guards: Vec<(&'static str, MountGuard<'a, H>)>,
}

impl<'a, H: MountOps + ?Sized> MountedSet<'a, H> {
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Unmount now, children first, surfacing the first failure.
    pub fn unmount(mut self) -> InstallResult<()> {
        while let Some((label, guard)) = self.guards.pop() {
            guard
                .unmount()
                .map_err(|e| InstallError::device(ExecStep::Assets, label, e))?;
        }
        Ok(())
    }
}

impl<'a, H: MountOps + ?Sized> Drop for MountedSet<'a, H> {
    fn drop(&mut self) {
        while let Some((_, guard)) = self.guards.pop() {
            drop(guard);
        }
    }
}
