//! Mount operations trait.

use crate::HalResult;
use std::path::{Path, PathBuf};

pub use nix::mount::MsFlags;

/// Trait for mounting and unmounting filesystems.
pub trait MountOps {
    /// Mount a device to a target path.
    ///
    /// # Arguments
    /// * `device` - Device path (e.g., `/dev/sda1`)
    /// * `target` - Mount point path, which must already exist
    /// * `fstype` - Optional filesystem type (e.g., `"xfs"`, `"vfat"`)
    /// * `options` - Mount flags and data
    /// * `dry_run` - If true, log the operation but don't execute it
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: MountOptions,
        dry_run: bool,
    ) -> HalResult<()>;

    /// Unmount a filesystem.
    fn unmount(&self, target: &Path, dry_run: bool) -> HalResult<()>;

    /// Unmount `target` and everything mounted below it, deepest first.
    fn unmount_recursive(&self, target: &Path, dry_run: bool) -> HalResult<()>;

    /// Check if a path is currently mounted.
    fn is_mounted(&self, path: &Path) -> HalResult<bool>;

    /// Mount points currently backed by partitions of `disk`.
    fn mounted_partitions(&self, disk: &Path) -> HalResult<Vec<PathBuf>>;
}

/// Mount flags and filesystem-specific data.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub flags: Option<MsFlags>,
    /// Filesystem data string (e.g., "uid=0,umask=077")
    pub data: Option<String>,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags(mut self, flags: MsFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn flags(&self) -> MsFlags {
        self.flags.unwrap_or_else(MsFlags::empty)
    }
}
