//! Filesystem formatting operations trait.

use crate::HalResult;
use std::path::Path;

/// Trait for formatting partitions.
pub trait FormatOps {
    /// Format a device with VFAT (FAT32), used for the EFI and boot partitions.
    ///
    /// # Arguments
    /// * `device` - Block device path (e.g., `/dev/sda1`)
    /// * `label` - Filesystem label
    /// * `opts` - Formatting options including dry-run and confirmation
    fn format_vfat(&self, device: &Path, label: &str, opts: &FormatOptions) -> HalResult<()>;

    /// Format a device with XFS, used for the state and ephemeral partitions.
    fn format_xfs(&self, device: &Path, label: &str, opts: &FormatOptions) -> HalResult<()>;
}

/// Options for formatting operations.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// If true, log the operation but don't execute it
    pub dry_run: bool,
    /// If true, the user has confirmed the destructive operation
    pub confirmed: bool,
    /// Additional arguments to pass to the format command
    pub extra_args: Vec<String>,
}

impl FormatOptions {
    pub fn new(dry_run: bool, confirmed: bool) -> Self {
        Self {
            dry_run,
            confirmed,
            extra_args: Vec::new(),
        }
    }
}
