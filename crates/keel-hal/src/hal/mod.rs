//! HAL trait definitions and implementations.
//!
//! This module defines the core traits for system operations and provides
//! both real (LinuxHal) and fake (FakeHal) implementations.

pub mod block_ops;
pub mod copy_ops;
pub mod fake_hal;
pub mod format_ops;
pub mod guards;
pub mod linux_hal;
pub mod mount_ops;
pub mod system_ops;

pub use block_ops::{
    BlockOps, DiskGeometry, PartitionEntry, PartitionTable, PartitionType, WriteOptions,
    ATTR_LEGACY_BIOS_BOOTABLE,
};
pub use copy_ops::{copy_tree, tree_size, CopyOps, CopyOptions, CopyProgress};
pub use fake_hal::{FakeFailure, FakeHal, Operation};
pub use format_ops::{FormatOps, FormatOptions};
pub use guards::MountGuard;
pub use linux_hal::LinuxHal;
pub use mount_ops::{MountOps, MountOptions, MsFlags};
pub use system_ops::SystemOps;

/// Complete HAL combining all system operation traits.
pub trait SystemHal: BlockOps + FormatOps + MountOps + CopyOps + SystemOps + Send + Sync {}

/// Automatically implement SystemHal for any type implementing all required traits.
impl<T> SystemHal for T where
    T: BlockOps + FormatOps + MountOps + CopyOps + SystemOps + Send + Sync
{
}
