//! The partition catalogue every installed disk follows.
//!
//! Order matters: a partition's position in [`PARTITION_SPECS`] is its GPT
//! partition number minus one.

use keel_hal::{PartitionType, ATTR_LEGACY_BIOS_BOOTABLE};

pub const MIB: u64 = 1024 * 1024;

pub const EFI_LABEL: &str = "EFI";
pub const BIOS_LABEL: &str = "BIOS";
pub const BOOT_LABEL: &str = "BOOT";
pub const META_LABEL: &str = "META";
pub const STATE_LABEL: &str = "STATE";
pub const EPHEMERAL_LABEL: &str = "EPHEMERAL";

/// Name of the boot partition in the two-partition legacy layout.
pub const LEGACY_BOOT_LABEL: &str = "ESP";

/// Machine configuration, relative to the State mount (and to the legacy boot root).
pub const CONFIG_FILE: &str = "config.yaml";

/// Files placed in each boot slot directory.
pub const KERNEL_ASSET: &str = "vmlinuz";
pub const INITRAMFS_ASSET: &str = "initramfs.xz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Vfat,
    Xfs,
    Raw,
}

impl FilesystemKind {
    /// Kernel filesystem type name, `None` for raw partitions.
    pub fn fstype(&self) -> Option<&'static str> {
        match self {
            FilesystemKind::Vfat => Some("vfat"),
            FilesystemKind::Xfs => Some("xfs"),
            FilesystemKind::Raw => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    Efi,
    BiosBoot,
    LinuxFs,
}

impl TypeClass {
    pub fn partition_type(&self) -> PartitionType {
        match self {
            TypeClass::Efi => PartitionType::EfiSystem,
            TypeClass::BiosBoot => PartitionType::BiosBoot,
            TypeClass::LinuxFs => PartitionType::LinuxFilesystem,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSize {
    Fixed(u64),
    /// Whatever the fixed partitions and GPT leave over.
    Remainder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSpec {
    pub label: &'static str,
    pub type_class: TypeClass,
    pub size: PartitionSize,
    pub filesystem: FilesystemKind,
    pub mount_path: Option<&'static str>,
    pub attributes: u64,
}

impl PartitionSpec {
    /// GPT partition number (1-based position in the catalogue).
    pub fn number(&self) -> u32 {
        PARTITION_SPECS
            .iter()
            .position(|s| s.label == self.label)
            .map(|idx| idx as u32 + 1)
            .unwrap_or(0)
    }

    pub fn is_mountable(&self) -> bool {
        self.filesystem != FilesystemKind::Raw && self.mount_path.is_some()
    }
}

pub static PARTITION_SPECS: [PartitionSpec; 6] = [
    PartitionSpec {
        label: EFI_LABEL,
        type_class: TypeClass::Efi,
        size: PartitionSize::Fixed(100 * MIB),
        filesystem: FilesystemKind::Vfat,
        mount_path: Some("/boot/EFI"),
        attributes: 0,
    },
    PartitionSpec {
        label: BIOS_LABEL,
        type_class: TypeClass::BiosBoot,
        size: PartitionSize::Fixed(MIB),
        filesystem: FilesystemKind::Raw,
        mount_path: None,
        attributes: ATTR_LEGACY_BIOS_BOOTABLE,
    },
    PartitionSpec {
        label: BOOT_LABEL,
        type_class: TypeClass::LinuxFs,
        size: PartitionSize::Fixed(300 * MIB),
        filesystem: FilesystemKind::Vfat,
        mount_path: Some("/boot"),
        attributes: 0,
    },
    PartitionSpec {
        label: META_LABEL,
        type_class: TypeClass::LinuxFs,
        size: PartitionSize::Fixed(MIB),
        filesystem: FilesystemKind::Raw,
        mount_path: None,
        attributes: 0,
    },
    PartitionSpec {
        label: STATE_LABEL,
        type_class: TypeClass::LinuxFs,
        size: PartitionSize::Fixed(100 * MIB),
        filesystem: FilesystemKind::Xfs,
        mount_path: Some("/system/state"),
        attributes: 0,
    },
    PartitionSpec {
        label: EPHEMERAL_LABEL,
        type_class: TypeClass::LinuxFs,
        size: PartitionSize::Remainder,
        filesystem: FilesystemKind::Xfs,
        mount_path: Some("/var"),
        attributes: 0,
    },
];

pub fn spec_for(label: &str) -> Option<&'static PartitionSpec> {
    PARTITION_SPECS.iter().find(|s| s.label == label)
}

/// Sum of every fixed-size partition in the catalogue.
pub fn fixed_bytes() -> u64 {
    PARTITION_SPECS
        .iter()
        .map(|s| match s.size {
            PartitionSize::Fixed(bytes) => bytes,
            PartitionSize::Remainder => 0,
        })
        .sum()
}
