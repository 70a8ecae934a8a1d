//! Raw block device and GPT partition table operations.

use crate::HalResult;
use std::fmt;
use std::path::Path;

/// GPT attribute bit 2: legacy BIOS bootable.
pub const ATTR_LEGACY_BIOS_BOOTABLE: u64 = 1 << 2;

/// A GPT partition entry array holds 128 entries of 128 bytes.
const GPT_ENTRY_ARRAY_BYTES: u64 = 128 * 128;

/// Size and sector size of a disk, plus the GPT reserved regions derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub size_bytes: u64,
    pub logical_block_size: u64,
}

impl DiskGeometry {
    pub fn new(size_bytes: u64, logical_block_size: u64) -> Self {
        Self {
            size_bytes,
            logical_block_size,
        }
    }

    pub fn total_lbas(&self) -> u64 {
        self.size_bytes / self.logical_block_size
    }

    fn entry_array_lbas(&self) -> u64 {
        GPT_ENTRY_ARRAY_BYTES.div_ceil(self.logical_block_size)
    }

    /// Protective MBR, primary header and the primary entry array come first.
    pub fn first_usable_lba(&self) -> u64 {
        2 + self.entry_array_lbas()
    }

    /// Backup entry array and backup header occupy the tail of the disk.
    pub fn last_usable_lba(&self) -> u64 {
        self.total_lbas()
            .saturating_sub(2 + self.entry_array_lbas())
    }

    /// LBAs outside the usable range (67 on a 512-byte sector disk).
    pub fn reserved_lbas(&self) -> u64 {
        self.first_usable_lba() + self.entry_array_lbas() + 1
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_lbas() * self.logical_block_size
    }

    /// Byte range `(offset, len)` of the protective MBR, primary header and entries.
    pub fn primary_gpt_region(&self) -> (u64, u64) {
        (0, self.first_usable_lba() * self.logical_block_size)
    }

    /// Byte range `(offset, len)` of the backup entries and backup header.
    pub fn backup_gpt_region(&self) -> (u64, u64) {
        let offset = (self.last_usable_lba() + 1) * self.logical_block_size;
        (offset, self.size_bytes.saturating_sub(offset))
    }
}

/// Partition type GUIDs the provisioner knows how to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionType {
    EfiSystem,
    BiosBoot,
    LinuxFilesystem,
    /// Any other type, carried as its upper-case GUID string.
    Other(String),
}

impl PartitionType {
    pub fn guid(&self) -> &str {
        match self {
            PartitionType::EfiSystem => "C12A7328-F81F-11D2-BA4B-00A0C93EC93B",
            PartitionType::BiosBoot => "21686148-6449-6E6F-744E-656564454649",
            PartitionType::LinuxFilesystem => "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
            PartitionType::Other(guid) => guid,
        }
    }

    pub fn from_guid(guid: &str) -> Self {
        let upper = guid.to_ascii_uppercase();
        for known in [
            PartitionType::EfiSystem,
            PartitionType::BiosBoot,
            PartitionType::LinuxFilesystem,
        ] {
            if known.guid() == upper {
                return known;
            }
        }
        PartitionType::Other(upper)
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.guid())
    }
}

/// One used slot of a GPT partition entry array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub number: u32,
    pub name: String,
    pub partition_type: PartitionType,
    pub guid: uuid::Uuid,
    pub first_lba: u64,
    /// Inclusive.
    pub last_lba: u64,
    pub attributes: u64,
}

impl PartitionEntry {
    pub fn length_lbas(&self) -> u64 {
        self.last_lba + 1 - self.first_lba
    }

    pub fn offset_bytes(&self, logical_block_size: u64) -> u64 {
        self.first_lba * logical_block_size
    }

    pub fn size_bytes(&self, logical_block_size: u64) -> u64 {
        self.length_lbas() * logical_block_size
    }
}

/// The used entries of a GPT, ordered by partition number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionTable {
    pub entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    pub fn new(mut entries: Vec<PartitionEntry>) -> Self {
        entries.sort_by_key(|e| e.number);
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&PartitionEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// Options for writes to the raw device.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// If true, log the operation but don't execute it
    pub dry_run: bool,
    /// If true, the user has confirmed the destructive operation
    pub confirmed: bool,
}

impl WriteOptions {
    pub fn new(dry_run: bool, confirmed: bool) -> Self {
        Self { dry_run, confirmed }
    }
}

/// Trait for raw disk access and partition table management.
pub trait BlockOps {
    /// Size in bytes and logical block size of `disk`.
    fn disk_geometry(&self, disk: &Path) -> HalResult<DiskGeometry>;

    /// Read the GPT of `disk`. Returns `None` when the disk carries no GPT signature.
    fn read_partition_table(&self, disk: &Path) -> HalResult<Option<PartitionTable>>;

    /// Replace the GPT of `disk` (protective MBR, primary and backup headers) with `table`.
    ///
    /// Entries are written with their exact LBA boundaries; no alignment is applied.
    fn write_partition_table(
        &self,
        disk: &Path,
        table: &PartitionTable,
        opts: &WriteOptions,
    ) -> HalResult<()>;

    /// Fill `buf` from `disk` starting at byte `offset`.
    fn read_raw(&self, disk: &Path, offset: u64, buf: &mut [u8]) -> HalResult<()>;

    /// Write `data` to `disk` at byte `offset`.
    fn write_raw(&self, disk: &Path, offset: u64, data: &[u8], opts: &WriteOptions)
        -> HalResult<()>;
}
