//! Disk provisioning: detect, plan, execute.

pub mod executor;
pub mod layout;
pub mod manifest;
pub mod meta;
pub mod mountpoints;
pub mod partitions;
pub mod plan;

pub use executor::ExecutionReport;
pub use layout::{detect, Layout, LegacyLayout};
pub use manifest::{Manifest, Sequence, Target, TargetAction};
pub use meta::{BootSlotRecord, BootSlots, SlotLabel};
pub use mountpoints::{MountPoint, MountPointSet, MountedSet};
pub use partitions::{PartitionSpec, PARTITION_SPECS};
pub use plan::{plan, DiskState};
