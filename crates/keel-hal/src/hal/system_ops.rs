//! System-level operations (sync, partition re-read, udev settle).

use crate::HalResult;
use std::path::Path;

/// System operations trait.
pub trait SystemOps {
    /// Best-effort filesystem sync.
    fn sync(&self) -> HalResult<()>;

    /// Ask the kernel to re-read the partition table of `disk`.
    fn reread_partitions(&self, disk: &Path) -> HalResult<()>;

    /// Best-effort udev settle (wait for block device events to quiesce).
    fn udev_settle(&self) -> HalResult<()>;
}
