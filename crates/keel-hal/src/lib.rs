//! keel hardware abstraction layer (HAL).
//!
//! Traits for the block-device, formatting, mount and copy primitives the
//! provisioner drives, with a Linux backend and an in-memory fake for tests.

pub mod error;
pub mod hal;
pub mod path;
pub mod procfs;
pub mod sysfs;

pub use error::{HalError, HalResult};
pub use hal::*;
pub use path::partition_path;
