//! nvmeadm deals with NVMe over TCP sessions on the initiator side:
//! opening a fabric connection for a subsystem NQN, locating the block
//! device a live session exposes, and tearing the session down again.
//!
//! All state lives in the kernel; this crate only reads sysfs and
//! writes the fabrics control files, so every operation is naturally
//! idempotent when retried.

pub mod error;
pub mod fabric;
pub mod subsystem;

pub use error::NvmeError;

use std::{fs, io::ErrorKind, path::Path, str::FromStr};

/// control file for opening new fabric connections
pub(crate) const NVME_FABRICS_PATH: &str = "/dev/nvme-fabrics";
/// sysfs directory holding one entry per fabric-attached controller
pub(crate) const SYSFS_FABRICS_CTL: &str =
    "/sys/devices/virtual/nvme-fabrics/ctl";
/// source of the stable host id used when identifying to a target
pub(crate) const MACHINE_UUID_PATH: &str = "/sys/class/dmi/id/product_uuid";

/// Read and parse a single-value sysfs attribute.
pub(crate) fn parse_value<T>(dir: &Path, file: &str) -> Result<T, std::io::Error>
where
    T: FromStr,
{
    let path = dir.join(file);
    let s = fs::read_to_string(&path)?;
    let s = s.trim();

    s.parse().map_err(|_| {
        std::io::Error::new(
            ErrorKind::InvalidData,
            format!("failed to parse {}: {}", path.display(), s),
        )
    })
}
