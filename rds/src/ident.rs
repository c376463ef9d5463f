//! Whitelist validation for every value interpolated into a RouterOS
//! command line. Nothing reaches the transport unless it matches one
//! of the accepted shapes, which keeps shell and CLI metacharacters
//! out of the command stream by construction.

use crate::{error::InvalidParameterSnafu, RdsError};
use once_cell::sync::Lazy;
use regex::Regex;
use snafu::ensure;

const UUID: &str =
    "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}";

static VOLUME_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^pvc-{}$", UUID)).unwrap());
static SNAPSHOT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^snap-{}$", UUID)).unwrap());
/// accepted only where test fixtures name volumes directly
static LAX_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Za-z0-9_-]{1,253}$").unwrap());
static PATH_FRAGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Za-z0-9][A-Za-z0-9._/-]{0,252}$").unwrap());
static NQN: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z0-9][A-Za-z0-9.:_-]{0,222}$").unwrap());

/// A deterministic volume id, `pvc-<uuid>`.
pub fn volume_id(id: &str) -> Result<&str, RdsError> {
    ensure!(
        VOLUME_ID.is_match(id),
        InvalidParameterSnafu {
            text: format!("volume id '{}' is not of the form pvc-<uuid>", id),
        }
    );
    Ok(id)
}

/// A deterministic snapshot id, `snap-<uuid>`.
pub fn snapshot_id(id: &str) -> Result<&str, RdsError> {
    ensure!(
        SNAPSHOT_ID.is_match(id),
        InvalidParameterSnafu {
            text: format!("snapshot id '{}' is not of the form snap-<uuid>", id),
        }
    );
    Ok(id)
}

/// Either a strict volume/snapshot id or the relaxed shape accepted at
/// test boundaries.
pub fn lax_id(id: &str) -> Result<&str, RdsError> {
    ensure!(
        LAX_ID.is_match(id),
        InvalidParameterSnafu {
            text: format!("identifier '{}' contains forbidden characters", id),
        }
    );
    Ok(id)
}

/// A path fragment on the appliance: no leading separator, no parent
/// traversal, conservative character set.
pub fn path_fragment(path: &str) -> Result<&str, RdsError> {
    ensure!(
        PATH_FRAGMENT.is_match(path) && !path.contains(".."),
        InvalidParameterSnafu {
            text: format!("path '{}' is not a safe appliance path", path),
        }
    );
    Ok(path)
}

/// An NVMe qualified name.
pub fn nqn(value: &str) -> Result<&str, RdsError> {
    ensure!(
        NQN.is_match(value),
        InvalidParameterSnafu {
            text: format!("'{}' is not a valid nqn", value),
        }
    );
    Ok(value)
}

/// A byte count. Zero is never a valid size for any command we issue.
pub fn size_bytes(bytes: u64) -> Result<u64, RdsError> {
    ensure!(
        bytes > 0,
        InvalidParameterSnafu {
            text: "size must be greater than zero".to_string(),
        }
    );
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOL: &str = "pvc-5bcf13d7-9c36-5a2c-9d5e-cafe00112233";
    const SNAP: &str = "snap-0f5a1b2c-3d4e-5f60-7182-93a4b5c6d7e8";

    #[test]
    fn strict_ids_accepted() {
        assert!(volume_id(VOL).is_ok());
        assert!(snapshot_id(SNAP).is_ok());
    }

    #[test]
    fn wrong_prefix_rejected() {
        assert!(volume_id(SNAP).is_err());
        assert!(snapshot_id(VOL).is_err());
    }

    #[test]
    fn injection_attempts_rejected() {
        for evil in [
            "pvc-1234; /system reset-configuration",
            "pvc-`reboot`",
            "pvc-$(id)",
            "pvc-1234\n/disk remove 0",
            "pvc-1234 slot=other",
            "pvc-1234\"",
        ]
        .iter()
        {
            assert!(volume_id(evil).is_err(), "accepted {:?}", evil);
            assert!(lax_id(evil).is_err(), "lax accepted {:?}", evil);
        }
    }

    #[test]
    fn lax_accepts_plain_names() {
        assert!(lax_id("test-volume_1").is_ok());
        assert!(lax_id("").is_err());
        assert!(lax_id(&"x".repeat(254)).is_err());
    }

    #[test]
    fn paths_must_be_relative_and_clean() {
        assert!(path_fragment("rds1/volumes/pvc-1.img").is_ok());
        assert!(path_fragment("/etc/passwd").is_err());
        assert!(path_fragment("a/../../flash").is_err());
        assert!(path_fragment("a b").is_err());
    }

    #[test]
    fn sizes() {
        assert!(size_bytes(1).is_ok());
        assert!(size_bytes(0).is_err());
    }
}
