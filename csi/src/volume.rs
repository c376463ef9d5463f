//! Core volume model: deterministic ids, access types and modes,
//! capabilities and the publish context exchanged between the
//! controller and node planes.

use crate::error::Error;
use std::{collections::HashMap, fmt};
use uuid::Uuid;

/// Fixed namespace for volume id derivation. Stable forever: changing
/// it would re-key every volume name in existing clusters.
pub const VOLUME_NAMESPACE: Uuid =
    Uuid::from_u128(0x9aa2_89e8_31f5_42c8_b0ac_6f4a_7e3d_5c11);
/// Fixed namespace for snapshot id derivation.
pub const SNAPSHOT_NAMESPACE: Uuid =
    Uuid::from_u128(0x1b7d_0c44_55a9_4f02_9d3e_8cb1_2af6_ee90);

/// publish context keys handed from controller to node
pub const CTX_NQN: &str = "nqn";
pub const CTX_ADDR: &str = "nvme-tcp-addr";
pub const CTX_PORT: &str = "nvme-tcp-port";
pub const CTX_VOLUME_MODE: &str = "volume-mode";
pub const CTX_FS_TYPE: &str = "fs-type";

/// StorageClass / request parameter keys surfaced by the sidecars
pub const PARAM_PVC_NAME: &str = "csi.storage.k8s.io/pvc/name";
pub const PARAM_PVC_NAMESPACE: &str = "csi.storage.k8s.io/pvc/namespace";
pub const PARAM_MIGRATION_TIMEOUT: &str = "migrationTimeoutSeconds";

const MIB: u64 = 1024 * 1024;

/// Derive the stable volume id for a volume name.
pub fn volume_id_for(name: &str) -> String {
    format!("pvc-{}", Uuid::new_v5(&VOLUME_NAMESPACE, name.as_bytes()))
}

/// Derive the stable snapshot id for a snapshot name.
pub fn snapshot_id_for(name: &str) -> String {
    format!("snap-{}", Uuid::new_v5(&SNAPSHOT_NAMESPACE, name.as_bytes()))
}

/// Round a byte count up to the next 1 MiB boundary.
pub fn round_up_mib(bytes: u64) -> u64 {
    bytes.div_ceil(MIB) * MIB
}

/// Filesystems the node plane knows how to format, check and grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Ext4,
    Xfs,
}

impl FsType {
    pub fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "" | "ext4" => Ok(FsType::Ext4),
            "xfs" => Ok(FsType::Xfs),
            other => Err(Error::InvalidParameter {
                text: format!("unsupported filesystem type: {}", other),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a volume is consumed on the node. The discriminant drives every
/// node-side branch: filesystem staging is a mounted directory, block
/// staging is a no-op and the publish target is a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Filesystem(FsType),
    Block,
}

impl AccessType {
    pub fn mode_str(&self) -> &'static str {
        match self {
            AccessType::Filesystem(_) => "filesystem",
            AccessType::Block => "block",
        }
    }
}

/// Who may write, and from how many nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    SingleWriter,
    ReaderOnly,
    MultiWriter,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::SingleWriter => "single-writer",
            AccessMode::ReaderOnly => "reader-only",
            AccessMode::MultiWriter => "multi-writer",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested capability: an access type plus an access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_type: AccessType,
    pub access_mode: AccessMode,
}

impl VolumeCapability {
    /// Admission rules shared by CreateVolume and
    /// ValidateVolumeCapabilities.
    pub fn validate(&self) -> Result<(), Error> {
        match (self.access_type, self.access_mode) {
            (AccessType::Filesystem(_), AccessMode::MultiWriter) => {
                Err(Error::InvalidParameter {
                    text: "multi-writer filesystem volumes are unsafe without \
                           a cluster filesystem; use Block mode for live \
                           migration"
                        .to_string(),
                })
            }
            (AccessType::Block, AccessMode::ReaderOnly) => {
                Err(Error::InvalidParameter {
                    text: "read-only block attachment is not supported"
                        .to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// PVC coordinates, used to address events at the object users watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvcCoords {
    pub name: String,
    pub namespace: String,
}

impl PvcCoords {
    pub fn from_parameters(params: &HashMap<String, String>) -> Option<Self> {
        match (params.get(PARAM_PVC_NAME), params.get(PARAM_PVC_NAMESPACE)) {
            (Some(name), Some(namespace)) => Some(PvcCoords {
                name: name.clone(),
                namespace: namespace.clone(),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for PvcCoords {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A provisioned volume as reported to callers.
#[derive(Debug, Clone)]
pub struct Volume {
    pub id: String,
    pub capacity: u64,
    pub access_type: AccessType,
    /// carried into every publish context for this volume
    pub context: HashMap<String, String>,
    pub content_source: Option<String>,
}

impl Volume {
    pub fn new(
        id: String,
        capacity: u64,
        access_type: AccessType,
        nqn: String,
        addr: String,
        port: u16,
        content_source: Option<String>,
    ) -> Self {
        let mut context = HashMap::new();
        context.insert(CTX_NQN.to_string(), nqn);
        context.insert(CTX_ADDR.to_string(), addr);
        context.insert(CTX_PORT.to_string(), port.to_string());
        context
            .insert(CTX_VOLUME_MODE.to_string(), access_type.mode_str().into());
        if let AccessType::Filesystem(fstype) = access_type {
            context.insert(CTX_FS_TYPE.to_string(), fstype.to_string());
        }
        Self {
            id,
            capacity,
            access_type,
            context,
            content_source,
        }
    }
}

/// A snapshot as reported to callers. The appliance does not persist
/// creation timestamps, so `created` is only known for snapshots taken
/// by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub source_volume_id: String,
    pub size: u64,
    pub created: Option<chrono::DateTime<chrono::Utc>>,
    pub ready_to_use: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_ids_are_deterministic() {
        let a = volume_id_for("my-pvc");
        let b = volume_id_for("my-pvc");
        assert_eq!(a, b);
        assert!(a.starts_with("pvc-"));
        assert_eq!(
            a,
            format!(
                "pvc-{}",
                Uuid::new_v5(&VOLUME_NAMESPACE, b"my-pvc")
            )
        );
        assert_ne!(a, volume_id_for("my-pvc2"));
    }

    #[test]
    fn snapshot_ids_use_their_own_namespace() {
        assert_ne!(
            volume_id_for("x").trim_start_matches("pvc-").to_string(),
            snapshot_id_for("x").trim_start_matches("snap-").to_string()
        );
    }

    #[test]
    fn rounding_to_mib() {
        assert_eq!(round_up_mib(1), MIB);
        assert_eq!(round_up_mib(MIB), MIB);
        assert_eq!(round_up_mib(MIB + 1), 2 * MIB);
        assert_eq!(round_up_mib(5 * MIB - 7), 5 * MIB);
    }

    #[test]
    fn filesystem_multi_writer_rejected() {
        let capability = VolumeCapability {
            access_type: AccessType::Filesystem(FsType::Ext4),
            access_mode: AccessMode::MultiWriter,
        };
        assert!(capability.validate().is_err());

        let capability = VolumeCapability {
            access_type: AccessType::Block,
            access_mode: AccessMode::MultiWriter,
        };
        assert!(capability.validate().is_ok());
    }

    #[test]
    fn block_reader_only_rejected() {
        let capability = VolumeCapability {
            access_type: AccessType::Block,
            access_mode: AccessMode::ReaderOnly,
        };
        assert!(capability.validate().is_err());
    }

    #[test]
    fn publish_context_keys() {
        let volume = Volume::new(
            volume_id_for("v"),
            MIB,
            AccessType::Filesystem(FsType::Xfs),
            "nqn.2014-08.com.mikrotik:pvc-x".to_string(),
            "10.0.0.2".to_string(),
            4420,
            None,
        );
        assert_eq!(volume.context.get(CTX_VOLUME_MODE).unwrap(), "filesystem");
        assert_eq!(volume.context.get(CTX_FS_TYPE).unwrap(), "xfs");
        assert_eq!(volume.context.get(CTX_PORT).unwrap(), "4420");

        let block = Volume::new(
            volume_id_for("b"),
            MIB,
            AccessType::Block,
            "nqn".to_string(),
            "10.0.0.2".to_string(),
            4420,
            None,
        );
        assert_eq!(block.context.get(CTX_VOLUME_MODE).unwrap(), "block");
        assert!(block.context.get(CTX_FS_TYPE).is_none());
    }
}
