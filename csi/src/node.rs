//! Node-plane service: stage/unstage, publish/unpublish, stats and
//! online expansion. The block-vs-filesystem decision is made at the
//! top of every operation from the typed access discriminant; the two
//! modes share no staging logic.

use crate::{
    block_vol,
    config::Config,
    dev::{self, DetachOutcome, NvmeTarget},
    error::Error,
    filesystem_vol,
    format,
    metrics,
    mount,
    volume::{AccessType, FsType, CTX_FS_TYPE, CTX_VOLUME_MODE},
};
use parking_lot::Mutex;
use rds::CircuitBreaker;
use std::{
    collections::HashMap,
    path::{Component, Path},
    sync::Arc,
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct NodeStageRequest {
    pub volume_id: String,
    pub staging_path: String,
    /// merged volume and publish context
    pub context: HashMap<String, String>,
    pub mount_flags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NodePublishRequest {
    pub volume_id: String,
    pub staging_path: String,
    pub target_path: String,
    pub context: HashMap<String, String>,
    pub readonly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
    ExpandVolume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    pub max_volumes_per_node: u32,
    /// accessible topology segment for this host
    pub topology: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStats {
    Filesystem {
        total: u64,
        available: u64,
        used: u64,
    },
    Block {
        total: u64,
    },
}

/// What the node remembers about a staged volume. Lost on restart;
/// unstage falls back to the mount table and sysfs in that case.
#[derive(Debug, Clone)]
struct StagedVolume {
    target: NvmeTarget,
    access_type: AccessType,
}

pub struct NodeService {
    config: Config,
    /// per-volume serialization of stage/unstage/publish/unpublish
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// per-volume breakers against retry storms on wedged devices
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    staged: Mutex<HashMap<String, StagedVolume>>,
}

impl NodeService {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            locks: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            staged: Mutex::new(HashMap::new()),
        }
    }

    pub fn capabilities(&self) -> Vec<NodeCapability> {
        vec![
            NodeCapability::StageUnstageVolume,
            NodeCapability::GetVolumeStats,
            NodeCapability::ExpandVolume,
        ]
    }

    pub fn node_get_info(&self) -> NodeInfo {
        let mut topology = HashMap::new();
        topology.insert(
            format!("{}/node", self.config.driver.name),
            self.config.driver.node_id.clone(),
        );
        NodeInfo {
            node_id: self.config.driver.node_id.clone(),
            max_volumes_per_node: self.config.node.max_sessions,
            topology,
        }
    }

    fn volume_lock(&self, volume_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(volume_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn breaker(&self, volume_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(volume_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    volume_id,
                    self.config.node.breaker_threshold,
                    Duration::from_secs(self.config.node.breaker_window_secs),
                    Duration::from_secs(
                        self.config.node.breaker_cooldown_secs,
                    ),
                ))
            })
            .clone()
    }

    fn breaker_gate(&self, volume_id: &str) -> Result<Arc<CircuitBreaker>, Error> {
        let breaker = self.breaker(volume_id);
        if !breaker.allow() {
            metrics::NODE_VOLUME_BREAKER
                .with_label_values(&[volume_id])
                .set(breaker.state().as_gauge());
            return Err(Error::Unavailable {
                text: format!(
                    "volume {} is failing repeatedly on this node, backing \
                     off",
                    volume_id
                ),
            });
        }
        Ok(breaker)
    }

    fn breaker_record(
        &self,
        volume_id: &str,
        breaker: &CircuitBreaker,
        ok: bool,
    ) {
        if ok {
            breaker.on_success();
        } else {
            breaker.on_failure();
        }
        metrics::NODE_VOLUME_BREAKER
            .with_label_values(&[volume_id])
            .set(breaker.state().as_gauge());
    }

    fn validate_path(&self, path: &str) -> Result<(), Error> {
        let prefix = Path::new(&self.config.driver.plugin_prefix);
        let path = Path::new(path);
        if !path.is_absolute() {
            return Err(Error::InvalidParameter {
                text: format!("path {} is not absolute", path.display()),
            });
        }
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(Error::InvalidParameter {
                text: format!(
                    "path {} contains parent traversal",
                    path.display()
                ),
            });
        }
        if !path.starts_with(prefix) {
            return Err(Error::InvalidParameter {
                text: format!(
                    "path {} is outside the kubelet plugin directory",
                    path.display()
                ),
            });
        }
        Ok(())
    }

    fn validate_volume_id(volume_id: &str) -> Result<(), Error> {
        rds::ident::lax_id(volume_id)
            .map(|_| ())
            .map_err(Error::from)
    }

    fn access_type_of(
        context: &HashMap<String, String>,
    ) -> Result<AccessType, Error> {
        match context.get(CTX_VOLUME_MODE).map(String::as_str) {
            Some("block") => Ok(AccessType::Block),
            Some("filesystem") | None => {
                let fstype = FsType::parse(
                    context
                        .get(CTX_FS_TYPE)
                        .map(String::as_str)
                        .unwrap_or(""),
                )?;
                Ok(AccessType::Filesystem(fstype))
            }
            Some(other) => Err(Error::InvalidParameter {
                text: format!("unknown volume mode '{}'", other),
            }),
        }
    }

    pub async fn node_stage_volume(
        &self,
        request: NodeStageRequest,
    ) -> Result<(), Error> {
        Self::validate_volume_id(&request.volume_id)?;
        self.validate_path(&request.staging_path)?;
        let access_type = Self::access_type_of(&request.context)?;
        let target = NvmeTarget::from_context(&request.context)?;

        let breaker = self.breaker_gate(&request.volume_id)?;
        let lock = self.volume_lock(&request.volume_id);
        let _guard = lock.lock().await;

        let result = self
            .do_stage(&request, access_type, &target)
            .await;
        self.breaker_record(&request.volume_id, &breaker, result.is_ok());

        if result.is_ok() {
            self.staged.lock().insert(
                request.volume_id.clone(),
                StagedVolume {
                    target,
                    access_type,
                },
            );
        }
        result
    }

    async fn do_stage(
        &self,
        request: &NodeStageRequest,
        access_type: AccessType,
        target: &NvmeTarget,
    ) -> Result<(), Error> {
        let device = target.attach(&self.config.node).await?;

        match access_type {
            // block volumes have no staging artifacts at all: the
            // fabric session is the staging
            AccessType::Block => {
                info!(
                    "volume {} staged (block, device {})",
                    request.volume_id, device
                );
                Ok(())
            }
            AccessType::Filesystem(fstype) => {
                filesystem_vol::stage_fs_volume(
                    &self.config.node,
                    &request.volume_id,
                    &device,
                    &request.staging_path,
                    fstype,
                    &request.mount_flags,
                )
                .await
            }
        }
    }

    pub async fn node_unstage_volume(
        &self,
        volume_id: &str,
        staging_path: &str,
    ) -> Result<(), Error> {
        Self::validate_volume_id(volume_id)?;
        self.validate_path(staging_path)?;

        let lock = self.volume_lock(volume_id);
        let _guard = lock.lock().await;

        let staged = self.staged.lock().get(volume_id).cloned();

        // figure out which session to drop. After a node restart the
        // staged map is empty, so fall back to the mount table and
        // sysfs before touching anything.
        let nqn = match &staged {
            Some(entry) => Some(entry.target.nqn.clone()),
            None => {
                match mount::find_mount(
                    None,
                    Some(staging_path),
                    self.config.node.mount_deadline(),
                )
                .await?
                {
                    Some(entry) => {
                        dev::nqn_of_device(
                            &entry.source.display().to_string(),
                        )
                        .await?
                    }
                    None => None,
                }
            }
        };

        let is_block = matches!(
            staged.as_ref().map(|entry| entry.access_type),
            Some(AccessType::Block)
        );
        if !is_block {
            filesystem_vol::unstage_fs_volume(
                &self.config.node,
                volume_id,
                staging_path,
            )
            .await?;
        }

        if let Some(nqn) = nqn {
            let target = match &staged {
                Some(entry) => entry.target.clone(),
                None => NvmeTarget {
                    nqn,
                    addr: String::new(),
                    port: 0,
                },
            };
            match target.detach().await? {
                DetachOutcome::Detached | DetachOutcome::NotConnected => {}
                DetachOutcome::InUse { device, holders } => {
                    // some other publication still needs the session
                    warn!(
                        "leaving session for {} up, {} held by {:?}",
                        volume_id, device, holders
                    );
                }
            }
        }

        self.staged.lock().remove(volume_id);
        info!("volume {} unstaged", volume_id);
        Ok(())
    }

    pub async fn node_publish_volume(
        &self,
        request: NodePublishRequest,
    ) -> Result<(), Error> {
        Self::validate_volume_id(&request.volume_id)?;
        self.validate_path(&request.target_path)?;
        let access_type = Self::access_type_of(&request.context)?;

        let breaker = self.breaker_gate(&request.volume_id)?;
        let lock = self.volume_lock(&request.volume_id);
        let _guard = lock.lock().await;

        let result = match access_type {
            AccessType::Filesystem(_) => {
                self.validate_path(&request.staging_path)?;
                filesystem_vol::publish_fs_volume(
                    &self.config.node,
                    &request.volume_id,
                    &request.staging_path,
                    &request.target_path,
                    request.readonly,
                )
                .await
            }
            AccessType::Block => {
                let target = NvmeTarget::from_context(&request.context)?;
                let device = target.attach(&self.config.node).await?;
                block_vol::publish_block_volume(
                    &self.config.node,
                    &request.volume_id,
                    &device,
                    &request.target_path,
                    request.readonly,
                )
                .await
            }
        };
        self.breaker_record(&request.volume_id, &breaker, result.is_ok());
        result
    }

    pub async fn node_unpublish_volume(
        &self,
        volume_id: &str,
        target_path: &str,
    ) -> Result<(), Error> {
        Self::validate_volume_id(volume_id)?;
        self.validate_path(target_path)?;

        let lock = self.volume_lock(volume_id);
        let _guard = lock.lock().await;

        // the target's own shape says which mode published it: block
        // targets are files, filesystem targets are directories
        match std::fs::metadata(target_path) {
            Ok(metadata) if metadata.is_dir() => {
                filesystem_vol::unpublish_fs_volume(
                    &self.config.node,
                    volume_id,
                    target_path,
                )
                .await
            }
            Ok(_) => {
                block_vol::unpublish_block_volume(
                    &self.config.node,
                    volume_id,
                    target_path,
                )
                .await
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "unpublish of {}: target {} already gone",
                    volume_id, target_path
                );
                Ok(())
            }
            Err(error) => Err(Error::Internal {
                text: format!("failed to stat {}: {}", target_path, error),
            }),
        }
    }

    /// Online filesystem growth after a controller-side expand.
    pub async fn node_expand_volume(
        &self,
        volume_id: &str,
        volume_path: &str,
        required_bytes: u64,
    ) -> Result<u64, Error> {
        Self::validate_volume_id(volume_id)?;
        self.validate_path(volume_path)?;

        let lock = self.volume_lock(volume_id);
        let _guard = lock.lock().await;

        let entry = mount::find_mount(
            None,
            Some(volume_path),
            self.config.node.mount_deadline(),
        )
        .await?
        .ok_or_else(|| Error::MountFailed {
            target: volume_path.to_string(),
            detail: format!("volume {} is not mounted here", volume_id),
        })?;

        let fstype = FsType::parse(&entry.fstype)?;
        let stats = statvfs(volume_path)?;
        if required_bytes < stats.total {
            return Err(Error::InvalidParameter {
                text: format!(
                    "cannot shrink {} from {} to {} bytes",
                    volume_id, stats.total, required_bytes
                ),
            });
        }

        format::online_resize(
            &entry.source.display().to_string(),
            volume_path,
            fstype,
            self.config.node.resize_deadline(),
        )
        .await?;

        Ok(statvfs(volume_path)?.total)
    }

    pub async fn node_get_volume_stats(
        &self,
        volume_id: &str,
        volume_path: &str,
    ) -> Result<VolumeStats, Error> {
        Self::validate_volume_id(volume_id)?;
        self.validate_path(volume_path)?;

        let entry = mount::find_mount(
            None,
            Some(volume_path),
            self.config.node.mount_deadline(),
        )
        .await?
        .ok_or_else(|| Error::VolumeNotFound {
            id: volume_id.to_string(),
        })?;

        match FsType::parse(&entry.fstype) {
            Ok(_) => {
                let stats = statvfs(volume_path)?;
                Ok(VolumeStats::Filesystem {
                    total: stats.total,
                    available: stats.available,
                    used: stats.total.saturating_sub(stats.free),
                })
            }
            // a bind-mounted device node: report raw capacity
            Err(_) => {
                let device = entry.source.display().to_string();
                Ok(VolumeStats::Block {
                    total: block_device_size(&device)?,
                })
            }
        }
    }
}

struct FsUsage {
    total: u64,
    available: u64,
    free: u64,
}

fn statvfs(path: &str) -> Result<FsUsage, Error> {
    let stats = nix::sys::statvfs::statvfs(Path::new(path)).map_err(
        |error| Error::Internal {
            text: format!("statvfs on {} failed: {}", path, error),
        },
    )?;
    let frsize = stats.fragment_size() as u64;
    Ok(FsUsage {
        total: stats.blocks() as u64 * frsize,
        available: stats.blocks_available() as u64 * frsize,
        free: stats.blocks_free() as u64 * frsize,
    })
}

/// Size of a block device read from sysfs (sector count times 512).
fn block_device_size(device: &str) -> Result<u64, Error> {
    let name = device.trim_start_matches("/dev/");
    let path = format!("/sys/class/block/{}/size", name);
    let sectors = std::fs::read_to_string(&path)
        .map_err(|error| Error::Internal {
            text: format!("cannot read {}: {}", path, error),
        })?
        .trim()
        .parse::<u64>()
        .map_err(|error| Error::Internal {
            text: format!("malformed sector count in {}: {}", path, error),
        })?;
    Ok(sectors * 512)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::{CTX_ADDR, CTX_NQN, CTX_PORT};
    use assert_matches::assert_matches;

    fn service() -> NodeService {
        let mut config = Config::default();
        config.driver.node_id = "node-test".to_string();
        NodeService::new(config)
    }

    fn service_with_prefix(prefix: &str) -> NodeService {
        let mut config = Config::default();
        config.driver.plugin_prefix = prefix.to_string();
        // keep connect failures fast in tests
        config.node.connect_attempts = 1;
        config.node.discovery_deadline_secs = 1;
        NodeService::new(config)
    }

    fn block_context() -> HashMap<String, String> {
        [
            (CTX_NQN, "nqn.2014-08.com.mikrotik:pvc-test"),
            (CTX_ADDR, "127.0.0.1"),
            (CTX_PORT, "4420"),
            (CTX_VOLUME_MODE, "block"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn path_validation() {
        let service = service();
        assert!(service
            .validate_path("/var/lib/kubelet/plugins/staging/v1")
            .is_ok());
        for bad in [
            "relative/path",
            "/etc/passwd",
            "/var/lib/kubelet/../../etc",
        ]
        .iter()
        {
            assert_matches!(
                service.validate_path(bad).unwrap_err(),
                Error::InvalidParameter { .. },
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn node_info_reports_configured_identity() {
        let service = service();
        let info = service.node_get_info();
        assert_eq!(info.node_id, "node-test");
        assert_eq!(info.max_volumes_per_node, 128);
    }

    #[tokio::test]
    async fn stage_without_nqn_is_invalid_argument() {
        let service = service();
        let mut context = block_context();
        context.remove(CTX_NQN);
        let err = service
            .node_stage_volume(NodeStageRequest {
                volume_id: "pvc-test".to_string(),
                staging_path: "/var/lib/kubelet/plugins/staging/v".to_string(),
                context,
                mount_flags: Vec::new(),
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidParameter { .. });
    }

    #[tokio::test]
    async fn stage_outside_plugin_dir_is_invalid_argument() {
        let service = service();
        let err = service
            .node_stage_volume(NodeStageRequest {
                volume_id: "pvc-test".to_string(),
                staging_path: "/tmp/evil".to_string(),
                context: block_context(),
                mount_flags: Vec::new(),
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidParameter { .. });
    }

    #[tokio::test]
    async fn injection_shaped_volume_id_is_rejected() {
        let service = service();
        let err = service
            .node_unstage_volume(
                "pvc-x; reboot",
                "/var/lib/kubelet/plugins/staging/v",
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidParameter { .. });
    }

    #[tokio::test]
    async fn unpublish_of_absent_target_is_idempotent_success() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with_prefix(dir.path().to_str().unwrap());
        let target = dir.path().join("pods/target");
        service
            .node_unpublish_volume("pvc-test", target.to_str().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unstage_of_never_staged_volume_is_idempotent_success() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_with_prefix(dir.path().to_str().unwrap());
        let staging = dir.path().join("staging/v");
        service
            .node_unstage_volume("pvc-test", staging.to_str().unwrap())
            .await
            .unwrap();
        // twice: still success
        service
            .node_unstage_volume("pvc-test", staging.to_str().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn repeated_stage_failures_open_the_volume_breaker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.driver.plugin_prefix =
            dir.path().to_str().unwrap().to_string();
        config.node.connect_attempts = 1;
        config.node.discovery_deadline_secs = 0;
        config.node.breaker_threshold = 2;
        config.node.breaker_cooldown_secs = 3600;
        let service = NodeService::new(config);

        let request = NodeStageRequest {
            volume_id: "pvc-breaker".to_string(),
            staging_path: dir
                .path()
                .join("staging/v")
                .to_str()
                .unwrap()
                .to_string(),
            context: block_context(),
            mount_flags: Vec::new(),
        };

        // connects fail on hosts without nvme fabrics support
        assert!(service.node_stage_volume(request.clone()).await.is_err());
        assert!(service.node_stage_volume(request.clone()).await.is_err());

        let err = service.node_stage_volume(request).await.unwrap_err();
        assert_matches!(err, Error::Unavailable { .. });
    }

    #[test]
    fn statvfs_of_root_reports_usage() {
        let usage = statvfs("/").unwrap();
        assert!(usage.total > 0);
        assert!(usage.total >= usage.free);
    }
}
