//! Controller-plane service: volume lifecycle against the appliance,
//! capacity, capability admission and publish/unpublish orchestration
//! over the attachment manager.

use crate::{
    attach::{AttachmentManager, PublishOutcome, UnpublishOutcome},
    config::Config,
    error::Error,
    events::{EventKind, EventSink, VolumeEvent},
    metrics,
    volume::{
        round_up_mib,
        volume_id_for,
        AccessMode,
        AccessType,
        PvcCoords,
        Volume,
        VolumeCapability,
        CTX_ADDR,
        CTX_FS_TYPE,
        CTX_NQN,
        CTX_PORT,
        CTX_VOLUME_MODE,
        PARAM_MIGRATION_TIMEOUT,
    },
};
use rds::{ident, RdsDisk, RdsOps};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Controller capabilities advertised to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    GetCapacity,
    ExpandVolume,
    CreateDeleteSnapshot,
    ListSnapshots,
}

#[derive(Debug, Clone)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub required_bytes: u64,
    /// zero means unbounded
    pub limit_bytes: u64,
    pub capabilities: Vec<VolumeCapability>,
    /// restore source: an existing snapshot id
    pub snapshot_source: Option<String>,
    /// storage class parameters plus sidecar-injected PVC metadata
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ControllerPublishRequest {
    pub volume_id: String,
    pub node_id: String,
    pub capability: VolumeCapability,
    pub readonly: bool,
    /// the context returned by CreateVolume
    pub volume_context: HashMap<String, String>,
}

/// Volume listing entry; the appliance does not record access types,
/// so listings carry only identity and capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    pub id: String,
    pub capacity: u64,
}

#[derive(Debug, Clone)]
pub struct ExpandVolumeResponse {
    pub capacity: u64,
    pub node_expansion_required: bool,
}

pub struct ControllerService {
    pub(crate) config: Config,
    pub(crate) rds: Arc<dyn RdsOps>,
    pub(crate) attachments: Arc<AttachmentManager>,
    pub(crate) events: Arc<dyn EventSink>,
}

impl ControllerService {
    pub fn new(
        config: Config,
        rds: Arc<dyn RdsOps>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let attachments = Arc::new(AttachmentManager::new(events.clone()));
        Self {
            config,
            rds,
            attachments,
            events,
        }
    }

    pub fn capabilities(&self) -> Vec<ControllerCapability> {
        vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::PublishUnpublishVolume,
            ControllerCapability::ListVolumes,
            ControllerCapability::GetCapacity,
            ControllerCapability::ExpandVolume,
            ControllerCapability::CreateDeleteSnapshot,
            ControllerCapability::ListSnapshots,
        ]
    }

    pub fn attachment_manager(&self) -> Arc<AttachmentManager> {
        self.attachments.clone()
    }

    fn volume_from_disk(
        &self,
        disk: &RdsDisk,
        access_type: AccessType,
        parameters: &HashMap<String, String>,
        content_source: Option<String>,
    ) -> Result<Volume, Error> {
        let nqn = disk.nqn.clone().ok_or_else(|| Error::Internal {
            text: format!("volume {} has no nqn on the appliance", disk.slot),
        })?;
        let port = disk.port.unwrap_or(self.config.rds.nvme_port);
        let mut volume = Volume::new(
            disk.slot.clone(),
            disk.size,
            access_type,
            nqn,
            self.config.rds.address.clone(),
            port,
            content_source,
        );
        // carried so that publish can honor a per-class migration window
        if let Some(timeout) = parameters.get(PARAM_MIGRATION_TIMEOUT) {
            volume
                .context
                .insert(PARAM_MIGRATION_TIMEOUT.to_string(), timeout.clone());
        }
        Ok(volume)
    }

    pub async fn create_volume(
        &self,
        request: CreateVolumeRequest,
    ) -> Result<Volume, Error> {
        let started = std::time::Instant::now();
        let result = self.do_create_volume(request).await;
        metrics::observe_op(
            "create_volume",
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn do_create_volume(
        &self,
        request: CreateVolumeRequest,
    ) -> Result<Volume, Error> {
        if request.name.is_empty() {
            return Err(Error::InvalidParameter {
                text: "volume name must not be empty".to_string(),
            });
        }
        if request.capabilities.is_empty() {
            return Err(Error::InvalidParameter {
                text: "at least one volume capability is required".to_string(),
            });
        }
        for capability in &request.capabilities {
            capability.validate()?;
        }
        let access_type = request.capabilities[0].access_type;

        if request.required_bytes == 0 {
            return Err(Error::InvalidParameter {
                text: "capacity is required".to_string(),
            });
        }
        let mut size = round_up_mib(request.required_bytes);
        if request.limit_bytes != 0 && size > request.limit_bytes {
            return Err(Error::InvalidParameter {
                text: format!(
                    "capacity {} rounded to 1 MiB exceeds limit {}",
                    size, request.limit_bytes
                ),
            });
        }

        let id = volume_id_for(&request.name);

        // create is idempotent: a volume that already exists with the
        // requested size is simply returned
        if let Some(existing) = self.rds.get_volume(&id).await? {
            return if existing.size == size
                || request.snapshot_source.is_some()
                    && existing.size >= size
            {
                info!("volume {} already provisioned", id);
                self.volume_from_disk(
                    &existing,
                    access_type,
                    &request.parameters,
                    request.snapshot_source,
                )
            } else {
                Err(Error::VolumeExists { id })
            };
        }

        let disk = match &request.snapshot_source {
            Some(snapshot_id) => {
                ident::snapshot_id(snapshot_id).map_err(Error::from)?;
                let snapshot = self
                    .rds
                    .get_snapshot(snapshot_id)
                    .await?
                    .ok_or_else(|| Error::SnapshotNotFound {
                        id: snapshot_id.clone(),
                    })?;
                // a restored volume can never be smaller than its source
                if let Some(snapshot_size) = snapshot.size {
                    size = size.max(round_up_mib(snapshot_size));
                }
                self.rds
                    .restore_snapshot(snapshot_id, &id, size)
                    .await?
            }
            None => {
                let free = self.rds.free_bytes().await?;
                if size > free {
                    return Err(Error::ResourcesExhausted {
                        text: format!(
                            "requested {} bytes but only {} free on the \
                             appliance",
                            size, free
                        ),
                    });
                }
                self.rds.create_volume(&id, size).await?
            }
        };

        self.volume_from_disk(
            &disk,
            access_type,
            &request.parameters,
            request.snapshot_source,
        )
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<(), Error> {
        let started = std::time::Instant::now();
        let result = self.do_delete_volume(volume_id).await;
        metrics::observe_op(
            "delete_volume",
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn do_delete_volume(&self, volume_id: &str) -> Result<(), Error> {
        ident::volume_id(volume_id).map_err(Error::from)?;
        match self.rds.delete_volume(volume_id).await {
            Ok(()) => Ok(()),
            // deleting something already gone is success
            Err(rds::RdsError::VolumeNotFound { .. }) => {
                debug!("volume {} already absent", volume_id);
                Ok(())
            }
            Err(error @ rds::RdsError::InvalidParameter { .. }) => {
                Err(error.into())
            }
            Err(error) => {
                warn!("delete of {} failed: {}", volume_id, error);
                Err(Error::Unavailable {
                    text: format!("could not delete volume {}", volume_id),
                })
            }
        }
    }

    pub async fn expand_volume(
        &self,
        volume_id: &str,
        required_bytes: u64,
        capability: Option<VolumeCapability>,
    ) -> Result<ExpandVolumeResponse, Error> {
        ident::volume_id(volume_id).map_err(Error::from)?;
        let disk = self
            .rds
            .get_volume(volume_id)
            .await?
            .ok_or_else(|| Error::VolumeNotFound {
                id: volume_id.to_string(),
            })?;

        let new_size = round_up_mib(required_bytes);
        if new_size < disk.size {
            return Err(Error::InvalidParameter {
                text: format!(
                    "cannot shrink volume {} from {} to {} bytes",
                    volume_id, disk.size, new_size
                ),
            });
        }

        let node_expansion_required = match capability {
            Some(capability) => {
                matches!(capability.access_type, AccessType::Filesystem(_))
            }
            // without a stated capability assume a filesystem volume;
            // a spurious node expand on a block volume is a no-op
            None => true,
        };

        if new_size == disk.size {
            return Ok(ExpandVolumeResponse {
                capacity: disk.size,
                node_expansion_required,
            });
        }

        self.rds.resize_volume(volume_id, new_size).await?;
        info!("expanded volume {} to {} bytes", volume_id, new_size);
        Ok(ExpandVolumeResponse {
            capacity: new_size,
            node_expansion_required,
        })
    }

    pub async fn validate_capabilities(
        &self,
        volume_id: &str,
        capabilities: &[VolumeCapability],
    ) -> Result<Result<(), String>, Error> {
        ident::volume_id(volume_id).map_err(Error::from)?;
        if self.rds.get_volume(volume_id).await?.is_none() {
            return Err(Error::VolumeNotFound {
                id: volume_id.to_string(),
            });
        }
        for capability in capabilities {
            if let Err(error) = capability.validate() {
                return Ok(Err(error.to_string()));
            }
        }
        Ok(Ok(()))
    }

    pub async fn get_capacity(&self) -> Result<u64, Error> {
        Ok(self.rds.free_bytes().await?)
    }

    pub async fn list_volumes(
        &self,
        max_entries: u32,
        starting_token: &str,
    ) -> Result<(Vec<VolumeEntry>, Option<String>), Error> {
        let disks = self.rds.list_volumes().await?;
        let entries: Vec<VolumeEntry> = disks
            .into_iter()
            .map(|disk| VolumeEntry {
                id: disk.slot,
                capacity: disk.size,
            })
            .collect();
        paginate(entries, starting_token, max_entries)
    }

    /// Record the attachment and hand back the context the node plane
    /// needs to find, stage and mount the volume.
    pub async fn controller_publish(
        &self,
        request: ControllerPublishRequest,
    ) -> Result<HashMap<String, String>, Error> {
        let started = std::time::Instant::now();
        let result = self.do_controller_publish(request).await;
        metrics::ATTACH_OPS_TOTAL
            .with_label_values(&[
                "publish",
                if result.is_ok() { "success" } else { "error" },
            ])
            .inc();
        metrics::VOLUME_OP_DURATION
            .with_label_values(&["controller_publish"])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn do_controller_publish(
        &self,
        request: ControllerPublishRequest,
    ) -> Result<HashMap<String, String>, Error> {
        ident::volume_id(&request.volume_id).map_err(Error::from)?;
        if request.node_id.is_empty() {
            return Err(Error::InvalidParameter {
                text: "node id must not be empty".to_string(),
            });
        }
        request.capability.validate()?;
        if request.readonly
            && request.capability.access_mode == AccessMode::MultiWriter
        {
            return Err(Error::InvalidParameter {
                text: "readonly publish conflicts with multi-writer mode"
                    .to_string(),
            });
        }

        let disk = self
            .rds
            .get_volume(&request.volume_id)
            .await?
            .ok_or_else(|| Error::VolumeNotFound {
                id: request.volume_id.clone(),
            })?;

        let migration_timeout = request
            .volume_context
            .get(PARAM_MIGRATION_TIMEOUT)
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.controller.migration_timeout());
        let pvc = PvcCoords::from_parameters(&request.volume_context);

        let outcome = self.attachments.publish(
            &request.volume_id,
            &request.node_id,
            request.capability.access_mode,
            migration_timeout,
            pvc.clone(),
        )?;

        if let PublishOutcome::Attached = outcome {
            self.events.publish(VolumeEvent::new(
                EventKind::VolumeAttached,
                &request.volume_id,
                pvc,
                format!("attached to node {}", request.node_id),
            ));
        }

        let mut context = HashMap::new();
        context.insert(
            CTX_NQN.to_string(),
            disk.nqn.clone().ok_or_else(|| Error::Internal {
                text: format!(
                    "volume {} has no nqn on the appliance",
                    request.volume_id
                ),
            })?,
        );
        context.insert(CTX_ADDR.to_string(), self.config.rds.address.clone());
        context.insert(
            CTX_PORT.to_string(),
            disk.port.unwrap_or(self.config.rds.nvme_port).to_string(),
        );
        context.insert(
            CTX_VOLUME_MODE.to_string(),
            request.capability.access_type.mode_str().to_string(),
        );
        if let AccessType::Filesystem(fstype) = request.capability.access_type
        {
            context.insert(CTX_FS_TYPE.to_string(), fstype.to_string());
        }
        Ok(context)
    }

    pub async fn controller_unpublish(
        &self,
        volume_id: &str,
        node_id: &str,
    ) -> Result<(), Error> {
        ident::volume_id(volume_id).map_err(Error::from)?;
        let outcome = self.attachments.unpublish(volume_id, node_id);

        match &outcome {
            UnpublishOutcome::NotAttached => {
                debug!(
                    "unpublish of {} from {}: nothing attached",
                    volume_id, node_id
                );
            }
            outcome => {
                self.events.publish(VolumeEvent::new(
                    EventKind::VolumeDetached,
                    volume_id,
                    None,
                    format!("detached from node {}", node_id),
                ));
                if let UnpublishOutcome::MigrationCompleted { duration } =
                    outcome
                {
                    debug!(
                        "migration of {} finished in {:?}",
                        volume_id, duration
                    );
                }
            }
        }

        metrics::ATTACH_OPS_TOTAL
            .with_label_values(&["unpublish", "success"])
            .inc();
        Ok(())
    }
}

/// Integer-offset pagination shared by the list operations. The token
/// is the base-10 offset into the deterministically sorted result.
pub(crate) fn paginate<T>(
    items: Vec<T>,
    starting_token: &str,
    max_entries: u32,
) -> Result<(Vec<T>, Option<String>), Error> {
    let offset = if starting_token.is_empty() {
        0
    } else {
        starting_token
            .parse::<usize>()
            .map_err(|_| Error::InvalidToken {
                token: starting_token.to_string(),
            })?
    };
    if offset > items.len() {
        return Err(Error::InvalidToken {
            token: starting_token.to_string(),
        });
    }

    let end = if max_entries == 0 {
        items.len()
    } else {
        (offset + max_entries as usize).min(items.len())
    };
    let next_token = if end < items.len() {
        Some(end.to_string())
    } else {
        None
    };
    let page = items
        .into_iter()
        .skip(offset)
        .take(end - offset)
        .collect();
    Ok((page, next_token))
}

#[cfg(test)]
pub(crate) mod test_rds {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rds::{BreakerState, RdsError, RdsSubvolume};
    use std::collections::BTreeMap;

    /// In-memory appliance double tracking call counts so tests can
    /// assert on backend effects, not just results.
    #[derive(Default)]
    pub struct MockRds {
        pub disks: Mutex<BTreeMap<String, RdsDisk>>,
        pub subvolumes: Mutex<BTreeMap<String, RdsSubvolume>>,
        pub free: Mutex<u64>,
        pub create_calls: Mutex<u32>,
        pub delete_calls: Mutex<u32>,
        pub fail_with: Mutex<Option<RdsError>>,
    }

    impl MockRds {
        pub fn with_free(free: u64) -> Self {
            let mock = Self::default();
            *mock.free.lock() = free;
            mock
        }

        fn take_failure(&self) -> Option<RdsError> {
            self.fail_with.lock().take()
        }

        fn nqn_for(id: &str) -> String {
            format!("nqn.2014-08.com.mikrotik:{}", id)
        }
    }

    #[async_trait]
    impl RdsOps for MockRds {
        async fn create_volume(
            &self,
            id: &str,
            size: u64,
        ) -> Result<RdsDisk, RdsError> {
            if let Some(error) = self.take_failure() {
                return Err(error);
            }
            *self.create_calls.lock() += 1;
            let disk = RdsDisk {
                slot: id.to_string(),
                file_path: format!("rds1/{}/disk.img", id),
                size,
                nqn: Some(Self::nqn_for(id)),
                port: Some(4420),
            };
            self.disks.lock().insert(id.to_string(), disk.clone());
            Ok(disk)
        }

        async fn get_volume(
            &self,
            id: &str,
        ) -> Result<Option<RdsDisk>, RdsError> {
            Ok(self.disks.lock().get(id).cloned())
        }

        async fn list_volumes(&self) -> Result<Vec<RdsDisk>, RdsError> {
            Ok(self.disks.lock().values().cloned().collect())
        }

        async fn delete_volume(&self, id: &str) -> Result<(), RdsError> {
            if let Some(error) = self.take_failure() {
                return Err(error);
            }
            *self.delete_calls.lock() += 1;
            match self.disks.lock().remove(id) {
                Some(_) => Ok(()),
                None => Err(RdsError::VolumeNotFound { id: id.to_string() }),
            }
        }

        async fn resize_volume(
            &self,
            id: &str,
            size: u64,
        ) -> Result<(), RdsError> {
            match self.disks.lock().get_mut(id) {
                Some(disk) => {
                    disk.size = size;
                    Ok(())
                }
                None => Err(RdsError::VolumeNotFound { id: id.to_string() }),
            }
        }

        async fn free_bytes(&self) -> Result<u64, RdsError> {
            if let Some(error) = self.take_failure() {
                return Err(error);
            }
            Ok(*self.free.lock())
        }

        async fn create_snapshot(
            &self,
            snapshot_id: &str,
            volume_id: &str,
        ) -> Result<RdsSubvolume, RdsError> {
            let size =
                self.disks.lock().get(volume_id).map(|disk| disk.size);
            let subvolume = RdsSubvolume {
                name: snapshot_id.to_string(),
                parent: Some(volume_id.to_string()),
                read_only: true,
                size,
            };
            self.subvolumes
                .lock()
                .insert(snapshot_id.to_string(), subvolume.clone());
            Ok(subvolume)
        }

        async fn get_snapshot(
            &self,
            id: &str,
        ) -> Result<Option<RdsSubvolume>, RdsError> {
            Ok(self.subvolumes.lock().get(id).cloned())
        }

        async fn list_snapshots(
            &self,
        ) -> Result<Vec<RdsSubvolume>, RdsError> {
            Ok(self.subvolumes.lock().values().cloned().collect())
        }

        async fn delete_snapshot(&self, id: &str) -> Result<(), RdsError> {
            match self.subvolumes.lock().remove(id) {
                Some(_) => Ok(()),
                None => {
                    Err(RdsError::SnapshotNotFound { id: id.to_string() })
                }
            }
        }

        async fn restore_snapshot(
            &self,
            snapshot_id: &str,
            new_volume_id: &str,
            size: u64,
        ) -> Result<RdsDisk, RdsError> {
            if self.subvolumes.lock().get(snapshot_id).is_none() {
                return Err(RdsError::SnapshotNotFound {
                    id: snapshot_id.to_string(),
                });
            }
            self.create_volume(new_volume_id, size).await
        }

        async fn probe(&self) -> Result<(), RdsError> {
            Ok(())
        }

        fn breaker_state(&self) -> BreakerState {
            BreakerState::Closed
        }
    }

    pub fn service_with(mock: Arc<MockRds>) -> ControllerService {
        let events = Arc::new(crate::events::test_sink::RecordingSink::default());
        ControllerService::new(Config::default(), mock, events)
    }

    pub fn fs_cap() -> VolumeCapability {
        VolumeCapability {
            access_type: AccessType::Filesystem(crate::volume::FsType::Ext4),
            access_mode: AccessMode::SingleWriter,
        }
    }

    pub fn block_rwx_cap() -> VolumeCapability {
        VolumeCapability {
            access_type: AccessType::Block,
            access_mode: AccessMode::MultiWriter,
        }
    }
}
