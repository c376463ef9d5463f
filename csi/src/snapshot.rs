//! Snapshot lifecycle against Btrfs subvolumes on the appliance.
//! Snapshots are crash-consistent and ready the moment the appliance
//! acknowledges them.

use crate::{
    controller::{paginate, ControllerService},
    error::Error,
    metrics,
    volume::{snapshot_id_for, Snapshot},
};
use chrono::Utc;
use rds::ident;
use std::time::Instant;

/// Filter for `list_snapshots`. Both fields empty lists everything.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub snapshot_id: Option<String>,
    pub source_volume_id: Option<String>,
}

impl ControllerService {
    pub async fn create_snapshot(
        &self,
        name: &str,
        source_volume_id: &str,
    ) -> Result<Snapshot, Error> {
        let started = Instant::now();
        let result = self.do_create_snapshot(name, source_volume_id).await;
        metrics::observe_op(
            "create_snapshot",
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn do_create_snapshot(
        &self,
        name: &str,
        source_volume_id: &str,
    ) -> Result<Snapshot, Error> {
        if name.is_empty() {
            return Err(Error::InvalidParameter {
                text: "snapshot name must not be empty".to_string(),
            });
        }
        ident::volume_id(source_volume_id).map_err(Error::from)?;
        let id = snapshot_id_for(name);

        // idempotent by (name, source); same name against a different
        // source is a conflict
        if let Some(existing) = self.rds.get_snapshot(&id).await? {
            match existing.parent.as_deref() {
                Some(parent) if parent != source_volume_id => {
                    return Err(Error::SnapshotExists { id });
                }
                _ => {
                    info!("snapshot {} already present", id);
                    return Ok(Snapshot {
                        id,
                        source_volume_id: existing
                            .parent
                            .unwrap_or_else(|| source_volume_id.to_string()),
                        size: existing.size.unwrap_or_default(),
                        created: None,
                        ready_to_use: true,
                    });
                }
            }
        }

        let source = self
            .rds
            .get_volume(source_volume_id)
            .await?
            .ok_or_else(|| Error::VolumeNotFound {
                id: source_volume_id.to_string(),
            })?;

        let subvolume =
            self.rds.create_snapshot(&id, source_volume_id).await?;
        info!("snapshot {} of {} ready", id, source_volume_id);
        Ok(Snapshot {
            id,
            source_volume_id: source_volume_id.to_string(),
            // the appliance does not report subvolume sizes reliably;
            // a crash-consistent snapshot holds at most the source size
            size: subvolume.size.unwrap_or(source.size),
            created: Some(Utc::now()),
            ready_to_use: true,
        })
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), Error> {
        let started = Instant::now();
        let result = self.do_delete_snapshot(snapshot_id).await;
        metrics::observe_op(
            "delete_snapshot",
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn do_delete_snapshot(&self, snapshot_id: &str) -> Result<(), Error> {
        ident::snapshot_id(snapshot_id).map_err(Error::from)?;
        match self.rds.delete_snapshot(snapshot_id).await {
            Ok(()) => Ok(()),
            Err(rds::RdsError::SnapshotNotFound { .. }) => {
                debug!("snapshot {} already absent", snapshot_id);
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// List snapshots with deterministic order and integer-offset
    /// pagination. A lookup by id that finds nothing returns an empty
    /// page, not an error.
    pub async fn list_snapshots(
        &self,
        filter: SnapshotFilter,
        max_entries: u32,
        starting_token: &str,
    ) -> Result<(Vec<Snapshot>, Option<String>), Error> {
        let subvolumes = match &filter.snapshot_id {
            Some(id) => {
                if ident::snapshot_id(id).is_err() {
                    // an id this driver never generated cannot exist
                    return Ok((Vec::new(), None));
                }
                self.rds.get_snapshot(id).await?.into_iter().collect()
            }
            None => self.rds.list_snapshots().await?,
        };

        let mut snapshots: Vec<Snapshot> = subvolumes
            .into_iter()
            .filter(|subvolume| match &filter.source_volume_id {
                Some(source) => {
                    subvolume.parent.as_deref() == Some(source.as_str())
                }
                None => true,
            })
            .map(|subvolume| Snapshot {
                id: subvolume.name.clone(),
                source_volume_id: subvolume.parent.unwrap_or_default(),
                size: subvolume.size.unwrap_or_default(),
                created: None,
                ready_to_use: true,
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));

        paginate(snapshots, starting_token, max_entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::test_rds::*;
    use assert_matches::assert_matches;
    use crate::controller::CreateVolumeRequest;
    use std::{collections::HashMap, sync::Arc};

    const GIB: u64 = 1 << 30;

    async fn service_with_volume(
    ) -> (crate::controller::ControllerService, String) {
        let mock = Arc::new(MockRds::with_free(100 * GIB));
        let service = service_with(mock);
        let volume = service
            .create_volume(CreateVolumeRequest {
                name: "source".to_string(),
                required_bytes: 2 * GIB,
                limit_bytes: 0,
                capabilities: vec![fs_cap()],
                snapshot_source: None,
                parameters: HashMap::new(),
            })
            .await
            .unwrap();
        (service, volume.id)
    }

    #[tokio::test]
    async fn create_snapshot_is_instant_and_sized_from_source() {
        let (service, volume_id) = service_with_volume().await;
        let snapshot =
            service.create_snapshot("snap1", &volume_id).await.unwrap();
        assert_eq!(snapshot.id, snapshot_id_for("snap1"));
        assert!(snapshot.id.starts_with("snap-"));
        assert!(snapshot.ready_to_use);
        assert_eq!(snapshot.size, 2 * GIB);
        assert_eq!(snapshot.source_volume_id, volume_id);
    }

    #[tokio::test]
    async fn create_snapshot_idempotent_and_conflicting() {
        let (service, volume_id) = service_with_volume().await;
        let first =
            service.create_snapshot("snap1", &volume_id).await.unwrap();
        let second =
            service.create_snapshot("snap1", &volume_id).await.unwrap();
        assert_eq!(first.id, second.id);

        // same name, different source volume
        let other = crate::volume::volume_id_for("other");
        let err = service
            .create_snapshot("snap1", &other)
            .await
            .unwrap_err();
        assert_matches!(err, Error::SnapshotExists { .. });
    }

    #[tokio::test]
    async fn create_snapshot_requires_source_volume() {
        let (service, _) = service_with_volume().await;
        let missing = crate::volume::volume_id_for("missing");
        let err = service
            .create_snapshot("snapx", &missing)
            .await
            .unwrap_err();
        assert_matches!(err, Error::VolumeNotFound { .. });
    }

    #[tokio::test]
    async fn delete_snapshot_is_idempotent() {
        let (service, volume_id) = service_with_volume().await;
        let snapshot =
            service.create_snapshot("gone", &volume_id).await.unwrap();
        service.delete_snapshot(&snapshot.id).await.unwrap();
        service.delete_snapshot(&snapshot.id).await.unwrap();
    }

    #[tokio::test]
    async fn list_by_id_missing_is_empty_not_error() {
        let (service, _) = service_with_volume().await;
        let (page, next) = service
            .list_snapshots(
                SnapshotFilter {
                    snapshot_id: Some(snapshot_id_for("nope")),
                    source_volume_id: None,
                },
                0,
                "",
            )
            .await
            .unwrap();
        assert!(page.is_empty());
        assert_eq!(next, None);
    }

    #[tokio::test]
    async fn list_filters_by_source_and_paginates() {
        let (service, volume_id) = service_with_volume().await;
        for i in 0 .. 3 {
            service
                .create_snapshot(&format!("s-{}", i), &volume_id)
                .await
                .unwrap();
        }

        let (all, _) = service
            .list_snapshots(SnapshotFilter::default(), 0, "")
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        // deterministic sort by id
        let mut sorted = all.iter().map(|s| s.id.clone()).collect::<Vec<_>>();
        sorted.sort();
        assert_eq!(
            all.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
            sorted
        );

        let (page, next) = service
            .list_snapshots(
                SnapshotFilter {
                    snapshot_id: None,
                    source_volume_id: Some(volume_id.clone()),
                },
                2,
                "",
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        let (rest, done) = service
            .list_snapshots(
                SnapshotFilter {
                    snapshot_id: None,
                    source_volume_id: Some(volume_id),
                },
                2,
                &next.unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(done, None);
    }

    #[tokio::test]
    async fn bad_tokens_abort() {
        let (service, _) = service_with_volume().await;
        for bad in ["-1", "abc", "99"].iter() {
            let err = service
                .list_snapshots(SnapshotFilter::default(), 2, bad)
                .await
                .unwrap_err();
            assert_eq!(err.code(), crate::error::Code::Aborted);
        }
    }
}
