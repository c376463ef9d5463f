//! Background reconciliation: the in-memory attachment cache converges
//! to the cluster's VolumeAttachment truth, and appliance volumes with
//! no bound PV are flagged (and optionally removed) after a grace
//! period.

use crate::{
    attach::AttachmentManager,
    config::ControllerConfig,
    error::Error,
    events::{EventKind, EventSink, VolumeEvent},
    metrics,
    volume::AccessMode,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rds::RdsOps;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};
use tokio::sync::watch;

/// The narrow, read-only Kubernetes surface the reconciler consumes.
/// Implemented by an API-server adapter in production and by fixtures
/// in tests.
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// `(volume_id, node_id)` pairs of current VolumeAttachments.
    async fn volume_attachments(&self) -> Result<Vec<(String, String)>, Error>;
    /// volume ids referenced by a bound PersistentVolume
    async fn bound_volume_ids(&self) -> Result<HashSet<String>, Error>;
}

pub struct Reconciler {
    attachments: Arc<AttachmentManager>,
    rds: Arc<dyn RdsOps>,
    cluster: Arc<dyn ClusterView>,
    events: Arc<dyn EventSink>,
    config: ControllerConfig,
    /// when each orphan candidate was first observed
    orphan_seen: Mutex<HashMap<String, Instant>>,
}

impl Reconciler {
    pub fn new(
        attachments: Arc<AttachmentManager>,
        rds: Arc<dyn RdsOps>,
        cluster: Arc<dyn ClusterView>,
        events: Arc<dyn EventSink>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            attachments,
            rds,
            cluster,
            events,
            config,
            orphan_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Periodic driver loop; returns when `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.reconcile_period());
        ticker.set_missed_tick_behavior(
            tokio::time::MissedTickBehavior::Delay,
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // a transient API failure skips the cycle
                    if let Err(error) = self.reconcile_attachments().await {
                        warn!("attachment reconciliation skipped: {}", error);
                    }
                    if let Err(error) = self.sweep_orphans().await {
                        warn!("orphan sweep skipped: {}", error);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciler stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Converge the attachment manager to the VolumeAttachment view.
    pub async fn reconcile_attachments(&self) -> Result<u32, Error> {
        let cluster_pairs = self.cluster.volume_attachments().await?;

        let mut cluster: HashMap<String, HashSet<String>> = HashMap::new();
        for (volume, node) in cluster_pairs {
            cluster.entry(volume).or_default().insert(node);
        }

        let mut corrections = 0;

        // nodes the cluster knows about that we do not
        for (volume, nodes) in &cluster {
            let known: HashSet<String> =
                self.attachments.attached_nodes(volume).into_iter().collect();
            let mode = self
                .attachments
                .access_mode(volume)
                .unwrap_or(if nodes.len() > 1 {
                    AccessMode::MultiWriter
                } else {
                    AccessMode::SingleWriter
                });
            for node in nodes {
                if known.contains(node) {
                    continue;
                }
                match self.attachments.publish(
                    volume,
                    node,
                    mode,
                    self.config.migration_timeout(),
                    None,
                ) {
                    Ok(_) => {
                        corrections += 1;
                        metrics::RECONCILIATIONS_TOTAL
                            .with_label_values(&["attachment_added"])
                            .inc();
                        info!(
                            "reconciled: adopted attachment of {} on {}",
                            volume, node
                        );
                    }
                    // the state machine still rules: a third node is
                    // never adopted
                    Err(error) => warn!(
                        "reconcile could not adopt {} on {}: {}",
                        volume, node, error
                    ),
                }
            }
        }

        // nodes we remember that the cluster no longer references
        for (volume, nodes) in self.attachments.snapshot() {
            let wanted = cluster.get(&volume);
            for node in nodes {
                let stale = wanted
                    .map(|set| !set.contains(&node))
                    .unwrap_or(true);
                if stale {
                    self.attachments.unpublish(&volume, &node);
                    corrections += 1;
                    metrics::RECONCILIATIONS_TOTAL
                        .with_label_values(&["attachment_cleared"])
                        .inc();
                    self.events.publish(VolumeEvent::new(
                        EventKind::StaleAttachmentCleared,
                        &volume,
                        None,
                        format!("cleared stale attachment on {}", node),
                    ));
                    info!(
                        "reconciled: cleared stale attachment of {} on {}",
                        volume, node
                    );
                }
            }
        }

        Ok(corrections)
    }

    /// Flag appliance volumes with no bound PV; delete them only when
    /// configured to, and only after the grace period.
    pub async fn sweep_orphans(&self) -> Result<Vec<String>, Error> {
        let bound = self.cluster.bound_volume_ids().await?;
        let disks = self.rds.list_volumes().await?;

        let mut flagged = Vec::new();
        let mut seen = self.orphan_seen.lock();
        let now = Instant::now();

        let orphans: Vec<String> = disks
            .into_iter()
            .map(|disk| disk.slot)
            .filter(|slot| slot.starts_with("pvc-") && !bound.contains(slot))
            .collect();

        // volumes that regained a PV stop being candidates
        seen.retain(|slot, _| orphans.contains(slot));

        for slot in orphans {
            let first = *seen.entry(slot.clone()).or_insert(now);
            if now.duration_since(first) < self.config.orphan_grace() {
                continue;
            }
            metrics::RECONCILIATIONS_TOTAL
                .with_label_values(&["orphan_flagged"])
                .inc();
            warn!(
                "volume {} has no bound PV for more than {:?}",
                slot,
                self.config.orphan_grace()
            );
            flagged.push(slot);
        }
        drop(seen);

        if self.config.delete_orphans {
            for slot in &flagged {
                match self.rds.delete_volume(slot).await {
                    Ok(()) | Err(rds::RdsError::VolumeNotFound { .. }) => {
                        metrics::RECONCILIATIONS_TOTAL
                            .with_label_values(&["orphan_deleted"])
                            .inc();
                        info!("deleted orphan volume {}", slot);
                        self.orphan_seen.lock().remove(slot);
                    }
                    Err(error) => {
                        warn!("could not delete orphan {}: {}", slot, error)
                    }
                }
            }
        }

        Ok(flagged)
    }
}
