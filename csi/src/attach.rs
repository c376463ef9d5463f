//! Attachment bookkeeping: at most one writer for single-node volumes,
//! at most two during a bounded migration window for multi-writer
//! volumes, with deterministic primary/secondary ordering.
//!
//! The map is striped: an outer lock guards the volume table, one
//! mutex per volume guards its state. Every transition (read current
//! state, decide, commit, emit) runs inside the per-volume critical
//! section, so the two-node ceiling check and the append are atomic
//! and a third concurrent publish can never slip through.

use crate::{
    error::Error,
    events::{EventSink, VolumeEvent},
    metrics,
    volume::{AccessMode, PvcCoords},
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

#[derive(Debug, Clone)]
pub struct NodeAttachment {
    pub node_id: String,
    pub attached_at: Instant,
}

#[derive(Debug)]
struct AttachmentState {
    access_mode: AccessMode,
    /// index 0 is the primary (migration source), index 1 the
    /// secondary (migration target)
    nodes: Vec<NodeAttachment>,
    migration_start: Option<Instant>,
    migration_timeout: Duration,
    /// MigrationFailed is emitted once per stuck migration, not once
    /// per rejected publish
    timeout_reported: bool,
    pvc: Option<PvcCoords>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// node freshly attached as the only attachment
    Attached,
    /// node was already attached; nothing changed
    AlreadyAttached,
    /// a secondary joined: the migration window is now open
    MigrationStarted { source_node: String },
}

#[derive(Debug, PartialEq, Eq)]
pub enum UnpublishOutcome {
    /// node was not attached; nothing changed
    NotAttached,
    /// node detached outside of any migration
    Detached { last: bool },
    /// primary left a dual attachment: migration completed
    MigrationCompleted { duration: Duration },
    /// secondary left a dual attachment: migration abandoned
    MigrationAborted,
}

pub struct AttachmentManager {
    attachments: RwLock<HashMap<String, Arc<Mutex<AttachmentState>>>>,
    events: Arc<dyn EventSink>,
}

impl AttachmentManager {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            attachments: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn entry(&self, volume_id: &str) -> Arc<Mutex<AttachmentState>> {
        if let Some(entry) = self.attachments.read().get(volume_id) {
            return entry.clone();
        }
        self.attachments
            .write()
            .entry(volume_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AttachmentState {
                    access_mode: AccessMode::SingleWriter,
                    nodes: Vec::with_capacity(2),
                    migration_start: None,
                    migration_timeout: Duration::from_secs(300),
                    timeout_reported: false,
                    pvc: None,
                }))
            })
            .clone()
    }

    /// Record a publish of `volume_id` on `node_id`.
    pub fn publish(
        &self,
        volume_id: &str,
        node_id: &str,
        access_mode: AccessMode,
        migration_timeout: Duration,
        pvc: Option<PvcCoords>,
    ) -> Result<PublishOutcome, Error> {
        loop {
            let entry = self.entry(volume_id);
            let mut state = entry.lock();

            // the entry may have been removed from the map between
            // lookup and lock; start over on a fresh entry
            match self.attachments.read().get(volume_id) {
                Some(current) if Arc::ptr_eq(current, &entry) => {}
                _ => continue,
            }

            if state.nodes.is_empty() {
                state.access_mode = access_mode;
                state.migration_timeout = migration_timeout;
                state.pvc = pvc;
                state.nodes.push(NodeAttachment {
                    node_id: node_id.to_string(),
                    attached_at: Instant::now(),
                });
                debug!("volume {} attached to {}", volume_id, node_id);
                return Ok(PublishOutcome::Attached);
            }

            if state.nodes.iter().any(|n| n.node_id == node_id) {
                return Ok(PublishOutcome::AlreadyAttached);
            }

            if state.nodes.len() == 1 {
                if state.access_mode != AccessMode::MultiWriter {
                    return Err(Error::AttachmentDenied {
                        volume_id: volume_id.to_string(),
                        reason: format!(
                            "already attached to node {}; only multi-writer \
                             block volumes may attach to a second node",
                            state.nodes[0].node_id
                        ),
                    });
                }
                let source_node = state.nodes[0].node_id.clone();
                if pvc.is_some() {
                    state.pvc = pvc;
                }
                state.nodes.push(NodeAttachment {
                    node_id: node_id.to_string(),
                    attached_at: Instant::now(),
                });
                state.migration_start = Some(Instant::now());
                state.migration_timeout = migration_timeout;
                state.timeout_reported = false;

                metrics::ACTIVE_MIGRATIONS.inc();
                self.events.publish(VolumeEvent::migration_started(
                    volume_id,
                    state.pvc.clone(),
                    &source_node,
                    node_id,
                    state.migration_timeout,
                ));
                info!(
                    "volume {} entering migration window: {} -> {}",
                    volume_id, source_node, node_id
                );
                return Ok(PublishOutcome::MigrationStarted { source_node });
            }

            // two nodes attached: hard ceiling
            let elapsed = state
                .migration_start
                .map(|start| start.elapsed())
                .unwrap_or_default();
            if state.migration_start.is_some()
                && elapsed > state.migration_timeout
            {
                if !state.timeout_reported {
                    state.timeout_reported = true;
                    metrics::MIGRATIONS_TOTAL
                        .with_label_values(&["timeout"])
                        .inc();
                    self.events.publish(VolumeEvent::migration_failed(
                        volume_id,
                        state.pvc.clone(),
                        "timeout",
                        elapsed,
                    ));
                }
                // state is left as-is: the operator must detach the
                // source before anything else may attach
                return Err(Error::MigrationTimedOut {
                    volume_id: volume_id.to_string(),
                    timeout: state.migration_timeout,
                    elapsed,
                });
            }

            return Err(Error::AttachmentDenied {
                volume_id: volume_id.to_string(),
                reason: format!(
                    "already attached to 2 nodes ({}, {}) - migration limit",
                    state.nodes[0].node_id, state.nodes[1].node_id
                ),
            });
        }
    }

    /// Record an unpublish of `volume_id` from `node_id`.
    pub fn unpublish(
        &self,
        volume_id: &str,
        node_id: &str,
    ) -> UnpublishOutcome {
        let entry = match self.attachments.read().get(volume_id) {
            Some(entry) => entry.clone(),
            None => return UnpublishOutcome::NotAttached,
        };
        let mut state = entry.lock();

        let position =
            match state.nodes.iter().position(|n| n.node_id == node_id) {
                Some(position) => position,
                None => return UnpublishOutcome::NotAttached,
            };

        let outcome = if state.nodes.len() == 2 {
            let migration_start = state.migration_start.take();
            state.timeout_reported = false;
            state.nodes.remove(position);

            if migration_start.is_some() {
                metrics::ACTIVE_MIGRATIONS.dec();
            }

            if position == 0 {
                // primary left: the handoff succeeded
                let duration = migration_start
                    .map(|start| start.elapsed())
                    .unwrap_or_default();
                metrics::MIGRATIONS_TOTAL
                    .with_label_values(&["success"])
                    .inc();
                metrics::MIGRATION_DURATION.observe(duration.as_secs_f64());
                self.events.publish(VolumeEvent::migration_completed(
                    volume_id,
                    state.pvc.clone(),
                    duration,
                ));
                info!(
                    "volume {} migration completed in {:?}, now on {}",
                    volume_id, duration, state.nodes[0].node_id
                );
                UnpublishOutcome::MigrationCompleted { duration }
            } else {
                // target side gave up; source keeps running
                metrics::MIGRATIONS_TOTAL
                    .with_label_values(&["failed"])
                    .inc();
                info!(
                    "volume {} migration abandoned, staying on {}",
                    volume_id, state.nodes[0].node_id
                );
                UnpublishOutcome::MigrationAborted
            }
        } else {
            state.nodes.remove(position);
            debug!("volume {} detached from {}", volume_id, node_id);
            UnpublishOutcome::Detached {
                last: state.nodes.is_empty(),
            }
        };

        if state.nodes.is_empty() {
            // keep lock order: outer map lock is taken while the state
            // lock is held only here, and publishers never lock a state
            // while holding the map lock
            let mut map = self.attachments.write();
            if let Some(current) = map.get(volume_id) {
                if Arc::ptr_eq(current, &entry) {
                    map.remove(volume_id);
                }
            }
        }

        outcome
    }

    /// Nodes currently attached, primary first.
    pub fn attached_nodes(&self, volume_id: &str) -> Vec<String> {
        // the map guard is dropped before the state lock is taken;
        // holding both in this order could deadlock with removal
        let entry = self.attachments.read().get(volume_id).cloned();
        match entry {
            Some(entry) => {
                entry.lock().nodes.iter().map(|n| n.node_id.clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Snapshot of all attachments, for the reconciler.
    pub fn snapshot(&self) -> Vec<(String, Vec<String>)> {
        let entries: Vec<(String, Arc<Mutex<AttachmentState>>)> = self
            .attachments
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        entries
            .into_iter()
            .map(|(id, entry)| {
                let nodes = entry
                    .lock()
                    .nodes
                    .iter()
                    .map(|n| n.node_id.clone())
                    .collect();
                (id, nodes)
            })
            .collect()
    }

    /// Access mode recorded for a volume, if attached anywhere.
    pub fn access_mode(&self, volume_id: &str) -> Option<AccessMode> {
        let entry = self.attachments.read().get(volume_id).cloned();
        entry.map(|entry| entry.lock().access_mode)
    }
}
