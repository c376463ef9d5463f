//! Typed events the controller plane emits. The sink is an external
//! collaborator (in production a Kubernetes event recorder addressing
//! the PVC); the default sink writes to the log so the core never
//! depends on the cluster API.

use crate::volume::PvcCoords;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    MigrationStarted,
    MigrationCompleted,
    MigrationFailed,
    VolumeAttached,
    VolumeDetached,
    StaleAttachmentCleared,
}

impl EventKind {
    pub fn severity(&self) -> Severity {
        match self {
            EventKind::MigrationFailed => Severity::Warning,
            _ => Severity::Normal,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            EventKind::MigrationStarted => "MigrationStarted",
            EventKind::MigrationCompleted => "MigrationCompleted",
            EventKind::MigrationFailed => "MigrationFailed",
            EventKind::VolumeAttached => "VolumeAttached",
            EventKind::VolumeDetached => "VolumeDetached",
            EventKind::StaleAttachmentCleared => "StaleAttachmentCleared",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VolumeEvent {
    pub kind: EventKind,
    pub volume_id: String,
    /// object the event is addressed to, when known
    pub pvc: Option<PvcCoords>,
    pub message: String,
}

impl VolumeEvent {
    pub fn new(kind: EventKind, volume_id: &str, pvc: Option<PvcCoords>, message: String) -> Self {
        Self {
            kind,
            volume_id: volume_id.to_string(),
            pvc,
            message,
        }
    }

    pub fn migration_started(
        volume_id: &str,
        pvc: Option<PvcCoords>,
        source: &str,
        target: &str,
        timeout: Duration,
    ) -> Self {
        Self::new(
            EventKind::MigrationStarted,
            volume_id,
            pvc,
            format!(
                "live migration started from {} to {}, window {:?}",
                source, target, timeout
            ),
        )
    }

    pub fn migration_completed(
        volume_id: &str,
        pvc: Option<PvcCoords>,
        duration: Duration,
    ) -> Self {
        Self::new(
            EventKind::MigrationCompleted,
            volume_id,
            pvc,
            format!("live migration completed in {:?}", duration),
        )
    }

    pub fn migration_failed(
        volume_id: &str,
        pvc: Option<PvcCoords>,
        reason: &str,
        elapsed: Duration,
    ) -> Self {
        Self::new(
            EventKind::MigrationFailed,
            volume_id,
            pvc,
            format!("live migration failed: {} ({:?} elapsed)", reason, elapsed),
        )
    }
}

/// Receives events; implementations must be cheap and non-blocking.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: VolumeEvent);
}

/// Default sink: events go to the structured log.
#[derive(Debug, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn publish(&self, event: VolumeEvent) {
        let object = event
            .pvc
            .as_ref()
            .map(|pvc| pvc.to_string())
            .unwrap_or_else(|| event.volume_id.clone());
        match event.kind.severity() {
            Severity::Normal => info!(
                "event {} on {}: {}",
                event.kind.reason(),
                object,
                event.message
            ),
            Severity::Warning => warn!(
                "event {} on {}: {}",
                event.kind.reason(),
                object,
                event.message
            ),
        }
    }
}
