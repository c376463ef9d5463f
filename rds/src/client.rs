//! Typed appliance client: builds the RouterOS command set the driver
//! needs, executes it through the pooled channel with retry and the
//! circuit breaker, and parses replies into typed records.
//!
//! Appliance layout: every volume is a Btrfs subvolume
//! `<fs_label>/<volume-id>` holding a single backing file `disk.img`
//! that is exported as a file-backed disk over NVMe/TCP. Snapshots are
//! read-only subvolume snapshots of a volume's subvolume; restore is a
//! writable subvolume clone of a snapshot plus a fresh disk export.

use crate::{
    breaker::{BreakerState, CircuitBreaker},
    ident,
    parser::{parse_records, Record},
    pool::ConnectionPool,
    retry::RetryPolicy,
    session::{CommandOutput, Connector, RdsConfig, SshConnector},
    RdsError,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec,
    register_int_counter_vec,
    register_int_gauge,
    HistogramVec,
    IntCounterVec,
    IntGauge,
};
use std::{sync::Arc, time::Instant};

static COMMANDS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rds_commands_total",
        "Appliance commands issued, by verb and result",
        &["verb", "result"]
    )
    .unwrap()
});
static COMMAND_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "rds_command_duration_seconds",
        "Appliance command latency by verb",
        &["verb"]
    )
    .unwrap()
});
static BREAKER_STATE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "rds_breaker_open",
        "Appliance channel breaker state (0 closed, 1 open, 2 half-open)"
    )
    .unwrap()
});

/// A file-backed disk export on the appliance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdsDisk {
    /// the slot doubles as the volume id
    pub slot: String,
    pub file_path: String,
    pub size: u64,
    pub nqn: Option<String>,
    pub port: Option<u16>,
}

/// A Btrfs subvolume entry; snapshots and restored clones both appear
/// in this shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdsSubvolume {
    pub name: String,
    /// absent on some firmware revisions, reconstructed by the caller
    pub parent: Option<String>,
    pub read_only: bool,
    pub size: Option<u64>,
}

/// The appliance command surface consumed by the controller plane.
#[async_trait]
pub trait RdsOps: Send + Sync {
    async fn create_volume(
        &self,
        id: &str,
        size: u64,
    ) -> Result<RdsDisk, RdsError>;
    async fn get_volume(&self, id: &str) -> Result<Option<RdsDisk>, RdsError>;
    async fn list_volumes(&self) -> Result<Vec<RdsDisk>, RdsError>;
    async fn delete_volume(&self, id: &str) -> Result<(), RdsError>;
    async fn resize_volume(&self, id: &str, size: u64) -> Result<(), RdsError>;
    async fn free_bytes(&self) -> Result<u64, RdsError>;

    async fn create_snapshot(
        &self,
        snapshot_id: &str,
        volume_id: &str,
    ) -> Result<RdsSubvolume, RdsError>;
    async fn get_snapshot(
        &self,
        id: &str,
    ) -> Result<Option<RdsSubvolume>, RdsError>;
    async fn list_snapshots(&self) -> Result<Vec<RdsSubvolume>, RdsError>;
    async fn delete_snapshot(&self, id: &str) -> Result<(), RdsError>;
    async fn restore_snapshot(
        &self,
        snapshot_id: &str,
        new_volume_id: &str,
        size: u64,
    ) -> Result<RdsDisk, RdsError>;

    /// readiness probe of the command channel
    async fn probe(&self) -> Result<(), RdsError>;
    /// breaker state for observability
    fn breaker_state(&self) -> BreakerState;
}

enum Entity {
    Volume,
    Snapshot,
}

pub struct RdsClient<C: Connector = SshConnector> {
    config: RdsConfig,
    pool: ConnectionPool<C>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl RdsClient<SshConnector> {
    pub fn new(config: RdsConfig) -> Self {
        let connector = SshConnector::new(config.clone());
        Self::with_connector(config, connector)
    }
}

impl<C: Connector> RdsClient<C> {
    pub fn with_connector(config: RdsConfig, connector: C) -> Self {
        let pool = ConnectionPool::new(
            connector,
            config.max_connections,
            config.acquire_timeout(),
            config.command_timeout(),
        );
        let breaker = Arc::new(CircuitBreaker::new(
            "rds",
            config.breaker_threshold,
            std::time::Duration::from_secs(config.breaker_window_secs),
            std::time::Duration::from_secs(config.breaker_cooldown_secs),
        ));
        Self {
            config,
            pool,
            breaker,
            retry: RetryPolicy::default(),
        }
    }

    /// Drain and close the underlying pool.
    pub async fn close(&self, deadline: std::time::Duration) {
        self.pool.close(deadline).await;
    }

    /// Subsystem NQN a volume is exported under.
    pub fn volume_nqn(&self, id: &str) -> String {
        format!("{}{}", self.config.nqn_prefix, id)
    }

    fn volume_file_path(&self, id: &str) -> String {
        format!("{}/{}/disk.img", self.config.fs_label, id)
    }

    async fn execute(
        &self,
        verb: &'static str,
        command: String,
    ) -> Result<CommandOutput, RdsError> {
        if !self.breaker.allow() {
            BREAKER_STATE.set(self.breaker.state().as_gauge());
            COMMANDS_TOTAL.with_label_values(&[verb, "rejected"]).inc();
            return Err(RdsError::CircuitOpen {});
        }

        let start = Instant::now();
        let result = self
            .retry
            .run(|| self.pool.execute(command.clone()))
            .await;

        match &result {
            Err(error) if error.trips_breaker() => self.breaker.on_failure(),
            // a typed backend verdict still proves the channel works
            _ => self.breaker.on_success(),
        }
        BREAKER_STATE.set(self.breaker.state().as_gauge());

        let label = if result.is_ok() { "success" } else { "error" };
        COMMANDS_TOTAL.with_label_values(&[verb, label]).inc();
        COMMAND_DURATION
            .with_label_values(&[verb])
            .observe(start.elapsed().as_secs_f64());

        result
    }

    /// Turn backend verdict texts into typed errors. The raw output is
    /// logged but never embedded in the error shown upstream.
    fn check_output(
        &self,
        verb: &'static str,
        entity: Entity,
        id: &str,
        output: CommandOutput,
    ) -> Result<CommandOutput, RdsError> {
        let text = output.stdout.to_ascii_lowercase();

        if text.contains("no such item") || text.contains("no such disk") {
            return Err(match entity {
                Entity::Volume => RdsError::VolumeNotFound { id: id.to_string() },
                Entity::Snapshot => RdsError::SnapshotNotFound {
                    id: id.to_string(),
                },
            });
        }
        if text.contains("already have") || text.contains("already exists") {
            return Err(match entity {
                Entity::Volume => RdsError::VolumeExists { id: id.to_string() },
                Entity::Snapshot => RdsError::SnapshotExists {
                    id: id.to_string(),
                },
            });
        }
        if text.contains("not enough")
            || text.contains("no space")
            || text.contains("disk full")
        {
            return Err(RdsError::ResourceExhausted {
                text: "appliance reports insufficient space".to_string(),
            });
        }
        if output.exit_status != 0
            || text.contains("failure:")
            || text.contains("syntax error")
            || text.contains("bad command")
            || text.contains("expected end of command")
        {
            error!("appliance rejected '{}': {}", verb, output.stdout.trim());
            return Err(RdsError::CommandFailed {
                verb: verb.to_string(),
                detail: output.stdout.trim().to_string(),
            });
        }
        Ok(output)
    }

    fn disk_from_record(record: &Record) -> Result<RdsDisk, RdsError> {
        Ok(RdsDisk {
            slot: record.require("slot")?.to_string(),
            file_path: record
                .get("file-path")
                .unwrap_or_default()
                .to_string(),
            size: record.require_u64("file-size")?,
            nqn: record.get("nvme-tcp-server-nqn").map(String::from),
            port: record
                .get_u64("nvme-tcp-server-port")?
                .map(|port| port as u16),
        })
    }

    fn subvolume_from_record(
        record: &Record,
    ) -> Result<RdsSubvolume, RdsError> {
        Ok(RdsSubvolume {
            name: record.require("name")?.to_string(),
            parent: record.get("parent").map(String::from),
            read_only: record.get_bool("read-only")?.unwrap_or(false),
            size: record.get_u64("size")?,
        })
    }
}

#[async_trait]
impl<C: Connector> RdsOps for RdsClient<C> {
    async fn create_volume(
        &self,
        id: &str,
        size: u64,
    ) -> Result<RdsDisk, RdsError> {
        let id = ident::volume_id(id)?;
        let size = ident::size_bytes(size)?;
        let path = self.volume_file_path(id);
        ident::path_fragment(&path)?;
        let nqn = self.volume_nqn(id);
        ident::nqn(&nqn)?;

        // the volume lives in its own subvolume so it can be
        // snapshotted independently
        let subvol = format!(
            "/disk/btrfs/subvolume/add fs={} name={}",
            self.config.fs_label, id
        );
        let output = self.execute("subvolume-add", subvol).await?;
        match self.check_output("subvolume-add", Entity::Volume, id, output) {
            // an existing empty subvolume is a leftover of a failed
            // create; reusing it keeps the operation idempotent
            Ok(_) | Err(RdsError::VolumeExists { .. }) => {}
            Err(error) => return Err(error),
        }

        let command = format!(
            "/disk add type=file file-path={} file-size={} slot={} \
             nvme-tcp-export=yes nvme-tcp-server-port={} nvme-tcp-server-nqn={}",
            path, size, id, self.config.nvme_port, nqn
        );
        let output = self.execute("disk-add", command).await?;
        self.check_output("disk-add", Entity::Volume, id, output)?;

        info!("created volume {} ({} bytes)", id, size);
        Ok(RdsDisk {
            slot: id.to_string(),
            file_path: path,
            size,
            nqn: Some(nqn),
            port: Some(self.config.nvme_port),
        })
    }

    async fn get_volume(&self, id: &str) -> Result<Option<RdsDisk>, RdsError> {
        let id = ident::volume_id(id)?;
        let command = format!("/disk print detail where slot={}", id);
        let output = self.execute("disk-print", command).await?;
        let output =
            self.check_output("disk-print", Entity::Volume, id, output)?;

        let records = parse_records(&output.stdout)?;
        match records.first() {
            None => Ok(None),
            Some(record) => Ok(Some(Self::disk_from_record(record)?)),
        }
    }

    async fn list_volumes(&self) -> Result<Vec<RdsDisk>, RdsError> {
        let command = "/disk print detail where type=file".to_string();
        let output = self.execute("disk-list", command).await?;
        let output =
            self.check_output("disk-list", Entity::Volume, "", output)?;

        let mut disks = Vec::new();
        for record in parse_records(&output.stdout)? {
            if record
                .get("slot")
                .map(|slot| slot.starts_with("pvc-"))
                .unwrap_or(false)
            {
                disks.push(Self::disk_from_record(&record)?);
            }
        }
        disks.sort_by(|a, b| a.slot.cmp(&b.slot));
        Ok(disks)
    }

    async fn delete_volume(&self, id: &str) -> Result<(), RdsError> {
        let id = ident::volume_id(id)?;

        let command = format!("/disk remove [find slot={}]", id);
        let output = self.execute("disk-remove", command).await?;
        let removed =
            self.check_output("disk-remove", Entity::Volume, id, output);

        // the backing subvolume goes too, even when the export was
        // already gone; a delete must leave no residue behind
        let command = format!(
            "/disk/btrfs/subvolume/remove [find name={}]",
            id
        );
        let output = self.execute("subvolume-remove", command).await?;
        match self.check_output("subvolume-remove", Entity::Volume, id, output)
        {
            Ok(_) | Err(RdsError::VolumeNotFound { .. }) => {}
            Err(error) => return Err(error),
        }

        removed?;
        info!("deleted volume {}", id);
        Ok(())
    }

    async fn resize_volume(&self, id: &str, size: u64) -> Result<(), RdsError> {
        let id = ident::volume_id(id)?;
        let size = ident::size_bytes(size)?;
        let command =
            format!("/disk set [find slot={}] file-size={}", id, size);
        let output = self.execute("disk-set", command).await?;
        self.check_output("disk-set", Entity::Volume, id, output)?;
        info!("resized volume {} to {} bytes", id, size);
        Ok(())
    }

    async fn free_bytes(&self) -> Result<u64, RdsError> {
        let command = format!(
            "/file print detail where name={}",
            self.config.fs_label
        );
        let output = self.execute("file-print", command).await?;
        let output =
            self.check_output("file-print", Entity::Volume, "", output)?;

        let records = parse_records(&output.stdout)?;
        let record = records.first().ok_or_else(|| RdsError::Parse {
            text: format!(
                "backing filesystem '{}' not reported by the appliance",
                self.config.fs_label
            ),
        })?;
        // field name varies across RouterOS revisions
        match record.get_u64("free-space")? {
            Some(free) => Ok(free),
            None => record.require_u64("free"),
        }
    }

    async fn create_snapshot(
        &self,
        snapshot_id: &str,
        volume_id: &str,
    ) -> Result<RdsSubvolume, RdsError> {
        let snapshot_id = ident::snapshot_id(snapshot_id)?;
        let volume_id = ident::volume_id(volume_id)?;

        let command = format!(
            "/disk/btrfs/subvolume/add read-only=yes parent={} fs={} name={}",
            volume_id, self.config.fs_label, snapshot_id
        );
        let output = self.execute("snapshot-add", command).await?;
        self.check_output(
            "snapshot-add",
            Entity::Snapshot,
            snapshot_id,
            output,
        )?;

        info!("created snapshot {} of {}", snapshot_id, volume_id);
        Ok(RdsSubvolume {
            name: snapshot_id.to_string(),
            parent: Some(volume_id.to_string()),
            read_only: true,
            size: None,
        })
    }

    async fn get_snapshot(
        &self,
        id: &str,
    ) -> Result<Option<RdsSubvolume>, RdsError> {
        let id = ident::snapshot_id(id)?;
        let command =
            format!("/disk/btrfs/subvolume/print detail where name={}", id);
        let output = self.execute("snapshot-print", command).await?;
        let output =
            self.check_output("snapshot-print", Entity::Snapshot, id, output)?;

        let records = parse_records(&output.stdout)?;
        match records.first() {
            None => Ok(None),
            Some(record) => Ok(Some(Self::subvolume_from_record(record)?)),
        }
    }

    async fn list_snapshots(&self) -> Result<Vec<RdsSubvolume>, RdsError> {
        let command =
            "/disk/btrfs/subvolume/print detail where name~\"snap-\""
                .to_string();
        let output = self.execute("snapshot-list", command).await?;
        let output =
            self.check_output("snapshot-list", Entity::Snapshot, "", output)?;

        let mut snapshots = Vec::new();
        for record in parse_records(&output.stdout)? {
            let subvolume = Self::subvolume_from_record(&record)?;
            if subvolume.name.starts_with("snap-") {
                snapshots.push(subvolume);
            }
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }

    async fn delete_snapshot(&self, id: &str) -> Result<(), RdsError> {
        let id = ident::snapshot_id(id)?;
        let command =
            format!("/disk/btrfs/subvolume/remove [find name={}]", id);
        let output = self.execute("snapshot-remove", command).await?;
        self.check_output("snapshot-remove", Entity::Snapshot, id, output)?;
        info!("deleted snapshot {}", id);
        Ok(())
    }

    async fn restore_snapshot(
        &self,
        snapshot_id: &str,
        new_volume_id: &str,
        size: u64,
    ) -> Result<RdsDisk, RdsError> {
        let snapshot_id = ident::snapshot_id(snapshot_id)?;
        let new_volume_id = ident::volume_id(new_volume_id)?;
        let size = ident::size_bytes(size)?;

        // writable clone of the snapshot subvolume
        let command = format!(
            "/disk/btrfs/subvolume/add parent={} fs={} name={}",
            snapshot_id, self.config.fs_label, new_volume_id
        );
        let output = self.execute("subvolume-clone", command).await?;
        self.check_output(
            "subvolume-clone",
            Entity::Snapshot,
            snapshot_id,
            output,
        )?;

        // export the cloned backing file; file-size also grows the
        // clone when the requested capacity exceeds the snapshot
        let path = self.volume_file_path(new_volume_id);
        let nqn = self.volume_nqn(new_volume_id);
        ident::nqn(&nqn)?;
        let command = format!(
            "/disk add type=file file-path={} file-size={} slot={} \
             nvme-tcp-export=yes nvme-tcp-server-port={} nvme-tcp-server-nqn={}",
            path, size, new_volume_id, self.config.nvme_port, nqn
        );
        let output = self.execute("disk-add", command).await?;
        self.check_output("disk-add", Entity::Volume, new_volume_id, output)?;

        info!(
            "restored snapshot {} into volume {} ({} bytes)",
            snapshot_id, new_volume_id, size
        );
        Ok(RdsDisk {
            slot: new_volume_id.to_string(),
            file_path: path,
            size,
            nqn: Some(nqn),
            port: Some(self.config.nvme_port),
        })
    }

    async fn probe(&self) -> Result<(), RdsError> {
        let output = self.execute("probe", ":put \"ok\"".to_string()).await?;
        if output.exit_status == 0 && output.stdout.contains("ok") {
            Ok(())
        } else {
            Err(RdsError::CommandFailed {
                verb: "probe".to_string(),
                detail: output.stdout,
            })
        }
    }

    fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Transport;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::{collections::VecDeque, sync::Arc, time::Duration};

    const VOL: &str = "pvc-5bcf13d7-9c36-5a2c-9d5e-cafe00112233";
    const SNAP: &str = "snap-0f5a1b2c-3d4e-5f60-7182-93a4b5c6d7e8";

    /// Scripted appliance: pops one canned reply per command and
    /// records what was sent.
    #[derive(Default)]
    struct Script {
        replies: Mutex<VecDeque<CommandOutput>>,
        sent: Mutex<Vec<String>>,
    }

    impl Script {
        fn push(&self, stdout: &str) {
            self.replies.lock().push_back(CommandOutput {
                stdout: stdout.to_string(),
                exit_status: 0,
            });
        }
        fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    struct ScriptConn(Arc<Script>);

    impl Transport for ScriptConn {
        fn exec(&mut self, command: &str) -> Result<CommandOutput, RdsError> {
            self.0.sent.lock().push(command.to_string());
            Ok(self.0.replies.lock().pop_front().unwrap_or(CommandOutput {
                stdout: String::new(),
                exit_status: 0,
            }))
        }
        fn healthy(&mut self) -> bool {
            true
        }
    }

    impl Connector for Arc<Script> {
        type Conn = ScriptConn;
        fn connect(&self) -> Result<ScriptConn, RdsError> {
            Ok(ScriptConn(self.clone()))
        }
    }

    fn client(script: Arc<Script>) -> RdsClient<Arc<Script>> {
        let mut config = RdsConfig::default();
        config.command_timeout_secs = 2;
        config.acquire_timeout_secs = 1;
        RdsClient::with_connector(config, script)
    }

    #[tokio::test]
    async fn create_volume_issues_subvolume_then_disk_add() {
        let script = Arc::new(Script::default());
        script.push("");
        script.push("");
        let c = client(script.clone());

        let disk = c.create_volume(VOL, 1073741824).await.unwrap();
        assert_eq!(disk.slot, VOL);
        assert_eq!(disk.size, 1073741824);
        assert_eq!(disk.port, Some(4420));
        assert_eq!(
            disk.nqn.as_deref(),
            Some(format!("nqn.2014-08.com.mikrotik:{}", VOL).as_str())
        );

        let sent = script.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].starts_with("/disk/btrfs/subvolume/add fs=rds1"));
        assert!(sent[1].contains("type=file"));
        assert!(sent[1].contains(&format!("slot={}", VOL)));
        assert!(sent[1].contains("nvme-tcp-export=yes"));
    }

    #[tokio::test]
    async fn create_volume_rejects_bad_id_without_transport() {
        let script = Arc::new(Script::default());
        let c = client(script.clone());
        let err = c
            .create_volume("pvc-1; /system reset", 1024)
            .await
            .unwrap_err();
        assert_matches!(err, RdsError::InvalidParameter { .. });
        assert!(script.sent().is_empty());
    }

    #[tokio::test]
    async fn get_volume_parses_detail_output() {
        let script = Arc::new(Script::default());
        script.push(&format!(
            " 0   slot=\"{}\" type=\"file\"\n     file-path=\"rds1/{}/disk.img\"\n     file-size=2147483648 nvme-tcp-export=yes nvme-tcp-server-port=4420\n     nvme-tcp-server-nqn=\"nqn.2014-08.com.mikrotik:{}\"\n",
            VOL, VOL, VOL
        ));
        let c = client(script);

        let disk = c.get_volume(VOL).await.unwrap().unwrap();
        assert_eq!(disk.size, 2147483648);
        assert_eq!(disk.file_path, format!("rds1/{}/disk.img", VOL));
    }

    #[tokio::test]
    async fn get_volume_empty_output_is_none() {
        let script = Arc::new(Script::default());
        script.push("");
        let c = client(script);
        assert!(c.get_volume(VOL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backend_verdicts_map_to_typed_errors() {
        let script = Arc::new(Script::default());
        script.push("failure: no such item");
        let c = client(script);
        assert_matches!(
            c.resize_volume(VOL, 2048).await.unwrap_err(),
            RdsError::VolumeNotFound { .. }
        );

        let script = Arc::new(Script::default());
        script.push("failure: not enough disk space");
        script.push("");
        let c = client(script);
        assert_matches!(
            c.create_volume(VOL, 1024).await.unwrap_err(),
            RdsError::ResourceExhausted { .. }
        );
    }

    #[tokio::test]
    async fn list_volumes_filters_foreign_slots() {
        let script = Arc::new(Script::default());
        script.push(&format!(
            " 0   slot=\"{}\" type=\"file\" file-size=1048576\n\n 1   slot=\"scratch\" type=\"file\" file-size=2048\n",
            VOL
        ));
        let c = client(script);
        let disks = c.list_volumes().await.unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].slot, VOL);
    }

    #[tokio::test]
    async fn snapshot_round_trip_commands() {
        let script = Arc::new(Script::default());
        script.push("");
        let c = client(script.clone());

        let snapshot = c.create_snapshot(SNAP, VOL).await.unwrap();
        assert!(snapshot.read_only);
        assert_eq!(snapshot.parent.as_deref(), Some(VOL));

        let sent = script.sent();
        assert!(sent[0].contains("read-only=yes"));
        assert!(sent[0].contains(&format!("parent={}", VOL)));
        assert!(sent[0].contains(&format!("name={}", SNAP)));
    }

    #[tokio::test]
    async fn free_bytes_accepts_both_field_spellings() {
        let script = Arc::new(Script::default());
        script.push("name=\"rds1\" type=\"disk\" free-space=107374182400");
        let c = client(script);
        assert_eq!(c.free_bytes().await.unwrap(), 107374182400);

        let script = Arc::new(Script::default());
        script.push("name=\"rds1\" type=\"disk\" free=55");
        let c = client(script);
        assert_eq!(c.free_bytes().await.unwrap(), 55);
    }

    #[tokio::test]
    async fn breaker_opens_after_repeated_transport_failures() {
        struct FailConn;
        impl Transport for FailConn {
            fn exec(
                &mut self,
                _command: &str,
            ) -> Result<CommandOutput, RdsError> {
                Err(RdsError::Transport {
                    context: "exec".to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "refused",
                    ),
                })
            }
            fn healthy(&mut self) -> bool {
                false
            }
        }
        struct FailConnector;
        impl Connector for FailConnector {
            type Conn = FailConn;
            fn connect(&self) -> Result<FailConn, RdsError> {
                Ok(FailConn)
            }
        }

        let mut config = RdsConfig::default();
        config.breaker_threshold = 2;
        config.breaker_cooldown_secs = 60;
        config.command_timeout_secs = 2;
        let c = RdsClient::with_connector(config, FailConnector);

        // each probe retries internally, so one call is enough to trip
        assert!(c.probe().await.is_err());
        assert!(c.probe().await.is_err());
        assert_eq!(c.breaker_state(), BreakerState::Open);
        assert_matches!(
            c.probe().await.unwrap_err(),
            RdsError::CircuitOpen {}
        );
    }
}
