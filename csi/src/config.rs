//! Driver configuration. Everything tunable carries a default that
//! matches the documented behavior, so an empty file is a valid
//! configuration for a lab setup with the appliance on localhost.

use crate::error::Error;
use rds::RdsConfig;
use serde::Deserialize;
use std::{path::Path, time::Duration};

fn default_driver_name() -> String {
    "rds.csi.mikrotik.com".to_string()
}
fn default_node_id() -> String {
    "unknown".to_string()
}
fn default_plugin_prefix() -> String {
    "/var/lib/kubelet".to_string()
}
fn default_migration_timeout() -> u64 {
    300
}
fn default_reconcile_period() -> u64 {
    60
}
fn default_orphan_grace() -> u64 {
    24 * 3600
}
fn default_shutdown_drain() -> u64 {
    30
}
fn default_mount_deadline() -> u64 {
    30
}
fn default_probe_deadline() -> u64 {
    30
}
fn default_format_deadline() -> u64 {
    120
}
fn default_resize_deadline() -> u64 {
    60
}
fn default_discovery_deadline() -> u64 {
    30
}
fn default_connect_attempts() -> u32 {
    5
}
fn default_keep_alive_tmo() -> u32 {
    5
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_window() -> u64 {
    120
}
fn default_breaker_cooldown() -> u64 {
    30
}
fn default_max_sessions() -> u32 {
    128
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// plugin name advertised through the identity surface
    pub name: String,
    /// kubernetes node name this instance runs on (node mode)
    pub node_id: String,
    /// staging and publish paths must live under this prefix
    pub plugin_prefix: String,
    pub shutdown_drain_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: default_driver_name(),
            node_id: default_node_id(),
            plugin_prefix: default_plugin_prefix(),
            shutdown_drain_secs: default_shutdown_drain(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// default migration window; per-volume override via storage class
    pub migration_timeout_secs: u64,
    pub reconcile_period_secs: u64,
    pub orphan_grace_secs: u64,
    /// orphan volumes are only flagged unless this is set
    pub delete_orphans: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            migration_timeout_secs: default_migration_timeout(),
            reconcile_period_secs: default_reconcile_period(),
            orphan_grace_secs: default_orphan_grace(),
            delete_orphans: false,
        }
    }
}

impl ControllerConfig {
    pub fn migration_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_timeout_secs)
    }
    pub fn reconcile_period(&self) -> Duration {
        Duration::from_secs(self.reconcile_period_secs)
    }
    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// watchdog for each mount-table syscall
    pub mount_deadline_secs: u64,
    /// deadline for the read-only filesystem check
    pub probe_deadline_secs: u64,
    pub format_deadline_secs: u64,
    pub resize_deadline_secs: u64,
    /// how long to poll sysfs for a namespace after connect
    pub discovery_deadline_secs: u64,
    pub connect_attempts: u32,
    pub keep_alive_tmo: u32,
    /// per-volume breaker guarding stage/publish retry storms
    pub breaker_threshold: u32,
    pub breaker_window_secs: u64,
    pub breaker_cooldown_secs: u64,
    /// advertised ceiling on concurrently staged volumes
    pub max_sessions: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mount_deadline_secs: default_mount_deadline(),
            probe_deadline_secs: default_probe_deadline(),
            format_deadline_secs: default_format_deadline(),
            resize_deadline_secs: default_resize_deadline(),
            discovery_deadline_secs: default_discovery_deadline(),
            connect_attempts: default_connect_attempts(),
            keep_alive_tmo: default_keep_alive_tmo(),
            breaker_threshold: default_breaker_threshold(),
            breaker_window_secs: default_breaker_window(),
            breaker_cooldown_secs: default_breaker_cooldown(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl NodeConfig {
    pub fn mount_deadline(&self) -> Duration {
        Duration::from_secs(self.mount_deadline_secs)
    }
    pub fn probe_deadline(&self) -> Duration {
        Duration::from_secs(self.probe_deadline_secs)
    }
    pub fn format_deadline(&self) -> Duration {
        Duration::from_secs(self.format_deadline_secs)
    }
    pub fn resize_deadline(&self) -> Duration {
        Duration::from_secs(self.resize_deadline_secs)
    }
    pub fn discovery_deadline(&self) -> Duration {
        Duration::from_secs(self.discovery_deadline_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub driver: DriverConfig,
    pub rds: RdsConfig,
    pub controller: ControllerConfig,
    pub node: NodeConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|error| {
            Error::InvalidParameter {
                text: format!(
                    "cannot read config {}: {}",
                    path.as_ref().display(),
                    error
                ),
            }
        })?;
        serde_yaml::from_str(&text).map_err(|error| Error::InvalidParameter {
            text: format!("malformed config: {}", error),
        })
    }
}
