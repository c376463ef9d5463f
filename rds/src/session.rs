//! Blocking SSH sessions against the appliance. Sessions are owned by
//! the connection pool and only ever driven from the blocking thread
//! pool; the async side sees leases, never raw sockets.

use crate::{
    error::{SshSnafu, TransportSnafu},
    RdsError,
};
use serde::Deserialize;
use snafu::ResultExt;
use ssh2::Session;
use std::{
    io::Read,
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

/// health check command: cheap, side-effect free, fixed reply
const ECHO_PROBE: &str = ":put \"ok\"";

fn default_port() -> u16 {
    22
}
fn default_username() -> String {
    "admin".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_command_timeout() -> u64 {
    30
}
fn default_max_connections() -> usize {
    8
}
fn default_acquire_timeout() -> u64 {
    10
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_window() -> u64 {
    60
}
fn default_breaker_cooldown() -> u64 {
    30
}
fn default_fs_label() -> String {
    "rds1".to_string()
}
fn default_nqn_prefix() -> String {
    "nqn.2014-08.com.mikrotik:".to_string()
}
fn default_nvme_port() -> u16 {
    4420
}

/// Connection and command-channel configuration for one appliance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RdsConfig {
    /// appliance address for both SSH and NVMe/TCP
    pub address: String,
    #[serde(default = "default_port")]
    pub ssh_port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    /// key-based auth only, no password fallback
    pub private_key: PathBuf,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_window")]
    pub breaker_window_secs: u64,
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,
    /// Btrfs filesystem label; also the mount point under which every
    /// volume lives as its own subvolume
    #[serde(default = "default_fs_label")]
    pub fs_label: String,
    /// prefix for per-volume subsystem NQNs
    #[serde(default = "default_nqn_prefix")]
    pub nqn_prefix: String,
    /// NVMe/TCP port volumes are exported on
    #[serde(default = "default_nvme_port")]
    pub nvme_port: u16,
}

impl Default for RdsConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            ssh_port: default_port(),
            username: default_username(),
            private_key: PathBuf::from("/etc/rds-csi/id_ed25519"),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
            breaker_threshold: default_breaker_threshold(),
            breaker_window_secs: default_breaker_window(),
            breaker_cooldown_secs: default_breaker_cooldown(),
            fs_label: default_fs_label(),
            nqn_prefix: default_nqn_prefix(),
            nvme_port: default_nvme_port(),
        }
    }
}

impl RdsConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Output of one executed command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_status: i32,
}

/// One leased connection. Implemented by the SSH session and by test
/// doubles; every method blocks and must run on the blocking pool.
pub trait Transport: Send {
    fn exec(&mut self, command: &str) -> Result<CommandOutput, RdsError>;
    /// cheap liveness probe run when a lease is returned
    fn healthy(&mut self) -> bool;
}

/// Creates connections for the pool.
pub trait Connector: Send + Sync + 'static {
    type Conn: Transport + 'static;
    fn connect(&self) -> Result<Self::Conn, RdsError>;
}

/// A live SSH session to the appliance.
pub struct SshSession {
    session: Session,
}

impl SshSession {
    pub fn connect(config: &RdsConfig) -> Result<Self, RdsError> {
        let address = format!("{}:{}", config.address, config.ssh_port);
        let socket_addrs: Vec<_> = address
            .as_str()
            .to_socket_addrs()
            .context(TransportSnafu {
                context: format!("resolving {}", config.address),
            })?
            .collect();

        let addr = socket_addrs.first().ok_or_else(|| {
            RdsError::InvalidParameter {
                text: format!("address '{}' did not resolve", config.address),
            }
        })?;

        let tcp = TcpStream::connect_timeout(addr, config.connect_timeout())
            .context(TransportSnafu {
                context: format!("connecting to {}", config.address),
            })?;
        tcp.set_read_timeout(Some(config.command_timeout())).context(
            TransportSnafu {
                context: "setting socket timeout".to_string(),
            },
        )?;

        let mut session = Session::new().context(SshSnafu {
            context: "creating session".to_string(),
        })?;
        session.set_tcp_stream(tcp);
        session.set_timeout(config.command_timeout().as_millis() as u32);
        session.handshake().context(SshSnafu {
            context: "ssh handshake".to_string(),
        })?;
        session
            .userauth_pubkey_file(
                &config.username,
                None,
                Path::new(&config.private_key),
                None,
            )
            .context(SshSnafu {
                context: "public key authentication".to_string(),
            })?;

        debug!("ssh session established to {}", config.address);
        Ok(Self { session })
    }
}

impl Transport for SshSession {
    fn exec(&mut self, command: &str) -> Result<CommandOutput, RdsError> {
        let mut channel =
            self.session.channel_session().context(SshSnafu {
                context: "opening channel".to_string(),
            })?;
        channel.exec(command).context(SshSnafu {
            context: "dispatching command".to_string(),
        })?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).context(TransportSnafu {
            context: "reading command output".to_string(),
        })?;
        let mut stderr = String::new();
        // RouterOS reports errors on stdout; stderr is drained so the
        // channel can close
        let _ = channel.stderr().read_to_string(&mut stderr);

        channel.wait_close().context(SshSnafu {
            context: "closing channel".to_string(),
        })?;
        let exit_status = channel.exit_status().context(SshSnafu {
            context: "reading exit status".to_string(),
        })?;

        if !stderr.is_empty() {
            stdout.push('\n');
            stdout.push_str(&stderr);
        }
        Ok(CommandOutput {
            stdout,
            exit_status,
        })
    }

    fn healthy(&mut self) -> bool {
        match self.exec(ECHO_PROBE) {
            Ok(output) => {
                output.exit_status == 0 && output.stdout.contains("ok")
            }
            Err(_) => false,
        }
    }
}

/// Default connector used outside of tests.
pub struct SshConnector {
    config: RdsConfig,
}

impl SshConnector {
    pub fn new(config: RdsConfig) -> Self {
        Self { config }
    }
}

impl Connector for SshConnector {
    type Conn = SshSession;

    fn connect(&self) -> Result<SshSession, RdsError> {
        SshSession::connect(&self.config)
    }
}
