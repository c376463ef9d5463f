//! Node-side NVMe/TCP device handling: open the fabric session for a
//! published volume, discover the namespace device by NQN, and tear
//! the session down once nothing uses it.

use crate::{
    config::NodeConfig,
    error::Error,
    mount,
    volume::{CTX_ADDR, CTX_NQN, CTX_PORT},
};
use nvmeadm::{fabric::ConnectArgs, subsystem::Subsystem, NvmeError};
use std::{collections::HashMap, time::Duration};
use tokio::time::sleep;

/// connect retry schedule: initial 500 ms, doubling, capped at 8 s
const CONNECT_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(8);
/// sysfs poll cadence while waiting for a namespace to appear
const DISCOVERY_POLL: Duration = Duration::from_millis(500);

/// Connection coordinates of one exported volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvmeTarget {
    pub nqn: String,
    pub addr: String,
    pub port: u16,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DetachOutcome {
    /// session dropped
    Detached,
    /// there was no session for the nqn
    NotConnected,
    /// in-kernel holders exist; the session was left alone
    InUse { device: String, holders: Vec<String> },
}

impl NvmeTarget {
    /// Extract connection coordinates from a publish context.
    pub fn from_context(
        context: &HashMap<String, String>,
    ) -> Result<Self, Error> {
        let required = |key: &str| {
            context.get(key).cloned().ok_or_else(|| Error::InvalidParameter {
                text: format!("volume context is missing '{}'", key),
            })
        };
        let nqn = required(CTX_NQN)?;
        let addr = required(CTX_ADDR)?;
        let port = required(CTX_PORT)?;
        let port = port.parse::<u16>().map_err(|_| Error::InvalidParameter {
            text: format!("'{}' is not a valid nvme port", port),
        })?;
        Ok(Self { nqn, addr, port })
    }

    /// Device node of the namespace backing this target, if the
    /// session is live and the namespace has appeared.
    pub async fn find(&self) -> Result<Option<String>, Error> {
        let nqn = self.nqn.clone();
        tokio::task::spawn_blocking(move || lookup_device(&nqn))
            .await
            .map_err(|error| Error::Internal {
                text: format!("device lookup task failed: {}", error),
            })?
    }

    /// Ensure a live session and return the namespace device path.
    /// Connect retries transient failures; an existing session is
    /// success. After connect, sysfs is polled until the namespace
    /// shows up or the discovery deadline passes.
    pub async fn attach(&self, config: &NodeConfig) -> Result<String, Error> {
        if let Some(device) = self.find().await? {
            debug!("nqn {} already connected at {}", self.nqn, device);
            return Ok(device);
        }

        let attempts = config.connect_attempts.max(1);
        let mut delay = CONNECT_BACKOFF_INITIAL;
        for attempt in 1 ..= attempts {
            let args = ConnectArgs::new(
                &self.nqn,
                &self.addr,
                self.port,
                config.keep_alive_tmo,
            )
            .map_err(Error::from)?;

            let outcome =
                tokio::task::spawn_blocking(move || args.connect())
                    .await
                    .map_err(|error| Error::Internal {
                        text: format!("connect task failed: {}", error),
                    })?;

            match outcome {
                Ok(reply) => {
                    debug!("nvme connect {}: {}", self.nqn, reply);
                    break;
                }
                Err(NvmeError::ConnectInProgress { .. }) => {
                    debug!("nqn {} already connected", self.nqn);
                    break;
                }
                Err(error) if attempt < attempts => {
                    warn!(
                        "nvme connect {} attempt {}/{} failed: {}",
                        self.nqn, attempt, attempts, error
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(CONNECT_BACKOFF_CAP);
                }
                Err(error) => return Err(error.into()),
            }
        }

        self.wait_for_device(config.discovery_deadline()).await
    }

    async fn wait_for_device(
        &self,
        deadline: Duration,
    ) -> Result<String, Error> {
        let give_up = tokio::time::Instant::now() + deadline;
        loop {
            if let Some(device) = self.find().await? {
                info!("nqn {} exposed as {}", self.nqn, device);
                return Ok(device);
            }
            if tokio::time::Instant::now() >= give_up {
                return Err(Error::DeviceNotFound {
                    nqn: self.nqn.clone(),
                });
            }
            sleep(DISCOVERY_POLL).await;
        }
    }

    /// Drop the session unless in-kernel holders still use one of its
    /// namespaces. Mounts referencing the device count as holders.
    pub async fn detach(&self) -> Result<DetachOutcome, Error> {
        let nqn = self.nqn.clone();
        let subsystem =
            tokio::task::spawn_blocking(move || Subsystem::lookup(&nqn))
                .await
                .map_err(|error| Error::Internal {
                    text: format!("subsystem lookup task failed: {}", error),
                })?
                .map_err(Error::from)?;

        let subsystem = match subsystem {
            Some(subsystem) => subsystem,
            None => return Ok(DetachOutcome::NotConnected),
        };

        let devices = {
            let subsystem = subsystem.clone();
            tokio::task::spawn_blocking(move || subsystem.namespace_devices())
                .await
                .map_err(|error| Error::Internal {
                    text: format!("namespace scan task failed: {}", error),
                })?
                .map_err(Error::from)?
        };

        for device in &devices {
            let mut holders = Subsystem::device_holders(device);
            for entry in
                mount::device_mounts(device, Duration::from_secs(5)).await?
            {
                holders.push(format!("mount:{}", entry.dest.display()));
            }
            if !holders.is_empty() {
                info!(
                    "not disconnecting {}: {} is held by {:?}",
                    self.nqn, device, holders
                );
                return Ok(DetachOutcome::InUse {
                    device: device.clone(),
                    holders,
                });
            }
        }

        tokio::task::spawn_blocking(move || subsystem.disconnect())
            .await
            .map_err(|error| Error::Internal {
                text: format!("disconnect task failed: {}", error),
            })?
            .map_err(Error::from)?;
        info!("nqn {} disconnected", self.nqn);
        Ok(DetachOutcome::Detached)
    }
}

fn lookup_device(nqn: &str) -> Result<Option<String>, Error> {
    match Subsystem::lookup(nqn).map_err(Error::from)? {
        None => Ok(None),
        Some(subsystem) => {
            let devices =
                subsystem.namespace_devices().map_err(Error::from)?;
            Ok(devices.into_iter().next())
        }
    }
}

/// Reverse lookup: which NQN exposes this device node. Used when a
/// node restarts and must unstage a volume it no longer remembers.
pub async fn nqn_of_device(device: &str) -> Result<Option<String>, Error> {
    let device = device.to_string();
    tokio::task::spawn_blocking(move || {
        for subsystem in Subsystem::scan().map_err(Error::from)? {
            let devices =
                subsystem.namespace_devices().map_err(Error::from)?;
            if devices.iter().any(|entry| entry == &device) {
                return Ok(Some(subsystem.nqn));
            }
        }
        Ok(None)
    })
    .await
    .map_err(|error| Error::Internal {
        text: format!("subsystem scan task failed: {}", error),
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn context(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn target_from_complete_context() {
        let target = NvmeTarget::from_context(&context(&[
            (CTX_NQN, "nqn.2014-08.com.mikrotik:pvc-1"),
            (CTX_ADDR, "10.0.0.2"),
            (CTX_PORT, "4420"),
        ]))
        .unwrap();
        assert_eq!(target.nqn, "nqn.2014-08.com.mikrotik:pvc-1");
        assert_eq!(target.port, 4420);
    }

    #[test]
    fn missing_nqn_is_invalid_argument() {
        let err = NvmeTarget::from_context(&context(&[
            (CTX_ADDR, "10.0.0.2"),
            (CTX_PORT, "4420"),
        ]))
        .unwrap_err();
        assert_matches!(err, Error::InvalidParameter { .. });
        assert!(err.to_string().contains("nqn"));
    }

    #[test]
    fn bad_port_is_invalid_argument() {
        let err = NvmeTarget::from_context(&context(&[
            (CTX_NQN, "nqn.x"),
            (CTX_ADDR, "10.0.0.2"),
            (CTX_PORT, "not-a-port"),
        ]))
        .unwrap_err();
        assert_matches!(err, Error::InvalidParameter { .. });
    }

    #[tokio::test]
    async fn find_on_a_host_without_fabric_sessions_is_none() {
        // test machines have no fabric-attached controllers for this nqn
        let target = NvmeTarget {
            nqn: "nqn.2014-08.com.mikrotik:pvc-does-not-exist".to_string(),
            addr: "127.0.0.1".to_string(),
            port: 4420,
        };
        assert_eq!(target.find().await.unwrap(), None);
        assert_eq!(target.detach().await.unwrap(), DetachOutcome::NotConnected);
    }
}
