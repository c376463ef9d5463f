//! Identity surface: plugin info, plugin capabilities and readiness.

use crate::error::Error;
use rds::{BreakerState, RdsOps};
use std::sync::Arc;

pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginCapability {
    ControllerService,
    VolumeExpansionOnline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}

pub struct IdentityService {
    name: String,
    /// present in controller mode; the node plane has no appliance
    /// channel to probe
    rds: Option<Arc<dyn RdsOps>>,
}

impl IdentityService {
    pub fn new(name: &str, rds: Option<Arc<dyn RdsOps>>) -> Self {
        Self {
            name: name.to_string(),
            rds,
        }
    }

    pub fn get_plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            version: PLUGIN_VERSION.to_string(),
        }
    }

    pub fn get_plugin_capabilities(&self) -> Vec<PluginCapability> {
        vec![
            PluginCapability::ControllerService,
            PluginCapability::VolumeExpansionOnline,
        ]
    }

    /// Readiness. In controller mode the appliance channel is probed
    /// unless its breaker already knows the answer.
    pub async fn probe(&self) -> Result<bool, Error> {
        match &self.rds {
            None => Ok(true),
            Some(rds) => {
                if rds.breaker_state() == BreakerState::Open {
                    return Ok(false);
                }
                match rds.probe().await {
                    Ok(()) => Ok(true),
                    Err(error) => {
                        warn!("readiness probe failed: {}", error);
                        Ok(false)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn node_mode_is_always_ready() {
        let identity = IdentityService::new("rds.csi.mikrotik.com", None);
        assert!(identity.probe().await.unwrap());
        assert_eq!(identity.get_plugin_info().name, "rds.csi.mikrotik.com");
    }
}
