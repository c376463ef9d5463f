//! Core of a CSI driver provisioning block storage from MikroTik
//! RouterOS RDS appliances (Btrfs-backed, NVMe/TCP-exported disks
//! driven over SSH).
//!
//! The crate ships both deployment planes. The controller plane owns
//! volume and snapshot lifecycle on the appliance plus attachment
//! bookkeeping with bounded dual-attach for live migration; the node
//! plane owns NVMe sessions, staging mounts and pod publishing on one
//! host. Transport adapters (gRPC, Kubernetes objects, metric
//! serving) live outside this crate and consume the services defined
//! here.

#[macro_use]
extern crate tracing;

pub mod attach;
pub mod block_vol;
pub mod config;
pub mod controller;
pub mod dev;
pub mod error;
pub mod events;
pub mod filesystem_vol;
pub mod format;
pub mod identity;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod reconcile;
pub mod shutdown;
pub mod snapshot;
pub mod volume;

pub use config::Config;
pub use error::{Code, Error};
