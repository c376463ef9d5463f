//! Command channel to a MikroTik RouterOS "RDS" appliance.
//!
//! The appliance is driven over SSH with RouterOS CLI commands and is
//! the source of truth for volumes (file-backed disks exported over
//! NVMe/TCP) and snapshots (Btrfs subvolumes). This crate provides the
//! transport (a bounded connection pool with per-command leases), the
//! guard rails (identifier sanitization, retry with backoff, a circuit
//! breaker) and a typed client for the command set the CSI driver
//! needs.

#[macro_use]
extern crate tracing;

pub mod breaker;
pub mod client;
pub mod error;
pub mod ident;
pub mod parser;
pub mod pool;
pub mod retry;
pub mod session;

pub use breaker::{BreakerState, CircuitBreaker};
pub use client::{RdsClient, RdsDisk, RdsOps, RdsSubvolume};
pub use error::RdsError;
pub use session::RdsConfig;
