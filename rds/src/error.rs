use snafu::Snafu;

/// Error taxonomy of the RDS command channel. Variants are independent
/// of any transport the CSI layer maps them onto; `is_transient`
/// decides retriability and the circuit breaker counts only transport
/// conditions.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum RdsError {
    #[snafu(display("Volume '{}' not found on the appliance", id))]
    VolumeNotFound { id: String },
    #[snafu(display("Volume '{}' already exists", id))]
    VolumeExists { id: String },
    #[snafu(display("Snapshot '{}' not found on the appliance", id))]
    SnapshotNotFound { id: String },
    #[snafu(display("Snapshot '{}' already exists", id))]
    SnapshotExists { id: String },
    #[snafu(display("Invalid parameter: {}", text))]
    InvalidParameter { text: String },
    #[snafu(display("Appliance is out of resources: {}", text))]
    ResourceExhausted { text: String },
    #[snafu(display("Operation timed out: {}", text))]
    OperationTimeout { text: String },
    #[snafu(display("SSH transport error during {}: {}", context, source))]
    Ssh { context: String, source: ssh2::Error },
    #[snafu(display("Transport error during {}: {}", context, source))]
    Transport {
        context: String,
        source: std::io::Error,
    },
    #[snafu(display("Command '{}' rejected by the appliance", verb))]
    CommandFailed { verb: String, detail: String },
    #[snafu(display("Failed to parse appliance output: {}", text))]
    Parse { text: String },
    #[snafu(display("Circuit breaker is open, appliance presumed unavailable"))]
    CircuitOpen {},
    #[snafu(display("Connection pool is shut down"))]
    PoolClosed {},
}

impl RdsError {
    /// True for transport-level conditions worth an internal retry:
    /// refused connects, mid-command EOF, socket timeouts. Backend
    /// verdicts (not found, exists, out of space) and parse errors are
    /// final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RdsError::Ssh { .. }
                | RdsError::Transport { .. }
                | RdsError::OperationTimeout { .. }
        )
    }

    /// True when the failure should count against the circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        self.is_transient()
    }
}
