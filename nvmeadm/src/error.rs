use snafu::Snafu;

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum NvmeError {
    #[snafu(display("Fabric connect for nqn {} failed: {}", nqn, source))]
    ConnectFailed { nqn: String, source: std::io::Error },
    #[snafu(display("Connect already in progress for nqn {}", nqn))]
    ConnectInProgress { nqn: String },
    #[snafu(display("No fabric controller found for nqn {}", nqn))]
    NotConnected { nqn: String },
    #[snafu(display("No namespace device for nqn {}", nqn))]
    DeviceNotFound { nqn: String },
    #[snafu(display("Device {} is held by {}", device, holders.join(", ")))]
    DeviceInUse { device: String, holders: Vec<String> },
    #[snafu(display("File IO error on {}: {}", filename, source))]
    FileIo {
        filename: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to read sysfs attribute under {}: {}", path, source))]
    SysfsRead { path: String, source: std::io::Error },
    #[snafu(display("sysfs scan failed for {}: {}", pattern, source))]
    SysfsScan {
        pattern: String,
        source: glob::PatternError,
    },
    #[snafu(display("Invalid parameter: {}", text))]
    InvalidParam { text: String },
}

impl NvmeError {
    /// True for conditions a caller may safely retry after a short wait.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NvmeError::ConnectInProgress { .. } | NvmeError::ConnectFailed { .. }
        )
    }
}
