//! Fabric-attached subsystem state, read from sysfs.

use crate::{
    error::{FileIoSnafu, SysfsReadSnafu, SysfsScanSnafu},
    parse_value,
    NvmeError,
    SYSFS_FABRICS_CTL,
};
use glob::glob;
use snafu::ResultExt;
use std::{fs::OpenOptions, io::Write, path::Path};

/// One fabric-attached NVMe controller.
#[derive(Debug, Clone)]
pub struct Subsystem {
    /// controller name, e.g. `nvme3`
    pub name: String,
    /// controller instance number
    pub instance: u32,
    /// subsystem NQN the controller is connected to
    pub nqn: String,
    /// connection state as reported by the kernel, `live` when healthy
    pub state: String,
    /// transport in use, always `tcp` for this driver
    pub transport: String,
    /// `traddr=...,trsvcid=...` of the far end
    pub address: String,
}

impl Subsystem {
    fn from_sysfs(source: &Path) -> Result<Self, NvmeError> {
        let name = source
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        let instance = name
            .trim_start_matches("nvme")
            .parse::<u32>()
            .map_err(|_| NvmeError::SysfsRead {
                path: source.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "controller name is not nvme<N>",
                ),
            })?;

        let read = |file: &str| {
            parse_value::<String>(source, file).context(SysfsReadSnafu {
                path: source.display().to_string(),
            })
        };

        Ok(Self {
            name,
            instance,
            nqn: read("subsysnqn")?,
            state: read("state")?,
            transport: read("transport")?,
            address: read("address")?,
        })
    }

    /// All fabric-attached controllers on this host.
    pub fn scan() -> Result<Vec<Subsystem>, NvmeError> {
        let pattern = format!("{}/nvme*", SYSFS_FABRICS_CTL);
        let entries = glob(&pattern).context(SysfsScanSnafu {
            pattern: pattern.clone(),
        })?;

        let mut subsystems = Vec::new();
        for path in entries.flatten() {
            // a controller can vanish mid-scan during disconnect
            if let Ok(subsystem) = Subsystem::from_sysfs(&path) {
                subsystems.push(subsystem);
            }
        }
        Ok(subsystems)
    }

    /// Locate the controller serving the given NQN, if any.
    pub fn lookup(nqn: &str) -> Result<Option<Subsystem>, NvmeError> {
        Ok(Self::scan()?.into_iter().find(|s| s.nqn == nqn))
    }

    /// Block device nodes of the namespaces behind this controller,
    /// e.g. `/dev/nvme3n1`. Sorted so that the first entry is stable
    /// across rescans.
    pub fn namespace_devices(&self) -> Result<Vec<String>, NvmeError> {
        let pattern = format!(
            "{}/{}/nvme*",
            SYSFS_FABRICS_CTL, self.name
        );
        let entries = glob(&pattern).context(SysfsScanSnafu {
            pattern: pattern.clone(),
        })?;

        let mut devices: Vec<String> = entries
            .flatten()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?.to_string();
                if is_namespace_name(&name) {
                    Some(format!("/dev/{}", name))
                } else {
                    None
                }
            })
            .collect();
        devices.sort();
        Ok(devices)
    }

    /// Names of in-kernel holders of the given namespace (dm targets,
    /// partitions). A non-empty result means the device must not be
    /// disconnected.
    pub fn device_holders(device_path: &str) -> Vec<String> {
        let name = device_path.trim_start_matches("/dev/");
        let pattern = format!("/sys/class/block/{}/holders/*", name);
        match glob(&pattern) {
            Ok(entries) => entries
                .flatten()
                .filter_map(|path| {
                    path.file_name().map(|n| n.to_string_lossy().into_owned())
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Drop the controller, ending the fabric session and removing all
    /// of its namespaces.
    pub fn disconnect(&self) -> Result<(), NvmeError> {
        let filename =
            format!("/sys/class/nvme/{}/delete_controller", self.name);
        let mut file = OpenOptions::new()
            .write(true)
            .open(Path::new(&filename))
            .context(FileIoSnafu {
                filename: filename.clone(),
            })?;
        file.write_all(b"1").context(FileIoSnafu { filename })?;
        Ok(())
    }
}

/// `nvme3n1` and `nvme3c0n1` name namespaces; `nvme3` names the
/// controller itself and anything else is an attribute directory.
fn is_namespace_name(name: &str) -> bool {
    let mut rest = match name.strip_prefix("nvme") {
        Some(rest) => rest,
        None => return false,
    };
    let digits = |s: &str| s.chars().take_while(|c| c.is_ascii_digit()).count();

    let n = digits(rest);
    if n == 0 {
        return false;
    }
    rest = &rest[n ..];

    if let Some(stripped) = rest.strip_prefix('c') {
        let n = digits(stripped);
        if n == 0 {
            return false;
        }
        rest = &stripped[n ..];
    }

    match rest.strip_prefix('n') {
        Some(stripped) => {
            let n = digits(stripped);
            n > 0 && n == stripped.len()
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_names() {
        assert!(is_namespace_name("nvme0n1"));
        assert!(is_namespace_name("nvme12n3"));
        assert!(is_namespace_name("nvme0c0n1"));
        assert!(!is_namespace_name("nvme0"));
        assert!(!is_namespace_name("nvme0n"));
        assert!(!is_namespace_name("sda1"));
        assert!(!is_namespace_name("nvme0n1p1"));
    }
}
