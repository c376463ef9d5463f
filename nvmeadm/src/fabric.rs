//! Opening NVMe/TCP fabric connections through `/dev/nvme-fabrics`.
//!
//! Writing a comma separated argument string to the fabrics control
//! file asks the kernel to create a controller; the reply names the
//! instance that was created. The same write against a live controller
//! fails with EALREADY, which callers treat as success.

use crate::{
    error::{ConnectFailedSnafu, FileIoSnafu, InvalidParamSnafu},
    NvmeError,
    MACHINE_UUID_PATH,
    NVME_FABRICS_PATH,
};
use snafu::{ensure, ResultExt};
use std::{
    fs,
    fs::OpenOptions,
    io::{Read, Write},
    net::IpAddr,
    path::Path,
    str::FromStr,
};

/// errno returned when a controller for the nqn already exists
const EALREADY: i32 = 114;

/// Parameters for a single fabric connect.
#[derive(Debug, Clone)]
pub struct ConnectArgs {
    nqn: String,
    traddr: String,
    trsvcid: u16,
    keep_alive_tmo: u32,
}

impl ConnectArgs {
    pub fn new(
        nqn: &str,
        traddr: &str,
        trsvcid: u16,
        keep_alive_tmo: u32,
    ) -> Result<Self, NvmeError> {
        ensure!(
            !nqn.is_empty() && !nqn.contains(','),
            InvalidParamSnafu {
                text: format!("invalid nqn: {:?}", nqn),
            }
        );
        ensure!(
            IpAddr::from_str(traddr).is_ok(),
            InvalidParamSnafu {
                text: format!("invalid transport address: {:?}", traddr),
            }
        );
        ensure!(
            trsvcid != 0,
            InvalidParamSnafu {
                text: "transport service id must not be 0".to_string(),
            }
        );
        Ok(Self {
            nqn: nqn.to_string(),
            traddr: traddr.to_string(),
            trsvcid,
            keep_alive_tmo,
        })
    }

    pub fn nqn(&self) -> &str {
        &self.nqn
    }

    /// Open the connection. Returns the kernel reply (`instance=N,cntlid=M`)
    /// on a fresh connect; an existing live controller is reported as
    /// `ConnectInProgress`.
    pub fn connect(&self) -> Result<String, NvmeError> {
        let args = self.build_arg_string();
        let path = Path::new(NVME_FABRICS_PATH);

        let mut file = OpenOptions::new()
            .write(true)
            .read(true)
            .open(path)
            .context(FileIoSnafu {
                filename: NVME_FABRICS_PATH,
            })?;

        if let Err(error) = file.write_all(args.as_bytes()) {
            if error.raw_os_error() == Some(EALREADY) {
                return Err(NvmeError::ConnectInProgress {
                    nqn: self.nqn.clone(),
                });
            }
            return Err(error).context(ConnectFailedSnafu {
                nqn: self.nqn.clone(),
            });
        }

        let mut reply = String::new();
        file.read_to_string(&mut reply).context(ConnectFailedSnafu {
            nqn: self.nqn.clone(),
        })?;
        Ok(reply.trim().to_string())
    }

    fn build_arg_string(&self) -> String {
        let mut args = format!(
            "nqn={},transport=tcp,traddr={},trsvcid={}",
            self.nqn, self.traddr, self.trsvcid
        );
        if let Ok(hostid) = machine_uuid() {
            args.push_str(&format!(",hostnqn={},hostid={}", host_nqn(&hostid), hostid));
        }
        if self.keep_alive_tmo > 0 {
            args.push_str(&format!(",keep_alive_tmo={}", self.keep_alive_tmo));
        }
        args
    }
}

fn machine_uuid() -> Result<String, std::io::Error> {
    let id = fs::read_to_string(MACHINE_UUID_PATH)?;
    Ok(id.trim().to_string())
}

fn host_nqn(hostid: &str) -> String {
    format!("nqn.2014-08.org.nvmexpress:uuid:{}", hostid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_parameters() {
        assert!(ConnectArgs::new("", "10.0.0.1", 4420, 5).is_err());
        assert!(ConnectArgs::new("nqn.x,evil=1", "10.0.0.1", 4420, 5).is_err());
        assert!(ConnectArgs::new("nqn.x", "not-an-ip", 4420, 5).is_err());
        assert!(ConnectArgs::new("nqn.x", "10.0.0.1", 0, 5).is_err());
    }

    #[test]
    fn arg_string_has_fixed_shape() {
        let args = ConnectArgs::new("nqn.2014-08.test:pvc-1", "10.1.2.3", 4420, 7)
            .unwrap()
            .build_arg_string();
        assert!(args.starts_with(
            "nqn=nqn.2014-08.test:pvc-1,transport=tcp,traddr=10.1.2.3,trsvcid=4420"
        ));
        assert!(args.ends_with("keep_alive_tmo=7"));
    }
}
