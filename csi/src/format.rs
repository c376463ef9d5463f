//! Filesystem preparation: superblock probing, formatting blank
//! devices, read-only health checks and online growth. All external
//! tools run under a deadline.

use crate::{error::Error, volume::FsType};
use std::{process::Output, time::Duration};
use tokio::process::Command;

/// blkid exits 2 when the device carries no recognizable signature
const BLKID_NOTHING_FOUND: i32 = 2;

async fn run_tool(
    tool: &str,
    args: &[&str],
    deadline: Duration,
) -> Result<Output, Error> {
    let rendered = format!("{} {}", tool, args.join(" "));
    trace!("running {}", rendered);

    let child = Command::new(tool)
        .args(args)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(deadline, child).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => Err(Error::Internal {
            text: format!("failed to run {}: {}", tool, error),
        }),
        Err(_) => Err(Error::OperationTimeout {
            text: format!("{} exceeded {:?}", rendered, deadline),
        }),
    }
}

/// Probe the device for an existing filesystem signature. `None`
/// means the device looks blank and is safe to format.
pub async fn probe_fs(
    device: &str,
    deadline: Duration,
) -> Result<Option<String>, Error> {
    let output =
        run_tool("blkid", &["-o", "value", "-s", "TYPE", device], deadline)
            .await?;

    if output.status.success() {
        let fstype =
            String::from_utf8_lossy(&output.stdout).trim().to_string();
        if fstype.is_empty() {
            return Ok(None);
        }
        return Ok(Some(fstype));
    }
    if output.status.code() == Some(BLKID_NOTHING_FOUND) {
        return Ok(None);
    }
    Err(Error::Internal {
        text: format!(
            "blkid failed on {}: {}",
            device,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    })
}

/// Format a blank device. Never called on a device with a recognized
/// signature; the probe above is the guard.
pub async fn format_device(
    device: &str,
    fstype: FsType,
    deadline: Duration,
) -> Result<(), Error> {
    info!("formatting {} with {}", device, fstype);
    let tool = format!("mkfs.{}", fstype);
    let output = run_tool(&tool, &[device], deadline).await?;
    if !output.status.success() {
        return Err(Error::Internal {
            text: format!(
                "{} on {} failed: {}",
                tool,
                device,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    info!("formatted {} with {}", device, fstype);
    Ok(())
}

/// Read-only filesystem check before re-using an already formatted
/// device. Catches a previously crashed mount before a pod starts
/// writing into a corrupt filesystem.
pub async fn health_check(
    device: &str,
    fstype: FsType,
    deadline: Duration,
) -> Result<(), Error> {
    let (tool, args): (&str, Vec<&str>) = match fstype {
        FsType::Ext4 => ("e2fsck", vec!["-n", device]),
        FsType::Xfs => ("xfs_repair", vec!["-n", device]),
    };
    let output = run_tool(tool, &args, deadline).await?;
    if output.status.success() {
        debug!("health probe of {} passed", device);
        return Ok(());
    }
    warn!(
        "health probe of {} failed: {}",
        device,
        String::from_utf8_lossy(&output.stderr).trim()
    );
    Err(Error::MountFailed {
        target: device.to_string(),
        detail: format!("{} health probe failed, refusing to mount", fstype),
    })
}

/// Grow a mounted filesystem to its device size. Both tools only
/// grow; shrink refusal is enforced by the caller before dispatch.
pub async fn online_resize(
    device: &str,
    mountpoint: &str,
    fstype: FsType,
    deadline: Duration,
) -> Result<(), Error> {
    let output = match fstype {
        FsType::Ext4 => run_tool("resize2fs", &[device], deadline).await?,
        FsType::Xfs => {
            run_tool("xfs_growfs", &[mountpoint], deadline).await?
        }
    };
    if !output.status.success() {
        return Err(Error::Internal {
            text: format!(
                "online resize of {} failed: {}",
                mountpoint,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    info!("grew {} ({}) online", mountpoint, fstype);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_tool_is_a_typed_error() {
        let err = run_tool(
            "definitely-not-a-real-tool",
            &[],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[tokio::test]
    async fn deadline_overrun_is_operation_timeout() {
        let err = run_tool("sleep", &["5"], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OperationTimeout { .. }));
    }
}
