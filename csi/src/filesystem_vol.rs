//! Stage, unstage, publish and unpublish for filesystem volumes.
//! Staging mounts the device globally once; publish bind-mounts the
//! staging directory into each pod.

use crate::{
    config::NodeConfig,
    error::Error,
    format,
    mount,
    volume::FsType,
};
use std::{fs, io::ErrorKind, path::Path};

/// Mount `device` onto the staging directory, formatting it first if
/// it is blank. Re-used filesystems get a read-only health probe
/// before they are trusted again.
pub async fn stage_fs_volume(
    config: &NodeConfig,
    volume_id: &str,
    device: &str,
    staging_path: &str,
    fstype: FsType,
    mount_flags: &[String],
) -> Result<(), Error> {
    if let Err(error) = fs::create_dir_all(staging_path) {
        if error.kind() != ErrorKind::AlreadyExists {
            return Err(Error::Internal {
                text: format!(
                    "failed to create staging directory {}: {}",
                    staging_path, error
                ),
            });
        }
    }

    let deadline = config.mount_deadline();

    if mount::find_mount(Some(device), Some(staging_path), deadline)
        .await?
        .is_some()
    {
        info!("volume {} already staged at {}", volume_id, staging_path);
        return Ok(());
    }

    if let Some(entry) =
        mount::find_mount(None, Some(staging_path), deadline).await?
    {
        return Err(Error::MountFailed {
            target: staging_path.to_string(),
            detail: format!(
                "another device ({}) is already mounted here",
                entry.source.display()
            ),
        });
    }

    match format::probe_fs(device, config.format_deadline()).await? {
        None => {
            format::format_device(device, fstype, config.format_deadline())
                .await?;
        }
        Some(found) if found == fstype.as_str() => {
            // the device carries data from an earlier life of this
            // volume; verify it before letting a pod write into it
            format::health_check(device, fstype, config.probe_deadline())
                .await?;
        }
        Some(found) => {
            return Err(Error::FilesystemMismatch {
                device: device.to_string(),
                found,
                requested: fstype.as_str().to_string(),
            });
        }
    }

    match mount::filesystem_mount(
        device,
        staging_path,
        fstype,
        mount_flags,
        deadline,
    )
    .await
    {
        Ok(()) => {
            info!("volume {} staged at {}", volume_id, staging_path);
            Ok(())
        }
        Err(Error::OperationTimeout { text }) => {
            // a wedged mount leaves the target in an unknown state
            mount::stale_unmount_recovery(staging_path, deadline).await.ok();
            Err(Error::OperationTimeout { text })
        }
        Err(error) => Err(error),
    }
}

/// Unmount the staging directory and remove it. Unmount overruns go
/// through stale recovery; a target held by processes surfaces as
/// `UnmountFailed` with the holder pids and leaves everything intact.
pub async fn unstage_fs_volume(
    config: &NodeConfig,
    volume_id: &str,
    staging_path: &str,
) -> Result<(), Error> {
    let deadline = config.mount_deadline();

    if mount::find_mount(None, Some(staging_path), deadline)
        .await?
        .is_some()
    {
        match mount::filesystem_unmount(staging_path, deadline).await {
            Ok(()) => {}
            Err(Error::OperationTimeout { .. }) => {
                mount::stale_unmount_recovery(staging_path, deadline).await?;
            }
            Err(error) => return Err(error),
        }
    }

    if let Err(error) = fs::remove_dir(staging_path) {
        if error.kind() != ErrorKind::NotFound {
            warn!(
                "could not remove staging directory {}: {}",
                staging_path, error
            );
        }
    }
    info!("volume {} unstaged from {}", volume_id, staging_path);
    Ok(())
}

/// Bind-mount staging into the pod target directory.
pub async fn publish_fs_volume(
    config: &NodeConfig,
    volume_id: &str,
    staging_path: &str,
    target_path: &str,
    readonly: bool,
) -> Result<(), Error> {
    let deadline = config.mount_deadline();

    let staged = mount::find_mount(None, Some(staging_path), deadline)
        .await?
        .ok_or_else(|| Error::MountFailed {
            target: target_path.to_string(),
            detail: format!(
                "volume {} is not staged at {}",
                volume_id, staging_path
            ),
        })?;

    if let Some(existing) =
        mount::find_mount(None, Some(target_path), deadline).await?
    {
        if existing.source == staged.source
            || existing.source == Path::new(staging_path)
        {
            info!(
                "volume {} already published at {}",
                volume_id, target_path
            );
            return Ok(());
        }
        return Err(Error::MountFailed {
            target: target_path.to_string(),
            detail: format!(
                "target already mounts {}",
                existing.source.display()
            ),
        });
    }

    if let Err(error) = fs::create_dir_all(target_path) {
        if error.kind() != ErrorKind::AlreadyExists {
            return Err(Error::Internal {
                text: format!(
                    "failed to create target directory {}: {}",
                    target_path, error
                ),
            });
        }
    }

    mount::bind_mount(staging_path, target_path, readonly, deadline).await?;
    info!("volume {} published at {}", volume_id, target_path);
    Ok(())
}

/// Remove the pod bind mount and its directory.
pub async fn unpublish_fs_volume(
    config: &NodeConfig,
    volume_id: &str,
    target_path: &str,
) -> Result<(), Error> {
    let deadline = config.mount_deadline();

    if mount::find_mount(None, Some(target_path), deadline)
        .await?
        .is_some()
    {
        mount::bind_unmount(target_path, deadline).await?;
    }

    if let Err(error) = fs::remove_dir(target_path) {
        if error.kind() != ErrorKind::NotFound {
            warn!(
                "could not remove target directory {}: {}",
                target_path, error
            );
        }
    }
    info!("volume {} unpublished from {}", volume_id, target_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn publish_requires_a_staged_volume() {
        let config = NodeConfig::default();
        let err = publish_fs_volume(
            &config,
            "pvc-x",
            "/var/lib/kubelet/not/staged",
            "/var/lib/kubelet/pods/t",
            false,
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::MountFailed { .. });
        assert!(err.to_string().contains("not staged"));
    }

    #[tokio::test]
    async fn unpublish_of_absent_target_is_success() {
        let config = NodeConfig::default();
        unpublish_fs_volume(
            &config,
            "pvc-x",
            "/tmp/rds-csi-test-definitely-missing-target",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn unstage_of_absent_staging_is_success() {
        let config = NodeConfig::default();
        unstage_fs_volume(
            &config,
            "pvc-x",
            "/tmp/rds-csi-test-definitely-missing-staging",
        )
        .await
        .unwrap();
    }
}
