//! Publish and unpublish for block-mode volumes. Block volumes are
//! never staged: the NVMe session is the only per-node state, and
//! publish bind-mounts the raw device node onto a file target.
//!
//! The target path is a file created by the kubelet (or by us). It is
//! never a directory, and nothing in this module may mkdir it; the
//! file-vs-directory check runs before anything touches the path.

use crate::{config::NodeConfig, error::Error, mount};
use std::{fs, io::ErrorKind, path::Path};

/// Ensure the publish target exists as a regular file without ever
/// creating a directory in its place.
pub(crate) fn prepare_block_target(target_path: &str) -> Result<(), Error> {
    let path = Path::new(target_path);
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Err(Error::InvalidParameter {
            text: format!(
                "block volume target {} is a directory, expected a file",
                target_path
            ),
        }),
        // an existing file is exactly what the kubelet hands us
        Ok(_) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|error| {
                    Error::Internal {
                        text: format!(
                            "failed to create parent of {}: {}",
                            target_path, error
                        ),
                    }
                })?;
            }
            fs::File::create(path).map_err(|error| Error::Internal {
                text: format!(
                    "failed to create block target {}: {}",
                    target_path, error
                ),
            })?;
            Ok(())
        }
        Err(error) => Err(Error::Internal {
            text: format!("failed to stat {}: {}", target_path, error),
        }),
    }
}

/// Bind the NVMe device node onto the pod's target file.
pub async fn publish_block_volume(
    config: &NodeConfig,
    volume_id: &str,
    device: &str,
    target_path: &str,
    readonly: bool,
) -> Result<(), Error> {
    let deadline = config.mount_deadline();

    if let Some(existing) =
        mount::find_mount(None, Some(target_path), deadline).await?
    {
        if existing.source == Path::new(device) {
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

    prepare_block_target(target_path)?;
    mount::bind_mount(device, target_path, readonly, deadline).await?;
    info!(
        "volume {} device {} published at {}",
        volume_id, device, target_path
    );
    Ok(())
}

/// Remove the device bind mount and the target file.
pub async fn unpublish_block_volume(
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

    if let Err(error) = fs::remove_file(target_path) {
        if error.kind() != ErrorKind::NotFound {
            warn!(
                "could not remove block target {}: {}",
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

    #[test]
    fn existing_file_target_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("volume");
        fs::File::create(&target).unwrap();

        prepare_block_target(target.to_str().unwrap()).unwrap();
        // still a file, not replaced by a directory
        assert!(fs::metadata(&target).unwrap().is_file());
    }

    #[test]
    fn missing_target_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("pods/volumeDevices/volume");

        prepare_block_target(target.to_str().unwrap()).unwrap();
        assert!(fs::metadata(&target).unwrap().is_file());
    }

    #[test]
    fn directory_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err =
            prepare_block_target(dir.path().to_str().unwrap()).unwrap_err();
        assert_matches!(err, Error::InvalidParameter { .. });
    }

    #[tokio::test]
    async fn unpublish_of_absent_target_is_success() {
        let config = NodeConfig::default();
        unpublish_block_volume(
            &config,
            "pvc-x",
            "/tmp/rds-csi-test-missing-block-target",
        )
        .await
        .unwrap();
    }
}
