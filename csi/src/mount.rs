//! Mount and unmount with deadline watchdogs.
//!
//! A dead NVMe session can make mount-table syscalls block forever, so
//! every call into the kernel mount API runs on the blocking pool
//! under a timeout. Stale-mount recovery classifies a stuck target and
//! either detaches it lazily or reports the processes holding it; it
//! never kills anything.

use crate::{error::Error, volume::FsType};
use devinfo::mountinfo::{MountInfo, MountIter};
use std::{path::Path, time::Duration};
use sys_mount::{unmount, FilesystemType, Mount, MountFlags, UnmountFlags};

/// Run a blocking mount-table operation under a watchdog.
async fn run_blocking<T, F>(
    what: String,
    deadline: Duration,
    operation: F,
) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, std::io::Error> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(operation);
    match tokio::time::timeout(deadline, task).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(error))) => Err(Error::MountFailed {
            target: what,
            detail: error.to_string(),
        }),
        Ok(Err(join)) => Err(Error::Internal {
            text: format!("blocking task for {} failed: {}", what, join),
        }),
        Err(_) => {
            warn!("{} did not return within {:?}", what, deadline);
            Err(Error::OperationTimeout {
                text: format!("{} exceeded {:?}", what, deadline),
            })
        }
    }
}

/// Read the mount table and return the first entry matching source
/// and/or destination. Parsing runs under the deadline because a hung
/// filesystem can stall even reads of /proc.
pub async fn find_mount(
    source: Option<&str>,
    target: Option<&str>,
    deadline: Duration,
) -> Result<Option<MountInfo>, Error> {
    let source = source.map(String::from);
    let target = target.map(String::from);
    run_blocking("mount table read".to_string(), deadline, move || {
        let mut found = None;
        for entry in MountIter::new()
            .map_err(|error| other_io(error.to_string()))?
        {
            let entry =
                entry.map_err(|error| other_io(error.to_string()))?;
            let source_matches = source
                .as_ref()
                .map(|value| entry.source == Path::new(value))
                .unwrap_or(true);
            let target_matches = target
                .as_ref()
                .map(|value| entry.dest == Path::new(value))
                .unwrap_or(true);
            if source_matches && target_matches {
                found = Some(entry);
                break;
            }
        }
        Ok(found)
    })
    .await
}

/// All mount entries whose source is the given device.
pub async fn device_mounts(
    device: &str,
    deadline: Duration,
) -> Result<Vec<MountInfo>, Error> {
    let device = device.to_string();
    run_blocking("mount table read".to_string(), deadline, move || {
        let mut entries = Vec::new();
        for entry in MountIter::new()
            .map_err(|error| other_io(error.to_string()))?
        {
            let entry =
                entry.map_err(|error| other_io(error.to_string()))?;
            if entry.source == Path::new(&device) {
                entries.push(entry);
            }
        }
        Ok(entries)
    })
    .await
}

fn other_io(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, message)
}

fn split_options(options: &[String]) -> (bool, String) {
    let mut readonly = false;
    let mut rest: Vec<&str> = Vec::new();
    for option in options {
        match option.as_str() {
            "ro" => readonly = true,
            "rw" => {}
            other => rest.push(other),
        }
    }
    (readonly, rest.join(","))
}

/// Mount a formatted device onto a staging directory.
pub async fn filesystem_mount(
    device: &str,
    target: &str,
    fstype: FsType,
    options: &[String],
    deadline: Duration,
) -> Result<(), Error> {
    let device = device.to_string();
    let target_owned = target.to_string();
    let (readonly, data) = split_options(options);

    run_blocking(format!("mount of {}", target), deadline, move || {
        let mut flags = MountFlags::empty();
        if readonly {
            flags.insert(MountFlags::RDONLY);
        }
        Mount::new(
            &device,
            &target_owned,
            FilesystemType::Manual(fstype.as_str()),
            flags,
            if data.is_empty() { None } else { Some(data.as_str()) },
        )?;
        Ok(())
    })
    .await?;
    debug!("mounted {} ({})", target, fstype);
    Ok(())
}

/// Regular unmount of a staging directory. Deadline overruns surface
/// as `OperationTimeout` so the caller can start stale recovery.
pub async fn filesystem_unmount(
    target: &str,
    deadline: Duration,
) -> Result<(), Error> {
    let target_owned = target.to_string();
    run_blocking(format!("unmount of {}", target), deadline, move || {
        unmount(&target_owned, UnmountFlags::empty())?;
        Ok(())
    })
    .await
    .map_err(|error| match error {
        Error::MountFailed { target, detail } => {
            Error::UnmountFailed { target, detail }
        }
        other => other,
    })?;
    debug!("unmounted {}", target);
    Ok(())
}

/// Lazy detach: the mount point is removed from the namespace now and
/// the filesystem is released once its last user exits.
pub async fn lazy_unmount(
    target: &str,
    deadline: Duration,
) -> Result<(), Error> {
    let target_owned = target.to_string();
    run_blocking(format!("lazy unmount of {}", target), deadline, move || {
        unmount(&target_owned, UnmountFlags::DETACH)?;
        Ok(())
    })
    .await
    .map_err(|error| match error {
        Error::MountFailed { target, detail } => {
            Error::UnmountFailed { target, detail }
        }
        other => other,
    })?;
    info!("lazily unmounted {}", target);
    Ok(())
}

/// Bind mount staging onto a pod target (directory for filesystem
/// volumes, file for block device nodes).
pub async fn bind_mount(
    source: &str,
    target: &str,
    readonly: bool,
    deadline: Duration,
) -> Result<(), Error> {
    let source = source.to_string();
    let target_owned = target.to_string();
    let source_for_mount = source.clone();
    run_blocking(format!("bind mount of {}", target), deadline, move || {
        Mount::new(
            &source_for_mount,
            &target_owned,
            FilesystemType::Manual("none"),
            MountFlags::BIND,
            None,
        )?;
        if readonly {
            // bind mounts ignore RDONLY on creation, a remount applies it
            Mount::new(
                "",
                &target_owned,
                FilesystemType::Manual(""),
                MountFlags::BIND | MountFlags::REMOUNT | MountFlags::RDONLY,
                None,
            )?;
        }
        Ok(())
    })
    .await?;
    debug!("bind mounted {} -> {}", source, target);
    Ok(())
}

/// Remove a bind mount.
pub async fn bind_unmount(
    target: &str,
    deadline: Duration,
) -> Result<(), Error> {
    let target_owned = target.to_string();
    run_blocking(format!("unmount of {}", target), deadline, move || {
        unmount(&target_owned, UnmountFlags::empty())?;
        Ok(())
    })
    .await
    .map_err(|error| match error {
        Error::MountFailed { target, detail } => {
            Error::UnmountFailed { target, detail }
        }
        other => other,
    })
}

/// Processes with an open file, working directory or root under the
/// given path. Scanning /proc is inherently racy; the result is a
/// best-effort report for the operator, not a synchronization
/// primitive.
pub fn holder_pids(path: &str) -> Vec<u32> {
    let prefix = Path::new(path);
    let mut pids = Vec::new();

    let proc_entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return pids,
    };

    for entry in proc_entries.flatten() {
        let name = entry.file_name();
        let pid = match name.to_str().and_then(|n| n.parse::<u32>().ok()) {
            Some(pid) => pid,
            None => continue,
        };

        let base = entry.path();
        let mut held = ["cwd", "root"].iter().any(|link| {
            std::fs::read_link(base.join(link))
                .map(|path| path.starts_with(prefix))
                .unwrap_or(false)
        });

        if !held {
            if let Ok(fds) = std::fs::read_dir(base.join("fd")) {
                held = fds.flatten().any(|fd| {
                    std::fs::read_link(fd.path())
                        .map(|path| path.starts_with(prefix))
                        .unwrap_or(false)
                });
            }
        }

        if held {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    pids
}

/// Recovery for a target whose regular unmount overran its deadline.
/// With no userspace holders the mount is detached lazily; otherwise
/// the holders are reported and nothing is forced.
pub async fn stale_unmount_recovery(
    target: &str,
    deadline: Duration,
) -> Result<(), Error> {
    warn!("stale mount suspected at {}", target);

    let target_owned = target.to_string();
    let pids = tokio::task::spawn_blocking(move || holder_pids(&target_owned))
        .await
        .map_err(|error| Error::Internal {
            text: format!("holder scan task failed: {}", error),
        })?;

    if pids.is_empty() {
        return lazy_unmount(target, deadline).await;
    }

    // killing the holders is operator policy, not driver policy
    Err(Error::UnmountFailed {
        target: target.to_string(),
        detail: format!(
            "mount is held by pids {}",
            pids.iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn root_is_always_mounted() {
        let entry = find_mount(None, Some("/"), DEADLINE).await.unwrap();
        assert!(entry.is_some());
        assert_eq!(entry.unwrap().dest, Path::new("/"));
    }

    #[tokio::test]
    async fn absent_target_finds_nothing() {
        let entry = find_mount(
            None,
            Some("/definitely/not/a/mountpoint"),
            DEADLINE,
        )
        .await
        .unwrap();
        assert!(entry.is_none());
    }

    #[tokio::test]
    async fn device_mounts_of_unknown_device_is_empty() {
        let entries = device_mounts("/dev/nvme99n9", DEADLINE).await.unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn split_options_extracts_readonly() {
        let (ro, data) = split_options(&[
            "ro".to_string(),
            "noatime".to_string(),
            "rw".to_string(),
            "discard".to_string(),
        ]);
        assert!(ro);
        assert_eq!(data, "noatime,discard");

        let (ro, data) = split_options(&[]);
        assert!(!ro);
        assert_eq!(data, "");
    }

    #[test]
    fn holder_scan_finds_this_process_under_root() {
        let pids = holder_pids("/");
        assert!(pids.contains(&std::process::id()));
    }

    #[test]
    fn holder_scan_of_unused_path_is_empty() {
        let pids = holder_pids("/definitely/not/used/by/anyone");
        assert!(pids.is_empty());
    }

    #[tokio::test]
    async fn unmount_of_nonexistent_target_fails_typed() {
        let err = filesystem_unmount("/definitely/not/mounted", DEADLINE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnmountFailed { .. }));
    }
}
