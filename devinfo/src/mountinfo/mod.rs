//! Parser for `/proc/self/mountinfo`.
//!
//! The per-process mountinfo table is preferred over `/proc/mounts`
//! because it carries mount ids and is unambiguous for bind mounts of
//! the same source to several targets. The parser must cope with
//! tables of thousands of lines, duplicate entries, and octal-escaped
//! paths (`\040` for a space in a mount point).

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    str::FromStr,
};

const PROC_MOUNTINFO: &str = "/proc/self/mountinfo";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MountInfoError {
    #[snafu(display("Failed to open {}", path))]
    OpenTable { path: String, source: io::Error },
    #[snafu(display("Failed to read mount table line"))]
    ReadLine { source: io::Error },
    #[snafu(display("Malformed mountinfo line, missing field '{}': {}", field, line))]
    MissingField { field: String, line: String },
    #[snafu(display("Malformed mountinfo line, bad value for '{}': {}", field, line))]
    BadField { field: String, line: String },
    #[snafu(display("Truncated octal escape in mountinfo path: {}", value))]
    BadEscape { value: String },
}

/// A single entry of the kernel mount table.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct MountInfo {
    /// unique id of the mount
    pub mount_id: u64,
    /// id of the parent mount
    pub parent_id: u64,
    /// path of the mount relative to the source filesystem root,
    /// "/" except for bind mounts of a subtree
    pub root: PathBuf,
    /// where the mount is attached
    pub dest: PathBuf,
    /// per-mount options (rw, relatime, ...)
    pub options: Vec<String>,
    /// filesystem type as reported by the kernel
    pub fstype: String,
    /// what is mounted, a device path for block filesystems
    pub source: PathBuf,
    /// per-superblock options
    pub super_options: Vec<String>,
}

impl MountInfo {
    /// True if the entry carries the "ro" mount option.
    pub fn readonly(&self) -> bool {
        self.options.iter().any(|option| option == "ro")
    }
}

impl FromStr for MountInfo {
    type Err = MountInfoError;

    /// Parse one mountinfo line:
    /// `36 35 98:0 / /mnt rw,noatime shared:1 - ext4 /dev/sda1 rw`
    /// Optional fields sit between the per-mount options and the `-`
    /// separator and are skipped.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();

        let field = |name: &str, value: Option<&str>| {
            value.map(String::from).context(MissingFieldSnafu {
                field: name.to_string(),
                line: line.to_string(),
            })
        };

        let mount_id = field("mount id", parts.next())?;
        let mount_id =
            mount_id.parse::<u64>().ok().context(BadFieldSnafu {
                field: "mount id".to_string(),
                line: line.to_string(),
            })?;

        let parent_id = field("parent id", parts.next())?;
        let parent_id =
            parent_id.parse::<u64>().ok().context(BadFieldSnafu {
                field: "parent id".to_string(),
                line: line.to_string(),
            })?;

        // major:minor, not needed by any caller
        let _ = field("device number", parts.next())?;

        let root = unescape(&field("root", parts.next())?)?;
        let dest = unescape(&field("mount point", parts.next())?)?;
        let options = field("mount options", parts.next())?
            .split(',')
            .map(String::from)
            .collect();

        // zero or more optional fields terminated by a single dash
        loop {
            let value = field("optional field", parts.next())?;
            if value == "-" {
                break;
            }
        }

        let fstype = field("fs type", parts.next())?;
        let source = unescape(&field("mount source", parts.next())?)?;
        let super_options = field("super options", parts.next())?
            .split(',')
            .map(String::from)
            .collect();

        Ok(MountInfo {
            mount_id,
            parent_id,
            root: PathBuf::from(root),
            dest: PathBuf::from(dest),
            options,
            fstype,
            source: PathBuf::from(source),
            super_options,
        })
    }
}

/// Expand the `\ooo` octal escapes the kernel emits for whitespace and
/// backslashes in paths.
fn unescape(value: &str) -> Result<String, MountInfoError> {
    if !value.contains('\\') {
        return Ok(value.to_string());
    }

    let mut out = Vec::with_capacity(value.len());
    let mut bytes = value.bytes();

    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let mut code: u32 = 0;
        for _ in 0 .. 3 {
            let digit = bytes.next().context(BadEscapeSnafu {
                value: value.to_string(),
            })?;
            ensure!(
                (b'0' ..= b'7').contains(&digit),
                BadEscapeSnafu {
                    value: value.to_string(),
                }
            );
            code = code * 8 + u32::from(digit - b'0');
        }
        out.push(code as u8);
    }

    String::from_utf8(out).ok().context(BadEscapeSnafu {
        value: value.to_string(),
    })
}

/// Iterator over the entries of a mount table. Lines that fail to
/// parse are surfaced as errors rather than silently dropped so that a
/// caller may decide whether a partial view is acceptable.
pub struct MountIter<R> {
    table: R,
    buffer: String,
}

impl MountIter<BufReader<File>> {
    /// Iterate the mount table of the current mount namespace.
    pub fn new() -> Result<Self, MountInfoError> {
        Self::from_path(PROC_MOUNTINFO)
    }

    /// Iterate a mountinfo-formatted file, used by tests and for
    /// inspecting foreign namespaces via /proc/<pid>/mountinfo.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, MountInfoError> {
        let file = File::open(path.as_ref()).context(OpenTableSnafu {
            path: path.as_ref().display().to_string(),
        })?;
        Ok(Self::from_reader(BufReader::new(file)))
    }
}

impl<R: BufRead> MountIter<R> {
    pub fn from_reader(table: R) -> Self {
        Self {
            table,
            buffer: String::with_capacity(256),
        }
    }
}

impl<R: BufRead> Iterator for MountIter<R> {
    type Item = Result<MountInfo, MountInfoError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buffer.clear();
            match self.table.read_line(&mut self.buffer) {
                Ok(0) => return None,
                Ok(_) => {
                    let line = self.buffer.trim();
                    if !line.is_empty() {
                        return Some(MountInfo::from_str(line));
                    }
                }
                Err(error) => {
                    return Some(Err(MountInfoError::ReadLine {
                        source: error,
                    }))
                }
            }
        }
    }
}
