//! Enumeration and barrier toggling for mounts that need write barriers
//! disabled while their backing LUKS device is frozen.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::kernel;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    MalformedMountsLine(String),
    Kernel(kernel::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<kernel::Error> for Error {
    fn from(e: kernel::Error) -> Self {
        Error::Kernel(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::MalformedMountsLine(line) => write!(f, "malformed /proc/mounts line: {}", line),
            Error::Kernel(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Kernel(e) => Some(e),
            _ => None,
        }
    }
}

const BARRIER_ELIGIBLE_FSTYPES: &[&str] = &["ext3", "ext4", "btrfs"];

fn has_write_barrier(fstype: &str, mountopts: &str) -> bool {
    if !BARRIER_ELIGIBLE_FSTYPES.contains(&fstype) {
        return false;
    }
    // Write barriers are on by default and don't show up in the option list,
    // so check for the negative.
    !mountopts.split(',').any(|o| o == "barrier=0" || o == "nobarrier")
}

/// A mount whose write barriers will be toggled across the suspend window.
#[derive(Debug, Clone)]
pub struct Filesystem {
    pub mountpoint: PathBuf,
    pub devno: u64,
}

impl Filesystem {
    pub fn disable_write_barrier(&self) -> Result<()> {
        kernel::remount_with_data(&self.mountpoint, "nobarrier").map_err(Error::from)
    }

    pub fn enable_write_barrier(&self) -> Result<()> {
        kernel::remount_with_data(&self.mountpoint, "barrier").map_err(Error::from)
    }
}

fn parse_mounts(contents: &str) -> Result<Vec<(PathBuf, String, String)>> {
    let mut result = Vec::new();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            return Err(Error::MalformedMountsLine(line.to_string()));
        }
        result.push((PathBuf::from(fields[1]), fields[2].to_string(), fields[3].to_string()));
    }
    Ok(result)
}

/// Enumerate mounts in `mounts_path` (normally `/proc/mounts`) eligible for
/// write barrier toggling.
pub fn discover(mounts_path: &Path) -> Result<Vec<Filesystem>> {
    let contents = fs::read_to_string(mounts_path)?;
    let mounts = parse_mounts(&contents)?;

    let mut filesystems = Vec::new();
    for (mountpoint, fstype, opts) in mounts {
        if has_write_barrier(&fstype, &opts) {
            let devno = kernel::devno(&mountpoint)?;
            filesystems.push(Filesystem { mountpoint, devno });
        }
    }

    debug!("{} filesystem(s) eligible for barrier toggling", filesystems.len());
    Ok(filesystems)
}

/// Disable write barriers on every filesystem. Any failure aborts - the root
/// is not yet frozen, so it's safe to bail out of preparation entirely.
pub fn disable_all(filesystems: &[Filesystem]) -> Result<()> {
    for fs in filesystems {
        fs.disable_write_barrier()?;
    }
    Ok(())
}

/// Re-enable write barriers. Verifies the mountpoint's device number hasn't
/// changed since discovery (the mount may have been replaced during suspend);
/// a mismatch is logged and skipped rather than failing the whole batch.
pub fn enable_all(filesystems: &[Filesystem]) {
    for fs in filesystems {
        match kernel::devno(&fs.mountpoint) {
            Ok(devno) if devno == fs.devno => {
                if let Err(e) = fs.enable_write_barrier() {
                    warn!("failed to re-enable write barrier on {}: {}", fs.mountpoint.display(), e);
                }
            }
            Ok(_) => warn!(
                "skipping barrier re-enable on {}: mountpoint was replaced during suspend",
                fs.mountpoint.display()
            ),
            Err(e) => warn!("failed to stat {}: {}", fs.mountpoint.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expectest::prelude::*;

    #[test]
    fn test_has_write_barrier_eligible_fstypes_only() {
        expect!(has_write_barrier("ext4", "rw,relatime")).to(be_true());
        expect!(has_write_barrier("xfs", "rw,relatime")).to(be_false());
        expect!(has_write_barrier("vfat", "rw")).to(be_false());
    }

    #[test]
    fn test_has_write_barrier_excludes_explicit_nobarrier() {
        expect!(has_write_barrier("ext4", "rw,nobarrier")).to(be_false());
        expect!(has_write_barrier("btrfs", "rw,barrier=0,relatime")).to(be_false());
        expect!(has_write_barrier("ext3", "rw,relatime")).to(be_true());
    }

    #[test]
    fn test_parse_mounts_rejects_short_lines() {
        let result = parse_mounts("/dev/sda1 / ext4 rw\n");
        expect!(result).to(be_err());
    }
}
