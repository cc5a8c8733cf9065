//! Thin wrappers over the kernel interfaces this tool pokes directly:
//! sysfs power state, the freeze timeout, sysrq poweroff, and mount/chroot.

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount, MsFlags};
use nix::unistd::{chroot, fchdir, sync};

use crate::paths;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Nix(nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Nix(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Nix(e) => write!(f, "system call failed: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Nix(e) => Some(e),
        }
    }
}

/// Write `"mem"` to `/sys/power/state`. Blocks until the kernel resumes.
pub fn suspend_to_ram() -> Result<()> {
    fs::write(paths::SYS_POWER_STATE, "mem")?;
    Ok(())
}

pub fn get_freeze_timeout() -> Result<u32> {
    let contents = fs::read_to_string(paths::SYS_POWER_FREEZE_TIMEOUT)?;
    contents
        .trim()
        .parse::<u32>()
        .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::InvalidData, "non-numeric freeze timeout")))
}

pub fn set_freeze_timeout(millis: u32) -> Result<()> {
    fs::write(paths::SYS_POWER_FREEZE_TIMEOUT, millis.to_string())?;
    Ok(())
}

/// Write `'o'` to `/proc/sysrq-trigger` in a loop until the kernel preempts us.
/// Never returns normally.
pub fn hard_poweroff() -> ! {
    error!("powering off via sysrq, system is unrecoverable");
    loop {
        let _ = fs::write(paths::SYSRQ_TRIGGER, "o");
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}

pub fn sync_disks() {
    sync();
}

/// `st_dev` of a mounted path, used to detect a mountpoint swap across suspend.
pub fn devno(path: &Path) -> Result<u64> {
    Ok(fs::metadata(path)?.dev())
}

fn none_cstr() -> Option<&'static str> {
    None
}

/// Bind-mount `src` onto `dst`. The inverse is `umount(dst)`.
pub fn bind_mount(src: &Path, dst: &Path) -> Result<()> {
    mount(Some(src), dst, none_cstr(), MsFlags::MS_BIND, none_cstr())?;
    Ok(())
}

pub fn unmount(target: &Path) -> Result<()> {
    umount(target)?;
    Ok(())
}

/// Remount an already-mounted filesystem with the given data option string
/// (e.g. `"nobarrier"` or `"barrier"`), without touching the rest of its mount options.
pub fn remount_with_data(target: &Path, data: &str) -> Result<()> {
    mount(
        none_cstr(),
        target,
        none_cstr(),
        MsFlags::MS_REMOUNT,
        Some(data),
    )?;
    Ok(())
}

pub fn mount_device(device: &Path, target: &Path, fstype: &str, readonly: bool) -> Result<()> {
    let flags = if readonly { MsFlags::MS_RDONLY } else { MsFlags::empty() };
    mount(Some(device), target, Some(fstype), flags, none_cstr())?;
    Ok(())
}

/// `chroot` into `path`, leaving the caller's cwd inside the new root (matching
/// the `chroot(2)` + `chdir("/")` convention used for chroot pivots).
pub fn enter_chroot(path: &Path) -> Result<()> {
    chroot(path)?;
    nix::unistd::chdir("/")?;
    Ok(())
}

/// Saves the caller's current root so a later `chroot` back to it is possible.
/// Mirrors the root-fd save/restore idiom used for chroot-and-return workflows.
pub struct RootGuard {
    saved_root: std::os::unix::io::RawFd,
}

impl RootGuard {
    pub fn save() -> Result<RootGuard> {
        use std::os::unix::io::IntoRawFd;
        let f = fs::File::open("/")?;
        Ok(RootGuard {
            saved_root: f.into_raw_fd(),
        })
    }

    pub fn restore(self) -> Result<()> {
        use std::os::unix::io::FromRawFd;
        let f = unsafe { fs::File::from_raw_fd(self.saved_root) };
        fchdir(std::os::unix::io::AsRawFd::as_raw_fd(&f))?;
        chroot(".")?;
        Ok(())
    }
}

pub fn is_executable_and_root_owned(path: &Path) -> Result<bool> {
    let meta = fs::metadata(path)?;
    let mode = meta.permissions().mode_mask();
    Ok(meta.is_file() && meta.uid() == 0 && mode & 0o111 != 0 && mode & 0o022 == 0)
}

trait PermissionsModeMask {
    fn mode_mask(&self) -> u32;
}

impl PermissionsModeMask for fs::Permissions {
    fn mode_mask(&self) -> u32 {
        std::os::unix::fs::PermissionsExt::mode(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expectest::prelude::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_root_owned_executable_check_rejects_group_writable() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("pre");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o775)).unwrap();

        let result = is_executable_and_root_owned(&script);
        expect!(result).to(be_ok());
        // non-root uid in test environment already fails the uid==0 check, but the
        // group-writable bit must independently disqualify the script.
        if let Ok(ok) = result {
            if unsafe { libc::getuid() } == 0 {
                expect!(ok).to(be_false());
            }
        }
    }

    #[test]
    fn test_devno_matches_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let expected = fs::metadata(dir.path()).unwrap().dev();
        expect!(devno(dir.path())).to(be_ok().value(expected));
    }
}
