//! The host-side orchestrator (SPEC_FULL §4.4): an ordered, reversible
//! prepare/teardown pipeline that bind-mounts initramfs, quiesces services
//! and write barriers, spawns the inner process with the device inventory on
//! fd 3, and unwinds everything afterwards.

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::unistd::dup2;

use crate::compensator::Stack;
use crate::cryptdevice::{self, Cryptdevice};
use crate::filesystem;
use crate::inventory;
use crate::kernel;
use crate::paths;
use crate::policy::Policy;
use crate::sleep_scripts;
use crate::systemd;
use crate::worker;

const INVENTORY_FD: i32 = 3;
const BIND_DIRS: &[&str] = &["sys", "proc", "dev", "run"];

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Cryptdevice(cryptdevice::Error),
    Filesystem(filesystem::Error),
    Inventory(inventory::Error),
    Kernel(kernel::Error),
    Systemd(systemd::Error),
    Nix(nix::Error),
    SleepScripts(sleep_scripts::Error),
    UnsafeSuspendBinary(String),
    InnerFailed(std::process::ExitStatus),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
impl From<cryptdevice::Error> for Error {
    fn from(e: cryptdevice::Error) -> Self {
        Error::Cryptdevice(e)
    }
}
impl From<filesystem::Error> for Error {
    fn from(e: filesystem::Error) -> Self {
        Error::Filesystem(e)
    }
}
impl From<inventory::Error> for Error {
    fn from(e: inventory::Error) -> Self {
        Error::Inventory(e)
    }
}
impl From<kernel::Error> for Error {
    fn from(e: kernel::Error) -> Self {
        Error::Kernel(e)
    }
}
impl From<systemd::Error> for Error {
    fn from(e: systemd::Error) -> Self {
        Error::Systemd(e)
    }
}
impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Nix(e)
    }
}
impl From<sleep_scripts::Error> for Error {
    fn from(e: sleep_scripts::Error) -> Self {
        Error::SleepScripts(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{}", e),
            Error::Cryptdevice(e) => write!(f, "{}", e),
            Error::Filesystem(e) => write!(f, "{}", e),
            Error::Inventory(e) => write!(f, "{}", e),
            Error::Kernel(e) => write!(f, "{}", e),
            Error::Systemd(e) => write!(f, "{}", e),
            Error::Nix(e) => write!(f, "system call failed: {}", e),
            Error::SleepScripts(e) => write!(f, "{}", e),
            Error::UnsafeSuspendBinary(path) => write!(f, "{} is missing or has unsafe permissions", path),
            Error::InnerFailed(status) => write!(f, "inner suspend process exited with {}", status),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Cryptdevice(e) => Some(e),
            Error::Filesystem(e) => Some(e),
            Error::Inventory(e) => Some(e),
            Error::Kernel(e) => Some(e),
            Error::Systemd(e) => Some(e),
            Error::Nix(e) => Some(e),
            Error::SleepScripts(e) => Some(e),
            _ => None,
        }
    }
}

/// Dup an inherited fd onto a fixed target fd number in the spawned child.
trait CommandRedirectionExt {
    fn take_fd_n(&mut self, fd: RawFd, target: RawFd) -> &mut Self;
}

impl CommandRedirectionExt for Command {
    fn take_fd_n(&mut self, fd: RawFd, target: RawFd) -> &mut Self {
        unsafe {
            self.pre_exec(move || {
                dup2(fd, target).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }
        self
    }
}

fn check_suspend_binary_safe(initramfs_dir: &Path) -> Result<()> {
    let suspend_bin = initramfs_dir.join("suspend");
    match kernel::is_executable_and_root_owned(&suspend_bin) {
        Ok(true) => Ok(()),
        _ => Err(Error::UnsafeSuspendBinary(suspend_bin.display().to_string())),
    }
}

fn bind_initramfs(initramfs_dir: &Path, compensator: &mut Stack) -> Result<()> {
    for dir in BIND_DIRS {
        let src = PathBuf::from("/").join(dir);
        let dst = initramfs_dir.join(dir);
        kernel::bind_mount(&src, &dst)?;
    }

    let dirs: Vec<PathBuf> = BIND_DIRS.iter().map(|d| initramfs_dir.join(d)).collect();
    compensator.push(move || {
        for dst in dirs.iter().rev() {
            if let Err(e) = kernel::unmount(dst) {
                warn!("failed to unmount {}: {}", dst.display(), e);
            }
        }
    });
    Ok(())
}

/// Run system-sleep scripts with `"pre"`, routing a failure through the
/// Strict-state `Policy::assert` (this runs before the root is frozen, so a
/// refused failure must abort, not just warn). Registers the `"post"`
/// counterpart as a compensator; by the time teardown reaches it the policy
/// is already Permissive, so that side only warns.
fn run_sleep_scripts(compensator: &mut Stack, policy: &Policy) -> Result<()> {
    let scripts = sleep_scripts::discover(Path::new(paths::SYSTEM_SLEEP_DIR))?;

    if !policy.assert_result(sleep_scripts::run_all(&scripts, "pre")) {
        policy.fail_hard();
    }

    compensator.push(move || {
        if let Err(e) = sleep_scripts::run_all(&scripts, "post") {
            warn!("{}", e);
        }
    });
    Ok(())
}

fn stop_services(compensator: &mut Stack) -> Result<()> {
    let stopped = systemd::stop_active(paths::STOPPED_SERVICES)?;
    debug!("stopped services: {}", stopped.join(", "));
    compensator.push(move || systemd::start_all(&stopped));
    Ok(())
}

fn disable_barriers(filesystems: Vec<filesystem::Filesystem>, compensator: &mut Stack) -> Result<()> {
    filesystem::disable_all(&filesystems)?;
    compensator.push(move || filesystem::enable_all(&filesystems));
    Ok(())
}

/// Spawn the inner process chrooted into `initramfs_dir`, handing it the
/// encoded device inventory on fd 3, and wait for it to exit.
fn run_inner_in_chroot(initramfs_dir: &Path, devices: &[Cryptdevice], policy: &Policy) -> Result<std::process::ExitStatus> {
    let (read_fd, write_fd): (RawFd, RawFd) = nix::unistd::pipe()?;

    {
        let mut write_file = unsafe { fs::File::from_raw_fd(write_fd) };
        inventory::encode(&mut write_file, devices)?;
    }

    let mut args = vec!["/suspend".to_string()];
    if policy.debug_mode() {
        args.push("-debug".to_string());
    }
    if policy.poweroff_on_error() {
        args.push("-poweroff".to_string());
    }

    let mut cmd = Command::new(&args[0]);
    cmd.args(&args[1..])
        .current_dir("/")
        .env_clear()
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .take_fd_n(read_fd, INVENTORY_FD);

    unsafe {
        let root = initramfs_dir.to_path_buf();
        cmd.pre_exec(move || kernel::enter_chroot(&root).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string())));
    }

    let mut child = cmd.spawn()?;
    let _ = nix::unistd::close(read_fd);
    Ok(child.wait()?)
}

/// Run the full outer pipeline.
pub fn run_outer(policy: &Policy) -> Result<()> {
    let cmdline = fs::read_to_string(paths::PROC_CMDLINE)?;
    let sysfs_block_dir = paths::sysfs_virtual_block_dir();

    // Discovery must be validated before any side effect runs - a Strict
    // failure here (e.g. no root cryptdevice on the cmdline) aborts before
    // even the sleep scripts fire.
    let devices = cryptdevice::discover(sysfs_block_dir, &cmdline)?;

    if devices.is_empty() {
        policy.enter_permissive();
        debug!("no cryptdevices found, doing normal suspend");
        let scripts = sleep_scripts::discover(Path::new(paths::SYSTEM_SLEEP_DIR))?;
        if let Err(e) = sleep_scripts::run_all(&scripts, "pre") {
            warn!("{}", e);
        }
        kernel::suspend_to_ram()?;
        if let Err(e) = sleep_scripts::run_all(&scripts, "post") {
            warn!("{}", e);
        }
        return Ok(());
    }

    let filesystems = filesystem::discover(Path::new(paths::PROC_MOUNTS))?;

    check_suspend_binary_safe(Path::new(paths::INITRAMFS_ROOT))?;

    let mut compensator = Stack::new();

    bind_initramfs(Path::new(paths::INITRAMFS_ROOT), &mut compensator)?;
    run_sleep_scripts(&mut compensator, policy)?;
    stop_services(&mut compensator)?;

    kernel::sync_disks();

    disable_barriers(filesystems, &mut compensator)?;

    debug!("calling suspend in initramfs chroot");
    let status = run_inner_in_chroot(Path::new(paths::INITRAMFS_ROOT), &devices, policy);

    {
        let devices_for_resume = devices.clone();
        compensator.push(move || worker::resume_auxiliary_devices(&devices_for_resume));
    }

    // The root device has (hopefully) been unlocked by now - be less paranoid.
    policy.enter_permissive();

    let mut devices = devices;
    if let Err(e) = cryptdevice::attach_crypttab_keyfiles(&mut devices, Path::new(paths::CRYPTTAB)) {
        warn!("failed to read crypttab after resume: {}", e);
    }

    compensator.unwind();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(Error::InnerFailed(status)),
        Err(e) => Err(e),
    }
}
