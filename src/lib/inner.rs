//! The initramfs-side orchestrator (SPEC_FULL §4.5): reads the device
//! inventory from fd 3, freezes devices in strict reverse order (root last),
//! suspends to RAM, then drives the interactive unlock loop.

use std::fmt;
use std::io;
use std::os::unix::io::FromRawFd;
use std::process::Command;

use crate::compensator::Stack;
use crate::cryptdevice::Cryptdevice;
use crate::cryptsetup;
use crate::inventory;
use crate::kernel;
use crate::paths;
use crate::policy::Policy;
use crate::unlock;

const INVENTORY_FD: i32 = 3;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Inventory(inventory::Error),
    Cryptsetup(cryptsetup::Error),
    Kernel(kernel::Error),
    Unlock(unlock::Error),
    EmptyInventory,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
impl From<inventory::Error> for Error {
    fn from(e: inventory::Error) -> Self {
        Error::Inventory(e)
    }
}
impl From<cryptsetup::Error> for Error {
    fn from(e: cryptsetup::Error) -> Self {
        Error::Cryptsetup(e)
    }
}
impl From<kernel::Error> for Error {
    fn from(e: kernel::Error) -> Self {
        Error::Kernel(e)
    }
}
impl From<unlock::Error> for Error {
    fn from(e: unlock::Error) -> Self {
        Error::Unlock(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{}", e),
            Error::Inventory(e) => write!(f, "{}", e),
            Error::Cryptsetup(e) => write!(f, "{}", e),
            Error::Kernel(e) => write!(f, "{}", e),
            Error::Unlock(e) => write!(f, "{}", e),
            Error::EmptyInventory => write!(f, "received an empty device inventory"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Inventory(e) => Some(e),
            Error::Cryptsetup(e) => Some(e),
            Error::Kernel(e) => Some(e),
            Error::Unlock(e) => Some(e),
            Error::EmptyInventory => None,
        }
    }
}

fn start_udev_daemon() -> Result<()> {
    Command::new("/usr/lib/systemd/systemd-udevd")
        .args(["--daemon", "--resolve-names=never"])
        .status()?;
    Ok(())
}

fn stop_udev_daemon() -> Result<()> {
    Command::new("/usr/bin/udevadm").arg("control").arg("--exit").status()?;
    Ok(())
}

/// Freeze every device in reverse inventory order, so the root (index 0) is
/// frozen last - an auxiliary device may be backed by a file on the root FS,
/// and freezing the root first would deadlock its own freeze.
fn freeze_all(devices: &[Cryptdevice]) -> Result<()> {
    for device in devices.iter().rev() {
        debug!("suspending {}", device.name);
        cryptsetup::luks_suspend(&device.name)?;
    }
    Ok(())
}

pub fn run_inner(policy: &Policy) -> Result<()> {
    let inventory_file = unsafe { std::fs::File::from_raw_fd(INVENTORY_FD) };
    debug!("loading device inventory");
    let devices = inventory::decode(inventory_file)?;

    if devices.is_empty() {
        return Err(Error::EmptyInventory);
    }

    let mut compensator = Stack::new();

    let root_keyfile_needs_udev = devices[0].keyfile.as_ref().map_or(false, |k| k.device.is_some());
    if root_keyfile_needs_udev {
        debug!("root keyfile references an external device, starting udevd");
        if !policy.assert_result(start_udev_daemon()) {
            policy.fail_hard();
        }
        compensator.push(|| {
            if let Err(e) = stop_udev_daemon() {
                warn!("failed to stop udevd: {}", e);
            }
        });
    }

    debug!("freezing {} device(s) in reverse order", devices.len());
    freeze_all(&devices)?;

    // Master keys are gone - failing loudly from here on is worse than
    // proceeding best-effort.
    policy.enter_permissive();

    let old_timeout = kernel::get_freeze_timeout().ok();
    let _ = kernel::set_freeze_timeout(paths::FREEZE_TIMEOUT_DURING_SUSPEND_MS);

    if policy.debug_mode() {
        debug!("debug mode: skipping suspend to RAM");
    } else {
        kernel::suspend_to_ram()?;
    }

    if let Some(timeout) = old_timeout {
        let _ = kernel::set_freeze_timeout(timeout);
    }

    let root = &devices[0];
    loop {
        match unlock::attempt_unlock(root, policy)? {
            true => break,
            false => {
                if policy.poweroff_on_error() {
                    policy.fail_hard();
                }
                // otherwise loop again, re-prompting
            }
        }
    }

    compensator.unwind();

    Ok(())
}
