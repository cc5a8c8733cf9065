//! Shared "resume a device from its keyfile" logic (SPEC_FULL §4.7), used
//! both by the interactive unlock's keyfile-first attempt and the auxiliary
//! device worker pool.

use std::fmt;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;

use crate::cryptdevice::{Cryptdevice, Keyfile};
use crate::cryptsetup;
use crate::kernel;

const MOUNT_DIR: &str = "/go-luks-suspend-mnt";

#[derive(Debug)]
pub enum Error {
    Kernel(kernel::Error),
    Cryptsetup(cryptsetup::Error),
    Io(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<kernel::Error> for Error {
    fn from(e: kernel::Error) -> Self {
        Error::Kernel(e)
    }
}

impl From<cryptsetup::Error> for Error {
    fn from(e: cryptsetup::Error) -> Self {
        Error::Cryptsetup(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Kernel(e) => write!(f, "{}", e),
            Error::Cryptsetup(e) => write!(f, "{}", e),
            Error::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Kernel(e) => Some(e),
            Error::Cryptsetup(e) => Some(e),
            Error::Io(e) => Some(e),
        }
    }
}

/// Resume `device` using `keyfile`. If the keyfile lives on a separate
/// filesystem (`keyfile.device` set), mount it read-only under a scratch
/// mountpoint first, then unmount and remove the mountpoint afterwards.
pub fn resume_with_keyfile(device: &Cryptdevice, keyfile: &Keyfile) -> Result<()> {
    match &keyfile.device {
        Some(source_device) => {
            let mountdir = PathBuf::from(MOUNT_DIR);
            std::fs::DirBuilder::new().mode(0o700).create(&mountdir).or_else(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;

            let fstype = keyfile.fstype.as_deref().unwrap_or("auto");
            kernel::mount_device(source_device, &mountdir, fstype, true)?;

            let full_path = mountdir.join(keyfile.path.strip_prefix("/").unwrap_or(&keyfile.path));
            let result = cryptsetup::luks_resume_with_keyfile(&device.name, &full_path, keyfile);

            if let Err(e) = kernel::unmount(&mountdir) {
                warn!("failed to unmount keyfile mountpoint {}: {}", mountdir.display(), e);
            }
            let _ = std::fs::remove_dir(&mountdir);

            result.map_err(Error::from)
        }
        None => cryptsetup::luks_resume_with_keyfile(&device.name, &keyfile.path, keyfile).map_err(Error::from),
    }
}
