//! Wraps the external `cryptsetup` executable, which is treated as an
//! out-of-scope collaborator: this module never links libcryptsetup, it only
//! shells out.

use std::fmt;
use std::io;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use secstr::SecStr;

use crate::cryptdevice::Keyfile;

const CRYPTSETUP_BIN: &str = "/usr/bin/cryptsetup";

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    NonZeroExit { command: String, stderr: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "failed to execute cryptsetup: {}", e),
            Error::NonZeroExit { command, stderr } => {
                write!(f, "cryptsetup {} failed: {}", command, stderr.trim())
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::NonZeroExit { .. } => None,
        }
    }
}

fn run(args: &[String]) -> Result<()> {
    let output = Command::new(CRYPTSETUP_BIN).args(args).output()?;
    if !output.status.success() {
        return Err(Error::NonZeroExit {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(())
}

/// Freeze `name`, wiping its in-kernel master key.
pub fn luks_suspend(name: &str) -> Result<()> {
    run(&["luksSuspend".to_string(), name.to_string()])
}

/// Resume `name` by piping `passphrase` to `cryptsetup`'s stdin.
/// `tries` limits how many times cryptsetup itself will re-prompt on a bad
/// passphrase before giving up (the outer retry loop controls the rest).
pub fn luks_resume_with_passphrase(name: &str, passphrase: &SecStr, tries: u32) -> Result<()> {
    let mut child = Command::new(CRYPTSETUP_BIN)
        .args(["--tries", &tries.to_string(), "luksResume", name])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(passphrase.unsecure())?;
        stdin.write_all(b"\n")?;
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(Error::NonZeroExit {
            command: format!("--tries {} luksResume {}", tries, name),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(())
}

/// Resume `name` using a keyfile, honoring offset/size/slot/header if set.
pub fn luks_resume_with_keyfile(name: &str, keyfile_path: &Path, keyfile: &Keyfile) -> Result<()> {
    let mut args = vec!["--key-file".to_string(), keyfile_path.display().to_string()];

    if keyfile.offset > 0 {
        args.push("--keyfile-offset".to_string());
        args.push(keyfile.offset.to_string());
    }
    if keyfile.size > 0 {
        args.push("--keyfile-size".to_string());
        args.push(keyfile.size.to_string());
    }
    if let Some(slot) = keyfile.key_slot {
        args.push("--key-slot".to_string());
        args.push(slot.to_string());
    }
    if let Some(header) = &keyfile.header {
        args.push("--header".to_string());
        args.push(header.display().to_string());
    }

    args.push("luksResume".to_string());
    args.push(name.to_string());

    run(&args)
}
