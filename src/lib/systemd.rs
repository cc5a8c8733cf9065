//! `systemctl` wrapper for the services stopped across the suspend window.

use std::fmt;
use std::io;
use std::process::Command;

const SYSTEMCTL_BIN: &str = "/usr/bin/systemctl";

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
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
            Error::Io(e) => write!(f, "failed to execute systemctl: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
        }
    }
}

pub fn is_active(unit: &str) -> Result<bool> {
    let status = Command::new(SYSTEMCTL_BIN).args(["--quiet", "is-active", unit]).status()?;
    Ok(status.success())
}

fn run(verb: &str, unit: &str) -> Result<()> {
    let status = Command::new(SYSTEMCTL_BIN).args([verb, unit]).status()?;
    if !status.success() {
        warn!("systemctl {} {} exited non-zero", verb, unit);
    }
    Ok(())
}

pub fn stop(unit: &str) -> Result<()> {
    run("stop", unit)
}

pub fn start(unit: &str) -> Result<()> {
    run("start", unit)
}

/// Stop every unit in `units` that is currently active, returning the subset
/// that was actually stopped so it can be restarted symmetrically.
pub fn stop_active(units: &[&str]) -> Result<Vec<String>> {
    let mut stopped = Vec::new();
    for unit in units {
        if is_active(unit)? {
            stop(unit)?;
            stopped.push(unit.to_string());
        }
    }
    Ok(stopped)
}

pub fn start_all(units: &[String]) {
    for unit in units {
        if let Err(e) = start(unit) {
            warn!("failed to restart {}: {}", unit, e);
        }
    }
}
