//! Enumerates and runs `/usr/lib/systemd/system-sleep/*` hooks in parallel,
//! matching the distro convention of invoking them as `script pre|post suspend`.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use rayon::prelude::*;

use crate::kernel;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    ScriptsFailed(String),
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
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::ScriptsFailed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::ScriptsFailed(_) => None,
        }
    }
}

/// Scripts that pass the root-owned, not-group/world-writable, executable check.
/// Scripts that fail it are skipped with a warning, never treated as fatal.
pub fn discover(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::from(e)),
    };

    let mut scripts = Vec::new();
    for entry in entries {
        let path = entry?.path();
        match kernel::is_executable_and_root_owned(&path) {
            Ok(true) => scripts.push(path),
            Ok(false) => warn!("skipping system-sleep script {}: unsafe permissions", path.display()),
            Err(e) => warn!("skipping system-sleep script {}: {}", path.display(), e),
        }
    }
    scripts.sort();
    Ok(scripts)
}

fn run_one(script: &Path, stage: &str) -> std::result::Result<(), String> {
    match Command::new(script).args([stage, "suspend"]).status() {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(format!("system-sleep script {} {} exited with {}", script.display(), stage, status)),
        Err(e) => Err(format!("failed to execute {} {}: {}", script.display(), stage, e)),
    }
}

/// Run all discovered scripts concurrently, one worker per script. Every
/// worker's error is recorded into a position-indexed slot; if any script
/// failed, the joined messages (separator `" • "`) are returned so the
/// caller can route the failure through `Policy::assert`.
pub fn run_all(scripts: &[PathBuf], stage: &str) -> Result<()> {
    let errors: Vec<String> = scripts.par_iter().filter_map(|script| run_one(script, stage).err()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::ScriptsFailed(errors.join(" • ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expectest::prelude::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_discover_skips_missing_dir() {
        let scripts = discover(Path::new("/nonexistent/system-sleep")).unwrap();
        expect!(scripts.len()).to(be_equal_to(0));
    }

    #[test]
    fn test_discover_finds_scripts_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["20-second", "10-first"] {
            let path = dir.path().join(name);
            fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let scripts = discover(dir.path()).unwrap();
        if unsafe { libc::getuid() } == 0 {
            expect!(scripts.len()).to(be_equal_to(2));
            expect!(scripts[0].file_name().unwrap().to_str().unwrap()).to(be_equal_to("10-first"));
        }
    }
}
