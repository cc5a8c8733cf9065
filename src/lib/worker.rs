//! Bounded parallel fan-out for resuming auxiliary (non-root) cryptdevices
//! from their keyfiles, once the root has been unlocked.
//!
//! Concurrency is bounded to the number of logical CPUs via `rayon`'s global
//! pool. Devices stacked on top of one another (one's keyfile lives on
//! another's filesystem) are not detected - this is a known limitation
//! carried over from the upstream tool.

use rayon::prelude::*;

use crate::cryptdevice::Cryptdevice;
use crate::keyfile_resume;

/// Attempt to resume every non-root, currently-suspended device with an
/// available keyfile. Failures are logged, never propagated - by the time
/// this runs `ignore_errors` is always in effect.
pub fn resume_auxiliary_devices(devices: &[Cryptdevice]) {
    devices
        .par_iter()
        .filter(|d| !d.is_root)
        .for_each(|device| resume_one(device));
}

fn resume_one(device: &Cryptdevice) {
    let suspended_path = device.dm_dir.join("suspended");
    let suspended = match read_trimmed(&suspended_path) {
        Ok(contents) => contents == "1",
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("device {} vanished before it could be resumed", device.name);
            return;
        }
        Err(e) => {
            warn!("failed to read {}: {}", suspended_path.display(), e);
            return;
        }
    };

    if !suspended {
        return;
    }

    let keyfile = match &device.keyfile {
        Some(k) if k.available() => k,
        Some(_) => {
            warn!("keyfile for {} is unavailable, skipping", device.name);
            return;
        }
        None => {
            warn!("no keyfile attached for {}, skipping", device.name);
            return;
        }
    };

    match keyfile_resume::resume_with_keyfile(device, keyfile) {
        Ok(()) => info!("resumed {} from keyfile", device.name),
        Err(e) => warn!("failed to resume {} from keyfile: {}", device.name, e),
    }
}

fn read_trimmed(path: &std::path::Path) -> std::io::Result<String> {
    Ok(std::fs::read_to_string(path)?.trim_end_matches('\n').to_string())
}
