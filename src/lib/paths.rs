//! Hardcoded paths, prefixes and the systemd unit set this tool touches.

use std::path::Path;

pub const SYSFS_VIRTUAL_BLOCK_DIR: &str = "/sys/devices/virtual/block";
pub const PROC_CMDLINE: &str = "/proc/cmdline";
pub const PROC_MOUNTS: &str = "/proc/mounts";
pub const CRYPTTAB: &str = "/etc/crypttab";
pub const SYSTEM_SLEEP_DIR: &str = "/usr/lib/systemd/system-sleep";

pub const SYS_POWER_STATE: &str = "/sys/power/state";
pub const SYS_POWER_FREEZE_TIMEOUT: &str = "/sys/power/pm_freeze_timeout";
pub const SYSRQ_TRIGGER: &str = "/proc/sysrq-trigger";

pub const INITRAMFS_ROOT: &str = "/run/initramfs";
pub const INITRAMFS_SUSPEND_BIN: &str = "/run/initramfs/suspend";

pub const DISK_BY_ID_DIR: &str = "/dev/disk/by-id";
pub const DISK_BY_UUID_DIR: &str = "/dev/disk/by-uuid";
pub const DISK_BY_LABEL_DIR: &str = "/dev/disk/by-label";
pub const DISK_BY_PARTUUID_DIR: &str = "/dev/disk/by-partuuid";
pub const DISK_BY_PARTLABEL_DIR: &str = "/dev/disk/by-partlabel";

/// sysfs dm uuid prefix identifying an active LUKS1 mapping.
///
/// Kept as a single constant so a future LUKS2 extension is a one-line change
/// (see the open question recorded in DESIGN.md).
pub const LUKS1_DM_UUID_PREFIX: &str = "CRYPT-LUKS1-";

/// Default keyfile path assumed before the kernel cmdline is scanned, matching
/// the upstream tool's convention of a sensible guess rather than a hard requirement.
pub const DEFAULT_KEYFILE_PATH: &str = "/crypto_keyfile.bin";

pub const FREEZE_TIMEOUT_DURING_SUSPEND_MS: u32 = 1000;

/// Sentinel exit code from the rescue shell meaning "resume normal execution".
pub const RESCUE_SHELL_RESUME_CODE: i32 = 42;

/// Services stopped (if active) before suspend and restarted (if they were stopped by us) after.
pub const STOPPED_SERVICES: &[&str] = &[
    "syslog.socket",
    "systemd-journald.socket",
    "systemd-journald-dev-log.socket",
    "systemd-journald-audit.socket",
    "systemd-journald.service",
    "systemd-udevd-control.socket",
    "systemd-udevd-kernel.socket",
    "systemd-udevd.service",
];

pub fn sysfs_virtual_block_dir() -> &'static Path {
    Path::new(SYSFS_VIRTUAL_BLOCK_DIR)
}
