//! Discovery and modeling of LUKS1 dm-crypt mappings: sysfs enumeration, kernel
//! cmdline parsing for the root device and its keyfile, and `/etc/crypttab`
//! keyfile attachment for auxiliary devices.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};

use crate::paths;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    NoRootCryptdevice,
    DuplicateCryptdevice(String),
    MalformedCmdline(String),
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
            Error::NoRootCryptdevice => write!(f, "no root cryptdevice found on kernel cmdline"),
            Error::DuplicateCryptdevice(name) => write!(f, "duplicate cryptdevice: {}", name),
            Error::MalformedCmdline(token) => write!(f, "malformed cmdline token: {}", token),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Optional unlock material for a cryptdevice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyfile {
    pub path: PathBuf,
    pub device: Option<PathBuf>,
    pub fstype: Option<String>,
    pub offset: u64,
    pub size: u64,
    pub key_slot: Option<u8>,
    pub header: Option<PathBuf>,
}

impl Keyfile {
    pub fn blank() -> Keyfile {
        Keyfile {
            path: PathBuf::new(),
            device: None,
            fstype: None,
            offset: 0,
            size: 0,
            key_slot: None,
            header: None,
        }
    }

    pub fn defined(&self) -> bool {
        !self.path.as_os_str().is_empty()
    }

    /// True when `defined()` and the referenced keyfile (or its backing device,
    /// when one is set) actually exists on the current filesystem view.
    pub fn available(&self) -> bool {
        if !self.defined() {
            return false;
        }
        match &self.device {
            Some(dev) => dev.exists(),
            None => self.path.exists(),
        }
    }
}

/// One active LUKS1 dm-crypt mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cryptdevice {
    pub name: String,
    pub uuid: String,
    pub dm_dir: PathBuf,
    pub is_root: bool,
    pub keyfile: Option<Keyfile>,
}

/// Resolve a `PREFIX=value` device reference (as used in kernel cmdline and
/// crypttab second fields) to a concrete `/dev/disk/by-*` path.
pub fn resolve_device_prefix(s: &str) -> PathBuf {
    let by = |dir: &str, value: &str| Path::new(dir).join(value);
    if let Some(v) = s.strip_prefix("UUID=") {
        by(paths::DISK_BY_UUID_DIR, v)
    } else if let Some(v) = s.strip_prefix("LABEL=") {
        by(paths::DISK_BY_LABEL_DIR, v)
    } else if let Some(v) = s.strip_prefix("PARTUUID=") {
        by(paths::DISK_BY_PARTUUID_DIR, v)
    } else if let Some(v) = s.strip_prefix("PARTLABEL=") {
        by(paths::DISK_BY_PARTLABEL_DIR, v)
    } else if let Some(v) = s.strip_prefix("ID=") {
        by(paths::DISK_BY_ID_DIR, v)
    } else if let Some(v) = s.strip_prefix("PATH=") {
        PathBuf::from(v)
    } else {
        PathBuf::from(s)
    }
}

/// Parse `/proc/cmdline` contents for the root dm name and its keyfile hint.
/// Last `cryptdevice=` token wins; malformed `cryptkey=` tokens are skipped.
fn parse_cmdline(contents: &str) -> Result<(String, Keyfile)> {
    let mut rootdev = String::new();
    let mut key = Keyfile::blank();
    key.path = PathBuf::from(paths::DEFAULT_KEYFILE_PATH);

    for token in contents.split_whitespace() {
        let mut kv = token.splitn(2, '=');
        let (k, v) = match (kv.next(), kv.next()) {
            (Some(k), Some(v)) => (k, v),
            _ => continue,
        };

        match k {
            "cryptdevice" => {
                let fields: Vec<&str> = v.splitn(3, ':').collect();
                if fields.len() < 2 {
                    continue;
                }
                rootdev = fields[1].to_string();
            }
            "cryptkey" => {
                let fields: Vec<&str> = v.splitn(3, ':').collect();
                if fields.len() < 2 {
                    continue;
                }
                if fields.len() == 2 && fields[0] == "rootfs" {
                    key.path = PathBuf::from(fields[1]);
                    key.device = None;
                    key.offset = 0;
                    key.size = 0;
                    continue;
                }
                if fields.len() < 3 {
                    continue;
                }
                if let Ok(offset) = fields[1].parse::<u64>() {
                    let size = match fields[2].parse::<u64>() {
                        Ok(size) => size,
                        Err(_) => continue,
                    };
                    key.path = resolve_device_prefix(fields[0]);
                    key.device = None;
                    key.offset = offset;
                    key.size = size;
                } else {
                    // cryptkey=device:fstype:path - requires mounting before the
                    // keyfile can be read.
                    key.device = Some(resolve_device_prefix(fields[0]));
                    key.fstype = Some(fields[1].to_string());
                    key.path = PathBuf::from(fields[2]);
                    key.offset = 0;
                    key.size = 0;
                }
            }
            _ => {}
        }
    }

    if rootdev.is_empty() {
        return Err(Error::NoRootCryptdevice);
    }

    Ok((rootdev, key))
}

fn read_trimmed(path: &Path) -> io::Result<String> {
    Ok(fs::read_to_string(path)?.trim_end_matches('\n').to_string())
}

/// Scan `sysfs_block_dir` (normally `/sys/devices/virtual/block`) for active
/// LUKS1 mappings, identify the root device from `cmdline_contents`, and
/// return the device list with the root device first.
pub fn discover(sysfs_block_dir: &Path, cmdline_contents: &str) -> Result<Vec<Cryptdevice>> {
    let (rootdev, rootkey) = parse_cmdline(cmdline_contents)?;

    let mut devices = Vec::new();
    let mut seen_names = std::collections::HashSet::new();

    let entries = match fs::read_dir(sysfs_block_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::from(e)),
    };

    for entry in entries {
        let entry = entry?;
        let dm_dir = entry.path().join("dm");
        if !dm_dir.is_dir() {
            continue;
        }

        let uuid = match read_trimmed(&dm_dir.join("uuid")) {
            Ok(uuid) => uuid,
            Err(_) => continue,
        };
        if !uuid.starts_with(paths::LUKS1_DM_UUID_PREFIX) {
            continue;
        }

        if let Ok(suspended) = read_trimmed(&dm_dir.join("suspended")) {
            if suspended == "1" {
                continue;
            }
        }

        let name = read_trimmed(&dm_dir.join("name"))?;
        if !seen_names.insert(name.clone()) {
            return Err(Error::DuplicateCryptdevice(name));
        }

        let is_root = name == rootdev;
        let keyfile = if is_root { Some(rootkey.clone()) } else { None };

        devices.push(Cryptdevice {
            name,
            uuid,
            dm_dir,
            is_root,
            keyfile,
        });
    }

    if let Some(root_idx) = devices.iter().position(|d| d.is_root) {
        devices.swap(0, root_idx);
    } else {
        return Err(Error::NoRootCryptdevice);
    }

    debug!("discovered {} cryptdevice(s)", devices.len());
    Ok(devices)
}

fn parse_crypttab_options(key: &mut Keyfile, opts: &str) {
    for opt in opts.split(',') {
        let mut kv = opt.splitn(2, '=');
        let (k, v) = match (kv.next(), kv.next()) {
            (Some(k), Some(v)) => (k, v),
            _ => continue,
        };
        match k {
            "keyfile-offset" => {
                if let Ok(n) = v.parse::<u64>() {
                    key.offset = n;
                }
            }
            "keyfile-size" => {
                if let Ok(n) = v.parse::<u64>() {
                    key.size = n;
                }
            }
            "key-slot" => {
                if let Ok(n) = v.parse::<u8>() {
                    if n <= 7 {
                        key.key_slot = Some(n);
                    }
                }
            }
            "header" => {
                key.header = Some(PathBuf::from(v));
            }
            _ => {}
        }
    }
}

/// Parse one non-comment, non-blank `/etc/crypttab` line. Returns `None` for
/// malformed lines or entries with no password material (`-`/`none`).
fn parse_crypttab_entry(line: &str) -> Option<(String, Keyfile)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 3 || fields[2] == "-" || fields[2] == "none" {
        return None;
    }

    let mut key = Keyfile::blank();
    key.path = PathBuf::from(fields[2]);

    if let Some(opts) = fields.get(3) {
        parse_crypttab_options(&mut key, opts);
    }

    Some((fields[0].to_string(), key))
}

/// Attach keyfile records parsed from `crypttab_path` to the matching devices
/// (by name) in `devices`. Entries for names not present in `devices` are ignored.
pub fn attach_crypttab_keyfiles(devices: &mut [Cryptdevice], crypttab_path: &Path) -> Result<()> {
    let contents = match fs::read_to_string(crypttab_path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::from(e)),
    };

    for line in contents.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some((name, key)) = parse_crypttab_entry(line) {
            if let Some(device) = devices.iter_mut().find(|d| d.name == name) {
                device.keyfile = Some(key);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use expectest::prelude::*;

    #[test]
    fn test_cmdline_last_cryptdevice_wins() {
        let (name, _) = parse_cmdline("cryptdevice=/dev/sda1:cryptroot1 cryptdevice=/dev/sda2:cryptroot2\n").unwrap();
        expect!(name).to(be_equal_to("cryptroot2"));
    }

    #[test]
    fn test_cmdline_uuid_prefixed_cryptdevice() {
        let (name, _) = parse_cmdline(
            "cryptdevice=UUID=d55cc35b-e99b-44ce-be89-4c573fccfb0b:cryptroot root=/dev/mapper/cryptroot\n",
        )
        .unwrap();
        expect!(name).to(be_equal_to("cryptroot"));
    }

    #[test]
    fn test_cmdline_cryptkey_rootfs() {
        let (name, key) = parse_cmdline("cryptdevice=/dev/sda2:root cryptkey=rootfs:/var/rootfs.key\n").unwrap();
        expect!(name).to(be_equal_to("root"));
        expect!(key.path).to(be_equal_to(PathBuf::from("/var/rootfs.key")));
        expect!(key.offset).to(be_equal_to(0));
    }

    #[test]
    fn test_cmdline_cryptkey_offset_size() {
        let (_, key) = parse_cmdline("cryptdevice=/dev/sda2:root cryptkey=/dev/sdb:512:1024\n").unwrap();
        expect!(key.path).to(be_equal_to(PathBuf::from("/dev/sdb")));
        expect!(key.offset).to(be_equal_to(512));
        expect!(key.size).to(be_equal_to(1024));
    }

    #[test]
    fn test_cmdline_no_root_cryptdevice_is_error() {
        let result = parse_cmdline("BOOT_IMAGE=../vmlinuz-linux rw initrd=../initramfs-linux.img\n");
        expect!(result).to(be_err());
    }

    #[test]
    fn test_crypttab_malformed_lines_ignored() {
        expect!(parse_crypttab_entry("foo")).to(be_none());
        expect!(parse_crypttab_entry("foo bar")).to(be_none());
    }

    #[test]
    fn test_crypttab_no_options() {
        let (name, key) =
            parse_crypttab_entry("crypt1 UUID=f7dd3b0e-b7ae-4f7c-8c31-4895e4c23231 /root/.keys/crypt1.key").unwrap();
        expect!(name).to(be_equal_to("crypt1"));
        expect!(key.path).to(be_equal_to(PathBuf::from("/root/.keys/crypt1.key")));
        expect!(key.offset).to(be_equal_to(0));
        expect!(key.size).to(be_equal_to(0));
    }

    #[test]
    fn test_crypttab_offset_and_size_last_duplicate_wins() {
        let (name, key) = parse_crypttab_entry(
            "crypt2 UUID=f7dd3b0e-b7ae-4f7c-8c31-4895e4c23231 /root/.keys/crypt2.key keyfile-size=512,luks,noauto,keyfile-offset=1024",
        )
        .unwrap();
        expect!(name).to(be_equal_to("crypt2"));
        expect!(key.size).to(be_equal_to(512));
        expect!(key.offset).to(be_equal_to(1024));

        let (_, key2) = parse_crypttab_entry(
            "crypt2 UUID=f7dd3b0e-b7ae-4f7c-8c31-4895e4c23231 /root/.keys/crypt2.key keyfile-size=512,luks,keyfile-size=1024,noauto",
        )
        .unwrap();
        expect!(key2.size).to(be_equal_to(1024));
    }

    #[test]
    fn test_crypttab_malformed_numeric_values_ignored() {
        let (_, key) = parse_crypttab_entry(
            "crypt2 UUID=f7dd3b0e-b7ae-4f7c-8c31-4895e4c23231 /root/.keys/crypt2.key keyfile-size=foo,keyfile-size=4096,,keyfile-offset=1024,luks,,,noauto,keyfile-offset=bar",
        )
        .unwrap();
        expect!(key.size).to(be_equal_to(4096));
        expect!(key.offset).to(be_equal_to(1024));
    }

    #[test]
    fn test_crypttab_key_slot_bounds() {
        let mut key = Keyfile::blank();
        parse_crypttab_options(&mut key, "key-slot=8");
        expect!(key.key_slot).to(be_none());

        let mut key = Keyfile::blank();
        parse_crypttab_options(&mut key, "key-slot=7");
        expect!(key.key_slot).to(be_some().value(7));
    }

    #[test]
    fn test_discover_excludes_suspended_and_non_luks1() {
        let dir = tempfile::tempdir().unwrap();
        let block_dir = dir.path().join("block");

        let make_dm = |disk: &str, uuid: &str, suspended: &str, name: &str| {
            let dm = block_dir.join(disk).join("dm");
            fs::create_dir_all(&dm).unwrap();
            fs::write(dm.join("uuid"), format!("{}\n", uuid)).unwrap();
            fs::write(dm.join("suspended"), suspended).unwrap();
            fs::write(dm.join("name"), format!("{}\n", name)).unwrap();
        };

        make_dm("dm-0", "CRYPT-LUKS1-aaaaaaaa", "0", "cryptroot2");
        make_dm("dm-1", "CRYPT-LUKS1-bbbbbbbb", "1", "already-suspended");
        make_dm("dm-2", "CRYPT-PLAIN-cccccccc", "0", "not-luks1");

        let cmdline = "cryptdevice=/dev/sda1:cryptroot1 cryptdevice=/dev/sda2:cryptroot2\n";
        let devices = discover(&block_dir, cmdline).unwrap();

        expect!(devices.len()).to(be_equal_to(1));
        expect!(&devices[0].name).to(be_equal_to("cryptroot2"));
        expect!(devices[0].is_root).to(be_true());
    }
}
