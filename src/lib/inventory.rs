//! Length-prefixed `serde_json` framing used to carry the device inventory
//! from the outer process to the inner process over an inherited pipe.

use std::fmt;
use std::io;
use std::io::{Read, Write};

use crate::cryptdevice::Cryptdevice;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Json(serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Json(e) => write!(f, "inventory record malformed: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
        }
    }
}

/// Write every device as a `u32`-length-prefixed JSON record.
pub fn encode<W: Write>(mut writer: W, devices: &[Cryptdevice]) -> Result<()> {
    for device in devices {
        let bytes = serde_json::to_vec(device)?;
        writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&bytes)?;
    }
    Ok(())
}

/// Read length-prefixed JSON records until EOF.
pub fn decode<R: Read>(mut reader: R) -> Result<Vec<Cryptdevice>> {
    let mut devices = Vec::new();
    let mut len_buf = [0u8; 4];

    loop {
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::from(e)),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        let mut record = vec![0u8; len];
        reader.read_exact(&mut record)?;
        devices.push(serde_json::from_slice(&record)?);
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryptdevice::Keyfile;
    use expectest::prelude::*;
    use std::path::PathBuf;

    fn sample_devices() -> Vec<Cryptdevice> {
        vec![
            Cryptdevice {
                name: "cryptroot".to_string(),
                uuid: "CRYPT-LUKS1-deadbeef".to_string(),
                dm_dir: PathBuf::from("/sys/devices/virtual/block/dm-0/dm"),
                is_root: true,
                keyfile: Some(Keyfile::blank()),
            },
            Cryptdevice {
                name: "cryptdata".to_string(),
                uuid: "CRYPT-LUKS1-cafef00d".to_string(),
                dm_dir: PathBuf::from("/sys/devices/virtual/block/dm-1/dm"),
                is_root: false,
                keyfile: None,
            },
        ]
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let devices = sample_devices();
        let mut buf = Vec::new();
        encode(&mut buf, &devices).unwrap();

        let decoded = decode(&buf[..]).unwrap();
        expect!(decoded.len()).to(be_equal_to(devices.len()));
        expect!(&decoded[0].name).to(be_equal_to(&devices[0].name));
        expect!(decoded[0].is_root).to(be_true());
        expect!(&decoded[1].name).to(be_equal_to(&devices[1].name));
    }

    #[test]
    fn test_decode_empty_input() {
        let decoded = decode(&b""[..]).unwrap();
        expect!(decoded.len()).to(be_equal_to(0));
    }
}
