//! Interactive root passphrase prompt: raw-mode TTY, byte-level line editor
//! with ESC/^W/^R/^T bindings, and a zeroize-scrubbed scratch buffer.

use std::fmt;
use std::io;
use std::io::{Read, Write};
use std::os::unix::io::RawFd;

use secstr::SecStr;
use termios::*;
use zeroize::Zeroize;

use crate::cryptdevice::Cryptdevice;
use crate::kernel;
use crate::keyfile_resume;
use crate::policy::Policy;

const STDIN_FD: RawFd = libc::STDIN_FILENO;
const BUFFER_SIZE: usize = 4096;

const ESC: u8 = 0x1b;
const CTRL_W: u8 = 0x17;
const CTRL_R: u8 = 0x12;
const CTRL_T: u8 = 0x14;
const BACKSPACE: u8 = 0x08;
const DEL: u8 = 0x7f;
const NEWLINE: u8 = b'\n';

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    NotATty,
    Kernel(kernel::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<kernel::Error> for Error {
    fn from(e: kernel::Error) -> Self {
        Error::Kernel(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::NotATty => write!(f, "stdin is not a tty"),
            Error::Kernel(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Kernel(e) => Some(e),
            Error::NotATty => None,
        }
    }
}

/// Raw-mode guard: disables ICANON|ECHO on construction, always restores the
/// saved termios on drop, regardless of how the scope is exited.
struct RawMode {
    saved: Termios,
}

impl RawMode {
    fn enter() -> Result<RawMode> {
        if unsafe { libc::isatty(STDIN_FD) } != 1 {
            return Err(Error::NotATty);
        }
        let saved = Termios::from_fd(STDIN_FD)?;
        let mut raw = saved;
        raw.c_lflag &= !(ICANON | ECHO);
        tcsetattr(STDIN_FD, TCSANOW, &raw)?;
        Ok(RawMode { saved })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = tcsetattr(STDIN_FD, TCSANOW, &self.saved);
    }
}

/// A fixed-size scratch buffer for the line editor, zeroed on drop.
struct ScrubbedBuffer {
    data: Vec<u8>,
}

impl ScrubbedBuffer {
    fn new() -> ScrubbedBuffer {
        ScrubbedBuffer {
            data: Vec::with_capacity(BUFFER_SIZE),
        }
    }

    fn push(&mut self, b: u8) {
        if self.data.len() < BUFFER_SIZE {
            self.data.push(b);
        }
    }

    fn pop(&mut self) {
        self.data.pop();
    }

    fn clear(&mut self) {
        self.data.zeroize();
        self.data.clear();
    }

    fn to_secstr(&self) -> SecStr {
        SecStr::new(self.data.clone())
    }
}

impl Drop for ScrubbedBuffer {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

enum LineResult {
    Submitted,
    KeyfileRequested,
    RescueRequested,
    Resuspended,
}

fn read_byte(stdin: &mut impl Read) -> io::Result<u8> {
    let mut b = [0u8; 1];
    stdin.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_line(buffer: &mut ScrubbedBuffer, policy: &Policy, has_keyfile: bool) -> Result<LineResult> {
    let mut stdin = io::stdin();
    loop {
        let b = read_byte(&mut stdin)?;
        match b {
            ESC => {
                info!("suspending to RAM");
                kernel::suspend_to_ram()?;
                buffer.clear();
                return Ok(LineResult::Resuspended);
            }
            CTRL_W => buffer.clear(),
            CTRL_R if has_keyfile => return Ok(LineResult::KeyfileRequested),
            CTRL_T if policy.debug_mode() => return Ok(LineResult::RescueRequested),
            NEWLINE => return Ok(LineResult::Submitted),
            BACKSPACE | DEL => buffer.pop(),
            printable if printable.is_ascii_graphic() || printable == b' ' => buffer.push(printable),
            _ => {}
        }
    }
}

const MAX_CONSECUTIVE_ATTEMPTS: u32 = 3;

/// Run one "outer loop iteration": try the root's keyfile if available, then
/// prompt interactively for up to `MAX_CONSECUTIVE_ATTEMPTS` consecutive
/// failed passphrase attempts, honoring ESC/^W/^R/^T along the way. Returns
/// `Ok(true)` on success, `Ok(false)` if all attempts were exhausted (the
/// caller decides whether to poweroff or call this again).
pub fn attempt_unlock(device: &Cryptdevice, policy: &Policy) -> Result<bool> {
    if let Some(keyfile) = &device.keyfile {
        if keyfile.available() {
            info!("attempting to unlock {} with keyfile", device.name);
            match keyfile_resume::resume_with_keyfile(device, keyfile) {
                Ok(()) => return Ok(true),
                Err(e) => warn!("keyfile unlock failed, falling back to prompt: {}", e),
            }
        }
    }

    let _raw_mode = match RawMode::enter() {
        Ok(guard) => Some(guard),
        Err(Error::NotATty) => {
            warn!("stdin is not a tty, falling back to direct passthrough");
            None
        }
        Err(e) => return Err(e),
    };

    let mut failed_attempts = 0;
    while failed_attempts < MAX_CONSECUTIVE_ATTEMPTS {
        print!("Enter passphrase for {}: ", device.name);
        io::stdout().flush()?;

        let mut buffer = ScrubbedBuffer::new();
        match read_line(&mut buffer, policy, device.keyfile.is_some())? {
            LineResult::Resuspended => continue,
            LineResult::RescueRequested => {
                policy.spawn_rescue_shell();
                continue;
            }
            LineResult::KeyfileRequested => {
                match &device.keyfile {
                    Some(keyfile) if keyfile.available() => {
                        info!("attempting to unlock {} with keyfile", device.name);
                        if keyfile_resume::resume_with_keyfile(device, keyfile).is_ok() {
                            return Ok(true);
                        }
                    }
                    _ => println!("keyfile unavailable."),
                }
                continue;
            }
            LineResult::Submitted => {
                let passphrase = buffer.to_secstr();
                match crate::cryptsetup::luks_resume_with_passphrase(&device.name, &passphrase, 1) {
                    Ok(()) => return Ok(true),
                    Err(e) => {
                        println!("failed to unlock: {}", e);
                        failed_attempts += 1;
                    }
                }
            }
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use expectest::prelude::*;

    #[test]
    fn test_scrubbed_buffer_push_pop() {
        let mut buf = ScrubbedBuffer::new();
        buf.push(b'a');
        buf.push(b'b');
        buf.pop();
        expect!(&buf.data).to(be_equal_to(&vec![b'a']));
    }

    #[test]
    fn test_scrubbed_buffer_clear_zeroes() {
        let mut buf = ScrubbedBuffer::new();
        buf.push(b's');
        buf.push(b'e');
        buf.push(b'c');
        buf.clear();
        expect!(buf.data.len()).to(be_equal_to(0));
    }

    #[test]
    fn test_scrubbed_buffer_caps_at_max_size() {
        let mut buf = ScrubbedBuffer::new();
        for _ in 0..BUFFER_SIZE + 10 {
            buf.push(b'x');
        }
        expect!(buf.data.len()).to(be_equal_to(BUFFER_SIZE));
    }
}
