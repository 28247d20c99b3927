//! Byte-level serial link to the modem.
//!
//! [`SerialLink`] opens the tty with nix termios (raw, 8N1, no flow control)
//! and configures `VMIN=0, VTIME=0` so reads return immediately with whatever
//! is pending. Nothing here retries or interprets bytes; that is the
//! correlator's job.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use nix::unistd;
use tracing::{debug, info};

use crate::error::Error;

/// Read buffer size (AT responses are small).
const READ_BUF_SIZE: usize = 1024;

/// The AT port of a SIM7600 when all five USB interfaces are enumerated.
const PREFERRED_AT_PORT: &str = "ttyUSB2";

/// Minimal contract the correlator needs from a link.
pub trait Transport: Send {
    /// Write every byte or fail.
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Return whatever input is pending. Never blocks; empty when idle.
    fn read_available(&mut self) -> Result<Vec<u8>, Error>;

    /// Drop any buffered input.
    fn clear(&mut self) -> Result<(), Error>;
}

/// Helper to get a `BorrowedFd` from a `RawFd` for nix termios calls.
///
/// # Safety
/// The caller must ensure `fd` is a valid open file descriptor.
unsafe fn borrow_fd(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// An open serial device. Closed on drop.
pub struct SerialLink {
    fd: RawFd,
    path: String,
    baud_rate: u32,
    open: bool,
}

impl SerialLink {
    /// Open a serial device path (e.g. `/dev/ttyUSB2`) at `baud_rate`.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, Error> {
        let speed = baud_from_u32(baud_rate)?;

        let fd = fcntl::open(path, OFlag::O_RDWR | OFlag::O_NOCTTY, Mode::empty())
            .map_err(|e| Error::Transport(format!("open {path}: {e}")))?;

        if let Err(e) = configure_termios(fd, speed) {
            let _ = unistd::close(fd);
            return Err(e);
        }

        // SAFETY: fd is valid, we just opened it
        unsafe {
            termios::tcflush(borrow_fd(fd), termios::FlushArg::TCIOFLUSH)
                .map_err(|e| Error::Transport(format!("tcflush: {e}")))?;
        }

        info!("Serial {path}: opened ({baud_rate} 8N1)");

        Ok(Self {
            fd,
            path: path.to_string(),
            baud_rate,
            open: true,
        })
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Transport(format!("{} is closed", self.path)))
        }
    }

    /// Close the fd. Further I/O fails with a transport error.
    pub fn close(&mut self) {
        if self.open {
            let _ = unistd::close(self.fd);
            self.open = false;
            debug!("Serial {}: closed", self.path);
        }
    }
}

impl Transport for SerialLink {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.ensure_open()?;
        // SAFETY: fd stays open while `self.open` is set
        let bfd = unsafe { borrow_fd(self.fd) };
        let mut written = 0;
        while written < bytes.len() {
            match unistd::write(bfd, &bytes[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EINTR | nix::errno::Errno::EAGAIN) => {}
                Err(e) => return Err(Error::Transport(format!("write {}: {e}", self.path))),
            }
        }
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, Error> {
        self.ensure_open()?;
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut out = Vec::new();
        loop {
            match unistd::read(self.fd, &mut buf) {
                // VMIN=0/VTIME=0: nothing pending
                Ok(0) | Err(nix::errno::Errno::EAGAIN) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(Error::Transport(format!("read {}: {e}", self.path))),
            }
        }
        Ok(out)
    }

    fn clear(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        // SAFETY: fd stays open while `self.open` is set
        let bfd = unsafe { borrow_fd(self.fd) };
        termios::tcflush(bfd, termios::FlushArg::TCIFLUSH)
            .map_err(|e| Error::Transport(format!("tcflush {}: {e}", self.path)))
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Configure termios: raw mode, requested baud, 8N1, no flow control.
/// VMIN=0, VTIME=0 → reads never block.
fn configure_termios(fd: RawFd, speed: BaudRate) -> Result<(), Error> {
    // SAFETY: fd is valid, caller just opened it
    let borrowed = unsafe { borrow_fd(fd) };

    let mut tio = termios::tcgetattr(borrowed)
        .map_err(|e| Error::Transport(format!("tcgetattr: {e}")))?;

    termios::cfmakeraw(&mut tio);

    termios::cfsetispeed(&mut tio, speed)
        .map_err(|e| Error::Transport(format!("cfsetispeed: {e}")))?;
    termios::cfsetospeed(&mut tio, speed)
        .map_err(|e| Error::Transport(format!("cfsetospeed: {e}")))?;

    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio)
        .map_err(|e| Error::Transport(format!("tcsetattr: {e}")))
}

fn baud_from_u32(baud: u32) -> Result<BaudRate, Error> {
    Ok(match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        460_800 => BaudRate::B460800,
        921_600 => BaudRate::B921600,
        other => return Err(Error::Transport(format!("unsupported baud rate {other}"))),
    })
}

/// Find a modem AT port under `/dev`.
pub fn detect_device() -> Option<String> {
    detect_device_in(Path::new("/dev"))
}

/// Prefers `ttyUSB2`, otherwise the lowest-numbered `ttyUSB*` in `dir`.
fn detect_device_in(dir: &Path) -> Option<String> {
    let mut candidates: Vec<String> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("ttyUSB"))
        .collect();

    candidates.sort_by_key(|name| {
        name.trim_start_matches("ttyUSB")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let chosen = candidates
        .iter()
        .find(|name| name.as_str() == PREFERRED_AT_PORT)
        .or_else(|| candidates.first())?;

    Some(dir.join(chosen).to_string_lossy().into_owned())
}
