//! Pseudo-terminal creation.
//!
//! The consumer end stays with the client; the producer end is derived here
//! and handed to spawned children as their controlling terminal. Producer
//! derivation prefers `TIOCGPTPEER` (Linux >= 4.13) and falls back to
//! opening the `ptsname` path, which is all an older kernel offers.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use rustix::fs::{Mode, OFlags};
use rustix::io::{Errno, FdFlags};
use rustix::pty::OpenptFlags;

use crate::envdetect;
use crate::error::AgentError;

/// Opens a new consumer (control) end of a pseudo-terminal.
pub fn create_consumer() -> Result<OwnedFd, AgentError> {
    let flags = OpenptFlags::RDWR | OpenptFlags::NOCTTY | OpenptFlags::CLOEXEC;

    let fd = match rustix::pty::openpt(flags) {
        Ok(fd) => fd,
        // Some kernels reject O_CLOEXEC on the ptmx open; fall back to
        // setting the flag separately.
        Err(Errno::INVAL) => {
            let fd = rustix::pty::openpt(OpenptFlags::RDWR | OpenptFlags::NOCTTY)?;
            rustix::io::fcntl_setfd(&fd, FdFlags::CLOEXEC)?;
            fd
        }
        Err(errno) => return Err(errno.into()),
    };

    rustix::io::ioctl_fionbio(&fd, true)?;

    Ok(fd)
}

/// Derives the producer end for `consumer`.
pub fn create_producer(consumer: BorrowedFd<'_>) -> Result<OwnedFd, AgentError> {
    rustix::pty::grantpt(consumer)?;
    rustix::pty::unlockpt(consumer)?;

    let producer = if envdetect::kernel_at_least(4, 13) {
        match tiocgptpeer(consumer) {
            Ok(fd) => fd,
            Err(_) => open_by_name(consumer)?,
        }
    } else {
        open_by_name(consumer)?
    };

    enable_packet_mode(&producer);

    Ok(rewrite_for_sandbox(producer))
}

fn open_by_name(consumer: BorrowedFd<'_>) -> Result<OwnedFd, AgentError> {
    let name = rustix::pty::ptsname(consumer, Vec::new())?;
    let name = name
        .into_string()
        .map_err(|_| AgentError::InvalidData("pts name is not valid UTF-8".into()))?;
    open_producer_path(Path::new(&name))
}

fn open_producer_path(path: &Path) -> Result<OwnedFd, AgentError> {
    let flags = OFlags::NOCTTY | OFlags::RDWR | OFlags::CLOEXEC | OFlags::NONBLOCK;
    Ok(rustix::fs::open(path, flags, Mode::empty())?)
}

/// `TIOCGPTPEER` hands out the peer without going through the filesystem,
/// which also works when `/dev/pts` is not visible at its usual place.
#[allow(unsafe_code)]
fn tiocgptpeer(consumer: BorrowedFd<'_>) -> Result<OwnedFd, AgentError> {
    let flags = libc::O_NOCTTY | libc::O_RDWR | libc::O_CLOEXEC | libc::O_NONBLOCK;

    // SAFETY: on success the ioctl returns a fresh descriptor which we
    // immediately take ownership of.
    let fd = unsafe { libc::ioctl(consumer.as_raw_fd(), libc::TIOCGPTPEER, flags) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Enables packet mode so the consumer observes flow-control transitions.
/// Best effort; not every kernel accepts it on this end.
#[allow(unsafe_code)]
fn enable_packet_mode(fd: &OwnedFd) {
    let one: libc::c_int = 1;
    // SAFETY: plain ioctl on a descriptor we own; the argument outlives it.
    let _ = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCPKT, &one) };
}

/// Re-opens the producer through `/run/host` when the host `/dev/pts` is
/// bind-mounted into our sandbox, so the tty path is identical inside and
/// outside. Keeps the original descriptor when anything disagrees.
fn rewrite_for_sandbox(producer: OwnedFd) -> OwnedFd {
    if !Path::new("/run/host/dev/pts/ptmx").exists() {
        return producer;
    }

    let Ok(name) = rustix::termios::ttyname(&producer, Vec::new()) else {
        return producer;
    };
    let Ok(name) = name.into_string() else {
        return producer;
    };

    let alt_path = format!("/run/host{name}");
    let Ok(alt) = open_producer_path(Path::new(&alt_path)) else {
        return producer;
    };

    match (std::fs::metadata(&name), std::fs::metadata(&alt_path)) {
        (Ok(ours), Ok(host)) if ours.dev() == host.dev() && ours.ino() == host.ino() => alt,
        _ => producer,
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn test_consumer_is_a_tty() {
        let consumer = create_consumer().unwrap();
        assert!(rustix::termios::isatty(&consumer));
    }

    #[test]
    fn test_producer_matches_consumer() {
        let consumer = create_consumer().unwrap();
        let producer = create_producer(consumer.as_fd()).unwrap();

        assert!(rustix::termios::isatty(&producer));

        let pts = rustix::pty::ptsname(&consumer, Vec::new()).unwrap();
        let tty = rustix::termios::ttyname(&producer, Vec::new()).unwrap();
        assert_eq!(pts, tty);
    }

    #[test]
    fn test_producer_output_reaches_consumer() {
        let consumer = create_consumer().unwrap();
        let producer = create_producer(consumer.as_fd()).unwrap();

        let mut writer = std::fs::File::from(producer);
        writer.write_all(b"hello").unwrap();

        let mut reader = std::fs::File::from(consumer);
        let mut buf = [0u8; 16];
        let n = loop {
            match reader.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("read from consumer failed: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"hello");
    }
}
