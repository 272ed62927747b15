//! Error taxonomy for the agent.
//!
//! Internal errors are typed so that IPC method handlers can translate them
//! into the matching D-Bus error name instead of collapsing everything into
//! `Failed`.

use std::io;

use thiserror::Error;

/// Errors produced by the agent's internals.
///
/// Only errors that can reach an IPC reply live here; transient subprocess
/// output problems are logged and swallowed at the call site.
#[derive(Debug, Error)]
pub enum AgentError {
    /// An FD map slot was read after its descriptor had been stolen.
    #[error("file-descriptor at index {0} already stolen")]
    Closed(usize),

    /// Two FD maps bind the same destination descriptor.
    #[error("attempt to merge overlapping destination FDs for {0}")]
    OverlappingFd(i32),

    /// Two layers request different working directories.
    #[error("cannot resolve differently requested cwd: {0} and {1}")]
    CwdConflict(String, String),

    /// A container id or program could not be resolved.
    #[error("no such entry \"{0}\"")]
    NotFound(String),

    /// Unexpected data from an external program.
    #[error("{0}")]
    InvalidData(String),

    /// A subprocess could not be launched.
    #[error("failed to spawn subprocess: {0}")]
    Spawn(#[source] io::Error),

    /// A subprocess ran but reported failure.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// errno pass-through from the platform.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<rustix::io::Errno> for AgentError {
    fn from(errno: rustix::io::Errno) -> Self {
        AgentError::Io(errno.into())
    }
}

impl From<AgentError> for zbus::fdo::Error {
    fn from(err: AgentError) -> Self {
        let message = err.to_string();
        match err {
            AgentError::Closed(_)
            | AgentError::OverlappingFd(_)
            | AgentError::CwdConflict(..) => zbus::fdo::Error::InvalidArgs(message),
            AgentError::NotFound(_) => zbus::fdo::Error::FileNotFound(message),
            AgentError::Io(_) => zbus::fdo::Error::IOError(message),
            AgentError::InvalidData(_) | AgentError::Spawn(_) | AgentError::CommandFailed(_) => {
                zbus::fdo::Error::Failed(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dbus_error_mapping() {
        let err: zbus::fdo::Error = AgentError::Closed(3).into();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));

        let err: zbus::fdo::Error = AgentError::OverlappingFd(1).into();
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));

        let err: zbus::fdo::Error = AgentError::NotFound("session".into()).into();
        assert!(matches!(err, zbus::fdo::Error::FileNotFound(_)));

        let err: zbus::fdo::Error =
            AgentError::Io(io::Error::from_raw_os_error(libc::EBADF)).into();
        assert!(matches!(err, zbus::fdo::Error::IOError(_)));
    }
}
