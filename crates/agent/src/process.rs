//! Per-process IPC object.
//!
//! Wraps one spawned child: waits for it asynchronously, emits exactly one
//! of `Exited`/`Signaled` (after the agent-level `ProcessExited`), then
//! removes itself from the bus. Also answers foreground-process queries for
//! the terminal's tab-title and confirm-close logic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{self, OwnedObjectPath};

use crate::agent;
use crate::error::AgentError;

/// Classification of a foreground process by executable basename.
static EXEC_TO_KIND: &[(&str, &str)] = &[
    ("docker", "container"),
    ("flatpak", "container"),
    ("mosh", "remote"),
    ("mosh-client", "remote"),
    ("podman", "container"),
    ("rlogin", "remote"),
    ("scp", "remote"),
    ("sftp", "remote"),
    ("slogin", "remote"),
    ("ssh", "remote"),
    ("telnet", "remote"),
    ("toolbox", "container"),
];

/// The per-process D-Bus object.
#[derive(Debug)]
pub struct ProcessIface {
    pid: i32,
    ended: Arc<AtomicBool>,
}

/// Generates a fresh process object path.
pub fn object_path() -> OwnedObjectPath {
    let guid = uuid::Uuid::new_v4().simple();
    OwnedObjectPath::try_from(format!("/org/boxterm/Process/{guid}"))
        .expect("generated object path is valid")
}

/// Exports a process object for `child` at `path` and begins waiting for
/// its exit on the event loop.
pub async fn export(
    connection: &zbus::Connection,
    child: tokio::process::Child,
    path: OwnedObjectPath,
) -> Result<(), AgentError> {
    let pid = child.id().map(|pid| pid as i32).unwrap_or(-1);
    let ended = Arc::new(AtomicBool::new(false));

    let iface = ProcessIface {
        pid,
        ended: ended.clone(),
    };
    connection
        .object_server()
        .at(path.clone(), iface)
        .await
        .map_err(|error| AgentError::InvalidData(error.to_string()))?;

    tokio::spawn(wait_for_exit(connection.clone(), child, path, ended));

    Ok(())
}

async fn wait_for_exit(
    connection: zbus::Connection,
    mut child: tokio::process::Child,
    path: OwnedObjectPath,
    ended: Arc<AtomicBool>,
) {
    use std::os::unix::process::ExitStatusExt;

    let status = child.wait().await;
    ended.store(true, Ordering::SeqCst);
    drop(child);

    let raw_status = match &status {
        Ok(status) => status.into_raw(),
        Err(_) => -1,
    };

    agent::emit_process_exited(&connection, &path, raw_status).await;

    match connection
        .object_server()
        .interface::<_, ProcessIface>(path.clone())
        .await
    {
        Ok(iface) => {
            let emitter = iface.signal_emitter();
            let emitted = match &status {
                Ok(status) => match status.signal() {
                    Some(term_sig) => ProcessIface::signaled(emitter, term_sig).await,
                    None => ProcessIface::exited(emitter, status.code().unwrap_or(-1)).await,
                },
                Err(error) => {
                    tracing::debug!("waiting on child failed: {error}");
                    ProcessIface::exited(emitter, -1).await
                }
            };
            if let Err(error) = emitted {
                tracing::debug!("failed to emit exit signal: {error}");
            }
        }
        Err(error) => tracing::debug!("process object vanished before exit: {error}"),
    }

    if let Err(error) = connection
        .object_server()
        .remove::<ProcessIface, _>(path.clone())
        .await
    {
        tracing::debug!("failed to unexport process object: {error}");
    }
}

#[zbus::interface(name = "org.boxterm.Process")]
impl ProcessIface {
    /// Delivers `signum` to the child when it is still live; success either
    /// way, so racing an exit stays harmless.
    fn send_signal(&self, signum: i32) {
        if self.ended.load(Ordering::SeqCst) {
            return;
        }
        let Ok(signal) = Signal::try_from(signum) else {
            return;
        };
        if let Err(errno) = kill(Pid::from_raw(self.pid), signal) {
            tracing::debug!("kill({}, {signal:?}) failed: {errno}", self.pid);
        }
    }

    /// Reports the foreground process group of `pty` and classifies its
    /// leader.
    fn has_foreground_process(&self, pty: zvariant::OwnedFd) -> (bool, i32, String, String) {
        let pid = rustix::termios::tcgetpgrp(&pty)
            .map(|pgrp| pgrp.as_raw_nonzero().get())
            .unwrap_or(-1);

        let has_foreground_process = pid != self.pid;
        let cmdline = if pid > 0 {
            cmdline_for_pid(pid)
        } else {
            String::new()
        };

        (
            has_foreground_process,
            pid,
            cmdline,
            leader_kind(pid).to_string(),
        )
    }

    /// Working directory of the foreground process group, `/` when nothing
    /// better can be determined.
    fn get_working_directory(&self, pty: zvariant::OwnedFd) -> String {
        let pid = rustix::termios::tcgetpgrp(&pty)
            .map(|pgrp| pgrp.as_raw_nonzero().get())
            .unwrap_or(self.pid);

        if pid > 0 {
            if let Ok(cwd) = std::fs::read_link(format!("/proc/{pid}/cwd")) {
                return cwd.to_string_lossy().into_owned();
            }
        }

        "/".to_string()
    }

    #[zbus(signal)]
    async fn exited(emitter: &SignalEmitter<'_>, exit_status: i32) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn signaled(emitter: &SignalEmitter<'_>, term_sig: i32) -> zbus::Result<()>;
}

fn cmdline_for_pid(pid: i32) -> String {
    match std::fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(bytes) => sanitize_cmdline(bytes),
        Err(_) => String::new(),
    }
}

fn sanitize_cmdline(mut bytes: Vec<u8>) -> String {
    bytes.truncate(1024);
    for byte in &mut bytes {
        if *byte == 0 || byte.is_ascii_control() {
            *byte = b' ';
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn leader_kind(pid: i32) -> &'static str {
    use std::os::unix::fs::MetadataExt;

    // Root ownership of the proc entry trumps whatever is running.
    if let Ok(meta) = std::fs::metadata(format!("/proc/{pid}/")) {
        if meta.uid() == 0 {
            return "superuser";
        }
    }

    let Ok(exe) = std::fs::read_link(format!("/proc/{pid}/exe")) else {
        return "unknown";
    };
    let Some(name) = exe.file_name().and_then(|name| name.to_str()) else {
        return "unknown";
    };
    kind_for_executable(name)
}

fn kind_for_executable(name: &str) -> &'static str {
    EXEC_TO_KIND
        .iter()
        .find(|(exec, _)| *exec == name)
        .map(|(_, kind)| *kind)
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_for_executable() {
        assert_eq!(kind_for_executable("ssh"), "remote");
        assert_eq!(kind_for_executable("mosh-client"), "remote");
        assert_eq!(kind_for_executable("podman"), "container");
        assert_eq!(kind_for_executable("toolbox"), "container");
        assert_eq!(kind_for_executable("foo"), "unknown");
        // Matching is exact, not prefix-based.
        assert_eq!(kind_for_executable("sshd"), "unknown");
    }

    #[test]
    fn test_sanitize_cmdline() {
        let raw = b"ssh\0-l\0alice\0host\0".to_vec();
        assert_eq!(sanitize_cmdline(raw), "ssh -l alice host ");

        let raw = b"vim\x1b[2J\0file\0".to_vec();
        assert_eq!(sanitize_cmdline(raw), "vim [2J file ");

        let mut long = vec![b'a'; 4096];
        long.push(0);
        assert_eq!(sanitize_cmdline(long).len(), 1024);
    }

    #[test]
    fn test_leader_kind_for_own_process() {
        let pid = std::process::id() as i32;
        let kind = leader_kind(pid);
        if nix::unistd::Uid::current().is_root() {
            assert_eq!(kind, "superuser");
        } else {
            // The test binary is not in the classification table.
            assert_eq!(kind, "unknown");
        }
    }

    #[test]
    fn test_leader_kind_for_bogus_pid() {
        assert_eq!(leader_kind(-1), "unknown");
    }
}
