//! Agent root object and runtime wiring.
//!
//! Owns the ordered container set (the synthetic session container always
//! first), gates `ContainersChanged` on the first `ListContainers` call,
//! and drives the whole lifetime: everything visible at startup is
//! registered before the connection starts dispatching, and the agent
//! exits when its single peer goes away.

use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};

use color_eyre::Result;
use futures_util::StreamExt;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{self, OwnedObjectPath};

use crate::container::{Container, ContainerIface};
use crate::error::AgentError;
use crate::provider::{PodmanProvider, ProviderEvent};
use crate::pty;
use crate::util;

/// Path of the root agent object.
pub const AGENT_PATH: &str = "/org/boxterm/Agent";

#[derive(Debug, Default)]
struct AgentState {
    containers: Vec<(Arc<Container>, OwnedObjectPath)>,
    has_listed: bool,
}

/// The root D-Bus object.
#[derive(Debug)]
pub struct AgentIface {
    state: Arc<Mutex<AgentState>>,
    os_name: String,
    user_data_dir: String,
}

impl AgentIface {
    fn new(state: Arc<Mutex<AgentState>>) -> Self {
        Self {
            state,
            os_name: read_os_name().unwrap_or_default(),
            user_data_dir: dirs::data_dir()
                .map(|path| path.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

#[zbus::interface(name = "org.boxterm.Agent")]
impl AgentIface {
    #[zbus(property)]
    fn os_name(&self) -> String {
        self.os_name.clone()
    }

    #[zbus(property)]
    fn user_data_dir(&self) -> String {
        self.user_data_dir.clone()
    }

    /// Current container object paths. The first successful call arms the
    /// `ContainersChanged` signal; the initial set travels in this reply.
    fn list_containers(&self) -> Vec<OwnedObjectPath> {
        let mut state = self.state.lock().expect("agent state");
        state.has_listed = true;
        state
            .containers
            .iter()
            .map(|(_, path)| path.clone())
            .collect()
    }

    fn create_pty(&self) -> zbus::fdo::Result<zvariant::OwnedFd> {
        let fd = pty::create_consumer().map_err(zbus::fdo::Error::from)?;
        Ok(zvariant::OwnedFd::from(fd))
    }

    fn create_pty_producer(&self, pty: zvariant::OwnedFd) -> zbus::fdo::Result<zvariant::OwnedFd> {
        let fd = pty::create_producer(std::os::fd::AsFd::as_fd(&pty))
            .map_err(zbus::fdo::Error::from)?;
        Ok(zvariant::OwnedFd::from(fd))
    }

    fn get_preferred_shell(&self) -> String {
        util::preferred_shell()
    }

    /// Resolves the container behind a pty's foreground process group.
    ///
    /// Mapping the group leader to a container would need its
    /// /proc/<pid>/root/var/run/.containerenv, which the parent shim does
    /// not expose; everything currently resolves to the session container.
    fn discover_current_container(
        &self,
        pty: zvariant::OwnedFd,
    ) -> zbus::fdo::Result<OwnedObjectPath> {
        let pgrp = rustix::termios::tcgetpgrp(&pty).ok();
        tracing::debug!(?pgrp, "discovering container for foreground group");

        let state = self.state.lock().expect("agent state");
        state
            .containers
            .iter()
            .find(|(container, _)| container.id == "session")
            .map(|(_, path)| path.clone())
            .ok_or_else(|| AgentError::NotFound("session".into()).into())
    }

    #[zbus(signal)]
    async fn containers_changed(
        emitter: &SignalEmitter<'_>,
        position: u32,
        removed: u32,
        added: Vec<OwnedObjectPath>,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn process_exited(
        emitter: &SignalEmitter<'_>,
        process: OwnedObjectPath,
        exit_status: i32,
    ) -> zbus::Result<()>;
}

/// Emits the agent-level `ProcessExited` signal; failures are logged, not
/// propagated, since the process teardown must continue regardless.
pub async fn emit_process_exited(
    connection: &zbus::Connection,
    process: &OwnedObjectPath,
    exit_status: i32,
) {
    match connection
        .object_server()
        .interface::<_, AgentIface>(AGENT_PATH)
        .await
    {
        Ok(agent) => {
            if let Err(error) =
                AgentIface::process_exited(agent.signal_emitter(), process.clone(), exit_status)
                    .await
            {
                tracing::debug!("failed to emit ProcessExited: {error}");
            }
        }
        Err(error) => tracing::debug!("agent object unavailable: {error}"),
    }
}

fn container_object_path() -> OwnedObjectPath {
    let guid = uuid::Uuid::new_v4().simple();
    OwnedObjectPath::try_from(format!("/org/boxterm/Containers/{guid}"))
        .expect("generated object path is valid")
}

fn read_os_name() -> Option<String> {
    let contents = std::fs::read_to_string("/etc/os-release").ok()?;
    parse_os_release(&contents)
}

fn parse_os_release(contents: &str) -> Option<String> {
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("NAME=\"") {
            if let Some(end) = rest.find('"') {
                return Some(rest[..end].to_string());
            }
        }
    }
    None
}

async fn add_container(
    connection: &zbus::Connection,
    state: &Arc<Mutex<AgentState>>,
    container: Arc<Container>,
) -> zbus::Result<()> {
    let path = container_object_path();
    connection
        .object_server()
        .at(path.clone(), ContainerIface::new(container.clone()))
        .await?;

    let (position, announce) = {
        let mut state = state.lock().expect("agent state");
        state.containers.push((container, path.clone()));
        ((state.containers.len() - 1) as u32, state.has_listed)
    };

    if announce {
        let agent = connection
            .object_server()
            .interface::<_, AgentIface>(AGENT_PATH)
            .await?;
        AgentIface::containers_changed(agent.signal_emitter(), position, 0, vec![path]).await?;
    }

    Ok(())
}

async fn remove_container(
    connection: &zbus::Connection,
    state: &Arc<Mutex<AgentState>>,
    id: &str,
) -> zbus::Result<()> {
    let removed = {
        let mut state = state.lock().expect("agent state");
        match state
            .containers
            .iter()
            .position(|(container, _)| container.id == id)
        {
            Some(position) => {
                let (_, path) = state.containers.remove(position);
                Some((position as u32, path, state.has_listed))
            }
            None => None,
        }
    };

    let Some((position, path, announce)) = removed else {
        return Ok(());
    };

    connection
        .object_server()
        .remove::<ContainerIface, _>(path.clone())
        .await?;

    if announce {
        let agent = connection
            .object_server()
            .interface::<_, AgentIface>(AGENT_PATH)
            .await?;
        AgentIface::containers_changed(agent.signal_emitter(), position, 1, Vec::new()).await?;
    }

    Ok(())
}

/// Serves the agent over the inherited socket until the peer goes away.
///
/// Returns the process exit code.
pub async fn run(socket: OwnedFd) -> Result<i32> {
    let state = Arc::new(Mutex::new(AgentState::default()));

    // The session container always sits at position zero.
    let mut initial: Vec<Arc<Container>> = vec![Arc::new(Container::session())];

    if util::home_dir().join(".config/jhbuildrc").exists() {
        initial.push(Arc::new(Container::jhbuild()));
    }

    let (provider, mut events) = PodmanProvider::new();
    if let Err(error) = provider.refresh().await {
        tracing::warn!("Failed to process podman containers: {error}");
        // Sometimes podman craps out on the first call after boot; one
        // retry covers it, after that we serve whatever we have.
        if let Err(error) = provider.refresh().await {
            tracing::warn!("Retried podman listing also failed: {error}");
        }
    }

    // Everything the startup refresh produced becomes part of the initial
    // exported set.
    while let Ok(event) = events.try_recv() {
        if let ProviderEvent::Added(container) = event {
            initial.push(container);
        }
    }

    let std_stream = std::os::unix::net::UnixStream::from(socket);
    std_stream.set_nonblocking(true)?;
    let stream = tokio::net::UnixStream::from_std(std_stream)?;

    // Register every object on the builder so nothing can be dispatched
    // before the full set is exported.
    let mut builder = zbus::connection::Builder::unix_stream(stream)
        .server(zbus::Guid::generate())?
        .p2p()
        .serve_at(AGENT_PATH, AgentIface::new(state.clone()))?;

    {
        let mut locked = state.lock().expect("agent state");
        for container in initial {
            let path = container_object_path();
            builder = builder.serve_at(path.clone(), ContainerIface::new(container.clone()))?;
            locked.containers.push((container, path));
        }
    }

    let connection = builder.build().await?;

    provider.spawn_watcher();

    // Watch the raw message stream purely for lifetime: when the peer
    // drops, the stream ends and so do we.
    let mut messages = zbus::MessageStream::from(&connection);

    loop {
        tokio::select! {
            message = messages.next() => {
                match message {
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::error!("transport error: {error}");
                        return Ok(1);
                    }
                    None => {
                        tracing::debug!("peer disconnected, exiting");
                        return Ok(0);
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Some(ProviderEvent::Added(container)) => {
                        add_container(&connection, &state, container).await?;
                    }
                    Some(ProviderEvent::Removed(container)) => {
                        remove_container(&connection, &state, &container.id).await?;
                    }
                    None => return Ok(0),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_release() {
        let contents = "NAME=\"Fedora Linux\"\nVERSION=\"40\"\nID=fedora\n";
        assert_eq!(parse_os_release(contents), Some("Fedora Linux".into()));

        // PRETTY_NAME must not match, wherever it sits.
        let contents = "PRETTY_NAME=\"Debian GNU/Linux 12\"\nNAME=\"Debian GNU/Linux\"\n";
        assert_eq!(parse_os_release(contents), Some("Debian GNU/Linux".into()));

        assert_eq!(parse_os_release("ID=unknown\n"), None);
        // Unquoted NAME is not the form we advertise.
        assert_eq!(parse_os_release("NAME=Alpine\n"), None);
    }

    #[test]
    fn test_container_object_paths_are_unique() {
        let a = container_object_path();
        let b = container_object_path();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("/org/boxterm/Containers/"));
    }
}
