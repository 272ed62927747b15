//! Container model and its IPC surface.
//!
//! A container is a named runtime target: the user's host session or a
//! podman container in one of its flavors. The flavor is decided once, by
//! the provider's label rules, and carried as a plain discriminant; all
//! downstream behavior switches on it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use zbus::zvariant::{self, OwnedObjectPath};

use crate::envdetect;
use crate::error::AgentError;
use crate::podman;
use crate::process;
use crate::provider::PsEntry;
use crate::run_context::RunContext;
use crate::util;

/// Which runtime a container represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Session,
    Podman,
    Toolbox,
    Distrobox,
}

/// A named runtime target.
#[derive(Debug)]
pub struct Container {
    pub id: String,
    pub display_name: String,
    pub icon_name: String,
    pub provider: String,
    pub kind: ContainerKind,
    #[allow(dead_code)]
    pub labels: HashMap<String, String>,
    /// Session flavor only: arguments prefixed to every spawned command.
    pub command_prefix: Vec<String>,
    /// Podman flavors only: latched once `podman start` has been attempted.
    pub has_started: AtomicBool,
}

impl Container {
    fn new(kind: ContainerKind) -> Self {
        let (icon_name, provider) = match kind {
            ContainerKind::Session => ("", "session"),
            ContainerKind::Podman => ("container-podman-symbolic", "podman"),
            ContainerKind::Toolbox => ("container-toolbox-symbolic", "toolbox"),
            ContainerKind::Distrobox => ("container-podman-symbolic", "distrobox"),
        };
        Self {
            id: String::new(),
            display_name: String::new(),
            icon_name: icon_name.to_string(),
            provider: provider.to_string(),
            kind,
            labels: HashMap::new(),
            command_prefix: Vec::new(),
            has_started: AtomicBool::new(false),
        }
    }

    /// The synthetic container for the user's host session.
    pub fn session() -> Self {
        let mut container = Self::new(ContainerKind::Session);
        container.id = "session".to_string();
        container
    }

    /// A session-flavored container that runs everything under
    /// `jhbuild run`; exported when `~/.config/jhbuildrc` exists.
    pub fn jhbuild() -> Self {
        let mut container = Self::new(ContainerKind::Session);
        container.id = "jhbuild".to_string();
        container.provider = "jhbuild".to_string();
        container.display_name = "JHBuild".to_string();
        container.icon_name = "container-jhbuild-symbolic".to_string();
        container.command_prefix = vec!["jhbuild".to_string(), "run".to_string()];
        container
    }

    /// Builds a podman-flavored container from one `podman ps` entry.
    pub fn from_ps_entry(kind: ContainerKind, entry: PsEntry) -> Result<Self, AgentError> {
        let Some(id) = entry.id else {
            return Err(AgentError::InvalidData(
                "Failed to locate Id in podman container description".into(),
            ));
        };

        let mut container = Self::new(kind);
        container.id = id;
        container.labels = entry.labels.unwrap_or_default();
        if let Some(name) = entry.names.and_then(|names| names.into_iter().next()) {
            container.display_name = name;
        }
        Ok(container)
    }

    #[cfg(test)]
    pub fn test_podman(id: &str, name: &str, kind: ContainerKind) -> Self {
        let mut container = Self::new(kind);
        container.id = id.to_string();
        container.display_name = name.to_string();
        container
    }
}

/// Copies the spawn request into the run context: working directory (home
/// when unset), terminal defaults, client environment, and duplicated
/// descriptors.
pub fn push_spawn(
    ctx: &mut RunContext,
    cwd: &str,
    argv: &[String],
    fds: HashMap<u32, zvariant::OwnedFd>,
    env: &HashMap<String, String>,
) {
    let cwd = if cwd.is_empty() {
        util::home_dir().to_string_lossy().into_owned()
    } else {
        cwd.to_string()
    };

    ctx.setenv("PWD", Some(&cwd));
    ctx.set_cwd(Some(cwd));

    ctx.append_args(argv.iter().cloned());

    ctx.setenv("COLORTERM", Some("truecolor"));
    ctx.setenv("TERM", Some("xterm-256color"));
    ctx.setenv("FLATPAK_TTY_PROGRESS", Some("1"));

    let mut env: Vec<_> = env.iter().collect();
    env.sort();
    for (key, value) in env {
        ctx.setenv(key, Some(value));
    }

    let mut fds: Vec<_> = fds.into_iter().collect();
    fds.sort_by_key(|(dest, _)| *dest);
    for (dest, fd) in fds {
        // The incoming descriptors belong to the message until the reply
        // completes; only duplicates go into the run context.
        match rustix::io::fcntl_dupfd_cloexec(&fd, 0) {
            Ok(duplicate) => ctx.take_fd(Some(duplicate), dest as i32),
            Err(errno) => {
                ctx.push_error(errno.into());
                break;
            }
        }
    }
}

fn session_cwd(cwd: &str) -> String {
    // The requested directory might have come from another container or a
    // sudo shell; fall back to home when it doesn't exist here.
    if cwd.is_empty() || !Path::new(cwd).is_dir() {
        util::home_dir().to_string_lossy().into_owned()
    } else {
        cwd.to_string()
    }
}

/// The per-container D-Bus object.
#[derive(Debug)]
pub struct ContainerIface {
    container: Arc<Container>,
}

impl ContainerIface {
    pub fn new(container: Arc<Container>) -> Self {
        Self { container }
    }
}

#[zbus::interface(name = "org.boxterm.Container")]
impl ContainerIface {
    #[zbus(property)]
    fn id(&self) -> String {
        self.container.id.clone()
    }

    #[zbus(property)]
    fn display_name(&self) -> String {
        self.container.display_name.clone()
    }

    #[zbus(property)]
    fn icon_name(&self) -> String {
        self.container.icon_name.clone()
    }

    #[zbus(property)]
    fn provider(&self) -> String {
        self.container.provider.clone()
    }

    /// Spawns `argv` inside this container, wiring the given descriptors
    /// and environment through, and returns the exported process object.
    async fn spawn(
        &self,
        cwd: String,
        argv: Vec<String>,
        fds: HashMap<u32, zvariant::OwnedFd>,
        env: HashMap<String, String>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> zbus::fdo::Result<OwnedObjectPath> {
        let container = &self.container;
        let mut ctx = RunContext::new();

        match container.kind {
            ContainerKind::Session => {
                let cwd = session_cwd(&cwd);

                // If we had to run within Flatpak, escape to host, and
                // place the process inside a new scope similar to what a
                // terminal widget would do.
                ctx.push_host();
                ctx.push_scope();

                // The default session inherits our whole environment;
                // sandboxed agents only have the minimal set worth copying.
                if envdetect::is_sandboxed() {
                    ctx.add_minimal_environment();
                } else {
                    ctx.set_environ(
                        std::env::vars()
                            .map(|(key, value)| format!("{key}={value}"))
                            .collect(),
                    );
                }

                if !container.command_prefix.is_empty() {
                    ctx.append_args(container.command_prefix.iter().cloned());
                }

                push_spawn(&mut ctx, &cwd, &argv, fds, &env);
            }
            _ => {
                podman::prepare_run_context(&mut ctx, container);
                push_spawn(&mut ctx, &cwd, &argv, fds, &env);
                podman::maybe_start(container)
                    .await
                    .map_err(zbus::fdo::Error::from)?;
            }
        }

        let child = ctx.spawn().map_err(zbus::fdo::Error::from)?;
        let path = process::object_path();
        process::export(connection, child, path.clone())
            .await
            .map_err(zbus::fdo::Error::from)?;

        Ok(path)
    }

    async fn find_program_in_path(&self, program: String) -> zbus::fdo::Result<String> {
        match self.container.kind {
            ContainerKind::Session => util::find_program_in_path(&program)
                .and_then(|path| path.to_str().map(str::to_owned))
                .ok_or_else(|| AgentError::NotFound(program).into()),
            _ => {
                podman::maybe_start(&self.container)
                    .await
                    .map_err(zbus::fdo::Error::from)?;
                podman::which(&self.container, &program)
                    .await
                    .map_err(zbus::fdo::Error::from)
            }
        }
    }

    fn translate_uri(&self, uri: String) -> String {
        uri
    }
}
