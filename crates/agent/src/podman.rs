//! Podman-specific execution.
//!
//! Builds the `podman exec` and `distrobox enter` wrapping layers, starts
//! containers on first use, and probes the podman client version (cached,
//! looked up on the host even when the agent itself is sandboxed).

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

use serde::Deserialize;

use crate::container::{Container, ContainerKind};
use crate::error::AgentError;
use crate::run_context::{LayerData, RunContext};
use crate::util;

/// Pushes the container-appropriate wrapping layer plus the minimal host
/// environment. `HOME` is dropped afterward so the container's own home
/// directory wins.
pub fn prepare_run_context(ctx: &mut RunContext, container: &Arc<Container>) {
    debug_assert!(container.kind != ContainerKind::Session);

    match container.kind {
        ContainerKind::Distrobox => {
            // These seem to be needed for distrobox-enter.
            ctx.setenv("HOME", Some(&util::home_dir().to_string_lossy()));
            ctx.setenv("USER", Some(&util::user_name()));

            let container = container.clone();
            ctx.push(Box::new(move |ctx, layer| {
                distrobox_enter_handler(ctx, layer, &container)
            }));
        }
        _ => {
            let container = container.clone();
            ctx.push(Box::new(move |ctx, layer| {
                podman_exec_handler(ctx, layer, &container)
            }));
        }
    }

    ctx.add_minimal_environment();
    ctx.setenv("HOME", None);
}

fn podman_exec_handler(
    ctx: &mut RunContext,
    layer: LayerData,
    container: &Container,
) -> Result<(), AgentError> {
    // Request TTY ioctls if any stdio descriptor is a terminal.
    let has_tty =
        layer.fd_map.stdin_isatty() || layer.fd_map.stdout_isatty() || layer.fd_map.stderr_isatty();
    let max_dest_fd = layer.fd_map.max_dest_fd();

    ctx.merge_fd_map(layer.fd_map)?;

    ctx.append_args(["podman", "exec", "--privileged", "--interactive"]);

    if has_tty {
        ctx.append_argv("--tty");
    }

    // Plain podman containers won't necessarily have the user's home in
    // them; only toolbox and distrobox set that contract up.
    if matches!(
        container.kind,
        ContainerKind::Toolbox | ContainerKind::Distrobox
    ) {
        ctx.append_argv(format!("--user={}", util::user_name()));
        if let Some(cwd) = &layer.cwd {
            ctx.append_argv(format!("--workdir={cwd}"));
        }
    }

    // From podman-exec(1): pass down to the process N additional file
    // descriptors in addition to 0, 1, 2.
    if max_dest_fd > 2 {
        ctx.append_argv(format!("--preserve-fds={}", max_dest_fd - 2));
    }

    // Keep podman from stealing ctrl+p.
    // https://github.com/containers/toolbox/issues/394
    if check_version(1, 8, 1) {
        ctx.append_argv("--detach-keys=");
    }

    for pair in &layer.env {
        ctx.append_argv(format!("--env={pair}"));
    }

    ctx.append_argv(container.id.clone());
    ctx.append_args(layer.argv);

    Ok(())
}

fn distrobox_enter_handler(
    ctx: &mut RunContext,
    layer: LayerData,
    container: &Container,
) -> Result<(), AgentError> {
    ctx.append_args(["distrobox", "enter", "--no-tty"]);
    ctx.append_argv(container.display_name.clone());

    let mut additional_flags = String::from("--tty ");
    let max_dest_fd = layer.fd_map.max_dest_fd();
    if max_dest_fd >= 2 {
        additional_flags.push_str(&format!("--preserve-fds={} ", max_dest_fd - 2));
    }

    ctx.merge_fd_map(layer.fd_map)?;

    ctx.append_argv("--additional-flags");
    ctx.append_argv(additional_flags);

    ctx.append_args(["--", "env"]);

    match &layer.cwd {
        Some(cwd) if !cwd.is_empty() && Path::new(cwd).exists() => {
            ctx.set_cwd(Some(cwd.clone()));
        }
        Some(cwd) => ctx.append_argv(format!("--chdir={cwd}")),
        None => {}
    }

    ctx.append_args(layer.env);
    ctx.append_args(layer.argv);

    Ok(())
}

/// Runs `podman start` the first time a container is used.
///
/// The latch is set before the outcome is known, so a failed start is not
/// retried on this instance; callers recover by looking the container up
/// afresh.
pub async fn maybe_start(container: &Container) -> Result<(), AgentError> {
    if container.has_started.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    // Wait so that we don't try to run before the pod has started.
    let status = tokio::process::Command::new("podman")
        .args(["start", &container.id])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(AgentError::Spawn)?;

    if !status.success() {
        return Err(AgentError::CommandFailed(format!(
            "podman start {} exited with {status}",
            container.id
        )));
    }

    Ok(())
}

/// Resolves `program` inside the container via `which`.
pub async fn which(container: &Container, program: &str) -> Result<String, AgentError> {
    let output = tokio::process::Command::new("podman")
        .args(["exec", &container.id, "which", program])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(AgentError::Spawn)?;

    if !output.status.success() {
        return Err(AgentError::NotFound(program.to_string()));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[derive(Debug, Deserialize)]
struct VersionReport {
    #[serde(rename = "Client")]
    client: Option<ClientVersion>,
}

#[derive(Debug, Deserialize)]
struct ClientVersion {
    #[serde(rename = "Version")]
    version: Option<String>,
}

/// The podman client version string, probed once per process.
pub fn version() -> Option<&'static str> {
    static VERSION: OnceLock<Option<String>> = OnceLock::new();
    VERSION.get_or_init(probe_version).as_deref()
}

fn probe_version() -> Option<String> {
    let mut ctx = RunContext::new();
    ctx.push_host();
    ctx.add_minimal_environment();
    ctx.append_args(["podman", "version", "--format=json"]);

    let output = ctx.finish().ok()?.output_blocking().ok()?;
    if !output.status.success() {
        return None;
    }

    let report: VersionReport = serde_json::from_slice(&output.stdout).ok()?;
    report.client?.version
}

/// Whether the podman client is at least `major.minor.micro`.
pub fn check_version(major: u32, minor: u32, micro: u32) -> bool {
    version()
        .map(|v| version_at_least(v, major, minor, micro))
        .unwrap_or(false)
}

fn version_at_least(version: &str, major: u32, minor: u32, micro: u32) -> bool {
    let Some((pmaj, pmin, pmic)) = parse_version_triple(version) else {
        return false;
    };
    (pmaj > major)
        || (pmaj == major && pmin > minor)
        || (pmaj == major && pmin == minor && pmic >= micro)
}

fn parse_version_triple(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = leading_number(parts.next()?)?;
    let minor = leading_number(parts.next()?)?;
    let micro = leading_number(parts.next()?)?;
    Some((major, minor, micro))
}

fn leading_number(part: &str) -> Option<u32> {
    let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
