//! Composable command builder for launching processes across container
//! boundaries.
//!
//! A run context is a stack of layers. The head layer carries the command
//! being assembled; every layer below it knows how to fold the layer above
//! into itself, wrapping the command for another boundary (`sh -c`,
//! `systemd-run --scope`, `flatpak-spawn --host`, `podman exec`, ...).
//! Folding walks head to root; what remains in the root is the single
//! subprocess invocation to launch.
//!
//! A context is single-use: [`RunContext::finish`] and
//! [`RunContext::spawn`] consume it, so a second spawn on the same context
//! is unrepresentable.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use crate::envdetect;
use crate::error::AgentError;
use crate::fdmap::FdMap;
use crate::util;

/// Environment variables copied from the host into spawned commands.
///
/// This is the minimal state needed for the display, session and locale to
/// work inside another mount namespace.
const COPY_ENV: &[&str] = &[
    "AT_SPI_BUS_ADDRESS",
    "COLUMNS",
    "DBUS_SESSION_BUS_ADDRESS",
    "DBUS_SYSTEM_BUS_ADDRESS",
    "DESKTOP_SESSION",
    "DISPLAY",
    "HOME",
    "LANG",
    "LINES",
    "SHELL",
    "SSH_AUTH_SOCK",
    "USER",
    "VTE_VERSION",
    "WAYLAND_DISPLAY",
    "XAUTHORITY",
    "XDG_CURRENT_DESKTOP",
    "XDG_DATA_DIRS",
    "XDG_MENU_PREFIX",
    "XDG_RUNTIME_DIR",
    "XDG_SEAT",
    "XDG_SESSION_DESKTOP",
    "XDG_SESSION_ID",
    "XDG_SESSION_TYPE",
    "XDG_VTNR",
];

/// How a wrapping `/bin/sh` should be invoked.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Default,
    Login,
    Interactive,
}

/// The contents of a popped layer, handed to its fold handler.
pub struct LayerData {
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub cwd: Option<String>,
    pub fd_map: FdMap,
}

impl fmt::Debug for LayerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerData")
            .field("argv", &self.argv)
            .field("env", &self.env)
            .field("cwd", &self.cwd)
            .finish()
    }
}

/// Folds a popped layer into the context (whose head is now the next layer
/// down).
pub type LayerHandler =
    Box<dyn FnOnce(&mut RunContext, LayerData) -> Result<(), AgentError> + Send>;

struct Layer {
    cwd: Option<String>,
    argv: Vec<String>,
    env: Vec<String>,
    fd_map: FdMap,
    handler: Option<LayerHandler>,
}

impl Layer {
    fn new(handler: Option<LayerHandler>) -> Self {
        Self {
            cwd: None,
            argv: Vec::new(),
            env: Vec::new(),
            fd_map: FdMap::new(),
            handler,
        }
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("cwd", &self.cwd)
            .field("argv", &self.argv)
            .field("env", &self.env)
            .field("fd_map", &self.fd_map)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// See the module docs; the head of `layers` is the current layer, the back
/// is the root that survives the fold.
#[derive(Debug)]
pub struct RunContext {
    layers: VecDeque<Layer>,
    setup_tty: bool,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        let mut layers = VecDeque::new();
        layers.push_back(Layer::new(None));
        Self {
            layers,
            setup_tty: true,
        }
    }

    fn current(&mut self) -> &mut Layer {
        self.layers.front_mut().expect("layer stack underflow")
    }

    /// Pushes a new head layer with `handler`.
    pub fn push(&mut self, handler: LayerHandler) {
        self.layers.push_front(Layer::new(Some(handler)));
    }

    /// Pushes a layer with the default fold behavior.
    #[allow(dead_code)]
    pub fn push_default(&mut self) {
        self.layers.push_front(Layer::new(None));
    }

    /// Inserts a layer just above the root, below everything else.
    #[allow(dead_code)]
    pub fn push_at_base(&mut self, handler: LayerHandler) {
        let index = self.layers.len() - 1;
        self.layers.insert(index, Layer::new(Some(handler)));
    }

    /// Pushes a layer that wraps the one above in `/bin/sh [-l|-i] -c "..."`.
    #[allow(dead_code)]
    pub fn push_shell(&mut self, kind: ShellKind) {
        self.push(Box::new(move |ctx, layer| shell_handler(ctx, layer, kind)));
    }

    /// Pushes a layer that places the command in a systemd user scope, when
    /// a usable `systemd-run` exists.
    pub fn push_scope(&mut self) {
        self.push(Box::new(|ctx, layer| {
            ctx.merge_fd_map(layer.fd_map)?;
            ctx.set_cwd(layer.cwd);
            ctx.set_environ(layer.env);
            if util::has_systemd_run() {
                ctx.append_args([
                    "systemd-run",
                    "--user",
                    "--scope",
                    "--collect",
                    "--quiet",
                    "--same-dir",
                ]);
            }
            ctx.append_args(layer.argv);
            Ok(())
        }));
    }

    /// Escapes a sandboxed agent to the host via `flatpak-spawn --host`.
    ///
    /// No-op when the agent is not sandboxed. When it is, the final child is
    /// spawned by the host `flatpak-spawn` service, so acquiring the
    /// controlling tty in our own child would target the wrong process.
    pub fn push_host(&mut self) {
        if !envdetect::is_sandboxed() {
            return;
        }
        self.setup_tty = false;
        self.push(Box::new(host_handler));
    }

    /// Pushes a layer that fails the fold with `error`, deferring a setup
    /// problem until spawn time.
    pub fn push_error(&mut self, error: AgentError) {
        self.push(Box::new(move |_ctx, _layer| Err(error)));
    }

    pub fn append_argv(&mut self, arg: impl Into<String>) {
        self.current().argv.push(arg.into());
    }

    pub fn append_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let layer = self.current();
        layer.argv.extend(args.into_iter().map(Into::into));
    }

    pub fn cwd(&self) -> Option<&str> {
        self.layers
            .front()
            .and_then(|layer| layer.cwd.as_deref())
    }

    pub fn set_cwd(&mut self, cwd: Option<String>) {
        self.current().cwd = cwd;
    }

    /// Replaces the current layer's environment wholesale.
    pub fn set_environ(&mut self, env: Vec<String>) {
        self.current().env = env;
    }

    /// Merges `KEY=VALUE` pairs into the current layer, overriding matching
    /// keys in place.
    pub fn add_environ(&mut self, env: &[String]) {
        let layer = self.current();
        for pair in env {
            let Some((key, _)) = pair.split_once('=') else {
                continue;
            };
            match layer.env.iter().position(|e| env_key_matches(e, key)) {
                Some(i) => layer.env[i] = pair.clone(),
                None => layer.env.push(pair.clone()),
            }
        }
    }

    /// Sets or deletes (`None`) a single variable on the current layer.
    pub fn setenv(&mut self, key: &str, value: Option<&str>) {
        let Some(value) = value else {
            self.unsetenv(key);
            return;
        };

        let layer = self.current();
        layer.env.push(format!("{key}={value}"));
        let last = layer.env.len() - 1;
        for i in 0..last {
            if env_key_matches(&layer.env[i], key) {
                layer.env.swap_remove(i);
                break;
            }
        }
    }

    pub fn unsetenv(&mut self, key: &str) {
        let layer = self.current();
        if let Some(i) = layer.env.iter().position(|e| env_key_matches(e, key)) {
            layer.env.swap_remove(i);
        }
    }

    /// Copies the minimal host environment (display, session, locale) into
    /// the current layer, with sensible terminal defaults.
    pub fn add_minimal_environment(&mut self) {
        for key in COPY_ENV {
            if let Ok(value) = std::env::var(key) {
                self.setenv(key, Some(&value));
            }
        }
        self.copy_env_with_fallback("TERM", "xterm-256color");
        self.copy_env_with_fallback("COLORTERM", "truecolor");
    }

    fn copy_env_with_fallback(&mut self, key: &str, fallback: &str) {
        match std::env::var(key) {
            Ok(value) => self.setenv(key, Some(&value)),
            Err(_) => self.setenv(key, Some(fallback)),
        }
    }

    /// Transfers `source` into the current layer's FD map at `dest`.
    pub fn take_fd(&mut self, source: Option<OwnedFd>, dest: i32) {
        self.current().fd_map.take(source, dest);
    }

    /// Merges an FD map into the current layer, failing on overlapping
    /// destinations.
    pub fn merge_fd_map(&mut self, mut other: FdMap) -> Result<(), AgentError> {
        self.current().fd_map.steal_from(&mut other)
    }

    /// Folds all layers into the root and returns the final invocation.
    pub fn finish(mut self) -> Result<PreparedCommand, AgentError> {
        while self.layers.len() > 1 {
            let mut layer = self.layers.pop_front().expect("layer stack underflow");

            // Sort environment variables first so that we have an easier
            // time finding them by eye in tooling which translates them.
            layer.env.sort();

            let handler = layer.handler.take();
            let data = LayerData {
                argv: layer.argv,
                env: layer.env,
                cwd: layer.cwd,
                fd_map: layer.fd_map,
            };

            match handler {
                Some(handler) => handler(&mut self, data)?,
                None => default_handler(&mut self, data)?,
            }
        }

        let root = self.layers.pop_front().expect("layer stack underflow");
        Ok(PreparedCommand {
            argv: root.argv,
            env: root.env,
            cwd: root.cwd,
            fd_map: root.fd_map,
            setup_tty: self.setup_tty,
        })
    }

    /// Folds and launches in one step.
    pub fn spawn(self) -> Result<tokio::process::Child, AgentError> {
        self.finish()?.spawn()
    }
}

fn env_key_matches(pair: &str, key: &str) -> bool {
    pair.strip_prefix(key)
        .map(|rest| rest.starts_with('='))
        .unwrap_or(false)
}

fn quote(arg: &str) -> Result<Cow<'_, str>, AgentError> {
    shlex::try_quote(arg).map_err(|_| AgentError::InvalidData(format!("cannot quote {arg:?}")))
}

/// Fold behavior for a plain layer: merge FDs, refuse conflicting working
/// directories, express env either by merging down or via `env(1)`.
fn default_handler(ctx: &mut RunContext, layer: LayerData) -> Result<(), AgentError> {
    if let Some(cwd) = layer.cwd {
        if let Some(existing) = ctx.cwd() {
            if existing != cwd {
                return Err(AgentError::CwdConflict(cwd, existing.to_string()));
            }
        }
        ctx.set_cwd(Some(cwd));
    }

    ctx.merge_fd_map(layer.fd_map)?;

    if !layer.env.is_empty() {
        if layer.argv.is_empty() {
            ctx.add_environ(&layer.env);
        } else {
            ctx.append_argv("env");
            ctx.append_args(layer.env);
        }
    }

    if !layer.argv.is_empty() {
        ctx.append_args(layer.argv);
    }

    Ok(())
}

fn shell_handler(
    ctx: &mut RunContext,
    layer: LayerData,
    kind: ShellKind,
) -> Result<(), AgentError> {
    ctx.merge_fd_map(layer.fd_map)?;

    if let Some(cwd) = layer.cwd {
        ctx.set_cwd(Some(cwd));
    }

    ctx.append_argv("/bin/sh");
    match kind {
        ShellKind::Login => ctx.append_argv("-l"),
        ShellKind::Interactive => ctx.append_argv("-i"),
        ShellKind::Default => {}
    }
    ctx.append_argv("-c");

    let mut script = String::new();
    if !layer.env.is_empty() {
        script.push_str("env");
        for pair in &layer.env {
            script.push(' ');
            script.push_str(&quote(pair)?);
        }
        script.push(' ');
    }
    for (i, arg) in layer.argv.iter().enumerate() {
        if i > 0 {
            script.push(' ');
        }
        script.push_str(&quote(arg)?);
    }

    ctx.append_argv(script);

    Ok(())
}

fn host_handler(ctx: &mut RunContext, layer: LayerData) -> Result<(), AgentError> {
    // The bus address is what --watch-bus keys its lifetime tracking off.
    if let Ok(address) = std::env::var("DBUS_SESSION_BUS_ADDRESS") {
        ctx.setenv("DBUS_SESSION_BUS_ADDRESS", Some(&address));
    }

    ctx.append_args(["flatpak-spawn", "--host", "--watch-bus"]);

    for pair in &layer.env {
        ctx.append_argv(format!("--env={pair}"));
    }

    if let Some(cwd) = &layer.cwd {
        ctx.append_argv(format!("--directory={cwd}"));
    }

    if !layer.fd_map.is_empty() {
        // Stdio is forwarded by flatpak-spawn itself; everything above it
        // needs an explicit mapping.
        for i in 0..layer.fd_map.len() {
            let (source, dest) = layer.fd_map.peek(i);
            if dest <= 2 || source.is_none() {
                continue;
            }
            tracing::debug!("forwarding FD {dest} via flatpak-spawn");
            ctx.append_argv(format!("--forward-fd={dest}"));
        }

        ctx.merge_fd_map(layer.fd_map)?;
    }

    ctx.append_args(layer.argv);

    Ok(())
}

/// The folded result: one subprocess invocation, ready to launch.
#[derive(Debug)]
pub struct PreparedCommand {
    pub(crate) argv: Vec<String>,
    pub(crate) env: Vec<String>,
    pub(crate) cwd: Option<String>,
    fd_map: FdMap,
    setup_tty: bool,
}

impl PreparedCommand {
    /// Builds the launcher: clean environment, FD table from the map, and a
    /// pre-exec step that detaches the child into its own session and
    /// process group and (unless a host layer intervened) acquires the
    /// controlling tty.
    #[allow(unsafe_code)]
    pub fn command(mut self) -> Result<tokio::process::Command, AgentError> {
        let Some(program) = self.argv.first() else {
            return Err(AgentError::InvalidData(
                "refusing to spawn an empty command line".into(),
            ));
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&self.argv[1..]);

        cmd.env_clear();
        for pair in &self.env {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        // Descriptors above the stdio range are renumbered past every
        // destination first so the child's dup2 loop cannot stomp a source
        // it has not consumed yet.
        let floor = self.fd_map.max_dest_fd() + 1;
        let mut extra: Vec<(OwnedFd, i32)> = Vec::new();

        for i in 0..self.fd_map.len() {
            let (source, dest) = self.fd_map.steal(i);
            match (dest, source) {
                (0, Some(fd)) => {
                    cmd.stdin(Stdio::from(fd));
                }
                (1, Some(fd)) => {
                    cmd.stdout(Stdio::from(fd));
                }
                (2, Some(fd)) => {
                    cmd.stderr(Stdio::from(fd));
                }
                (1, None) => {
                    cmd.stdout(Stdio::null());
                }
                (2, None) => {
                    cmd.stderr(Stdio::null());
                }
                (dest, Some(fd)) if dest > 2 => {
                    let hoisted = rustix::io::fcntl_dupfd_cloexec(&fd, floor)?;
                    extra.push((hoisted, dest));
                }
                _ => {}
            }
        }

        let setup_tty = self.setup_tty;

        // SAFETY: the closure runs between fork and exec and only performs
        // async-signal-safe syscalls: setsid, setpgid, prctl, dup2 and one
        // tty ioctl. No allocation, no locking.
        unsafe {
            cmd.pre_exec(move || {
                libc::setsid();
                libc::setpgid(0, 0);
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP as libc::c_ulong);

                for (source, dest) in &extra {
                    if libc::dup2(source.as_raw_fd(), *dest) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                if setup_tty && libc::isatty(libc::STDIN_FILENO) == 1 {
                    libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0);
                }

                Ok(())
            });
        }

        Ok(cmd)
    }

    pub fn spawn(self) -> Result<tokio::process::Child, AgentError> {
        self.command()?.spawn().map_err(AgentError::Spawn)
    }

    /// Runs the command to completion on the calling thread, capturing
    /// output. Only for FD-less invocations (version probes, the startup
    /// container listing).
    pub fn output_blocking(self) -> Result<std::process::Output, AgentError> {
        debug_assert!(self.fd_map.is_empty());

        let Some(program) = self.argv.first() else {
            return Err(AgentError::InvalidData(
                "refusing to spawn an empty command line".into(),
            ));
        };

        let mut cmd = std::process::Command::new(program);
        cmd.args(&self.argv[1..]);
        cmd.env_clear();
        for pair in &self.env {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        cmd.output().map_err(AgentError::Spawn)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::fd::AsFd;

    use super::*;
    use crate::pty;

    fn dup(fd: &OwnedFd) -> OwnedFd {
        rustix::io::fcntl_dupfd_cloexec(fd, 0).unwrap()
    }

    #[test]
    fn test_shell_login_fold() {
        let mut ctx = RunContext::new();
        ctx.push_shell(ShellKind::Login);
        ctx.setenv("FOO", Some("bar"));
        ctx.append_args(["ls", "-la"]);

        let prepared = ctx.finish().unwrap();
        assert_eq!(
            prepared.argv,
            vec!["/bin/sh", "-l", "-c", "env FOO=bar ls -la"]
        );
    }

    #[test]
    fn test_shell_quotes_awkward_arguments() {
        let mut ctx = RunContext::new();
        ctx.push_shell(ShellKind::Default);
        ctx.append_args(["printf", "a b"]);

        let prepared = ctx.finish().unwrap();
        assert_eq!(prepared.argv[..2], ["/bin/sh", "-c"]);
        let script = &prepared.argv[2];
        assert!(script.starts_with("printf "), "script: {script}");
        assert_ne!(script, "printf a b", "argument must stay one word");
    }

    #[test]
    fn test_default_layer_env_merges_down_without_argv() {
        let mut ctx = RunContext::new();
        ctx.push_default();
        ctx.setenv("FOO", Some("bar"));

        let prepared = ctx.finish().unwrap();
        assert!(prepared.argv.is_empty());
        assert_eq!(prepared.env, vec!["FOO=bar"]);
    }

    #[test]
    fn test_default_layer_env_becomes_env_command_with_argv() {
        let mut ctx = RunContext::new();
        ctx.push_default();
        ctx.setenv("B", Some("2"));
        ctx.setenv("A", Some("1"));
        ctx.append_argv("true");

        let prepared = ctx.finish().unwrap();
        // env entries are sorted before the fold.
        assert_eq!(prepared.argv, vec!["env", "A=1", "B=2", "true"]);
    }

    #[test]
    fn test_cwd_conflict_fails_fold() {
        let mut ctx = RunContext::new();
        ctx.set_cwd(Some("/tmp".into()));
        ctx.push_default();
        ctx.set_cwd(Some("/home".into()));
        ctx.append_argv("true");

        assert!(matches!(
            ctx.finish(),
            Err(AgentError::CwdConflict(..))
        ));
    }

    #[test]
    fn test_matching_cwd_folds() {
        let mut ctx = RunContext::new();
        ctx.set_cwd(Some("/tmp".into()));
        ctx.push_default();
        ctx.set_cwd(Some("/tmp".into()));
        ctx.append_argv("true");

        let prepared = ctx.finish().unwrap();
        assert_eq!(prepared.cwd.as_deref(), Some("/tmp"));
    }

    #[test]
    fn test_push_error_defers_failure_to_fold() {
        let mut ctx = RunContext::new();
        ctx.push_error(AgentError::NotFound("whatever".into()));
        ctx.append_argv("true");

        assert!(matches!(ctx.finish(), Err(AgentError::NotFound(_))));
    }

    #[test]
    fn test_push_at_base_wraps_outermost() {
        let mut ctx = RunContext::new();
        ctx.push_at_base(Box::new(|ctx, layer| {
            ctx.append_argv("wrapper");
            ctx.append_args(layer.argv);
            Ok(())
        }));
        ctx.push_default();
        ctx.append_args(["inner", "cmd"]);

        let prepared = ctx.finish().unwrap();
        assert_eq!(prepared.argv, vec!["wrapper", "inner", "cmd"]);
    }

    #[test]
    fn test_setenv_replaces_and_deletes() {
        let mut ctx = RunContext::new();
        ctx.setenv("A", Some("1"));
        ctx.setenv("B", Some("2"));
        ctx.setenv("A", Some("3"));
        ctx.setenv("B", None);

        let prepared = ctx.finish().unwrap();
        assert_eq!(prepared.env, vec!["A=3"]);
    }

    #[test]
    fn test_host_layer_is_noop_outside_sandbox() {
        // CI never runs under Flatpak; the layer must vanish.
        assert!(!envdetect::is_sandboxed());

        let mut ctx = RunContext::new();
        ctx.push_host();
        ctx.append_args(["podman", "ps"]);

        let prepared = ctx.finish().unwrap();
        assert_eq!(prepared.argv, vec!["podman", "ps"]);
        assert!(prepared.setup_tty);
    }

    #[test]
    fn test_host_handler_forwards_high_fds_only() {
        let mut ctx = RunContext::new();

        let mut fd_map = FdMap::new();
        let (r1, _w1) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC).unwrap();
        let (r2, _w2) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC).unwrap();
        fd_map.take(Some(r1), 0);
        fd_map.take(Some(r2), 5);

        let layer = LayerData {
            argv: vec!["podman".into(), "ps".into()],
            env: vec!["LANG=C".into()],
            cwd: Some("/tmp".into()),
            fd_map,
        };
        host_handler(&mut ctx, layer).unwrap();

        let prepared = ctx.finish().unwrap();
        assert_eq!(
            prepared.argv,
            vec![
                "flatpak-spawn",
                "--host",
                "--watch-bus",
                "--env=LANG=C",
                "--directory=/tmp",
                "--forward-fd=5",
                "podman",
                "ps",
            ]
        );
    }

    #[test]
    fn test_scope_layer_passes_command_through() {
        let mut ctx = RunContext::new();
        ctx.push_scope();
        ctx.append_args(["true"]);

        let prepared = ctx.finish().unwrap();
        if util::has_systemd_run() {
            assert_eq!(
                prepared.argv,
                vec![
                    "systemd-run",
                    "--user",
                    "--scope",
                    "--collect",
                    "--quiet",
                    "--same-dir",
                    "true",
                ]
            );
        } else {
            assert_eq!(prepared.argv, vec!["true"]);
        }
    }

    #[test]
    fn test_overlapping_fd_maps_fail_fold() {
        let mut ctx = RunContext::new();
        let (r1, _w1) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC).unwrap();
        let (r2, _w2) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC).unwrap();

        ctx.take_fd(Some(r1), 1);
        ctx.push_default();
        ctx.take_fd(Some(r2), 1);
        ctx.append_argv("true");

        assert!(matches!(
            ctx.finish(),
            Err(AgentError::OverlappingFd(1))
        ));
    }

    #[tokio::test]
    async fn test_spawn_echo_over_pty() {
        let consumer = pty::create_consumer().unwrap();
        let producer = pty::create_producer(consumer.as_fd()).unwrap();

        let mut ctx = RunContext::new();
        ctx.append_args(["/bin/echo", "hello"]);
        ctx.take_fd(Some(dup(&producer)), 0);
        ctx.take_fd(Some(dup(&producer)), 1);
        ctx.take_fd(Some(producer), 2);

        let mut child = ctx.spawn().unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());

        let mut reader = std::fs::File::from(consumer);
        let mut buf = [0u8; 64];
        let n = loop {
            match reader.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("read failed: {e}"),
            }
        };
        // The pty cooks the newline into \r\n.
        assert_eq!(&buf[..n], b"hello\r\n");
    }

    #[tokio::test]
    async fn test_spawn_high_fd_mapping() {
        let (read_end, write_end) =
            rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC).unwrap();

        let mut ctx = RunContext::new();
        ctx.append_args(["/bin/sh", "-c", "echo marker >&7"]);
        ctx.take_fd(Some(write_end), 7);

        let mut child = ctx.spawn().unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());

        let mut reader = std::fs::File::from(read_end);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "marker\n");
    }

    #[tokio::test]
    async fn test_spawn_silences_stdout_on_request() {
        let mut ctx = RunContext::new();
        ctx.append_args(["/bin/echo", "discarded"]);
        ctx.take_fd(None, 1);

        let mut child = ctx.spawn().unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }
}
