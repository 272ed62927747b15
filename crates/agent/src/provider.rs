//! Live set of podman containers.
//!
//! The set mirrors `podman ps --all`: a startup refresh, a debounced
//! refresh whenever podman's `containers.json` changes, and a positional
//! merge that keeps stable indexes while announcing adds and removals.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::container::{Container, ContainerKind};
use crate::error::AgentError;
use crate::run_context::RunContext;
use crate::util;

const RELOAD_DELAY: Duration = Duration::from_secs(3);

/// One element of `podman ps --all --format=json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PsEntry {
    pub id: Option<String>,
    pub names: Option<Vec<String>>,
    pub labels: Option<HashMap<String, String>>,
    pub is_infra: Option<bool>,
}

/// Set membership changes announced to the agent root.
#[derive(Debug)]
pub enum ProviderEvent {
    Added(Arc<Container>),
    Removed(Arc<Container>),
}

/// Maps a container label to the flavor it implies. First match wins, in
/// registration order.
#[derive(Debug)]
struct LabelRule {
    key: &'static str,
    value: Option<&'static str>,
    kind: ContainerKind,
}

fn default_rules() -> Vec<LabelRule> {
    vec![
        LabelRule {
            key: "com.github.containers.toolbox",
            value: None,
            kind: ContainerKind::Toolbox,
        },
        LabelRule {
            key: "manager",
            value: Some("distrobox"),
            kind: ContainerKind::Distrobox,
        },
    ]
}

/// The podman container provider.
#[derive(Debug)]
pub struct PodmanProvider {
    inner: Arc<ProviderInner>,
}

#[derive(Debug)]
struct ProviderInner {
    rules: Vec<LabelRule>,
    containers: Mutex<Vec<Arc<Container>>>,
    events: UnboundedSender<ProviderEvent>,
}

impl PodmanProvider {
    /// Creates the provider and the event stream the agent root consumes.
    pub fn new() -> (Self, UnboundedReceiver<ProviderEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let provider = Self {
            inner: Arc::new(ProviderInner {
                rules: default_rules(),
                containers: Mutex::new(Vec::new()),
                events,
            }),
        };
        (provider, receiver)
    }

    /// Runs `podman ps` once and merges the result into the current set.
    pub async fn refresh(&self) -> Result<(), AgentError> {
        self.inner.refresh().await
    }

    /// Starts the `containers.json` monitor with its debounced refresh.
    pub fn spawn_watcher(&self) {
        let storage = containers_json_path();
        let (queue, mut queued) = mpsc::unbounded_channel();

        // Create the parent upfront, in the same form podman would, so the
        // monitor has something to attach to.
        if let Some(parent) = storage.parent() {
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true);
            std::os::unix::fs::DirBuilderExt::mode(&mut builder, 0o700);
            if let Err(error) = builder.create(parent) {
                tracing::warn!("cannot create {}: {error}", parent.display());
            }
        }

        let watcher = make_watcher(&storage, queue);
        let inner = self.inner.clone();

        tokio::spawn(async move {
            // The watcher thread holds the sending side; keep it alive for
            // the lifetime of the loop.
            let _watcher = watcher;

            loop {
                if queued.recv().await.is_none() {
                    break;
                }

                // Debounce: podman rewrites the file several times per
                // operation, one refresh covers the burst.
                tokio::time::sleep(RELOAD_DELAY).await;
                while queued.try_recv().is_ok() {}

                if let Err(error) = inner.refresh().await {
                    tracing::debug!("Failed to run podman ps: {error}");
                }
            }
        });
    }
}

impl ProviderInner {
    async fn refresh(&self) -> Result<(), AgentError> {
        let mut ctx = RunContext::new();
        ctx.push_host();
        ctx.add_minimal_environment();
        ctx.append_args(["podman", "ps", "--all", "--format=json"]);

        let mut cmd = ctx.finish()?.command()?;
        cmd.stdin(Stdio::null());
        let output = cmd.output().await.map_err(AgentError::Spawn)?;

        if !output.status.success() {
            return Err(AgentError::CommandFailed(format!(
                "podman ps exited with {}",
                output.status
            )));
        }

        let entries: Vec<PsEntry> = serde_json::from_slice(&output.stdout)
            .map_err(|error| AgentError::InvalidData(format!("Failed to load podman JSON: {error}")))?;

        let incoming = entries
            .into_iter()
            .filter(|entry| !entry.is_infra.unwrap_or(false))
            .filter_map(|entry| self.deserialize(entry))
            .collect();

        self.merge(incoming);

        Ok(())
    }

    fn deserialize(&self, entry: PsEntry) -> Option<Arc<Container>> {
        let kind = self.kind_for_labels(entry.labels.as_ref());
        match Container::from_ps_entry(kind, entry) {
            Ok(container) => Some(Arc::new(container)),
            Err(error) => {
                tracing::error!("Failed to deserialize container JSON: {error}");
                None
            }
        }
    }

    fn kind_for_labels(&self, labels: Option<&HashMap<String, String>>) -> ContainerKind {
        if let Some(labels) = labels {
            for rule in &self.rules {
                let Some(value) = labels.get(rule.key) else {
                    continue;
                };
                match rule.value {
                    Some(expected) if expected != value => continue,
                    _ => return rule.kind,
                }
            }
        }
        ContainerKind::Podman
    }

    /// Merges `incoming` into the current set while keeping positions
    /// stable: replaced in place when the id survives, dropped otherwise,
    /// then unseen ids appended.
    fn merge(&self, incoming: Vec<Arc<Container>>) {
        let mut containers = self.containers.lock().expect("provider container set");

        for i in (0..containers.len()).rev() {
            let existing_id = containers[i].id.clone();
            match incoming.iter().find(|c| c.id == existing_id) {
                Some(replacement) => containers[i] = replacement.clone(),
                None => {
                    let removed = containers.remove(i);
                    tracing::debug!("Removed container \"{}\"", removed.id);
                    let _ = self.events.send(ProviderEvent::Removed(removed));
                }
            }
        }

        for container in incoming {
            if containers.iter().any(|c| c.id == container.id) {
                continue;
            }
            tracing::debug!("Added container \"{}\"", container.id);
            containers.push(container.clone());
            let _ = self.events.send(ProviderEvent::Added(container));
        }
    }
}

fn containers_json_path() -> PathBuf {
    let data_dir = dirs::data_dir().unwrap_or_else(|| util::home_dir().join(".local/share"));
    data_dir.join("containers/storage/overlay-containers/containers.json")
}

fn make_watcher(target: &Path, queue: UnboundedSender<()>) -> Option<RecommendedWatcher> {
    let target = target.to_path_buf();
    let parent = target.parent().unwrap_or(Path::new("/")).to_path_buf();

    let result = RecommendedWatcher::new(
        move |result: notify::Result<notify::Event>| {
            let Ok(event) = result else {
                return;
            };
            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) && event.paths.iter().any(|path| path == &target);
            if relevant {
                let _ = queue.send(());
            }
        },
        notify::Config::default(),
    );

    let mut watcher = match result {
        Ok(watcher) => watcher,
        Err(error) => {
            tracing::warn!("file monitor unavailable: {error}");
            return None;
        }
    };

    // Watch the parent: the json file itself may not exist yet.
    if let Err(error) = watcher.watch(&parent, RecursiveMode::NonRecursive) {
        tracing::warn!("cannot watch {}: {error}", parent.display());
        return None;
    }

    Some(watcher)
}
