//! Installable-plugin discovery: scan a directory of worker executables
//! and keep the registry's executable table in sync as files come and go.
//! Plugin id = file stem.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use futures::channel::mpsc;
use notify::{Config as NotifyConfig, Event, PollWatcher, RecursiveMode, Watcher};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::PluginRegistry;

fn is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path).map(|m| m.permissions().mode() & 0o111 != 0).unwrap_or(false)
    }
    #[cfg(not(unix))]
    true
}

fn plugin_id_for(path: &Path) -> Option<String> {
    path.file_stem().map(|stem| stem.to_string_lossy().into_owned())
}

/// Register every executable already present in the directory.
pub fn scan_plugins_dir(dir: &Path, registry: &PluginRegistry) -> anyhow::Result<usize> {
    let mut found = 0;
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("could not read plugins dir {}", dir.display()))?
    {
        let path = entry?.path();
        if !is_executable(&path) {
            debug!(path = %path.display(), "ignoring non-executable entry");
            continue;
        }
        if let Some(plugin_id) = plugin_id_for(&path) {
            registry.register_executable(&plugin_id, path);
            found += 1;
        }
    }
    Ok(found)
}

/// Keeps watching after construction; dropping it stops both the OS
/// watcher and the forwarding task.
pub struct PluginWatcher {
    _watcher: PollWatcher,
    task: JoinHandle<()>,
}

impl Drop for PluginWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watch `dir` for executables appearing or disappearing. Polling is used
/// so network mounts and overlay filesystems behave.
pub fn watch_plugins_dir(
    dir: &Path,
    registry: Arc<PluginRegistry>,
    poll_interval: Duration,
) -> anyhow::Result<PluginWatcher> {
    let (tx, mut rx) = mpsc::unbounded::<Event>();
    let mut watcher = PollWatcher::new(
        move |result: Result<Event, notify::Error>| match result {
            Ok(event) => {
                let _ = tx.unbounded_send(event);
            }
            Err(e) => warn!(error = %e, "plugin watcher error"),
        },
        NotifyConfig::default().with_poll_interval(poll_interval),
    )?;
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("could not watch {}", dir.display()))?;

    let task = tokio::spawn(async move {
        while let Some(event) = rx.next().await {
            for path in event.paths {
                let Some(plugin_id) = plugin_id_for(&path) else { continue };
                if is_executable(&path) {
                    registry.register_executable(&plugin_id, path.clone());
                } else if !path.exists() {
                    registry.unregister_executable(&plugin_id);
                }
            }
        }
    });

    Ok(PluginWatcher { _watcher: watcher, task })
}
