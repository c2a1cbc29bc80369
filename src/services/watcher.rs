use crate::messaging::{EventDispatcher, EventType};
use crate::shadow::read_document;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What a watched file carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    /// Desired-state document, replayed as `file_change`
    Configuration,
    /// Single `{name, context}` event written by an external process
    EventInput,
}

#[derive(Debug, Deserialize)]
struct InputEvent {
    name: String,
    #[serde(default)]
    context: Value,
}

/// Turns writes to local files into dispatcher events
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl FileWatcher {
    pub fn start(events: Arc<EventDispatcher>, targets: &[(PathBuf, WatchKind)]) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) if event.kind.is_create() || event.kind.is_modify() => {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Watch error: {:?}", e),
            }
        })?;

        // Editors replace files, so watch the directory and match by name
        let mut watched: HashMap<OsString, (PathBuf, WatchKind)> = HashMap::new();
        for (path, kind) in targets {
            if *kind == WatchKind::EventInput && !path.exists() {
                std::fs::write(path, "{}")
                    .with_context(|| format!("Failed to create input file {:?}", path))?;
            }
            let directory = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_owned(),
                _ => PathBuf::from("."),
            };
            let name = path
                .file_name()
                .with_context(|| format!("Watched path {:?} has no file name", path))?;
            watcher
                .watch(&directory, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch {:?}", directory))?;
            watched.insert(name.to_owned(), (path.clone(), *kind));
            info!("Watching {:?} for {:?}", path, kind);
        }

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                let changed = tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.recv() => changed,
                };
                let Some(changed) = changed else { break };
                let Some((path, kind)) = changed
                    .file_name()
                    .and_then(|name| watched.get(name))
                else {
                    continue;
                };
                if let Err(e) = dispatch(&events, *kind, path).await {
                    error!("Failed to handle change to {:?}: {:#}", path, e);
                }
            }
            debug!("File watcher stopped");
        });

        Ok(Self {
            _watcher: watcher,
            task,
            shutdown,
        })
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

/// Read a changed file and fire the event it describes.
///
/// Returns whether an event was fired.
pub async fn dispatch(events: &EventDispatcher, kind: WatchKind, path: &Path) -> Result<bool> {
    match kind {
        WatchKind::Configuration => {
            let Some(content) = read_document(path).await? else {
                return Ok(false);
            };
            if content.as_object().map_or(true, |map| map.is_empty()) {
                debug!("Ignoring empty configuration in {:?}", path);
                return Ok(false);
            }
            Ok(events.fire(
                EventType::FileChange,
                json!({
                    "file_name": path.to_string_lossy(),
                    "content": content,
                }),
            ))
        }
        WatchKind::EventInput => {
            let Some(content) = read_document(path).await? else {
                return Ok(false);
            };
            if content.as_object().map_or(false, |map| map.is_empty()) {
                return Ok(false);
            }
            let input: InputEvent = serde_json::from_value(content)
                .with_context(|| format!("Malformed event input in {:?}", path))?;
            let event_type: EventType = input.name.parse().unwrap_or_else(|e| match e {});
            debug!("Firing {} from {:?}", event_type, path);
            Ok(events.fire(event_type, input.context))
        }
    }
}
