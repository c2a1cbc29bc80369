//! Desired/reported state reconciliation.
//!
//! Incoming desired-state documents are fanned out as `file_change` events;
//! each reconciler-capable component picks its own namespace out of
//! `current.state.desired`. Reporting walks every registered component and
//! merges their namespace bodies into one flat document.

use crate::error::Error;
use crate::messaging::{EventDispatcher, EventMessage, EventType};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One namespace entry of a reported-state document
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigUpdate {
    pub name: String,
    pub body: Value,
}

impl ConfigUpdate {
    pub fn new(name: impl Into<String>, body: Value) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }
}

/// A component that can report its own live configuration.
///
/// Applying configuration goes through the component's `file_change`
/// handler; this trait covers the reporting half.
#[async_trait]
pub trait ConfigHandler: Send + Sync {
    /// Namespace of the desired-state document this component owns
    fn namespace(&self) -> &'static str;

    /// Current configuration, or `None` when there is nothing to contribute
    async fn report(&self) -> Option<ConfigUpdate>;
}

/// When the reported-state document should be written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportPolicy {
    #[default]
    Never,
    Always,
    /// Only when the reported document has never been populated
    #[serde(alias = "only-if-empty")]
    Empty,
}

impl std::str::FromStr for ReportPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "always" => Ok(Self::Always),
            "empty" | "only-if-empty" => Ok(Self::Empty),
            other => Err(Error::Config(format!("Unknown report policy: {}", other))),
        }
    }
}

/// View over the `current.state.desired` map of a document
#[derive(Debug, Clone, Copy)]
pub struct DesiredState<'a> {
    desired: &'a Map<String, Value>,
}

impl<'a> DesiredState<'a> {
    /// Extract the desired map from a raw document
    pub fn from_content(content: &'a Value) -> Option<Self> {
        content
            .get("current")?
            .get("state")?
            .get("desired")?
            .as_object()
            .map(|desired| Self { desired })
    }

    /// Extract the desired map from a `file_change` event payload
    pub fn from_event(event: &'a EventMessage) -> Option<Self> {
        Self::from_content(event.get("content")?)
    }

    pub fn namespace(&self, name: &str) -> Option<&'a Value> {
        self.desired.get(name)
    }

    /// Object body of a namespace; a non-object body is a configuration error
    pub fn section(&self, name: &str) -> Result<Option<&'a Map<String, Value>>> {
        match self.desired.get(name) {
            None => Ok(None),
            Some(Value::Object(body)) => Ok(Some(body)),
            Some(other) => Err(Error::Config(format!(
                "Namespace {} must be an object, got {}",
                name, other
            ))
            .into()),
        }
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &'a String> {
        self.desired.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.desired.is_empty()
    }
}

/// Wrap a flat namespace map in the `current.state.desired` envelope
pub fn desired_document(namespaces: Map<String, Value>) -> Value {
    json!({
        "current": {
            "state": {
                "desired": Value::Object(namespaces)
            }
        }
    })
}

/// Bidirectional sync between the device and the cloud-held document
pub struct ShadowReconciler {
    events: Arc<EventDispatcher>,
    /// Written externally; replayed on start
    desired_document: PathBuf,
    /// Written here when reporting
    reported_document: PathBuf,
    handlers: Vec<Arc<dyn ConfigHandler>>,
}

impl ShadowReconciler {
    pub fn new(events: Arc<EventDispatcher>, desired_document: &Path, reported_document: &Path) -> Self {
        Self {
            events,
            desired_document: desired_document.to_owned(),
            reported_document: reported_document.to_owned(),
            handlers: Vec::new(),
        }
    }

    pub fn add_handler(&mut self, handler: Arc<dyn ConfigHandler>) {
        self.handlers.push(handler);
    }

    pub fn desired_path(&self) -> &Path {
        &self.desired_document
    }

    pub fn reported_path(&self) -> &Path {
        &self.reported_document
    }

    /// Fan a desired-state document out to every `file_change` handler
    pub fn apply(&self, content: Value, file_name: Option<&Path>) -> bool {
        let mut payload = Map::new();
        if let Some(file_name) = file_name {
            payload.insert(
                "file_name".to_string(),
                Value::from(file_name.to_string_lossy().into_owned()),
            );
        }
        payload.insert("content".to_string(), content);
        self.events.fire(EventType::FileChange, Value::Object(payload))
    }

    /// Merge every handler's report; `None` when nobody contributed
    pub async fn report(&self) -> Option<Map<String, Value>> {
        let mut document = Map::new();
        for handler in &self.handlers {
            match handler.report().await {
                Some(update) => {
                    document.insert(update.name, update.body);
                }
                None => debug!("{} has nothing to report", handler.namespace()),
            }
        }
        if document.is_empty() {
            None
        } else {
            Some(document)
        }
    }

    /// Write the reported-state document if the policy allows it.
    ///
    /// Returns whether a document was written.
    pub async fn update_document(&self, policy: ReportPolicy) -> Result<bool> {
        let should_update = match policy {
            ReportPolicy::Never => false,
            ReportPolicy::Always => true,
            ReportPolicy::Empty => read_document(&self.reported_document)
                .await?
                .map_or(true, |document| is_blank(&document)),
        };
        if !should_update {
            return Ok(false);
        }

        let Some(document) = self.report().await else {
            info!("There was no update, skipping");
            return Ok(false);
        };

        let body = serde_json::to_vec_pretty(&Value::Object(document))?;
        write_atomically(&self.reported_document, &body).await?;
        info!("Successfully updated {:?}", self.reported_document);
        Ok(true)
    }

    /// Replay the last desired document so a restarted agent re-applies it.
    ///
    /// Returns whether a `file_change` was fired.
    pub async fn reset_from_document(&self) -> Result<bool> {
        match read_document(&self.desired_document).await? {
            Some(content) if !is_blank(&content) => {
                info!("Replaying configuration from {:?}", self.desired_document);
                Ok(self.apply(content, Some(&self.desired_document)))
            }
            _ => {
                info!("Skipping reset, as configuration is empty");
                Ok(false)
            }
        }
    }
}

/// Read a JSON document; `None` when the file does not exist
pub async fn read_document(path: &Path) -> Result<Option<Value>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context(format!("Failed to read {:?}", path)),
    };
    if raw.trim().is_empty() {
        return Ok(Some(Value::Object(Map::new())));
    }
    let document = serde_json::from_str(&raw).context(format!("Failed to parse {:?}", path))?;
    Ok(Some(document))
}

fn is_blank(document: &Value) -> bool {
    match document {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

async fn write_atomically(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, body)
        .await
        .context(format!("Failed to write {:?}", staging))?;
    tokio::fs::rename(&staging, path)
        .await
        .context(format!("Failed to move {:?} into place", staging))?;
    Ok(())
}
