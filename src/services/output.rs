use crate::messaging::{EventMessage, Handler};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};

/// Writes the latest public event to a file for local consumers.
///
/// The file holds one JSON object and is replaced on every event.
pub struct EventOutput {
    output_file: PathBuf,
}

impl EventOutput {
    pub fn new(output_file: &Path) -> Self {
        Self {
            output_file: output_file.to_owned(),
        }
    }

    async fn write(&self, event: &EventMessage) -> Result<()> {
        let body = serde_json::to_vec(&event.to_json())?;
        tokio::fs::write(&self.output_file, body)
            .await
            .with_context(|| format!("Failed to write event to {:?}", self.output_file))?;
        debug!("Wrote {} to {:?}", event.event_type, self.output_file);
        Ok(())
    }
}

#[async_trait]
impl Handler for EventOutput {
    async fn on_motion_start(&self, event: &EventMessage) -> Result<()> {
        self.write(event).await
    }

    async fn on_combine_end(&self, event: &EventMessage) -> Result<()> {
        self.write(event).await
    }

    async fn on_upload_end(&self, event: &EventMessage) -> Result<()> {
        self.write(event).await
    }

    async fn on_health_end(&self, event: &EventMessage) -> Result<()> {
        self.write(event).await
    }

    async fn on_record_end(&self, event: &EventMessage) -> Result<()> {
        self.write(event).await
    }
}
