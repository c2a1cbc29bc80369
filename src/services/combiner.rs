use crate::error::Error;
use crate::messaging::{EventDispatcher, EventMessage, EventType, Handler};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Joins the before/after segments of a flush into one motion clip
pub struct VideoCombiner {
    events: Arc<EventDispatcher>,
    capture_dir: PathBuf,
    combine_dir: PathBuf,
}

impl VideoCombiner {
    pub fn new(events: Arc<EventDispatcher>, capture_dir: &Path, combine_dir: &Path) -> Self {
        Self {
            events,
            capture_dir: capture_dir.to_owned(),
            combine_dir: combine_dir.to_owned(),
        }
    }

    pub fn combined_name(start_time: i64) -> String {
        format!("{}.motion.h264", start_time)
    }

    /// Concatenate both parts into the combine directory, returning the
    /// combined file name
    pub async fn combine(&self, start_time: i64) -> Result<String> {
        fs::create_dir_all(&self.combine_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", self.combine_dir))?;

        let file_name = Self::combined_name(start_time);
        let target = self.combine_dir.join(&file_name);
        let mut output = fs::File::create(&target)
            .await
            .with_context(|| format!("Failed to create {:?}", target))?;

        let parts: Vec<PathBuf> = ["before", "after"]
            .iter()
            .map(|part| self.capture_dir.join(format!("{}.{}.h264", start_time, part)))
            .collect();
        for part in &parts {
            let data = fs::read(part)
                .await
                .with_context(|| format!("Missing segment {:?}", part))?;
            output.write_all(&data).await?;
        }
        output.flush().await?;

        for part in &parts {
            if let Err(e) = fs::remove_file(part).await {
                warn!("Failed to remove segment {:?}: {}", part, e);
            }
        }
        Ok(file_name)
    }
}

#[async_trait]
impl Handler for VideoCombiner {
    async fn on_flush_end(&self, event: &EventMessage) -> Result<()> {
        let start_time = event
            .get("start_time")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Dispatch("flush_end without start_time".to_string()))?;

        let file_name = self.combine(start_time).await?;
        self.events.fire(
            EventType::CombineEnd,
            json!({
                "start_time": start_time,
                "combine_video": file_name,
            }),
        );
        info!("Finished concatenating to {}", file_name);
        Ok(())
    }
}
