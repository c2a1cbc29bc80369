use crate::cloud::CloudConnection;
use crate::recorder::CameraSettings;
use crate::shadow::ReportPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub camera: CameraSettings,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub shadow: ShadowConfig,
    /// No credentials are fetched without it
    #[serde(default)]
    pub cloud_connection: Option<CloudConnection>,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub combiner: CombinerConfig,
}

/// Which capture backend drives the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Simulated,
    Gstreamer,
}

/// Process-level settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub device: DeviceKind,
    /// V4L2 device node used by the GStreamer backend
    #[serde(default = "default_source")]
    pub source: String,
    /// Where before/after segments are written
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_source() -> String {
    "/dev/video0".to_string()
}

fn default_capture_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Local event exchange files
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventsConfig {
    /// `{name, context}` events written by other processes
    #[serde(default = "default_event_input")]
    pub input_file: PathBuf,
    /// Last public event, rewritten on every event
    #[serde(default = "default_event_output")]
    pub output_file: PathBuf,
}

fn default_event_input() -> PathBuf {
    PathBuf::from("input.json")
}

fn default_event_output() -> PathBuf {
    PathBuf::from("output.json")
}

/// Desired/reported document locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShadowConfig {
    #[serde(default = "default_desired_document")]
    pub desired_document: PathBuf,
    #[serde(default = "default_reported_document")]
    pub reported_document: PathBuf,
    #[serde(default)]
    pub update_policy: ReportPolicy,
}

fn default_desired_document() -> PathBuf {
    PathBuf::from("configuration.json")
}

fn default_reported_document() -> PathBuf {
    PathBuf::from("reported.json")
}

/// Device health telemetry
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    /// Seconds between `health_end` reports
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
}

fn default_health_interval() -> u64 {
    3600 // 1 hour
}

/// Motion clip assembly
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CombinerConfig {
    #[serde(default = "default_combine_dir")]
    pub combine_dir: PathBuf,
}

fn default_combine_dir() -> PathBuf {
    PathBuf::from("motion_videos")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            device: DeviceKind::default(),
            source: default_source(),
            capture_dir: default_capture_dir(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            input_file: default_event_input(),
            output_file: default_event_output(),
        }
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            desired_document: default_desired_document(),
            reported_document: default_reported_document(),
            update_policy: ReportPolicy::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
        }
    }
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            combine_dir: default_combine_dir(),
        }
    }
}

/// Load configuration from a file or use default
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => {
            let config_str = std::fs::read_to_string(path)
                .context(format!("Failed to read config file: {:?}", path))?;

            let config = if path.extension().map_or(false, |ext| ext == "json") {
                serde_json::from_str(&config_str).context("Failed to parse JSON config")?
            } else if path.extension().map_or(false, |ext| ext == "toml") {
                toml::from_str(&config_str).context("Failed to parse TOML config")?
            } else {
                return Err(anyhow::anyhow!("Unsupported config file format"));
            };

            Ok(config)
        }
        None => Ok(Config::default()),
    }
}
