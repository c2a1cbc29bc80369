use crate::error::Error;
use crate::messaging::{EventDispatcher, EventMessage, EventType, Handler};
use crate::shadow::{ConfigHandler, ConfigUpdate, DesiredState};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const HEALTH_NAMESPACE: &str = "health";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One group of fields in a `health_end` event
pub trait HealthMetric: Send + Sync {
    fn name(&self) -> &'static str;
    fn report(&self) -> Result<Map<String, Value>>;
}

pub struct RunningTime {
    started: DateTime<Utc>,
}

impl RunningTime {
    pub fn new() -> Self {
        Self { started: Utc::now() }
    }
}

impl Default for RunningTime {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMetric for RunningTime {
    fn name(&self) -> &'static str {
        "running_time"
    }

    fn report(&self) -> Result<Map<String, Value>> {
        let up_time = (Utc::now() - self.started).num_seconds();
        Ok(to_map(json!({
            "start_time": self.started.timestamp(),
            "up_time": up_time,
        })))
    }
}

/// CPU count and one minute load average
pub struct CpuMetric;

impl HealthMetric for CpuMetric {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn report(&self) -> Result<Map<String, Value>> {
        let cpu_count = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        let load = std::fs::read_to_string("/proc/loadavg").context("Failed to read load average")?;
        let cpu_used: f64 = load
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("Empty load average"))?
            .parse()?;
        Ok(to_map(json!({
            "cpu_count": cpu_count,
            "cpu_used": cpu_used,
        })))
    }
}

pub struct MemoryMetric {
    meminfo: PathBuf,
}

impl MemoryMetric {
    pub fn new() -> Self {
        Self {
            meminfo: PathBuf::from("/proc/meminfo"),
        }
    }

    /// Extract free, available and total memory in kB
    pub fn parse(meminfo: &str) -> Result<Map<String, Value>> {
        let pattern = Regex::new(r"(?m)^(MemTotal|MemFree|MemAvailable):\s+(\d+)")?;
        let mut usage = Map::new();
        for captures in pattern.captures_iter(meminfo) {
            let key = match &captures[1] {
                "MemTotal" => "mem_total",
                "MemFree" => "mem_free",
                _ => "mem_avail",
            };
            let value: u64 = captures[2].parse()?;
            usage.insert(key.to_string(), Value::from(value));
        }
        Ok(usage)
    }
}

impl Default for MemoryMetric {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMetric for MemoryMetric {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn report(&self) -> Result<Map<String, Value>> {
        let meminfo = std::fs::read_to_string(&self.meminfo)
            .with_context(|| format!("Failed to read {:?}", self.meminfo))?;
        Self::parse(&meminfo)
    }
}

/// Disk usage of the filesystem holding `path`, in bytes
pub struct DiskMetric {
    path: PathBuf,
}

impl DiskMetric {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse `df -k` output: filesystem, total, used, available...
    pub fn parse(output: &str) -> Result<Map<String, Value>> {
        let lines: Vec<&str> = output.lines().collect();
        if lines.len() < 2 {
            return Err(anyhow!("Invalid df output"));
        }
        let values: Vec<&str> = lines[1].split_whitespace().collect();
        if values.len() < 4 {
            return Err(anyhow!("Invalid df output format"));
        }
        let total_kb: u64 = values[1].parse()?;
        let used_kb: u64 = values[2].parse()?;
        let free_kb: u64 = values[3].parse()?;
        Ok(to_map(json!({
            "disk_total": total_kb * 1024,
            "disk_used": used_kb * 1024,
            "disk_free": free_kb * 1024,
        })))
    }
}

impl HealthMetric for DiskMetric {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn report(&self) -> Result<Map<String, Value>> {
        let path = self.path.to_string_lossy().to_string();
        let out = std::process::Command::new("df").args(["-k", &path]).output()?;
        if !out.status.success() {
            return Err(anyhow!("Failed to get disk usage"));
        }
        Self::parse(&String::from_utf8_lossy(&out.stdout))
    }
}

/// Address of the interface used for outbound traffic
pub struct HostAddress;

impl HealthMetric for HostAddress {
    fn name(&self) -> &'static str {
        "host_address"
    }

    fn report(&self) -> Result<Map<String, Value>> {
        // Connecting a UDP socket sends nothing; it only selects a route
        let ip_addr = UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| {
                socket.connect("8.8.8.8:80")?;
                socket.local_addr()
            })
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|e| {
                warn!("Failed to read ip: {}", e);
                "unknown".to_string()
            });
        Ok(to_map(json!({ "ip_addr": ip_addr })))
    }
}

pub fn default_metrics() -> Vec<Box<dyn HealthMetric>> {
    vec![
        Box::new(RunningTime::new()),
        Box::new(CpuMetric),
        Box::new(MemoryMetric::new()),
        Box::new(DiskMetric::new("/")),
        Box::new(HostAddress),
    ]
}

fn to_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

struct HealthState {
    interval: Duration,
    last_flush: Instant,
    motion_captured: u64,
    recording: bool,
}

/// Periodic device telemetry published as `health_end`
pub struct DeviceHealth {
    events: Arc<EventDispatcher>,
    metrics: Vec<Box<dyn HealthMetric>>,
    state: Mutex<HealthState>,
    shutdown: CancellationToken,
}

impl DeviceHealth {
    pub fn new(events: Arc<EventDispatcher>, interval: Duration) -> Self {
        Self::with_metrics(events, interval, default_metrics())
    }

    pub fn with_metrics(
        events: Arc<EventDispatcher>,
        interval: Duration,
        metrics: Vec<Box<dyn HealthMetric>>,
    ) -> Self {
        Self {
            events,
            metrics,
            state: Mutex::new(HealthState {
                interval,
                last_flush: Instant::now(),
                motion_captured: 0,
                recording: false,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    pub async fn interval(&self) -> Duration {
        self.state.lock().await.interval
    }

    /// Publish metrics if forced or the interval has elapsed.
    ///
    /// Returns whether a `health_end` was fired.
    pub async fn emit_health(&self, force: bool) -> bool {
        let mut state = self.state.lock().await;
        if force || state.last_flush.elapsed() > state.interval {
            self.flush_metrics(&mut state);
            return true;
        }
        false
    }

    fn flush_metrics(&self, state: &mut HealthState) {
        let mut context = to_map(json!({
            "version": VERSION,
            "motion_captured": state.motion_captured,
            "recording_status": state.recording,
        }));
        for metric in &self.metrics {
            match metric.report() {
                Ok(fields) => context.extend(fields),
                Err(e) => warn!("Failed to collect {} metric: {:#}", metric.name(), e),
            }
        }
        self.events.fire(EventType::HealthEnd, Value::Object(context));
        state.last_flush = Instant::now();
        debug!("Emitted health metric data");
    }

    /// Check once per second whether a health report is due
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let health = Arc::clone(self);
        tokio::spawn(async move {
            info!("Starting device health checks");
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = health.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        health.emit_health(false).await;
                    }
                }
            }
            info!("Device health checks stopped");
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

fn parse_interval(value: &Value) -> Result<u64> {
    let seconds = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    };
    seconds
        .filter(|seconds| *seconds > 0)
        .ok_or_else(|| Error::Config(format!("Invalid health interval: {}", value)).into())
}

#[async_trait]
impl Handler for DeviceHealth {
    async fn on_flush_end(&self, _event: &EventMessage) -> Result<()> {
        self.state.lock().await.motion_captured += 1;
        Ok(())
    }

    async fn on_recording_change(&self, event: &EventMessage) -> Result<()> {
        if let Some(recording) = event.get("recording").and_then(Value::as_bool) {
            self.state.lock().await.recording = recording;
        }
        Ok(())
    }

    async fn on_file_change(&self, event: &EventMessage) -> Result<()> {
        let Some(desired) = DesiredState::from_event(event) else {
            return Ok(());
        };
        let Some(health) = desired.section(HEALTH_NAMESPACE)? else {
            return Ok(());
        };
        if let Some(value) = health.get("interval") {
            let seconds = parse_interval(value)?;
            self.state.lock().await.interval = Duration::from_secs(seconds);
            info!("Health interval is now {} seconds", seconds);
        }
        Ok(())
    }

    /// A custom `health` event forces an immediate report
    async fn on_custom(&self, event: &EventMessage) -> Result<()> {
        if event.event_type.name() == HEALTH_NAMESPACE {
            let mut state = self.state.lock().await;
            self.flush_metrics(&mut state);
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigHandler for DeviceHealth {
    fn namespace(&self) -> &'static str {
        HEALTH_NAMESPACE
    }

    async fn report(&self) -> Option<ConfigUpdate> {
        let interval = self.interval().await;
        Some(ConfigUpdate::new(
            HEALTH_NAMESPACE,
            json!({ "interval": interval.as_secs() }),
        ))
    }
}
