use crate::error::Error;
use crate::messaging::{EventDispatcher, EventMessage, EventType, Handler};
use crate::recorder::device::{CaptureDevice, CaptureOutput};
use crate::recorder::motion::MotionDetector;
use crate::recorder::preroll::PrerollBuffer;
use crate::recorder::settings::CameraSettings;
use crate::shadow::{ConfigHandler, ConfigUpdate, DesiredState};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Timelike;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

pub const CAMERA_NAMESPACE: &str = "camera";

/// Source of the current wall-clock hour
pub type HourSource = Arc<dyn Fn() -> u32 + Send + Sync>;

/// Observable recording state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    Idle,
    Recording,
    /// Capture stopped because the clock is outside the recording window
    Paused,
    Flushing,
    Stopped,
}

impl Display for CameraState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Flushing => "flushing",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// State guarded by the configuration lock
struct CameraInner {
    device: Box<dyn CaptureDevice>,
    settings: CameraSettings,
    buffer: Arc<PrerollBuffer>,
    paused_by_window: bool,
    stopped: bool,
}

/// Drives the capture device: pre-roll recording, motion flushes,
/// recording-window pauses and live reconfiguration.
///
/// Every device access happens under `inner`, so a flush and a
/// configuration change never interleave.
pub struct CameraController {
    events: Arc<EventDispatcher>,
    capture_dir: PathBuf,
    inner: Mutex<CameraInner>,
    /// Copy of the committed settings, readable without the lock
    published: RwLock<CameraSettings>,
    recording: AtomicBool,
    window_paused: AtomicBool,
    stopped: AtomicBool,
    /// Timestamp of the flush in progress, if any
    flush_id: std::sync::Mutex<Option<i64>>,
    flush_requested: Notify,
    shutdown: CancellationToken,
    hour: HourSource,
}

impl CameraController {
    /// Configure the device and prepare the controller.
    ///
    /// Fails when the device rejects the initial settings or the capture
    /// directory cannot be created; startup should abort in that case.
    pub fn new(
        events: Arc<EventDispatcher>,
        settings: CameraSettings,
        device: Box<dyn CaptureDevice>,
        capture_dir: &Path,
    ) -> Result<Arc<Self>> {
        Self::with_hour_source(
            events,
            settings,
            device,
            capture_dir,
            Arc::new(|| chrono::Local::now().hour()),
        )
    }

    /// Same as `new` with a custom clock for the recording window
    pub fn with_hour_source(
        events: Arc<EventDispatcher>,
        settings: CameraSettings,
        mut device: Box<dyn CaptureDevice>,
        capture_dir: &Path,
        hour: HourSource,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(capture_dir)
            .with_context(|| format!("Failed to create capture directory {:?}", capture_dir))?;
        device
            .configure(&settings)
            .map_err(|e| Error::Camera(format!("Failed to configure capture device: {:#}", e)))?;

        let buffer = Arc::new(PrerollBuffer::new(settings.buffer_seconds));
        Ok(Arc::new(Self {
            events,
            capture_dir: capture_dir.to_owned(),
            published: RwLock::new(settings.clone()),
            inner: Mutex::new(CameraInner {
                device,
                settings,
                buffer,
                paused_by_window: false,
                stopped: false,
            }),
            recording: AtomicBool::new(false),
            window_paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            flush_id: std::sync::Mutex::new(None),
            flush_requested: Notify::new(),
            shutdown: CancellationToken::new(),
            hour,
        }))
    }

    /// Spawn the capture loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.run().await;
        })
    }

    async fn run(&self) {
        info!("Starting camera thread");
        if let Err(e) = self.resume().await {
            error!("Failed to start recording: {:#}", e);
        }

        while !self.shutdown.is_cancelled() {
            if !self.is_flushing() {
                let outside = self
                    .settings()
                    .recording_window
                    .is_some_and(|window| !window.contains((self.hour)()));
                if outside {
                    if let Err(e) = self.pause_for_window().await {
                        error!("Failed to pause outside recording window: {:#}", e);
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                } else if self.window_paused.load(Ordering::SeqCst) {
                    // Window cleared or entered
                    if let Err(e) = self.resume_for_window().await {
                        error!("Failed to resume inside recording window: {:#}", e);
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.flush_requested.notified() => {}
                _ = sleep(Duration::from_secs(1)) => {}
            }

            if let Err(e) = self.poll_device().await {
                error!("Capture device reported an error: {:#}", e);
            }
            if self.is_flushing() {
                if let Err(e) = self.flush().await {
                    error!("Failed to flush motion segments: {:#}", e);
                }
            }
        }
        info!("Camera thread stopped");
    }

    async fn lock(&self) -> MutexGuard<'_, CameraInner> {
        self.inner.lock().await
    }

    /// Committed settings
    pub fn settings(&self) -> CameraSettings {
        match self.published.read() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, settings: &CameraSettings) {
        let mut published = match self.published.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *published = settings.clone();
    }

    pub fn state(&self) -> CameraState {
        if self.stopped.load(Ordering::SeqCst) {
            CameraState::Stopped
        } else if self.is_flushing() {
            CameraState::Flushing
        } else if self.recording.load(Ordering::SeqCst) {
            CameraState::Recording
        } else if self.window_paused.load(Ordering::SeqCst) {
            CameraState::Paused
        } else {
            CameraState::Idle
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing_since().is_some()
    }

    /// Id of the flush in progress
    pub fn flushing_since(&self) -> Option<i64> {
        match self.flush_id.lock() {
            Ok(id) => *id,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_flush_id(&self, id: Option<i64>) -> Option<i64> {
        let mut current = match self.flush_id.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *current, id)
    }

    pub fn segment_path(&self, flush_id: i64, part: &str) -> PathBuf {
        self.capture_dir.join(format!("{}.{}.h264", flush_id, part))
    }

    /// Stop capture if active. Returns whether capture was stopped here.
    pub async fn pause(&self) -> Result<bool> {
        let mut inner = self.lock().await;
        self.pause_locked(&mut inner)
    }

    /// Start capture into a fresh pre-roll buffer if stopped. Returns
    /// whether capture was started here.
    pub async fn resume(&self) -> Result<bool> {
        let mut inner = self.lock().await;
        let resumed = self.resume_locked(&mut inner)?;
        inner.paused_by_window = false;
        self.window_paused.store(false, Ordering::SeqCst);
        Ok(resumed)
    }

    async fn pause_for_window(&self) -> Result<()> {
        let mut inner = self.lock().await;
        if self.pause_locked(&mut inner)? {
            info!("Outside the recording window, capture paused");
            inner.paused_by_window = true;
            self.window_paused.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn resume_for_window(&self) -> Result<()> {
        let mut inner = self.lock().await;
        if !inner.paused_by_window {
            return Ok(());
        }
        self.resume_locked(&mut inner)?;
        inner.paused_by_window = false;
        self.window_paused.store(false, Ordering::SeqCst);
        info!("Inside the recording window, capture resumed");
        Ok(())
    }

    fn pause_locked(&self, inner: &mut CameraInner) -> Result<bool> {
        if inner.stopped || !inner.device.is_recording() {
            return Ok(false);
        }
        inner.device.stop_recording()?;
        self.recording.store(false, Ordering::SeqCst);
        info!("Camera recording is now paused");
        self.events
            .fire(EventType::RecordingChange, json!({ "recording": false }));
        Ok(true)
    }

    fn resume_locked(&self, inner: &mut CameraInner) -> Result<bool> {
        if inner.stopped || inner.device.is_recording() {
            return Ok(false);
        }
        let buffer = Arc::new(PrerollBuffer::new(inner.settings.buffer_seconds));
        let motion = MotionDetector::new(self.events.clone(), inner.settings.sensitivity);
        inner
            .device
            .start_recording(CaptureOutput::Buffer(buffer.clone()), motion)?;
        inner.buffer = buffer;
        self.recording.store(true, Ordering::SeqCst);
        info!("Camera is now recording");
        self.events
            .fire(EventType::RecordingChange, json!({ "recording": true }));
        Ok(true)
    }

    async fn poll_device(&self) -> Result<()> {
        let mut inner = self.lock().await;
        if inner.stopped || !inner.device.is_recording() {
            return Ok(());
        }
        inner.device.poll()
    }

    /// Run the flush protocol for the pending flush id
    async fn flush(&self) -> Result<()> {
        let Some(flush_id) = self.flushing_since() else {
            return Ok(());
        };

        let mut inner = self.lock().await;
        let result = self.flush_locked(&mut inner, flush_id).await;
        self.set_flush_id(None);
        drop(inner);

        if result? {
            self.events
                .fire(EventType::FlushEnd, json!({ "start_time": flush_id }));
            info!("Finished flushing motion segments for {}", flush_id);
        }
        Ok(())
    }

    /// Returns `false` when the flush was abandoned before completion
    async fn flush_locked(&self, inner: &mut CameraInner, flush_id: i64) -> Result<bool> {
        if inner.stopped || !inner.device.is_recording() {
            warn!("Dropping flush {}, camera is not recording", flush_id);
            return Ok(false);
        }

        let after = self.segment_path(flush_id, "after");
        inner
            .device
            .split_recording(CaptureOutput::File(after.clone()))
            .with_context(|| format!("Failed to split recording into {:?}", after))?;

        let captured = self.capture_segments(inner, flush_id).await;

        if self.shutdown.is_cancelled() {
            return Ok(false);
        }
        let buffer = Arc::new(PrerollBuffer::new(inner.settings.buffer_seconds));
        inner
            .device
            .split_recording(CaptureOutput::Buffer(buffer.clone()))
            .context("Failed to return capture to the pre-roll buffer")?;
        inner.buffer = buffer;
        captured
    }

    /// Write the before segment, then let the after segment accumulate
    async fn capture_segments(&self, inner: &mut CameraInner, flush_id: i64) -> Result<bool> {
        let before = self.segment_path(flush_id, "before");
        let written = inner
            .buffer
            .copy_to(&before)
            .with_context(|| format!("Failed to copy pre-roll buffer to {:?}", before))?;
        inner.buffer.clear();
        debug!("Wrote {} bytes of pre-roll to {:?}", written, before);

        for _ in 0..inner.settings.buffer_seconds {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(false),
                _ = sleep(Duration::from_secs(1)) => {}
            }
            if let Err(e) = inner.device.poll() {
                warn!("Capture device error during flush {}: {:#}", flush_id, e);
            }
        }
        Ok(true)
    }

    /// Stop capture and release the device. Terminal.
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.cancel();
        let mut inner = self.lock().await;
        if inner.stopped {
            return Ok(());
        }
        inner.stopped = true;
        self.stopped.store(true, Ordering::SeqCst);
        self.recording.store(false, Ordering::SeqCst);
        if inner.device.is_recording() {
            if let Err(e) = inner.device.stop_recording() {
                warn!("Failed to stop recording on shutdown: {:#}", e);
            }
        }
        inner.device.close()?;
        info!("Camera device released");
        Ok(())
    }
}

#[async_trait]
impl Handler for CameraController {
    async fn on_motion_start(&self, event: &EventMessage) -> Result<()> {
        if !self.is_recording() {
            debug!("Ignoring motion event, camera is not recording");
            return Ok(());
        }
        let timestamp = event
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or(event.timestamp);

        let mut flush_id = match self.flush_id.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if flush_id.is_none() {
            debug!("Starting a flush on motion event from {}", timestamp);
            *flush_id = Some(timestamp);
            self.flush_requested.notify_one();
        }
        Ok(())
    }

    async fn on_file_change(&self, event: &EventMessage) -> Result<()> {
        let Some(desired) = DesiredState::from_event(event) else {
            return Ok(());
        };
        let Some(fields) = desired.section(CAMERA_NAMESPACE)? else {
            return Ok(());
        };
        info!("Update camera fields in {}", Value::Object(fields.clone()));

        // Waits here while a flush holds the lock
        let mut inner = self.lock().await;
        let (next, applied) = inner.settings.patched(fields)?;
        if applied.is_empty() {
            return Ok(());
        }

        let previously_recording = self.pause_locked(&mut inner)?;
        let configured = inner.device.configure(&next);
        if configured.is_ok() {
            inner.settings = next;
            self.publish(&inner.settings);
        }
        if previously_recording {
            self.resume_locked(&mut inner)?;
        }
        configured.map_err(|e| Error::Camera(format!("Failed to apply {:?}: {:#}", applied, e)))?;
        Ok(())
    }
}

#[async_trait]
impl ConfigHandler for CameraController {
    fn namespace(&self) -> &'static str {
        CAMERA_NAMESPACE
    }

    async fn report(&self) -> Option<ConfigUpdate> {
        let mut body = self.settings().to_document();
        body.insert("recording".into(), Value::from(self.is_recording()));
        body.insert("flushing".into(), Value::from(self.is_flushing()));
        body.insert("flushing_since".into(), Value::from(self.flushing_since()));
        body.insert("state".into(), Value::from(self.state().to_string()));
        Some(ConfigUpdate::new(CAMERA_NAMESPACE, Value::Object(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::preroll::Chunk;
    use crate::recorder::settings::{RecordingWindow, Resolution};
    use crate::shadow::desired_document;
    use std::sync::atomic::AtomicU32;

    /// Capture device that records every call
    struct MockDevice {
        ops: Arc<std::sync::Mutex<Vec<String>>>,
        output: Option<CaptureOutput>,
        clock: std::time::Duration,
        fail_configure: Arc<AtomicBool>,
    }

    impl MockDevice {
        fn new(ops: Arc<std::sync::Mutex<Vec<String>>>) -> Self {
            Self {
                ops,
                output: None,
                clock: std::time::Duration::ZERO,
                fail_configure: Arc::new(AtomicBool::new(false)),
            }
        }

        fn log(&self, op: String) {
            self.ops.lock().unwrap().push(op);
        }
    }

    fn describe(output: &CaptureOutput) -> String {
        match output {
            CaptureOutput::Buffer(_) => "buffer".to_string(),
            CaptureOutput::File(path) => path.file_name().unwrap().to_string_lossy().into_owned(),
        }
    }

    impl CaptureDevice for MockDevice {
        fn configure(&mut self, settings: &CameraSettings) -> Result<()> {
            if self.fail_configure.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!("sensor rejected settings"));
            }
            self.log(format!("configure:{}", settings.resolution));
            Ok(())
        }

        fn start_recording(&mut self, output: CaptureOutput, _motion: MotionDetector) -> Result<()> {
            self.log(format!("start:{}", describe(&output)));
            self.output = Some(output);
            Ok(())
        }

        fn split_recording(&mut self, output: CaptureOutput) -> Result<()> {
            self.log(format!("split:{}", describe(&output)));
            if let CaptureOutput::File(path) = &output {
                std::fs::write(path, b"after")?;
            }
            self.output = Some(output);
            Ok(())
        }

        fn stop_recording(&mut self) -> Result<()> {
            self.log("stop".to_string());
            self.output = None;
            Ok(())
        }

        fn is_recording(&self) -> bool {
            self.output.is_some()
        }

        fn poll(&mut self) -> Result<()> {
            if let Some(CaptureOutput::Buffer(buffer)) = &self.output {
                buffer.write(Chunk {
                    pts: self.clock,
                    keyframe: true,
                    data: b"frame".to_vec(),
                });
                self.clock += std::time::Duration::from_secs(1);
            }
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.log("close".to_string());
            Ok(())
        }
    }

    struct Fixture {
        events: Arc<EventDispatcher>,
        camera: Arc<CameraController>,
        ops: Arc<std::sync::Mutex<Vec<String>>>,
        flushes: Arc<std::sync::Mutex<Vec<i64>>>,
        hour: Arc<AtomicU32>,
        fail_configure: Arc<AtomicBool>,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(settings: CameraSettings) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let events = EventDispatcher::new();
            let ops = Arc::new(std::sync::Mutex::new(Vec::new()));
            let device = MockDevice::new(ops.clone());
            let fail_configure = device.fail_configure.clone();
            let hour = Arc::new(AtomicU32::new(12));
            let clock = hour.clone();
            let camera = CameraController::with_hour_source(
                events.clone(),
                settings,
                Box::new(device),
                dir.path(),
                Arc::new(move || clock.load(Ordering::SeqCst)),
            )
            .unwrap();
            events.on(camera.clone());

            let flushes = Arc::new(std::sync::Mutex::new(Vec::new()));
            let sink = flushes.clone();
            events.register_fn(EventType::FlushEnd, move |event| {
                sink.lock()
                    .unwrap()
                    .push(event.get("start_time").and_then(Value::as_i64).unwrap());
                Ok(())
            });
            events.start().unwrap();

            Self {
                events,
                camera,
                ops,
                flushes,
                hour,
                fail_configure,
                _dir: dir,
            }
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn flushes(&self) -> Vec<i64> {
            self.flushes.lock().unwrap().clone()
        }

        async fn wait_until<F: Fn(&Self) -> bool>(&self, condition: F) {
            tokio::time::timeout(Duration::from_secs(120), async {
                while !condition(self) {
                    sleep(Duration::from_millis(100)).await;
                }
            })
            .await
            .expect("condition never became true");
        }
    }

    fn short_buffer() -> CameraSettings {
        CameraSettings {
            buffer_seconds: 2,
            ..CameraSettings::default()
        }
    }

    fn camera_change(fields: Value) -> Value {
        desired_document(json!({ "camera": fields }).as_object().cloned().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_flushes_once_and_returns_to_recording() {
        let fixture = Fixture::new(short_buffer());
        let _run = fixture.camera.start();
        fixture.wait_until(|f| f.camera.is_recording()).await;
        // Let the pre-roll buffer collect a few frames
        sleep(Duration::from_secs(3)).await;

        fixture
            .events
            .fire(EventType::MotionStart, json!({"timestamp": 1234}));
        fixture
            .events
            .fire(EventType::MotionStart, json!({"timestamp": 1235}));
        fixture.wait_until(|f| f.camera.is_flushing()).await;
        let report = fixture.camera.report().await.unwrap();
        assert_eq!(report.body["flushing"], json!(true));
        assert_eq!(report.body["flushing_since"], json!(1234));
        assert_eq!(report.body["state"], json!("flushing"));

        fixture.wait_until(|f| !f.flushes().is_empty()).await;
        sleep(Duration::from_secs(5)).await;
        fixture.events.drained().await;

        assert_eq!(fixture.flushes(), vec![1234]);
        assert_eq!(fixture.camera.state(), CameraState::Recording);
        assert!(fixture.camera.segment_path(1234, "before").exists());
        assert!(fixture.camera.segment_path(1234, "after").exists());
        assert!(!fixture.camera.segment_path(1235, "after").exists());

        let ops = fixture.ops();
        let split_after = ops.iter().position(|op| op == "split:1234.after.h264").unwrap();
        assert_eq!(ops[split_after + 1], "split:buffer");
        fixture.camera.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_ignored_while_not_recording() {
        let fixture = Fixture::new(short_buffer());
        fixture
            .events
            .fire(EventType::MotionStart, json!({"timestamp": 99}));
        fixture.events.drained().await;
        assert!(!fixture.camera.is_flushing());
        assert_eq!(fixture.camera.state(), CameraState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_change_while_recording() {
        let fixture = Fixture::new(CameraSettings {
            recording_window: Some("0-23".parse().unwrap()),
            ..CameraSettings::default()
        });
        assert!(fixture.camera.resume().await.unwrap());

        fixture.events.fire(
            EventType::FileChange,
            json!({"content": camera_change(json!({
                "buffer": "20",
                "sensitivity": "20",
                "recording_window": "12-20",
                "rotation": "180",
                "resolution": "320x240",
                "framerate": "30",
                "encoding_bitrate": "5000000",
                "encoding_profile": "main",
                "encoding_level": "2.1"
            }))}),
        );
        fixture.events.drained().await;

        let settings = fixture.camera.settings();
        assert_eq!(settings.buffer_seconds, 20);
        assert_eq!(settings.sensitivity, 20);
        assert_eq!(
            settings.recording_window,
            Some(RecordingWindow {
                start_hour: 12,
                end_hour: 20
            })
        );
        assert_eq!(settings.rotation, 180);
        assert_eq!(
            settings.resolution,
            Resolution {
                width: 320,
                height: 240
            }
        );
        assert_eq!(settings.framerate, 30);
        assert_eq!(settings.encoding_bitrate, 5_000_000);
        assert_eq!(settings.encoding_profile, "main");
        assert_eq!(settings.encoding_level, "2.1");

        assert_eq!(
            fixture.ops(),
            vec![
                "configure:640x480",
                "start:buffer",
                "stop",
                "configure:320x240",
                "start:buffer"
            ]
        );
        assert!(fixture.camera.is_recording());

        let report = fixture.camera.report().await.unwrap();
        assert_eq!(report.name, "camera");
        assert_eq!(report.body["buffer"], json!(20));
        assert_eq!(report.body["resolution"], json!("320x240"));
        assert_eq!(report.body["recording_window"], json!("12-20"));
        assert_eq!(report.body["encoding_level"], json!("2.1"));
        assert_eq!(report.body["recording"], json!(true));
        assert_eq!(report.body["flushing_since"], Value::Null);
        assert_eq!(report.body["state"], json!("recording"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_apply_reports_the_same() {
        let fixture = Fixture::new(CameraSettings::default());
        let change = json!({"content": camera_change(json!({"buffer": 8, "rotation": "90"}))});

        fixture.events.fire(EventType::FileChange, change.clone());
        fixture.events.drained().await;
        let once = fixture.camera.report().await;

        fixture.events.fire(EventType::FileChange, change);
        fixture.events.drained().await;
        let twice = fixture.camera.report().await;

        assert_eq!(once, twice);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_while_paused_stays_paused() {
        let fixture = Fixture::new(CameraSettings::default());
        fixture.events.fire(
            EventType::FileChange,
            json!({"content": camera_change(json!({"resolution": "1280x720"}))}),
        );
        fixture.events.drained().await;

        assert!(!fixture.camera.is_recording());
        assert_eq!(fixture.ops(), vec!["configure:640x480", "configure:1280x720"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_change_applies_nothing_and_keeps_recording() {
        let fixture = Fixture::new(CameraSettings::default());
        fixture.camera.resume().await.unwrap();
        fixture.events.fire(
            EventType::FileChange,
            json!({"content": camera_change(json!({"buffer": "30", "resolution": "wide"}))}),
        );
        fixture.events.drained().await;

        assert_eq!(fixture.camera.settings(), CameraSettings::default());
        assert!(fixture.camera.is_recording());
        assert_eq!(fixture.ops(), vec!["configure:640x480", "start:buffer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_rejection_still_resumes() {
        let fixture = Fixture::new(CameraSettings::default());
        fixture.camera.resume().await.unwrap();
        fixture.fail_configure.store(true, Ordering::SeqCst);
        fixture.events.fire(
            EventType::FileChange,
            json!({"content": camera_change(json!({"framerate": 60}))}),
        );
        fixture.events.drained().await;

        assert_eq!(fixture.camera.settings().framerate, 20);
        assert!(fixture.camera.is_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_namespaces_ignored() {
        let fixture = Fixture::new(CameraSettings::default());
        fixture.events.fire(
            EventType::FileChange,
            json!({"content": desired_document(
                json!({"health": {"interval": 60}}).as_object().cloned().unwrap()
            )}),
        );
        fixture.events.fire(EventType::FileChange, json!({"file_name": "input.json"}));
        fixture.events.drained().await;
        assert_eq!(fixture.ops(), vec!["configure:640x480"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_during_flush_waits_for_flush() {
        let fixture = Fixture::new(short_buffer());
        let _run = fixture.camera.start();
        fixture.wait_until(|f| f.camera.is_recording()).await;

        fixture
            .events
            .fire(EventType::MotionStart, json!({"timestamp": 50}));
        fixture
            .wait_until(|f| f.ops().iter().any(|op| op == "split:50.after.h264"))
            .await;
        assert_eq!(fixture.camera.state(), CameraState::Flushing);

        fixture.events.fire(
            EventType::FileChange,
            json!({"content": camera_change(json!({"resolution": "320x240"}))}),
        );
        fixture.wait_until(|f| !f.flushes().is_empty()).await;
        fixture.events.drained().await;

        let ops = fixture.ops();
        let redirect = ops.iter().position(|op| op == "split:buffer").unwrap();
        let reconfigure = ops.iter().position(|op| op == "configure:320x240").unwrap();
        assert!(reconfigure > redirect);
        assert_eq!(fixture.camera.settings().resolution.to_string(), "320x240");
        fixture.camera.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_window_pauses_and_resumes() {
        let fixture = Fixture::new(CameraSettings {
            recording_window: Some("8-17".parse().unwrap()),
            ..CameraSettings::default()
        });
        fixture.hour.store(20, Ordering::SeqCst);
        let _run = fixture.camera.start();

        fixture
            .wait_until(|f| f.camera.state() == CameraState::Paused)
            .await;
        assert!(fixture.ops().contains(&"stop".to_string()));

        fixture.hour.store(9, Ordering::SeqCst);
        fixture
            .wait_until(|f| f.camera.state() == CameraState::Recording)
            .await;
        fixture.camera.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clearing_window_resumes_paused_camera() {
        let fixture = Fixture::new(CameraSettings {
            recording_window: Some("8-17".parse().unwrap()),
            ..CameraSettings::default()
        });
        fixture.hour.store(20, Ordering::SeqCst);
        let _run = fixture.camera.start();
        fixture
            .wait_until(|f| f.camera.state() == CameraState::Paused)
            .await;

        fixture.events.fire(
            EventType::FileChange,
            json!({"content": camera_change(json!({"recording_window": null}))}),
        );
        fixture.events.drained().await;
        assert_eq!(fixture.camera.settings().recording_window, None);

        fixture
            .wait_until(|f| f.camera.state() == CameraState::Recording)
            .await;
        assert!(fixture.camera.is_recording());
        fixture.camera.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_are_idempotent() {
        let fixture = Fixture::new(CameraSettings::default());
        assert!(!fixture.camera.pause().await.unwrap());
        assert!(fixture.camera.resume().await.unwrap());
        assert!(!fixture.camera.resume().await.unwrap());
        assert!(fixture.camera.pause().await.unwrap());
        assert!(!fixture.camera.pause().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_terminal() {
        let fixture = Fixture::new(CameraSettings::default());
        let run = fixture.camera.start();
        fixture.wait_until(|f| f.camera.is_recording()).await;

        fixture.camera.stop().await.unwrap();
        run.await.unwrap();
        assert_eq!(fixture.camera.state(), CameraState::Stopped);
        assert!(!fixture.camera.resume().await.unwrap());
        assert_eq!(fixture.ops().last().map(String::as_str), Some("close"));

        // Stopping twice is harmless
        fixture.camera.stop().await.unwrap();
    }
}
