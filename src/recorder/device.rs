use crate::error::Error;
use crate::recorder::motion::MotionDetector;
use crate::recorder::preroll::{Chunk, PrerollBuffer};
use crate::recorder::settings::CameraSettings;
use anyhow::{Context, Result};
use log::{debug, info};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Where the encoder's output currently goes
#[derive(Debug, Clone)]
pub enum CaptureOutput {
    /// The circular pre-roll buffer
    Buffer(Arc<PrerollBuffer>),
    /// A segment file on disk
    File(PathBuf),
}

/// Hardware capture abstraction driven by the camera controller.
///
/// Implementations stream encoded video into the current `CaptureOutput`
/// and feed per-frame motion vectors to the attached detector.
pub trait CaptureDevice: Send {
    /// Apply resolution, framerate, rotation and encoder parameters.
    /// Only called while capture is stopped.
    fn configure(&mut self, settings: &CameraSettings) -> Result<()>;

    fn start_recording(&mut self, output: CaptureOutput, motion: MotionDetector) -> Result<()>;

    /// Redirect the live capture without stopping the encoder
    fn split_recording(&mut self, output: CaptureOutput) -> Result<()>;

    fn stop_recording(&mut self) -> Result<()>;

    fn is_recording(&self) -> bool;

    /// Called about once per second while recording; surfaces encoder errors
    fn poll(&mut self) -> Result<()>;

    /// Release the hardware. No further calls are valid afterwards.
    fn close(&mut self) -> Result<()>;
}

/// Open destination for encoded chunks
pub(crate) enum OutputSink {
    Buffer(Arc<PrerollBuffer>),
    File(BufWriter<File>),
}

impl OutputSink {
    pub(crate) fn open(output: CaptureOutput) -> Result<Self> {
        Ok(match output {
            CaptureOutput::Buffer(buffer) => OutputSink::Buffer(buffer),
            CaptureOutput::File(path) => {
                let file = File::create(&path)
                    .with_context(|| format!("Failed to create segment {:?}", path))?;
                OutputSink::File(BufWriter::new(file))
            }
        })
    }

    pub(crate) fn write(&mut self, chunk: Chunk) -> Result<()> {
        match self {
            OutputSink::Buffer(buffer) => buffer.write(chunk),
            OutputSink::File(writer) => writer.write_all(&chunk.data)?,
        }
        Ok(())
    }

    pub(crate) fn finish(&mut self) -> Result<()> {
        if let OutputSink::File(writer) = self {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Capture device producing synthetic frames, one second per `poll`.
///
/// Used when no camera hardware is attached. It never reports motion.
pub struct SimulatedDevice {
    settings: CameraSettings,
    sink: Option<OutputSink>,
    clock: Duration,
    frame: u64,
    closed: bool,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            settings: CameraSettings::default(),
            sink: None,
            clock: Duration::ZERO,
            frame: 0,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Capture("Simulated device is closed".to_string()).into());
        }
        Ok(())
    }

    fn emit_second(&mut self) -> Result<()> {
        let framerate = self.settings.framerate.max(1) as u64;
        let frame_time = Duration::from_secs(1) / framerate as u32;
        let frame_bytes = (self.settings.encoding_bitrate as u64 / 8 / framerate).clamp(16, 4096);
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        for _ in 0..framerate {
            let keyframe = self.frame % framerate == 0;
            sink.write(Chunk {
                pts: self.clock,
                keyframe,
                data: vec![(self.frame % 251) as u8; frame_bytes as usize],
            })?;
            self.frame += 1;
            self.clock += frame_time;
        }
        Ok(())
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice for SimulatedDevice {
    fn configure(&mut self, settings: &CameraSettings) -> Result<()> {
        self.ensure_open()?;
        debug!(
            "Simulated device configured: {} @ {}fps, rotation {}",
            settings.resolution, settings.framerate, settings.rotation
        );
        self.settings = settings.clone();
        Ok(())
    }

    fn start_recording(&mut self, output: CaptureOutput, _motion: MotionDetector) -> Result<()> {
        self.ensure_open()?;
        if self.sink.is_some() {
            return Err(Error::Capture("Simulated device is already recording".to_string()).into());
        }
        self.sink = Some(OutputSink::open(output)?);
        info!("Simulated device started recording");
        Ok(())
    }

    fn split_recording(&mut self, output: CaptureOutput) -> Result<()> {
        self.ensure_open()?;
        let mut previous = self
            .sink
            .take()
            .ok_or_else(|| Error::Capture("Simulated device is not recording".to_string()))?;
        previous.finish()?;
        self.sink = Some(OutputSink::open(output)?);
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.finish()?;
        }
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.sink.is_some()
    }

    fn poll(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.emit_second()
    }

    fn close(&mut self) -> Result<()> {
        self.stop_recording()?;
        self.closed = true;
        Ok(())
    }
}
