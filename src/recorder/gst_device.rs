use crate::error::Error;
use crate::recorder::device::{CaptureDevice, CaptureOutput, OutputSink};
use crate::recorder::motion::{block_vectors, MotionDetector};
use crate::recorder::preroll::Chunk;
use crate::recorder::settings::CameraSettings;
use anyhow::{anyhow, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Resolution of the raw branch used for motion estimation
const ANALYSIS_WIDTH: usize = 80;
const ANALYSIS_HEIGHT: usize = 60;

type SharedSink = Arc<Mutex<Option<OutputSink>>>;

fn lock_sink(sink: &SharedSink) -> std::sync::MutexGuard<'_, Option<OutputSink>> {
    match sink.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// V4L2 camera encoded with x264 and tapped through appsinks
pub struct GstCaptureDevice {
    source: String,
    settings: CameraSettings,
    pipeline: Option<gst::Pipeline>,
    encoded: Option<gst_app::AppSink>,
    sink: SharedSink,
    closed: bool,
}

impl GstCaptureDevice {
    pub fn new(source: &str) -> Result<Self> {
        gst::init().context("Failed to initialize GStreamer")?;
        Ok(Self {
            source: source.to_string(),
            settings: CameraSettings::default(),
            pipeline: None,
            encoded: None,
            sink: Arc::new(Mutex::new(None)),
            closed: false,
        })
    }

    fn flip_method(rotation: u32) -> &'static str {
        match rotation {
            90 => "clockwise",
            180 => "rotate-180",
            270 => "counterclockwise",
            _ => "none",
        }
    }

    /// Pipeline description for the current settings
    pub fn describe(&self) -> String {
        let settings = &self.settings;
        format!(
            "v4l2src device={source} ! videoconvert ! videoscale ! videorate ! \
             video/x-raw,width={width},height={height},framerate={fps}/1 ! \
             videoflip method={flip} ! tee name=t \
             t. ! queue ! videoconvert ! \
             x264enc bitrate={kbps} tune=zerolatency speed-preset=ultrafast key-int-max={fps} ! \
             video/x-h264,profile={profile},level=(string){level} ! \
             h264parse config-interval=-1 ! video/x-h264,stream-format=byte-stream,alignment=au ! \
             appsink name=encoded sync=false \
             t. ! queue leaky=downstream max-size-buffers=2 ! videoscale ! videoconvert ! \
             video/x-raw,format=GRAY8,width={aw},height={ah} ! \
             appsink name=motion sync=false max-buffers=1 drop=true",
            source = self.source,
            width = settings.resolution.width,
            height = settings.resolution.height,
            fps = settings.framerate,
            flip = Self::flip_method(settings.rotation),
            kbps = (settings.encoding_bitrate / 1000).max(1),
            profile = settings.encoding_profile,
            level = settings.encoding_level,
            aw = ANALYSIS_WIDTH,
            ah = ANALYSIS_HEIGHT,
        )
    }

    fn appsink(pipeline: &gst::Pipeline, name: &str) -> Result<gst_app::AppSink> {
        pipeline
            .by_name(name)
            .ok_or_else(|| anyhow!("Pipeline has no element {}", name))?
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|_| anyhow!("Element {} is not an appsink", name))
    }

    fn attach_encoded(appsink: &gst_app::AppSink, sink: SharedSink) {
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or_else(|| {
                        error!("No buffer in sample");
                        gst::FlowError::Error
                    })?;
                    let map = buffer.map_readable().map_err(|e| {
                        error!("Failed to map buffer: {:?}", e);
                        gst::FlowError::Error
                    })?;
                    let chunk = Chunk {
                        pts: buffer
                            .pts()
                            .map(|pts| Duration::from_nanos(pts.nseconds()))
                            .unwrap_or_default(),
                        keyframe: !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT),
                        data: map.as_slice().to_vec(),
                    };
                    if let Some(output) = lock_sink(&sink).as_mut() {
                        if let Err(e) = output.write(chunk) {
                            error!("Failed to write encoded chunk: {:#}", e);
                            return Err(gst::FlowError::Error);
                        }
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }

    fn attach_motion(appsink: &gst_app::AppSink, motion: MotionDetector, width: u32) {
        let scale = width as f64 / ANALYSIS_WIDTH as f64 * 4.0;
        let mut previous: Option<Vec<u8>> = None;
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let Some(buffer) = sample.buffer() else {
                        return Ok(gst::FlowSuccess::Ok);
                    };
                    let Ok(map) = buffer.map_readable() else {
                        return Ok(gst::FlowSuccess::Ok);
                    };
                    let frame = map.as_slice().to_vec();
                    if let Some(previous) = previous.as_ref() {
                        let vectors = block_vectors(
                            previous,
                            &frame,
                            ANALYSIS_WIDTH,
                            ANALYSIS_HEIGHT,
                            scale,
                        );
                        motion.analyze(&vectors);
                    }
                    previous = Some(frame);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Capture("Capture device is closed".to_string()).into());
        }
        Ok(())
    }

    /// Ask the encoder for a keyframe so a new segment starts decodable
    fn request_keyframe(&self) {
        if let Some(encoded) = &self.encoded {
            let event = gst_video::UpstreamForceKeyUnitEvent::builder()
                .all_headers(true)
                .build();
            if !encoded.send_event(event) {
                debug!("Encoder ignored keyframe request");
            }
        }
    }
}

impl CaptureDevice for GstCaptureDevice {
    fn configure(&mut self, settings: &CameraSettings) -> Result<()> {
        self.ensure_open()?;
        if self.pipeline.is_some() {
            return Err(Error::Capture("Cannot configure while recording".to_string()).into());
        }
        self.settings = settings.clone();
        debug!("Capture pipeline: {}", self.describe());
        Ok(())
    }

    fn start_recording(&mut self, output: CaptureOutput, motion: MotionDetector) -> Result<()> {
        self.ensure_open()?;
        if self.pipeline.is_some() {
            return Err(Error::Capture("Capture device is already recording".to_string()).into());
        }

        let pipeline = gst::parse::launch(&self.describe())
            .context("Failed to build capture pipeline")?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow!("Capture description is not a pipeline"))?;
        let encoded = Self::appsink(&pipeline, "encoded")?;
        let analysis = Self::appsink(&pipeline, "motion")?;

        *lock_sink(&self.sink) = Some(OutputSink::open(output)?);
        Self::attach_encoded(&encoded, self.sink.clone());
        Self::attach_motion(&analysis, motion, self.settings.resolution.width);

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            let _ = pipeline.set_state(gst::State::Null);
            lock_sink(&self.sink).take();
            return Err(anyhow!("Failed to set pipeline to Playing: {}", e));
        }
        info!("Capture started on {}", self.source);
        self.pipeline = Some(pipeline);
        self.encoded = Some(encoded);
        Ok(())
    }

    fn split_recording(&mut self, output: CaptureOutput) -> Result<()> {
        self.ensure_open()?;
        if self.pipeline.is_none() {
            return Err(Error::Capture("Capture device is not recording".to_string()).into());
        }
        let next = OutputSink::open(output)?;
        {
            let mut sink = lock_sink(&self.sink);
            if let Some(mut previous) = sink.replace(next) {
                previous.finish()?;
            }
        }
        self.request_keyframe();
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<()> {
        self.encoded = None;
        if let Some(pipeline) = self.pipeline.take() {
            pipeline
                .set_state(gst::State::Null)
                .map_err(|e| anyhow!("Failed to set pipeline to Null: {}", e))?;
            info!("Capture stopped on {}", self.source);
        }
        if let Some(mut sink) = lock_sink(&self.sink).take() {
            sink.finish()?;
        }
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.pipeline.is_some()
    }

    fn poll(&mut self) -> Result<()> {
        self.ensure_open()?;
        let Some(bus) = self.pipeline.as_ref().and_then(|pipeline| pipeline.bus()) else {
            return Ok(());
        };
        while let Some(msg) = bus.timed_pop_filtered(
            gst::ClockTime::ZERO,
            &[gst::MessageType::Error, gst::MessageType::Eos, gst::MessageType::Warning],
        ) {
            match msg.view() {
                gst::MessageView::Error(err) => {
                    return Err(Error::Capture(format!(
                        "Error from {:?}: {} ({:?})",
                        err.src().map(|s| s.name()),
                        err.error(),
                        err.debug()
                    ))
                    .into());
                }
                gst::MessageView::Eos(_) => {
                    return Err(Error::Capture("Capture source ended".to_string()).into());
                }
                gst::MessageView::Warning(warning) => {
                    warn!("Capture warning: {}", warning.error());
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stop_recording()?;
        self.closed = true;
        Ok(())
    }
}
