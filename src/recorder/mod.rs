pub mod controller;
pub mod device;
#[cfg(feature = "gst")]
pub mod gst_device;
pub mod motion;
pub mod preroll;
pub mod settings;

pub use controller::{CameraController, CameraState};
pub use device::{CaptureDevice, CaptureOutput, SimulatedDevice};
#[cfg(feature = "gst")]
pub use gst_device::GstCaptureDevice;
pub use motion::{MotionDetector, MotionVector};
pub use preroll::PrerollBuffer;
pub use settings::{CameraSettings, RecordingWindow, Resolution};
