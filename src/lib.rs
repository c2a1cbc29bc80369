pub mod cloud;
pub mod config;
pub mod error;
pub mod messaging;
pub mod recorder;
pub mod services;
pub mod shadow;

// Re-export main components for easier use
pub use error::Error;
pub use messaging::{EventDispatcher, EventMessage, EventType, Handler};
pub use recorder::{CameraController, CameraSettings, CameraState};
pub use shadow::{ConfigHandler, ConfigUpdate, ReportPolicy, ShadowReconciler};
