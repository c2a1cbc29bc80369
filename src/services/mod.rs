pub mod combiner;
pub mod health;
pub mod output;
pub mod relay;
pub mod watcher;

pub use combiner::VideoCombiner;
pub use health::DeviceHealth;
pub use output::EventOutput;
pub use relay::{ConnectionHandler, ConnectionPoster, ConnectionWorker, FrameSource, ProcessSource};
pub use watcher::{FileWatcher, WatchKind};
