pub mod dispatcher;
pub mod event;

pub use dispatcher::{EventCallback, EventDispatcher, Handler};
pub use event::{EventMessage, EventType};
