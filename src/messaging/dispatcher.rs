use crate::error::Error;
use crate::messaging::event::{EventMessage, EventType};
use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Callback function type for ad hoc event handling
pub type EventCallback = Arc<dyn Fn(&EventMessage) -> Result<()> + Send + Sync>;

/// A component that reacts to dispatched events.
///
/// Every method defaults to a no-op, so implementors override only the
/// events they care about. `handle` routes a message to the matching method.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn on_motion_start(&self, _event: &EventMessage) -> Result<()> {
        Ok(())
    }

    async fn on_flush_end(&self, _event: &EventMessage) -> Result<()> {
        Ok(())
    }

    async fn on_recording_change(&self, _event: &EventMessage) -> Result<()> {
        Ok(())
    }

    async fn on_combine_end(&self, _event: &EventMessage) -> Result<()> {
        Ok(())
    }

    async fn on_upload_end(&self, _event: &EventMessage) -> Result<()> {
        Ok(())
    }

    async fn on_file_change(&self, _event: &EventMessage) -> Result<()> {
        Ok(())
    }

    async fn on_health_end(&self, _event: &EventMessage) -> Result<()> {
        Ok(())
    }

    async fn on_record_end(&self, _event: &EventMessage) -> Result<()> {
        Ok(())
    }

    async fn on_custom(&self, _event: &EventMessage) -> Result<()> {
        Ok(())
    }

    async fn handle(&self, event: &EventMessage) -> Result<()> {
        match event.event_type {
            EventType::MotionStart => self.on_motion_start(event).await,
            EventType::FlushEnd => self.on_flush_end(event).await,
            EventType::RecordingChange => self.on_recording_change(event).await,
            EventType::CombineEnd => self.on_combine_end(event).await,
            EventType::UploadEnd => self.on_upload_end(event).await,
            EventType::FileChange => self.on_file_change(event).await,
            EventType::HealthEnd => self.on_health_end(event).await,
            EventType::RecordEnd => self.on_record_end(event).await,
            EventType::Custom(_) => self.on_custom(event).await,
        }
    }
}

/// Adapts a plain callback into a handler
struct CallbackHandler {
    callback: EventCallback,
}

#[async_trait]
impl Handler for CallbackHandler {
    async fn handle(&self, event: &EventMessage) -> Result<()> {
        (self.callback)(event)
    }
}

/// An enqueued event together with the handlers registered when it fired
struct QueuedEvent {
    message: EventMessage,
    handlers: Vec<Arc<dyn Handler>>,
}

/// Sequential in-process event dispatcher.
///
/// Any number of threads may `fire`; a single consumer task delivers each
/// event to its handlers one at a time, in arrival order.
pub struct EventDispatcher {
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn Handler>>>>,
    sender: mpsc::UnboundedSender<QueuedEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<QueuedEvent>>>,
    pending: watch::Sender<usize>,
    shutdown: CancellationToken,
}

impl EventDispatcher {
    /// Create a new dispatcher; call `start` to begin delivery
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            sender,
            receiver: Mutex::new(Some(receiver)),
            pending,
            shutdown: CancellationToken::new(),
        })
    }

    /// Append a handler to the list for one event type
    pub fn register(&self, event_type: EventType, handler: Arc<dyn Handler>) {
        let mut handlers = match self.handlers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handlers.entry(event_type).or_default().push(handler);
    }

    /// Register a handler for every built-in event type
    pub fn on(&self, handler: Arc<dyn Handler>) {
        for event_type in EventType::BUILT_IN.iter() {
            self.register(event_type.clone(), handler.clone());
        }
    }

    /// Register a callback for a single event type
    pub fn register_fn<F>(&self, event_type: EventType, callback: F)
    where
        F: Fn(&EventMessage) -> Result<()> + Send + Sync + 'static,
    {
        self.register(
            event_type,
            Arc::new(CallbackHandler {
                callback: Arc::new(callback),
            }),
        );
    }

    /// Fire an event with the current timestamp.
    ///
    /// Returns `false` when nothing is listening for the event type or the
    /// dispatcher has already shut down.
    pub fn fire(&self, event_type: EventType, payload: Value) -> bool {
        self.enqueue(EventMessage::new(event_type, payload))
    }

    /// Enqueue an already constructed message
    pub fn enqueue(&self, message: EventMessage) -> bool {
        let handlers = {
            let registry = match self.handlers.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match registry.get(&message.event_type) {
                Some(handlers) if !handlers.is_empty() => handlers.clone(),
                _ => {
                    debug!("No handlers for {}, dropping event", message.event_type);
                    return false;
                }
            }
        };

        let event_type = message.event_type.clone();
        self.pending.send_modify(|pending| *pending += 1);
        if self
            .sender
            .send(QueuedEvent { message, handlers })
            .is_err()
        {
            self.pending
                .send_modify(|pending| *pending = pending.saturating_sub(1));
            warn!("Dispatcher is stopped, dropping {} event", event_type);
            return false;
        }
        true
    }

    /// Spawn the consumer task
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let receiver = match self.receiver.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
        .ok_or_else(|| Error::Dispatch("Event dispatcher already started".to_string()))?;

        let dispatcher = Arc::clone(self);
        Ok(tokio::spawn(async move {
            dispatcher.run(receiver).await;
        }))
    }

    async fn run(&self, mut receiver: mpsc::UnboundedReceiver<QueuedEvent>) {
        info!("Starting the event dispatcher");
        loop {
            let queued = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(queued) => queued,
                    None => break,
                },
            };

            self.deliver(&queued).await;
            self.pending
                .send_modify(|pending| *pending = pending.saturating_sub(1));
        }

        // Undelivered events are dropped on shutdown
        receiver.close();
        self.pending.send_replace(0);
        info!("Event dispatcher stopped");
    }

    async fn deliver(&self, queued: &QueuedEvent) {
        debug!(
            "Delivering {} ({}) to {} handlers",
            queued.message.event_type,
            queued.message.id,
            queued.handlers.len()
        );
        for handler in &queued.handlers {
            match AssertUnwindSafe(handler.handle(&queued.message))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(
                        "Handler failed on {} event {}: {:#}",
                        queued.message.event_type, queued.message.id, e
                    );
                }
                Err(_) => {
                    error!(
                        "Handler panicked on {} event {}",
                        queued.message.event_type, queued.message.id
                    );
                }
            }
        }
    }

    /// Wait until every enqueued event has been handled
    pub async fn drained(&self) {
        let mut pending = self.pending.subscribe();
        let _ = pending.wait_for(|pending| *pending == 0).await;
    }

    /// Number of events fired but not yet fully handled
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Stop the consumer after the current event's handlers finish
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
