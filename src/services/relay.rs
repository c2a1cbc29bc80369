use crate::error::Error;
use crate::messaging::{EventDispatcher, EventMessage, EventType, Handler};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use serde_json::{Map, Value};
use std::io::Read;
use std::process::{Child, ChildStdout};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Largest chunk forwarded in one post
pub const FRAME_SIZE: usize = 32768;

/// Raw byte stream read by a relay worker
pub trait FrameSource: Send {
    /// Read up to `buf.len()` bytes; `Ok(0)` means nothing available right now
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Whether the upstream producer has exited
    fn finished(&mut self) -> bool;

    fn close(&mut self);
}

/// Remote side of a relay connection
pub trait ConnectionPoster: Send + Sync {
    /// Deliver one chunk; `Ok(false)` means the connection is gone
    fn post(&self, connection_id: &str, data: &[u8]) -> Result<bool>;
}

/// Stdout of a capture sub-process
pub struct ProcessSource {
    child: Child,
    stdout: Option<ChildStdout>,
}

impl ProcessSource {
    pub fn new(mut child: Child) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Relay("Capture process has no stdout".to_string()))?;
        Ok(Self {
            child,
            stdout: Some(stdout),
        })
    }
}

impl FrameSource for ProcessSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf),
            None => Ok(0),
        }
    }

    fn finished(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    fn close(&mut self) {
        self.stdout.take();
        if let Ok(None) = self.child.try_wait() {
            if let Err(e) = self.child.kill() {
                debug!("Capture process already gone: {}", e);
            }
        }
        let _ = self.child.wait();
    }
}

/// Closes the source and announces the end of the session on every exit
struct SessionEnd {
    source: Box<dyn FrameSource>,
    events: Arc<EventDispatcher>,
    event_data: Map<String, Value>,
}

impl Drop for SessionEnd {
    fn drop(&mut self) {
        self.source.close();
        let mut payload = self.event_data.clone();
        let mut session = match payload.remove("session") {
            Some(Value::Object(session)) => session,
            _ => Map::new(),
        };
        session.insert("stop".to_string(), Value::Bool(true));
        payload.insert("session".to_string(), Value::Object(session));
        self.events.fire(EventType::RecordEnd, Value::Object(payload));
    }
}

/// Forwards a live stream to one remote connection on a dedicated thread
pub struct ConnectionWorker {
    source: Box<dyn FrameSource>,
    poster: Arc<dyn ConnectionPoster>,
    event_data: Map<String, Value>,
    events: Arc<EventDispatcher>,
}

impl ConnectionWorker {
    /// `event_data` must carry `connection.id`; it is echoed in `record_end`
    pub fn new(
        source: Box<dyn FrameSource>,
        poster: Arc<dyn ConnectionPoster>,
        event_data: Map<String, Value>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            source,
            poster,
            event_data,
            events,
        }
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("relay-connection".to_string())
            .spawn(move || self.run())
            .context("Failed to spawn relay worker")
    }

    fn run(self) {
        let connection_id = self
            .event_data
            .get("connection")
            .and_then(|connection| connection.get("id"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        let mut session = SessionEnd {
            source: self.source,
            events: self.events,
            event_data: self.event_data,
        };
        let Some(connection_id) = connection_id else {
            error!("Relay session without a connection id");
            return;
        };

        info!("Relaying stream to {}", connection_id);
        let mut buf = vec![0u8; FRAME_SIZE];
        loop {
            match session.source.read_chunk(&mut buf) {
                Ok(0) => {
                    if session.source.finished() {
                        debug!("Stream for {} exhausted", connection_id);
                        break;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Ok(read) => match self.poster.post(&connection_id, &buf[..read]) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("Connection {} closed", connection_id);
                        break;
                    }
                    Err(e) => {
                        error!("Failed to post to {}: {:#}", connection_id, e);
                        break;
                    }
                },
                Err(e) => {
                    error!("Failed to read stream for {}: {}", connection_id, e);
                    break;
                }
            }
        }
    }
}

/// Posts session telemetry back over the relay connections named in an event
pub struct ConnectionHandler {
    poster: Arc<dyn ConnectionPoster>,
}

impl ConnectionHandler {
    pub fn new(poster: Arc<dyn ConnectionPoster>) -> Self {
        Self { poster }
    }

    async fn post_to(&self, event: &EventMessage, key: &str) -> Result<()> {
        let Some(connection_id) = event
            .get("connection")
            .and_then(|connection| connection.get(key))
            .and_then(Value::as_str)
            .map(str::to_owned)
        else {
            return Ok(());
        };
        let data = serde_json::to_vec(&event.to_json())?;
        let poster = Arc::clone(&self.poster);
        let target = connection_id.clone();
        let delivered = tokio::task::spawn_blocking(move || poster.post(&target, &data))
            .await
            .context("Relay post task failed")??;
        if !delivered {
            debug!("Connection {} no longer accepts {}", connection_id, event.event_type);
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    async fn on_record_end(&self, event: &EventMessage) -> Result<()> {
        self.post_to(event, "manager_id").await
    }

    async fn on_upload_end(&self, event: &EventMessage) -> Result<()> {
        self.post_to(event, "id").await
    }

    async fn on_health_end(&self, event: &EventMessage) -> Result<()> {
        self.post_to(event, "id").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedSource {
        chunks: VecDeque<Vec<u8>>,
        closed: Arc<AtomicBool>,
    }

    impl FrameSource for ScriptedSource {
        fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }

        fn finished(&mut self) -> bool {
            self.chunks.is_empty()
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    enum Behaviour {
        Accept,
        Reject,
        Panic,
    }

    struct ScriptedPoster {
        posts: AtomicUsize,
        behaviour: Behaviour,
    }

    impl ConnectionPoster for ScriptedPoster {
        fn post(&self, connection_id: &str, _data: &[u8]) -> Result<bool> {
            assert_eq!(connection_id, "conn-1");
            self.posts.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Accept => Ok(true),
                Behaviour::Reject => Ok(false),
                Behaviour::Panic => panic!("connection handle poisoned"),
            }
        }
    }

    struct Harness {
        events: Arc<EventDispatcher>,
        ended: Arc<Mutex<Vec<Value>>>,
        closed: Arc<AtomicBool>,
    }

    fn harness() -> Harness {
        let events = EventDispatcher::new();
        let ended = Arc::new(Mutex::new(Vec::new()));
        let sink = ended.clone();
        events.register_fn(EventType::RecordEnd, move |event| {
            sink.lock().unwrap().push(event.to_json());
            Ok(())
        });
        Harness {
            events,
            ended,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn worker(harness: &Harness, poster: Arc<ScriptedPoster>) -> ConnectionWorker {
        let source = ScriptedSource {
            chunks: VecDeque::from(vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]),
            closed: harness.closed.clone(),
        };
        let data = json!({"connection": {"id": "conn-1", "manager_id": "mgr-9"}});
        ConnectionWorker::new(
            Box::new(source),
            poster,
            data.as_object().cloned().unwrap(),
            harness.events.clone(),
        )
    }

    fn poster(behaviour: Behaviour) -> Arc<ScriptedPoster> {
        Arc::new(ScriptedPoster {
            posts: AtomicUsize::new(0),
            behaviour,
        })
    }

    async fn assert_session_ended(harness: &Harness) {
        let _consumer = harness.events.start().unwrap();
        harness.events.drained().await;
        assert!(harness.closed.load(Ordering::SeqCst));
        let ended = harness.ended.lock().unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0]["connection"]["id"], json!("conn-1"));
        assert_eq!(ended[0]["connection"]["manager_id"], json!("mgr-9"));
        assert_eq!(ended[0]["session"]["stop"], json!(true));
    }

    #[tokio::test]
    async fn test_exhausted_stream_ends_session() {
        let harness = harness();
        let poster = poster(Behaviour::Accept);
        worker(&harness, poster.clone()).spawn().unwrap().join().unwrap();
        assert_eq!(poster.posts.load(Ordering::SeqCst), 3);
        assert_session_ended(&harness).await;
    }

    #[tokio::test]
    async fn test_rejected_post_ends_session() {
        let harness = harness();
        let poster = poster(Behaviour::Reject);
        worker(&harness, poster.clone()).spawn().unwrap().join().unwrap();
        assert_eq!(poster.posts.load(Ordering::SeqCst), 1);
        assert_session_ended(&harness).await;
    }

    #[tokio::test]
    async fn test_panicking_post_still_ends_session() {
        let harness = harness();
        let joined = worker(&harness, poster(Behaviour::Panic)).spawn().unwrap().join();
        assert!(joined.is_err());
        assert_session_ended(&harness).await;
    }

    #[tokio::test]
    async fn test_missing_connection_id_ends_session() {
        let harness = harness();
        let source = ScriptedSource {
            chunks: VecDeque::new(),
            closed: harness.closed.clone(),
        };
        ConnectionWorker::new(
            Box::new(source),
            poster(Behaviour::Accept),
            Map::new(),
            harness.events.clone(),
        )
        .spawn()
        .unwrap()
        .join()
        .unwrap();

        let _consumer = harness.events.start().unwrap();
        harness.events.drained().await;
        assert!(harness.closed.load(Ordering::SeqCst));
        assert_eq!(harness.ended.lock().unwrap()[0]["session"]["stop"], json!(true));
    }

    struct RecordingPoster {
        posts: Mutex<Vec<(String, Value)>>,
    }

    impl ConnectionPoster for RecordingPoster {
        fn post(&self, connection_id: &str, data: &[u8]) -> Result<bool> {
            let body = serde_json::from_slice(data)?;
            self.posts.lock().unwrap().push((connection_id.to_string(), body));
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_handler_posts_back_to_connections() {
        let events = EventDispatcher::new();
        let poster = Arc::new(RecordingPoster {
            posts: Mutex::new(Vec::new()),
        });
        events.on(Arc::new(ConnectionHandler::new(poster.clone())));
        let _consumer = events.start().unwrap();

        events.fire(
            EventType::RecordEnd,
            json!({"connection": {"id": "conn-1", "manager_id": "mgr-9"}}),
        );
        events.fire(EventType::HealthEnd, json!({"connection": {"id": "conn-2"}}));
        events.fire(EventType::UploadEnd, json!({"connection": {"id": "conn-3"}}));
        events.fire(EventType::HealthEnd, json!({"version": "0.7.0"}));
        events.fire(EventType::RecordEnd, json!({"connection": {"id": "conn-4"}}));
        events.drained().await;

        let posts = poster.posts.lock().unwrap();
        let targets: Vec<&str> = posts.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(targets, vec!["mgr-9", "conn-2", "conn-3"]);
        assert_eq!(posts[0].1["connection"]["id"], json!("conn-1"));
        assert_eq!(posts[1].1["name"], json!("health_end"));
    }
}
