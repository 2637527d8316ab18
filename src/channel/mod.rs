// Channel session manager
// Owns the one long-lived connection: reconnects with backoff, replays room
// membership after every reconnect, keeps handlers registered across drops
// and matches acks to emits.

use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;

pub mod backoff;
pub mod events;
pub mod transport;

pub use backoff::Backoff;
pub use events::{AckResponse, ClientEvent, Frame, ServerEvent, Topic, SERVER_EVENT_NAMES};
pub use transport::{Connection, Transport};

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Stopped,
}

type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, PartialEq, Eq)]
enum Exit {
    Lost,
    Shutdown,
}

struct Shared {
    transport: Arc<dyn Transport>,
    backoff: Backoff,
    // Lock order: topics before outbound
    topics: TokioMutex<Vec<Topic>>,
    outbound: TokioMutex<Option<mpsc::Sender<Frame>>>,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
    acks: TokioMutex<HashMap<u64, oneshot::Sender<AckResponse>>>,
    next_id: AtomicU64,
    status: watch::Sender<ConnectionStatus>,
}

impl Shared {
    async fn send_frame(&self, frame: Frame) -> Result<(), SyncError> {
        let sender = self.outbound.lock().await.clone();
        match sender {
            Some(sender) => sender
                .send(frame)
                .await
                .map_err(|_| SyncError::ChannelConnection("connection closed".to_string())),
            None => Err(SyncError::ChannelConnection("not connected".to_string())),
        }
    }

    fn dispatch(&self, event: &str, payload: &Value) {
        let handlers: Vec<EventHandler> = match self.handlers.read() {
            Ok(handlers) => handlers
                .get(event)
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default(),
            Err(e) => {
                error!("Handler registry poisoned: {}", e);
                return;
            }
        };
        if handlers.is_empty() {
            debug!("No handler for channel event '{}'", event);
        }
        for handler in handlers {
            handler(payload);
        }
    }

    async fn resolve_ack(&self, id: u64, response: AckResponse) {
        match self.acks.lock().await.remove(&id) {
            Some(waiter) => {
                // The emitter may have timed out and gone away already
                let _ = waiter.send(response);
            }
            None => debug!("Late or unknown ack {}", id),
        }
    }
}

pub struct ChannelSession {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: TokioMutex<Option<JoinHandle<()>>>,
}

impl ChannelSession {
    pub fn new(transport: Arc<dyn Transport>, backoff: Backoff) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (shutdown, _) = watch::channel(false);
        ChannelSession {
            shared: Arc::new(Shared {
                transport,
                backoff,
                topics: TokioMutex::new(Vec::new()),
                outbound: TokioMutex::new(None),
                handlers: RwLock::new(HashMap::new()),
                acks: TokioMutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                status,
            }),
            shutdown,
            task: TokioMutex::new(None),
        }
    }

    /// Spawn the connection loop. Calling it again while running does nothing.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(run_session(self.shared.clone(), shutdown)));
    }

    /// Stop reconnecting and close the connection
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!("Channel session task ended abnormally: {}", e);
            }
        }
        info!("Channel session stopped");
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.status.borrow() == ConnectionStatus::Connected
    }

    /// Register a handler for a server event. Handlers survive reconnects.
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        match self.shared.handlers.write() {
            Ok(mut handlers) => handlers
                .entry(event.to_string())
                .or_default()
                .push((id, Arc::new(handler))),
            Err(e) => error!("Handler registry poisoned: {}", e),
        }
        id
    }

    pub fn off(&self, id: HandlerId) -> bool {
        match self.shared.handlers.write() {
            Ok(mut handlers) => {
                let mut removed = false;
                for list in handlers.values_mut() {
                    let before = list.len();
                    list.retain(|(h, _)| *h != id);
                    removed |= list.len() != before;
                }
                removed
            }
            Err(e) => {
                error!("Handler registry poisoned: {}", e);
                false
            }
        }
    }

    /// Add a room to the membership set and join it now if connected
    pub async fn join(&self, topic: Topic) {
        let mut topics = self.shared.topics.lock().await;
        if topics.contains(&topic) {
            return;
        }
        topics.push(topic.clone());
        let (event, payload) = topic.join_event().to_parts();
        match self.shared.send_frame(Frame::Emit { event, payload, ack: None }).await {
            Ok(()) => debug!("Joined {:?}", topic),
            Err(_) => debug!("Not connected, {:?} will be joined on connect", topic),
        }
    }

    pub async fn leave(&self, topic: &Topic) {
        let mut topics = self.shared.topics.lock().await;
        let before = topics.len();
        topics.retain(|t| t != topic);
        if topics.len() == before {
            return;
        }
        if let Some(leave) = topic.leave_event() {
            let (event, payload) = leave.to_parts();
            if self.shared.send_frame(Frame::Emit { event, payload, ack: None }).await.is_err() {
                debug!("Not connected while leaving {:?}", topic);
            }
        }
    }

    pub async fn topics(&self) -> Vec<Topic> {
        self.shared.topics.lock().await.clone()
    }

    /// Fire-and-forget emit
    pub async fn send(&self, event: &ClientEvent) -> Result<(), SyncError> {
        let (event, payload) = event.to_parts();
        self.shared.send_frame(Frame::Emit { event, payload, ack: None }).await
    }

    /// Emit and wait for the ack. A missing ack is `ChannelTimeout`: the server
    /// may or may not have acted, so callers must not treat it as failure.
    pub async fn emit(&self, event: &ClientEvent, timeout: Duration) -> Result<AckResponse, SyncError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.acks.lock().await.insert(id, tx);

        let (name, payload) = event.to_parts();
        if let Err(e) = self
            .shared
            .send_frame(Frame::Emit { event: name.clone(), payload, ack: Some(id) })
            .await
        {
            self.shared.acks.lock().await.remove(&id);
            warn!("Could not emit '{}': {}", name, e);
            return Err(e);
        }
        debug!("Emitted '{}' awaiting ack {}", name, id);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) if response.success => Ok(response),
            Ok(Ok(response)) => {
                let reason = response.error.unwrap_or_else(|| "request rejected".to_string());
                info!("Server rejected '{}': {}", name, reason);
                Err(SyncError::ServerRejection { action: name, reason })
            }
            Ok(Err(_)) | Err(_) => {
                self.shared.acks.lock().await.remove(&id);
                warn!("No ack for '{}' within {:?}, outcome unknown", name, timeout);
                Err(SyncError::ChannelTimeout { event: name, timeout })
            }
        }
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run_session(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    shared.status.send_replace(ConnectionStatus::Connecting);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let connected = tokio::select! {
            result = shared.transport.connect() => result,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok(connection) => {
                info!("Channel connected");
                attempt = 0;
                if pump(&shared, connection, &mut shutdown).await == Exit::Shutdown {
                    break;
                }
                warn!("Channel connection lost");
            }
            Err(e) => warn!("Channel connect failed: {}", e),
        }

        attempt = attempt.saturating_add(1);
        let delay = shared.backoff.delay(attempt);
        shared.status.send_replace(ConnectionStatus::Reconnecting { attempt });
        info!("Reconnecting in {:?} (attempt {})", delay, attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    *shared.outbound.lock().await = None;
    shared.status.send_replace(ConnectionStatus::Stopped);
}

async fn pump(shared: &Shared, connection: Connection, shutdown: &mut watch::Receiver<bool>) -> Exit {
    let Connection { outbound, mut inbound } = connection;

    {
        // Rejoin before publishing the sender so nothing overtakes the joins
        let topics = shared.topics.lock().await;
        for topic in topics.iter() {
            let (event, payload) = topic.join_event().to_parts();
            if outbound.send(Frame::Emit { event, payload, ack: None }).await.is_err() {
                return Exit::Lost;
            }
        }
        if !topics.is_empty() {
            info!("Rejoined {} topic(s)", topics.len());
        }
        *shared.outbound.lock().await = Some(outbound.clone());
    }
    shared.status.send_replace(ConnectionStatus::Connected);

    let exit = loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(Frame::Event { event, payload }) => shared.dispatch(&event, &payload),
                Some(Frame::Ack { ack, response }) => shared.resolve_ack(ack, response).await,
                Some(Frame::Emit { event, .. }) => warn!("Ignoring emit frame '{}' from server", event),
                None => break Exit::Lost,
            },
            _ = outbound.closed() => break Exit::Lost,
            _ = shutdown.changed() => break Exit::Shutdown,
        }
    };

    *shared.outbound.lock().await = None;
    if exit == Exit::Lost {
        shared.status.send_replace(ConnectionStatus::Disconnected);
    }
    exit
}
