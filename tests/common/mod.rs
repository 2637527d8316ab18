// Common test utilities for integration tests
// An in-memory channel server, fake REST collaborators and a few wait helpers

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::LevelFilter;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use tripsync::channel::{AckResponse, ChannelSession, Connection, Frame, Transport};
use tripsync::location::PositionSource;
use tripsync::rest::{ChatApi, NotificationApi, RideApi};
use tripsync::{
    Booking, BookingDecision, Collaborators, ConnectionStatus, Coordinates, InboundMessage, LocationErrorKind,
    Notification, PassengerState, RideSession, RideStatus, SyncConfig, SyncError, SyncUpdate, Synchronizer, TempId,
};

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

/// Decides the ack for an emitted event; `None` means the server stays silent
pub type Responder = Arc<dyn Fn(&str, &Value) -> Option<AckResponse> + Send + Sync>;

struct ServerState {
    emitted: Mutex<Vec<(String, Value)>>,
    responder: Mutex<Responder>,
    to_client: Mutex<Option<mpsc::Sender<Frame>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connects: AtomicUsize,
    failures_left: AtomicUsize,
}

/// Scripted channel server. Records every emit, answers acks through the responder
/// and can drop the live connection on demand.
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<ServerState>,
}

impl FakeServer {
    pub fn new() -> Self {
        FakeServer {
            state: Arc::new(ServerState {
                emitted: Mutex::new(Vec::new()),
                responder: Mutex::new(Arc::new(|_, _| Some(AckResponse::ok()))),
                to_client: Mutex::new(None),
                reader: Mutex::new(None),
                connects: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str, &Value) -> Option<AckResponse> + Send + Sync + 'static,
    {
        *self.state.responder.lock().unwrap() = Arc::new(responder);
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: usize) {
        self.state.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.state.emitted.lock().unwrap().clone()
    }

    pub fn emitted_names(&self) -> Vec<String> {
        self.emitted().into_iter().map(|(name, _)| name).collect()
    }

    pub fn clear_emitted(&self) {
        self.state.emitted.lock().unwrap().clear();
    }

    /// Push a server event to the connected client
    pub async fn push(&self, event: &str, payload: Value) {
        let sender = self.state.to_client.lock().unwrap().clone();
        let sender = sender.expect("no client connected");
        sender
            .send(Frame::Event { event: event.to_string(), payload })
            .await
            .expect("client went away");
    }

    /// Kill the live connection from the server side
    pub fn drop_connection(&self) {
        self.state.to_client.lock().unwrap().take();
        if let Some(reader) = self.state.reader.lock().unwrap().take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn connect(&self) -> Result<Connection, SyncError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .state
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(SyncError::ChannelConnection("connection refused".to_string()));
        }

        let (client_tx, mut server_rx) = mpsc::channel::<Frame>(64);
        let (server_tx, client_rx) = mpsc::channel::<Frame>(64);
        *self.state.to_client.lock().unwrap() = Some(server_tx.clone());

        let state = self.state.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = server_rx.recv().await {
                if let Frame::Emit { event, payload, ack } = frame {
                    state.emitted.lock().unwrap().push((event.clone(), payload.clone()));
                    let Some(id) = ack else { continue };
                    let responder = state.responder.lock().unwrap().clone();
                    if let Some(response) = responder(&event, &payload) {
                        let _ = server_tx.send(Frame::Ack { ack: id, response }).await;
                    }
                }
            }
        });
        if let Some(old) = self.state.reader.lock().unwrap().replace(reader) {
            old.abort();
        }

        Ok(Connection { outbound: client_tx, inbound: client_rx })
    }
}

/// Fake REST backend for rides, chat and notifications
#[derive(Default)]
pub struct FakeApi {
    pub driver_rides: Mutex<Vec<RideSession>>,
    pub passenger_rides: Mutex<Vec<RideSession>>,
    pub history: Mutex<Vec<InboundMessage>>,
    pub notifications: Mutex<Vec<Notification>>,
    pub fail_sends: AtomicBool,
    pub fail_responses: AtomicBool,
    pub sent: Mutex<Vec<(String, String, TempId)>>,
    pub responses: Mutex<Vec<(String, BookingDecision)>>,
    next_id: AtomicUsize,
}

#[async_trait]
impl RideApi for FakeApi {
    async fn driver_rides(&self) -> Result<Vec<RideSession>, SyncError> {
        Ok(self.driver_rides.lock().unwrap().clone())
    }

    async fn passenger_rides(&self) -> Result<Vec<RideSession>, SyncError> {
        Ok(self.passenger_rides.lock().unwrap().clone())
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn history(&self, _chat_room_id: &str) -> Result<Vec<InboundMessage>, SyncError> {
        Ok(self.history.lock().unwrap().clone())
    }

    async fn send_message(&self, chat_room_id: &str, content: &str, temp_id: TempId) -> Result<InboundMessage, SyncError> {
        self.sent
            .lock()
            .unwrap()
            .push((chat_room_id.to_string(), content.to_string(), temp_id));
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SyncError::Request("503 Service Unavailable".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(InboundMessage {
            id: format!("m{}", id),
            chat_room_id: chat_room_id.to_string(),
            sender_id: "D1".to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            temp_id: Some(temp_id),
        })
    }
}

#[async_trait]
impl NotificationApi for FakeApi {
    async fn list(&self) -> Result<Vec<Notification>, SyncError> {
        Ok(self.notifications.lock().unwrap().clone())
    }

    async fn mark_read(&self, _id: &str) -> Result<(), SyncError> {
        Ok(())
    }

    async fn delete(&self, _id: &str) -> Result<(), SyncError> {
        Ok(())
    }

    async fn respond_to_booking(&self, id: &str, decision: BookingDecision) -> Result<(), SyncError> {
        if self.fail_responses.load(Ordering::SeqCst) {
            return Err(SyncError::Request("booking already handled".to_string()));
        }
        self.responses.lock().unwrap().push((id.to_string(), decision));
        Ok(())
    }
}

/// Always reports the same spot, or a fixed error
pub struct FixedPosition(pub Result<Coordinates, LocationErrorKind>);

#[async_trait]
impl PositionSource for FixedPosition {
    async fn current_position(&self) -> Result<Coordinates, LocationErrorKind> {
        self.0
    }
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        ack_timeout_ms: 300,
        rest_timeout_ms: 500,
        reconnect_base_ms: 10,
        reconnect_max_ms: 50,
        reconnect_jitter_ms: 0,
        location_interval_ms: 20,
        location_sample_timeout_ms: 100,
        update_buffer: 1024,
    }
}

pub fn session(server: &FakeServer) -> Arc<ChannelSession> {
    Arc::new(ChannelSession::new(Arc::new(server.clone()), test_config().backoff()))
}

pub struct Harness {
    pub server: FakeServer,
    pub api: Arc<FakeApi>,
    pub sync: Synchronizer,
    pub updates: mpsc::Receiver<SyncUpdate>,
}

/// A started synchronizer connected to a fresh fake server, viewed as `viewer`
pub async fn harness(viewer: &str) -> Harness {
    setup_logging();
    let server = FakeServer::new();
    let api = Arc::new(FakeApi::default());
    let collaborators = Collaborators {
        rides: api.clone(),
        chat: api.clone(),
        notifications: api.clone(),
        position: Arc::new(FixedPosition(Ok(Coordinates { lat: 52.5, lng: 13.4 }))),
    };
    let (sync, updates) = Synchronizer::new(test_config(), session(&server), collaborators, Some(viewer.to_string()));
    sync.start().await;
    wait_for_status(&mut sync.session().status(), ConnectionStatus::Connected).await;
    Harness { server, api, sync, updates }
}

pub fn ride(id: &str, driver: &str, status: RideStatus, passengers: &[&str]) -> RideSession {
    RideSession {
        id: id.to_string(),
        status,
        driver_id: driver.to_string(),
        start_location: Coordinates { lat: 52.52, lng: 13.40 },
        end_location: Coordinates { lat: 48.13, lng: 11.58 },
        passengers: passengers
            .iter()
            .map(|p| PassengerState::new(*p, Booking::SeatsBooked(1)))
            .collect(),
    }
}

pub async fn wait_for_status(status: &mut watch::Receiver<ConnectionStatus>, want: ConnectionStatus) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *status.borrow_and_update() == want {
                return;
            }
            if status.changed().await.is_err() {
                panic!("status channel closed before {:?}", want);
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "status never became {:?}", want);
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
