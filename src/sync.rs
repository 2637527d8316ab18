// Trip synchronizer
// `SyncState` is the injectable store container: typed server events in,
// `SyncUpdate`s out. `Synchronizer` wires it to the channel session, the REST
// collaborators and the location loops, and publishes every change on one
// update channel a UI layer subscribes to.

use chrono::Utc;
use futures::future::{join_all, try_join};
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::channel::{ChannelSession, ConnectionStatus, HandlerId, ServerEvent, Topic, SERVER_EVENT_NAMES};
use crate::chat::{ChatStore, OutgoingMessage};
use crate::config::SyncConfig;
use crate::error::{LocationErrorKind, SyncError, ValidationError};
use crate::ledger::EntryState;
use crate::location::{LocationCache, LocationLoop, PositionSource};
use crate::models::{
    BookingDecision, ChatRoomId, Identity, LocationSample, Notification, RideId, RideSession, RideStatus, StopKind,
    TempId, UserId,
};
use crate::notifications::{NotificationInbox, PendingInboxAction};
use crate::rest::{with_deadline, ChatApi, NotificationApi, RideApi};
use crate::ride::{PendingRideAction, RideStore};

/// Everything a subscriber needs to re-render
#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    RideChanged(RideSession),
    PassengerApproaching { ride_id: RideId, passenger_id: UserId, stop: StopKind },
    LocationUpdated(LocationSample),
    LocationError { ride_id: RideId, kind: LocationErrorKind, message: String },
    ThreadChanged { thread_id: ChatRoomId, unread_count: u32 },
    MessageFailed { thread_id: ChatRoomId, temp_id: TempId, reason: String },
    NotificationReceived(Notification),
    InboxChanged { unread_count: usize },
    ConnectionStatus(ConnectionStatus),
}

pub struct SyncState {
    pub rides: RideStore,
    pub chat: ChatStore,
    pub notifications: NotificationInbox,
    pub locations: LocationCache,
}

impl SyncState {
    pub fn new(viewer: Option<UserId>) -> Self {
        SyncState {
            rides: RideStore::new(viewer.clone()),
            chat: ChatStore::new(viewer),
            notifications: NotificationInbox::new(),
            locations: LocationCache::new(),
        }
    }

    pub fn viewer(&self) -> Option<&str> {
        self.rides.viewer()
    }

    /// The viewer can load after cached data; ownership is recomputed from here on
    pub fn set_viewer(&mut self, viewer: UserId) {
        self.rides.set_viewer(viewer.clone());
        self.chat.set_viewer(viewer);
    }

    pub fn apply_server_event(&mut self, event: ServerEvent) -> Vec<SyncUpdate> {
        match event {
            ServerEvent::LocationUpdated { ride_id, location, observed_at } => {
                let sample = LocationSample {
                    ride_id,
                    coordinates: location,
                    observed_at: observed_at.unwrap_or_else(Utc::now),
                };
                if self.locations.apply(sample.clone()) {
                    vec![SyncUpdate::LocationUpdated(sample)]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::ApproachingPickup { ride_id, passenger_id } => {
                self.approaching(ride_id, passenger_id, StopKind::Pickup)
            }
            ServerEvent::ApproachingDropoff { ride_id, passenger_id } => {
                self.approaching(ride_id, passenger_id, StopKind::Dropoff)
            }
            ServerEvent::NewMessage(message) => {
                let thread_id = message.chat_room_id.clone();
                self.chat.receive_inbound(message);
                self.thread_update(&thread_id).into_iter().collect()
            }
            ServerEvent::NewNotification(notification) => {
                let received = SyncUpdate::NotificationReceived(notification.clone());
                if self.notifications.receive(notification) {
                    vec![received, self.inbox_update()]
                } else {
                    Vec::new()
                }
            }
            ride_event => self
                .rides
                .apply_inbound(&ride_event)
                .map(SyncUpdate::RideChanged)
                .into_iter()
                .collect(),
        }
    }

    fn approaching(&self, ride_id: RideId, passenger_id: UserId, stop: StopKind) -> Vec<SyncUpdate> {
        if self.rides.ride(&ride_id).is_none() {
            debug!("Ignoring approach notice for unknown ride {}", ride_id);
            return Vec::new();
        }
        vec![SyncUpdate::PassengerApproaching { ride_id, passenger_id, stop }]
    }

    pub fn thread_update(&self, thread_id: &str) -> Option<SyncUpdate> {
        self.chat.thread(thread_id).map(|t| SyncUpdate::ThreadChanged {
            thread_id: t.id.clone(),
            unread_count: t.unread_count,
        })
    }

    pub fn inbox_update(&self) -> SyncUpdate {
        SyncUpdate::InboxChanged {
            unread_count: self.notifications.unread_count(),
        }
    }

    /// JSON view of everything held, as shown by `tripsync replay`
    pub fn snapshot(&self) -> Value {
        let mut rides: Vec<&RideSession> = self.rides.rides().collect();
        rides.sort_by(|a, b| a.id.cmp(&b.id));
        let rides: Vec<Value> = rides
            .into_iter()
            .map(|ride| {
                json!({
                    "ride": ride,
                    "pending": self.rides.ride_state(&ride.id) == Some(EntryState::Pending),
                    "outstandingStops": ride.route_stops().len(),
                })
            })
            .collect();

        let mut threads: Vec<_> = self.chat.threads().collect();
        threads.sort_by(|a, b| a.id.cmp(&b.id));
        let threads: Vec<Value> = threads
            .into_iter()
            .map(|thread| {
                let messages: Vec<Value> = thread
                    .messages()
                    .map(|(message, _)| {
                        let id = match &message.identity {
                            Identity::Server(id) => id.clone(),
                            Identity::Temp(temp_id) => temp_id.to_string(),
                        };
                        json!({
                            "id": id,
                            "senderId": message.sender_id,
                            "content": message.content,
                            "timestamp": message.timestamp,
                            "deliveryState": message.delivery_state,
                            "isOwn": self.chat.is_own(message),
                        })
                    })
                    .collect();
                json!({ "id": thread.id, "unreadCount": thread.unread_count, "messages": messages })
            })
            .collect();

        let notifications: Vec<&Notification> = self.notifications.notifications().collect();
        json!({
            "viewer": self.viewer(),
            "rides": rides,
            "threads": threads,
            "totalUnread": self.chat.total_unread(),
            "notifications": notifications,
            "unreadNotifications": self.notifications.unread_count(),
        })
    }
}

/// REST and device collaborators
#[derive(Clone)]
pub struct Collaborators {
    pub rides: Arc<dyn RideApi>,
    pub chat: Arc<dyn ChatApi>,
    pub notifications: Arc<dyn NotificationApi>,
    pub position: Arc<dyn PositionSource>,
}

struct Inner {
    config: SyncConfig,
    session: Arc<ChannelSession>,
    api: Collaborators,
    state: TokioMutex<SyncState>,
    updates: mpsc::Sender<SyncUpdate>,
    // Lock order: broadcasts before state
    broadcasts: TokioMutex<Broadcasts>,
}

#[derive(Default)]
struct Broadcasts {
    running: HashMap<RideId, LocationLoop>,
    /// Rides whose view was closed; no loop runs for them until watched again
    unwatched: HashSet<RideId>,
    stopped: bool,
}

impl Inner {
    async fn publish(&self, updates: Vec<SyncUpdate>) {
        for update in updates {
            if let SyncUpdate::RideChanged(ride) = &update {
                self.reconcile_location_loop(&ride.id).await;
            }
            if self.updates.send(update).await.is_err() {
                debug!("No update subscriber");
            }
        }
    }

    /// A loop runs exactly while the viewer drives a ride that is in progress.
    /// Decided from the ride as stored now, since the published copy may be stale.
    async fn reconcile_location_loop(&self, ride_id: &str) {
        let mut broadcasts = self.broadcasts.lock().await;
        let (driver_id, status) = {
            let state = self.state.lock().await;
            let viewer = state.viewer();
            match state.rides.ride(ride_id) {
                Some(ride) if viewer.map_or(false, |v| ride.is_driver(v)) => (Some(ride.driver_id.clone()), Some(ride.status)),
                Some(ride) => (None, Some(ride.status)),
                None => (None, None),
            }
        };
        let wanted = !broadcasts.stopped
            && !broadcasts.unwatched.contains(ride_id)
            && status == Some(RideStatus::InProgress);

        match driver_id {
            Some(driver_id) if wanted => {
                if !broadcasts.running.contains_key(ride_id) {
                    let handle = LocationLoop::start(
                        ride_id,
                        &driver_id,
                        self.api.position.clone(),
                        self.session.clone(),
                        self.config.location_settings(),
                        self.updates.clone(),
                    );
                    broadcasts.running.insert(ride_id.to_string(), handle);
                }
            }
            _ => {
                if let Some(handle) = broadcasts.running.remove(ride_id) {
                    info!("Stopping location broadcast for ride {} ({:?})", ride_id, status);
                    handle.stop().await;
                }
            }
        }
    }

    async fn unwatch_loop(&self, ride_id: &str) {
        let mut broadcasts = self.broadcasts.lock().await;
        broadcasts.unwatched.insert(ride_id.to_string());
        if let Some(handle) = broadcasts.running.remove(ride_id) {
            info!("Stopping location broadcast for unwatched ride {}", ride_id);
            handle.stop().await;
        }
    }

    async fn stop_all_loops(&self) {
        let loops: Vec<LocationLoop> = {
            let mut broadcasts = self.broadcasts.lock().await;
            broadcasts.stopped = true;
            broadcasts.running.drain().map(|(_, l)| l).collect()
        };
        join_all(loops.into_iter().map(LocationLoop::stop)).await;
    }
}

async fn dispatch(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        let updates = inner.state.lock().await.apply_server_event(event);
        inner.publish(updates).await;
    }
    debug!("Inbound dispatch finished");
}

async fn forward_status(mut status: watch::Receiver<ConnectionStatus>, updates: mpsc::Sender<SyncUpdate>) {
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        let stopped = current == ConnectionStatus::Stopped;
        if updates.send(SyncUpdate::ConnectionStatus(current)).await.is_err() || stopped {
            break;
        }
    }
}

pub struct Synchronizer {
    inner: Arc<Inner>,
    handlers: StdMutex<Vec<HandlerId>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Synchronizer {
    pub fn new(
        config: SyncConfig,
        session: Arc<ChannelSession>,
        api: Collaborators,
        viewer: Option<UserId>,
    ) -> (Self, mpsc::Receiver<SyncUpdate>) {
        let (updates, receiver) = mpsc::channel(config.update_buffer.max(1));
        let inner = Inner {
            config,
            session,
            api,
            state: TokioMutex::new(SyncState::new(viewer)),
            updates,
            broadcasts: TokioMutex::new(Broadcasts::default()),
        };
        let synchronizer = Synchronizer {
            inner: Arc::new(inner),
            handlers: StdMutex::new(Vec::new()),
            tasks: StdMutex::new(Vec::new()),
        };
        (synchronizer, receiver)
    }

    /// Register inbound handlers, join the viewer's room and connect
    pub async fn start(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut ids = Vec::with_capacity(SERVER_EVENT_NAMES.len());
        for name in SERVER_EVENT_NAMES {
            let tx = tx.clone();
            let event_name = name.to_string();
            ids.push(self.inner.session.on(name, move |payload| {
                match ServerEvent::parse(&event_name, payload.clone()) {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            debug!("Dispatch stopped, dropping '{}'", event_name);
                        }
                    }
                    Err(e) => warn!("Dropping inbound event: {}", e),
                }
            }));
        }

        let already_started = match self.handlers.lock() {
            Ok(mut handlers) => {
                let started = !handlers.is_empty();
                if !started {
                    *handlers = ids.clone();
                }
                started
            }
            Err(_) => true,
        };
        if already_started {
            for id in ids {
                self.inner.session.off(id);
            }
            return;
        }

        let dispatch_task = tokio::spawn(dispatch(self.inner.clone(), rx));
        let status_task = tokio::spawn(forward_status(self.inner.session.status(), self.inner.updates.clone()));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(dispatch_task);
            tasks.push(status_task);
        }

        let viewer = self.inner.state.lock().await.viewer().map(str::to_string);
        if let Some(viewer) = viewer {
            self.inner.session.join(Topic::User(viewer)).await;
        }
        self.inner.session.start().await;
        info!("Synchronizer started");
    }

    /// Tear down handlers, location loops and the connection
    pub async fn shutdown(&self) {
        let ids = match self.handlers.lock() {
            Ok(mut handlers) => std::mem::take(&mut *handlers),
            Err(_) => Vec::new(),
        };
        for id in ids {
            self.inner.session.off(id);
        }

        self.inner.stop_all_loops().await;

        self.inner.session.shutdown().await;

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in &tasks {
            task.abort();
        }
        join_all(tasks).await;
        info!("Synchronizer stopped");
    }

    /// Read access to the stores
    pub async fn state(&self) -> MutexGuard<'_, SyncState> {
        self.inner.state.lock().await
    }

    pub fn session(&self) -> &ChannelSession {
        &self.inner.session
    }

    pub async fn is_broadcasting(&self, ride_id: &str) -> bool {
        self.inner
            .broadcasts
            .lock()
            .await
            .running
            .get(ride_id)
            .map_or(false, |l| l.is_running())
    }

    pub async fn set_viewer(&self, viewer: UserId) {
        self.inner.state.lock().await.set_viewer(viewer.clone());
        self.inner.session.join(Topic::User(viewer)).await;
    }

    // Rides

    pub async fn refresh_rides(&self) -> Result<(), SyncError> {
        let deadline = self.inner.config.rest_timeout();
        let (driving, riding) = try_join(
            with_deadline(deadline, "driver_rides", self.inner.api.rides.driver_rides()),
            with_deadline(deadline, "passenger_rides", self.inner.api.rides.passenger_rides()),
        )
        .await?;

        let changed = {
            let mut state = self.inner.state.lock().await;
            let mut changed = state.rides.merge_snapshot(driving);
            changed.extend(state.rides.merge_snapshot(riding));
            changed
        };
        info!("Merged {} ride(s) from snapshot", changed.len());
        self.inner
            .publish(changed.into_iter().map(SyncUpdate::RideChanged).collect())
            .await;
        Ok(())
    }

    pub async fn request_start(&self, ride_id: &str) -> Result<(), SyncError> {
        self.run_ride_action(|rides| rides.begin_start(ride_id)).await
    }

    pub async fn confirm_pickup(&self, ride_id: &str, passenger_id: &str, otp: &str) -> Result<(), SyncError> {
        self.run_ride_action(|rides| rides.begin_pickup(ride_id, passenger_id, otp)).await
    }

    pub async fn confirm_dropoff(&self, ride_id: &str, passenger_id: &str) -> Result<(), SyncError> {
        self.run_ride_action(|rides| rides.begin_dropoff(ride_id, passenger_id)).await
    }

    pub async fn cancel_passenger(&self, ride_id: &str, passenger_id: &str, reason: &str) -> Result<(), SyncError> {
        self.run_ride_action(|rides| rides.begin_cancel_passenger(ride_id, passenger_id, reason)).await
    }

    pub async fn cancel_ride(&self, ride_id: &str, reason: &str) -> Result<(), SyncError> {
        self.run_ride_action(|rides| rides.begin_cancel_ride(ride_id, reason)).await
    }

    pub async fn complete_ride(&self, ride_id: &str) -> Result<(), SyncError> {
        self.run_ride_action(|rides| rides.begin_complete(ride_id)).await
    }

    /// Validate and apply the optimistic part, emit, then settle with the ack.
    /// The state lock is never held while waiting on the network.
    async fn run_ride_action<F>(&self, begin: F) -> Result<(), SyncError>
    where
        F: FnOnce(&mut RideStore) -> Result<PendingRideAction, SyncError>,
    {
        let (pending, optimistic) = {
            let mut state = self.inner.state.lock().await;
            let pending = begin(&mut state.rides)?;
            let ride = state.rides.ride(&pending.ride_id).cloned();
            (pending, ride)
        };
        self.inner
            .publish(optimistic.into_iter().map(SyncUpdate::RideChanged).collect())
            .await;

        let outcome = self.inner.session.emit(&pending.event, self.inner.config.ack_timeout()).await;

        let (result, settled) = {
            let mut state = self.inner.state.lock().await;
            let result = state.rides.settle(pending.temp_id, outcome);
            (result, state.rides.ride(&pending.ride_id).cloned())
        };
        self.inner
            .publish(settled.into_iter().map(SyncUpdate::RideChanged).collect())
            .await;
        result
    }

    pub async fn watch_ride(&self, ride_id: &str) -> Result<(), SyncError> {
        let viewer = {
            let mut state = self.inner.state.lock().await;
            let viewer = state.viewer().map(str::to_string).ok_or(ValidationError::ViewerUnknown)?;
            state.locations.watch(ride_id);
            viewer
        };
        self.inner
            .session
            .join(Topic::Ride { ride_id: ride_id.to_string(), user_id: viewer })
            .await;
        let rewatched = self.inner.broadcasts.lock().await.unwatched.remove(ride_id);
        if rewatched {
            self.inner.reconcile_location_loop(ride_id).await;
        }
        Ok(())
    }

    /// Leave the ride room, forget its location and stop broadcasting for it
    pub async fn unwatch_ride(&self, ride_id: &str) {
        let viewer = {
            let mut state = self.inner.state.lock().await;
            state.locations.unwatch(ride_id);
            state.viewer().map(str::to_string)
        };
        if let Some(viewer) = viewer {
            self.inner
                .session
                .leave(&Topic::Ride { ride_id: ride_id.to_string(), user_id: viewer })
                .await;
        }
        self.inner.unwatch_loop(ride_id).await;
    }

    // Chat

    pub async fn load_history(&self, thread_id: &str) -> Result<(), SyncError> {
        let history = with_deadline(
            self.inner.config.rest_timeout(),
            "chat_history",
            self.inner.api.chat.history(thread_id),
        )
        .await?;
        let update = {
            let mut state = self.inner.state.lock().await;
            state.chat.merge_history(thread_id, history);
            state.thread_update(thread_id)
        };
        self.inner.publish(update.into_iter().collect()).await;
        Ok(())
    }

    pub async fn open_thread(&self, thread_id: &str) -> Result<(), SyncError> {
        let update = {
            let mut state = self.inner.state.lock().await;
            state.chat.open_thread(thread_id)?;
            state.thread_update(thread_id)
        };
        self.inner.publish(update.into_iter().collect()).await;
        Ok(())
    }

    pub async fn close_thread(&self, thread_id: &str) {
        self.inner.state.lock().await.chat.close_thread(thread_id);
    }

    /// Returns the temp id the message was sent under
    pub async fn send_message(&self, thread_id: &str, content: &str) -> Result<TempId, SyncError> {
        let (outgoing, update) = {
            let mut state = self.inner.state.lock().await;
            let outgoing = state.chat.begin_send(thread_id, content)?;
            (outgoing, state.thread_update(thread_id))
        };
        self.inner.publish(update.into_iter().collect()).await;
        self.deliver(outgoing).await
    }

    pub async fn retry_send(&self, thread_id: &str, temp_id: TempId) -> Result<TempId, SyncError> {
        let (outgoing, update) = {
            let mut state = self.inner.state.lock().await;
            let outgoing = state.chat.retry_send(thread_id, temp_id)?;
            (outgoing, state.thread_update(thread_id))
        };
        self.inner.publish(update.into_iter().collect()).await;
        self.deliver(outgoing).await
    }

    async fn deliver(&self, outgoing: OutgoingMessage) -> Result<TempId, SyncError> {
        let sent = with_deadline(
            self.inner.config.rest_timeout(),
            "send_message",
            self.inner
                .api
                .chat
                .send_message(&outgoing.chat_room_id, &outgoing.content, outgoing.temp_id),
        )
        .await;

        let (result, mut updates) = {
            let mut state = self.inner.state.lock().await;
            let result = state.chat.complete_send(outgoing.temp_id, sent);
            let updates: Vec<SyncUpdate> = state.thread_update(&outgoing.chat_room_id).into_iter().collect();
            (result, updates)
        };
        if let Err(SyncError::DeliveryFailure(reason)) = &result {
            updates.push(SyncUpdate::MessageFailed {
                thread_id: outgoing.chat_room_id.clone(),
                temp_id: outgoing.temp_id,
                reason: reason.clone(),
            });
        }
        self.inner.publish(updates).await;
        result.map(|()| outgoing.temp_id)
    }

    // Notifications

    pub async fn refresh_notifications(&self) -> Result<(), SyncError> {
        let list = with_deadline(
            self.inner.config.rest_timeout(),
            "notifications",
            self.inner.api.notifications.list(),
        )
        .await?;
        let update = {
            let mut state = self.inner.state.lock().await;
            state.notifications.merge(list);
            state.inbox_update()
        };
        self.inner.publish(vec![update]).await;
        Ok(())
    }

    pub async fn mark_notification_read(&self, id: &str) -> Result<(), SyncError> {
        let pending = self.inner.state.lock().await.notifications.begin_mark_read(id)?;
        let api = self.inner.api.notifications.clone();
        self.run_inbox_action(pending, "mark_read", api.mark_read(id)).await
    }

    pub async fn delete_notification(&self, id: &str) -> Result<(), SyncError> {
        let pending = self.inner.state.lock().await.notifications.begin_delete(id)?;
        let api = self.inner.api.notifications.clone();
        self.run_inbox_action(pending, "delete_notification", api.delete(id)).await
    }

    /// Approve or reject a booking request; the notification goes away only on success
    pub async fn respond_to_booking(&self, id: &str, decision: BookingDecision) -> Result<(), SyncError> {
        let pending = self.inner.state.lock().await.notifications.begin_respond(id, decision)?;
        let api = self.inner.api.notifications.clone();
        self.run_inbox_action(pending, "respond_to_booking", api.respond_to_booking(id, decision))
            .await
    }

    async fn run_inbox_action<F>(&self, pending: PendingInboxAction, request: &str, call: F) -> Result<(), SyncError>
    where
        F: std::future::Future<Output = Result<(), SyncError>>,
    {
        let update = self.inner.state.lock().await.inbox_update();
        self.inner.publish(vec![update]).await;

        let outcome = with_deadline(self.inner.config.rest_timeout(), request, call).await;
        let (result, update) = {
            let mut state = self.inner.state.lock().await;
            let result = state.notifications.settle(pending.temp_id, outcome);
            (result, state.inbox_update())
        };
        self.inner.publish(vec![update]).await;
        result
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Connection, Transport};
    use crate::models::{Booking, Coordinates, InboundMessage, PassengerState};
    use async_trait::async_trait;
    use chrono::DateTime;

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn connect(&self) -> Result<Connection, SyncError> {
            Err(SyncError::ChannelConnection("offline".to_string()))
        }
    }

    #[async_trait]
    impl RideApi for Offline {
        async fn driver_rides(&self) -> Result<Vec<RideSession>, SyncError> {
            Ok(Vec::new())
        }
        async fn passenger_rides(&self) -> Result<Vec<RideSession>, SyncError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl ChatApi for Offline {
        async fn history(&self, _chat_room_id: &str) -> Result<Vec<InboundMessage>, SyncError> {
            Ok(Vec::new())
        }
        async fn send_message(&self, _: &str, _: &str, _: TempId) -> Result<InboundMessage, SyncError> {
            Err(SyncError::Request("offline".to_string()))
        }
    }

    #[async_trait]
    impl NotificationApi for Offline {
        async fn list(&self) -> Result<Vec<Notification>, SyncError> {
            Ok(Vec::new())
        }
        async fn mark_read(&self, _id: &str) -> Result<(), SyncError> {
            Ok(())
        }
        async fn delete(&self, _id: &str) -> Result<(), SyncError> {
            Ok(())
        }
        async fn respond_to_booking(&self, _id: &str, _decision: BookingDecision) -> Result<(), SyncError> {
            Ok(())
        }
    }

    #[async_trait]
    impl PositionSource for Offline {
        async fn current_position(&self) -> Result<Coordinates, LocationErrorKind> {
            Err(LocationErrorKind::PositionUnavailable)
        }
    }

    fn offline_synchronizer(viewer: &str) -> (Synchronizer, mpsc::Receiver<SyncUpdate>) {
        let config = SyncConfig::default();
        let session = Arc::new(ChannelSession::new(Arc::new(Offline), config.backoff()));
        let offline = Arc::new(Offline);
        let collaborators = Collaborators {
            rides: offline.clone(),
            chat: offline.clone(),
            notifications: offline.clone(),
            position: offline,
        };
        Synchronizer::new(config, session, collaborators, Some(viewer.to_string()))
    }

    fn ride(status: RideStatus) -> RideSession {
        RideSession {
            id: "R1".to_string(),
            status,
            driver_id: "D1".to_string(),
            start_location: Coordinates { lat: 0.0, lng: 0.0 },
            end_location: Coordinates { lat: 1.0, lng: 1.0 },
            passengers: vec![PassengerState::new("U1", Booking::SeatsBooked(1))],
        }
    }

    fn location(ride_id: &str, seconds: i64) -> ServerEvent {
        ServerEvent::LocationUpdated {
            ride_id: ride_id.to_string(),
            location: Coordinates { lat: seconds as f64, lng: 0.0 },
            observed_at: DateTime::from_timestamp(1_700_000_000 + seconds, 0),
        }
    }

    #[test]
    fn test_ride_events_produce_ride_updates() {
        let mut state = SyncState::new(Some("U1".to_string()));
        let updates = state.apply_server_event(ServerEvent::RideUpdate {
            ride: ride(RideStatus::InProgress),
            cancelled_passenger_id: None,
        });
        assert!(matches!(&updates[..], [SyncUpdate::RideChanged(r)] if r.status == RideStatus::InProgress));

        let updates = state.apply_server_event(ServerEvent::PassengerDroppedOff {
            ride_id: "R1".into(),
            passenger_id: "U1".into(),
            dropoff_time: None,
        });
        assert!(matches!(&updates[..], [SyncUpdate::RideChanged(r)] if r.status == RideStatus::Completed));

        assert!(state
            .apply_server_event(ServerEvent::RideStarted { ride_id: "R9".into() })
            .is_empty());
    }

    #[test]
    fn test_location_only_for_watched_rides() {
        let mut state = SyncState::new(Some("U1".to_string()));
        state.locations.watch("R1");
        assert_eq!(state.apply_server_event(location("R1", 10)).len(), 1);
        assert!(state.apply_server_event(location("R2", 11)).is_empty());
        assert!(state.apply_server_event(location("R1", 5)).is_empty());
        assert_eq!(state.locations.latest("R1").map(|s| s.coordinates.lat), Some(10.0));
    }

    #[test]
    fn test_approach_notices_need_a_known_ride() {
        let mut state = SyncState::new(Some("U1".to_string()));
        let notice = ServerEvent::ApproachingPickup { ride_id: "R1".into(), passenger_id: "U1".into() };
        assert!(state.apply_server_event(notice.clone()).is_empty());

        state.rides.merge_snapshot(vec![ride(RideStatus::InProgress)]);
        assert_eq!(
            state.apply_server_event(notice),
            vec![SyncUpdate::PassengerApproaching {
                ride_id: "R1".into(),
                passenger_id: "U1".into(),
                stop: StopKind::Pickup
            }]
        );
    }

    #[test]
    fn test_messages_and_notifications_update_counters() {
        let mut state = SyncState::new(Some("U1".to_string()));
        let message = InboundMessage {
            id: "m1".into(),
            chat_room_id: "T1".into(),
            sender_id: "D1".into(),
            content: "on my way".into(),
            timestamp: Utc::now(),
            temp_id: None,
        };
        assert_eq!(
            state.apply_server_event(ServerEvent::NewMessage(message)),
            vec![SyncUpdate::ThreadChanged { thread_id: "T1".into(), unread_count: 1 }]
        );

        let notification = Notification {
            id: "n1".into(),
            kind: "booking_request".into(),
            payload: json!({ "rideId": "R1" }),
            is_read: false,
        };
        let updates = state.apply_server_event(ServerEvent::NewNotification(notification.clone()));
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1], SyncUpdate::InboxChanged { unread_count: 1 });
        assert!(state.apply_server_event(ServerEvent::NewNotification(notification)).is_empty());

        let snapshot = state.snapshot();
        assert_eq!(snapshot["totalUnread"], 1);
        assert_eq!(snapshot["threads"][0]["messages"][0]["isOwn"], false);
        assert_eq!(snapshot["unreadNotifications"], 1);
    }

    #[tokio::test]
    async fn test_location_loop_follows_stored_ride_not_published_copy() {
        let (sync, _updates) = offline_synchronizer("D1");
        sync.state().await.rides.merge_snapshot(vec![ride(RideStatus::InProgress)]);
        let stale = sync.state().await.rides.ride("R1").cloned().unwrap();

        sync.inner.publish(vec![SyncUpdate::RideChanged(stale.clone())]).await;
        assert!(sync.is_broadcasting("R1").await);

        // The ride is cancelled before an older in-progress copy gets published
        let cancelled = sync
            .state()
            .await
            .apply_server_event(ServerEvent::RideCancelled { ride_id: "R1".into(), reason: None, cancelled_passenger_id: None });
        sync.inner.publish(cancelled).await;
        assert!(!sync.is_broadcasting("R1").await);

        sync.inner.publish(vec![SyncUpdate::RideChanged(stale)]).await;
        assert!(!sync.is_broadcasting("R1").await);
        sync.shutdown().await;
    }
}
