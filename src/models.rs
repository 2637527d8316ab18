// Data model shared by the ride, chat and notification stores
// Wire names follow the server: camelCase fields, snake_case enum values

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type RideId = String;
pub type UserId = String;
pub type MessageId = String;
pub type ChatRoomId = String;
pub type NotificationId = String;

/// Client-generated placeholder identity for an entity the server has not acknowledged yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(Uuid);

impl TempId {
    pub fn new() -> Self {
        TempId(Uuid::new_v4())
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp-{}", self.0)
    }
}

/// An entity is known either by its temporary id or by the id the server issued, never both
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity<K> {
    Temp(TempId),
    Server(K),
}

impl<K> Identity<K> {
    pub fn is_temp(&self) -> bool {
        matches!(self, Identity::Temp(_))
    }

    pub fn server_id(&self) -> Option<&K> {
        match self {
            Identity::Server(id) => Some(id),
            Identity::Temp(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Scheduled,
    Rescheduled,
    Delayed,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    /// Statuses from which a ride may be started
    pub fn is_pre_start(self) -> bool {
        matches!(self, RideStatus::Scheduled | RideStatus::Rescheduled | RideStatus::Delayed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// Position along the lifecycle; status never moves to a lower rank
    pub fn rank(self) -> u8 {
        match self {
            RideStatus::Scheduled | RideStatus::Rescheduled | RideStatus::Delayed => 0,
            RideStatus::InProgress => 1,
            RideStatus::Completed | RideStatus::Cancelled => 2,
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RideStatus::Scheduled => "scheduled",
            RideStatus::Rescheduled => "rescheduled",
            RideStatus::Delayed => "delayed",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What a passenger reserved on the ride
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Booking {
    SeatsBooked(u32),
    CargoBooked(u32),
}

/// Nested passenger lifecycle derived from the flags on `PassengerState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassengerPhase {
    Booked,
    PickedUp,
    DroppedOff,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassengerState {
    pub user_id: UserId,
    #[serde(flatten)]
    pub booking: Booking,
    #[serde(default)]
    pub picked_up: bool,
    #[serde(default)]
    pub pickup_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dropped_off: bool,
    #[serde(default)]
    pub dropoff_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
    #[serde(default)]
    pub pickup_location: Option<Coordinates>,
    #[serde(default)]
    pub dropoff_location: Option<Coordinates>,
}

impl PassengerState {
    pub fn new(user_id: impl Into<UserId>, booking: Booking) -> Self {
        PassengerState {
            user_id: user_id.into(),
            booking,
            picked_up: false,
            pickup_time: None,
            dropped_off: false,
            dropoff_time: None,
            cancelled: false,
            cancellation_reason: None,
            pickup_location: None,
            dropoff_location: None,
        }
    }

    pub fn phase(&self) -> PassengerPhase {
        if self.cancelled {
            PassengerPhase::Cancelled
        } else if self.dropped_off {
            PassengerPhase::DroppedOff
        } else if self.picked_up {
            PassengerPhase::PickedUp
        } else {
            PassengerPhase::Booked
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Pickup,
    Dropoff,
}

/// An outstanding stop on the driver's route
#[derive(Debug, Clone, PartialEq)]
pub struct RouteStop {
    pub passenger_id: UserId,
    pub kind: StopKind,
    pub location: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideSession {
    pub id: RideId,
    pub status: RideStatus,
    pub driver_id: UserId,
    pub start_location: Coordinates,
    pub end_location: Coordinates,
    #[serde(default)]
    pub passengers: Vec<PassengerState>,
}

impl RideSession {
    pub fn passenger(&self, user_id: &str) -> Option<&PassengerState> {
        self.passengers.iter().find(|p| p.user_id == user_id)
    }

    pub fn passenger_mut(&mut self, user_id: &str) -> Option<&mut PassengerState> {
        self.passengers.iter_mut().find(|p| p.user_id == user_id)
    }

    /// Passengers still on the booking, cancelled ones filtered out
    pub fn active_passengers(&self) -> impl Iterator<Item = &PassengerState> {
        self.passengers.iter().filter(|p| !p.cancelled)
    }

    pub fn is_driver(&self, user_id: &str) -> bool {
        self.driver_id == user_id
    }

    /// Pickups first, then dropoffs, skipping cancelled passengers and stops already served
    pub fn route_stops(&self) -> Vec<RouteStop> {
        let pickups = self.active_passengers().filter(|p| !p.picked_up).map(|p| RouteStop {
            passenger_id: p.user_id.clone(),
            kind: StopKind::Pickup,
            location: p.pickup_location,
        });
        let dropoffs = self.active_passengers().filter(|p| !p.dropped_off).map(|p| RouteStop {
            passenger_id: p.user_id.clone(),
            kind: StopKind::Dropoff,
            location: p.dropoff_location,
        });
        pickups.chain(dropoffs).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub ride_id: RideId,
    pub coordinates: Coordinates,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub identity: Identity<MessageId>,
    pub chat_room_id: ChatRoomId,
    pub content: String,
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Ownership is computed against the viewer at read time, never cached
    pub fn is_own(&self, viewer: Option<&str>) -> bool {
        viewer.map_or(false, |v| v == self.sender_id)
    }
}

/// A chat message as the server sends it, in REST responses and `new_message` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: MessageId,
    pub chat_room_id: ChatRoomId,
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Echo of the sender's temporary id, present on the sender's own messages
    #[serde(default)]
    pub temp_id: Option<TempId>,
}

impl From<InboundMessage> for Message {
    fn from(inbound: InboundMessage) -> Self {
        Message {
            identity: Identity::Server(inbound.id),
            chat_room_id: inbound.chat_room_id,
            content: inbound.content,
            sender_id: inbound.sender_id,
            timestamp: inbound.timestamp,
            delivery_state: DeliveryState::Confirmed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub is_read: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingDecision {
    Approve,
    Reject,
}
