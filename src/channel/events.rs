// Wire events exchanged over the channel
// Payloads are validated into closed enums at the boundary; nothing untyped reaches the stores

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::SyncError;
use crate::models::{
    Coordinates, InboundMessage, Notification, RideId, RideSession, UserId,
};

/// Events the client emits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Join { user_id: UserId },
    JoinRide { ride_id: RideId, user_id: UserId },
    LeaveRide { ride_id: RideId },
    UpdateLocation { ride_id: RideId, driver_id: UserId, location: Coordinates },
    ConfirmPickup { ride_id: RideId, passenger_id: UserId, driver_id: UserId, otp: String },
    ConfirmDropoff { ride_id: RideId, passenger_id: UserId, driver_id: UserId },
    StartRide { ride_id: RideId, driver_id: UserId },
    CompleteRide { ride_id: RideId, driver_id: UserId },
    CancelRide { ride_id: RideId, user_id: UserId, reason: String },
    CancelPassengerRide { ride_id: RideId, passenger_id: UserId, driver_id: UserId, reason: String },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join { .. } => "join",
            ClientEvent::JoinRide { .. } => "join_ride",
            ClientEvent::LeaveRide { .. } => "leave_ride",
            ClientEvent::UpdateLocation { .. } => "update_location",
            ClientEvent::ConfirmPickup { .. } => "confirm_pickup",
            ClientEvent::ConfirmDropoff { .. } => "confirm_dropoff",
            ClientEvent::StartRide { .. } => "start_ride",
            ClientEvent::CompleteRide { .. } => "complete_ride",
            ClientEvent::CancelRide { .. } => "cancel_ride",
            ClientEvent::CancelPassengerRide { .. } => "cancel_passenger_ride",
        }
    }

    /// Split into the event name and its JSON payload
    pub fn to_parts(&self) -> (String, Value) {
        let payload = match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        (self.name().to_string(), payload)
    }
}

/// Events the server pushes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    RideUpdate { ride: RideSession, cancelled_passenger_id: Option<UserId> },
    LocationUpdated { ride_id: RideId, location: Coordinates, observed_at: Option<DateTime<Utc>> },
    RideStarted { ride_id: RideId },
    ApproachingPickup { ride_id: RideId, passenger_id: UserId },
    ApproachingDropoff { ride_id: RideId, passenger_id: UserId },
    PickupConfirmed { ride_id: RideId, passenger_id: UserId, pickup_time: Option<DateTime<Utc>> },
    PassengerDroppedOff { ride_id: RideId, passenger_id: UserId, dropoff_time: Option<DateTime<Utc>> },
    RideCompleted { ride_id: RideId },
    RideCancelled { ride_id: RideId, reason: Option<String>, cancelled_passenger_id: Option<UserId> },
    NewMessage(InboundMessage),
    NewNotification(Notification),
}

/// Every event name the server may push
pub const SERVER_EVENT_NAMES: &[&str] = &[
    "ride_update",
    "location_updated",
    "ride_started",
    "approaching_pickup",
    "approaching_dropoff",
    "pickup_confirmed",
    "passenger_dropped_off",
    "ride_completed",
    "ride_cancelled",
    "new_message",
    "new_notification",
];

impl ServerEvent {
    /// Validate a raw event into its typed variant
    pub fn parse(event: &str, payload: Value) -> Result<Self, SyncError> {
        serde_json::from_value(json!({ "event": event, "payload": payload })).map_err(|e| SyncError::Protocol {
            event: event.to_string(),
            reason: e.to_string(),
        })
    }

    /// The ride this event concerns, if any
    pub fn ride_id(&self) -> Option<&str> {
        match self {
            ServerEvent::RideUpdate { ride, .. } => Some(&ride.id),
            ServerEvent::LocationUpdated { ride_id, .. }
            | ServerEvent::RideStarted { ride_id }
            | ServerEvent::ApproachingPickup { ride_id, .. }
            | ServerEvent::ApproachingDropoff { ride_id, .. }
            | ServerEvent::PickupConfirmed { ride_id, .. }
            | ServerEvent::PassengerDroppedOff { ride_id, .. }
            | ServerEvent::RideCompleted { ride_id }
            | ServerEvent::RideCancelled { ride_id, .. } => Some(ride_id),
            ServerEvent::NewMessage(_) | ServerEvent::NewNotification(_) => None,
        }
    }
}

/// Rooms the client is a member of; membership is replayed after every reconnect
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    User(UserId),
    Ride { ride_id: RideId, user_id: UserId },
}

impl Topic {
    pub fn join_event(&self) -> ClientEvent {
        match self {
            Topic::User(user_id) => ClientEvent::Join { user_id: user_id.clone() },
            Topic::Ride { ride_id, user_id } => ClientEvent::JoinRide {
                ride_id: ride_id.clone(),
                user_id: user_id.clone(),
            },
        }
    }

    /// The personal room has no explicit leave event
    pub fn leave_event(&self) -> Option<ClientEvent> {
        match self {
            Topic::User(_) => None,
            Topic::Ride { ride_id, .. } => Some(ClientEvent::LeaveRide { ride_id: ride_id.clone() }),
        }
    }
}

/// Acknowledgement body: `{ "success": true }` or `{ "success": false, "error": "..." }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl AckResponse {
    pub fn ok() -> Self {
        AckResponse { success: true, error: None, data: Value::Null }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        AckResponse { success: false, error: Some(reason.into()), data: Value::Null }
    }
}

/// Unit of transfer on the connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client to server, with an ack id when a reply is expected
    Emit {
        event: String,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
    /// Server push
    Event { event: String, payload: Value },
    Ack { ack: u64, response: AckResponse },
}
