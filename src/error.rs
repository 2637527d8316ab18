// Error taxonomy for the synchronizer
// Validation errors are raised before any network call and never leave an
// optimistic mutation behind. Timeouts are ambiguous: the action may or may
// not have happened, so callers keep pending state and wait for an
// authoritative event instead of deciding locally.

use std::time::Duration;
use thiserror::Error;

use crate::models::RideStatus;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// Transient connection failure; the session keeps reconnecting
    #[error("Channel connection error: {0}")]
    ChannelConnection(String),

    /// No ack arrived in time; the outcome is unknown
    #[error("No acknowledgement for '{event}' within {timeout:?}, outcome unknown")]
    ChannelTimeout { event: String, timeout: Duration },

    /// A local precondition failed
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The server answered with an error
    #[error("Server rejected '{action}': {reason}")]
    ServerRejection { action: String, reason: String },

    #[error("Location sampling failed: {0}")]
    LocationSampling(LocationErrorKind),

    #[error("Message delivery failed: {0}")]
    DeliveryFailure(String),

    /// A REST call lost the race against its deadline; the outcome is unknown
    #[error("Request '{request}' timed out after {timeout:?}, outcome unknown")]
    RequestTimeout { request: String, timeout: Duration },

    #[error("Request failed: {0}")]
    Request(String),

    /// Inbound payload that failed boundary validation
    #[error("Malformed '{event}' event: {reason}")]
    Protocol { event: String, reason: String },
}

impl SyncError {
    /// True when the action may have happened and the next authoritative event decides
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, SyncError::ChannelTimeout { .. } | SyncError::RequestTimeout { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown ride {0}")]
    UnknownRide(String),
    #[error("passenger {passenger_id} is not on ride {ride_id}")]
    UnknownPassenger { ride_id: String, passenger_id: String },
    #[error("unknown chat thread {0}")]
    UnknownThread(String),
    #[error("unknown notification {0}")]
    UnknownNotification(String),
    #[error("only the driver may do this")]
    NotDriver,
    #[error("user is neither the driver nor a passenger of this ride")]
    NotParticipant,
    #[error("cannot move ride from {from} to {to}")]
    InvalidTransition { from: RideStatus, to: RideStatus },
    #[error("ride is not in progress")]
    RideNotInProgress,
    #[error("passenger has not been picked up")]
    NotPickedUp,
    #[error("passenger has already been picked up")]
    AlreadyPickedUp,
    #[error("passenger has already been dropped off")]
    AlreadyDroppedOff,
    #[error("passenger booking is already cancelled")]
    AlreadyCancelled,
    #[error("ride is {0} and can no longer change")]
    RideTerminal(RideStatus),
    #[error("current user is not known yet")]
    ViewerUnknown,
    #[error("message is empty")]
    EmptyMessage,
    #[error("message has not failed")]
    NotFailed,
}

/// Sub-kinds of a failed position sample, each surfaced with its own message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum LocationErrorKind {
    #[error("permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("timeout")]
    Timeout,
    #[error("unknown error")]
    Unknown,
}

impl LocationErrorKind {
    pub fn user_message(self) -> &'static str {
        match self {
            LocationErrorKind::PermissionDenied => {
                "Location permission denied. Enable location access so passengers can follow the ride."
            }
            LocationErrorKind::PositionUnavailable => {
                "Your position is currently unavailable. Check GPS or network signal."
            }
            LocationErrorKind::Timeout => "Getting your position took too long. Retrying.",
            LocationErrorKind::Unknown => "Could not read your location. Retrying.",
        }
    }
}
