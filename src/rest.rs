// REST collaborators the synchronizer consumes
// Only the contracts live here; responses are treated as authoritative snapshots.

use async_trait::async_trait;
use log::warn;
use std::future::Future;
use std::time::Duration;

use crate::error::SyncError;
use crate::models::{BookingDecision, InboundMessage, Notification, RideSession, TempId};

/// `GET /rides/driver` and `GET /rides/passenger`
#[async_trait]
pub trait RideApi: Send + Sync {
    async fn driver_rides(&self) -> Result<Vec<RideSession>, SyncError>;
    async fn passenger_rides(&self) -> Result<Vec<RideSession>, SyncError>;
}

/// `GET/POST /chats/...`
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn history(&self, chat_room_id: &str) -> Result<Vec<InboundMessage>, SyncError>;

    /// The temp id is echoed back on the `new_message` event for this message
    async fn send_message(&self, chat_room_id: &str, content: &str, temp_id: TempId) -> Result<InboundMessage, SyncError>;
}

/// `GET/PATCH/DELETE /notifications/...`
#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn list(&self) -> Result<Vec<Notification>, SyncError>;
    async fn mark_read(&self, id: &str) -> Result<(), SyncError>;
    async fn delete(&self, id: &str) -> Result<(), SyncError>;
    async fn respond_to_booking(&self, id: &str, decision: BookingDecision) -> Result<(), SyncError>;
}

/// Race `request` against `deadline`. Losing the race is `RequestTimeout`, an
/// unknown outcome, and the late result is discarded.
pub async fn with_deadline<T, F>(deadline: Duration, request: &str, future: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    match tokio::time::timeout(deadline, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Request '{}' did not finish within {:?}", request, deadline);
            Err(SyncError::RequestTimeout {
                request: request.to_string(),
                timeout: deadline,
            })
        }
    }
}
