// Transport seam for the channel session
// A transport only knows how to open one connection; reconnects and room membership live in the session

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::events::Frame;
use crate::error::SyncError;

/// One live connection: frames go out on `outbound`, arrive on `inbound`.
/// The connection is considered lost once `inbound` yields `None` or `outbound` is closed.
pub struct Connection {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Connection, SyncError>;
}
