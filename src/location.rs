// Location broadcast loop (driver side) and latest-location cache (viewer side)

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::channel::{ChannelSession, ClientEvent};
use crate::error::{LocationErrorKind, SyncError};
use crate::models::{Coordinates, LocationSample, RideId, UserId};
use crate::sync::SyncUpdate;

/// Device positioning, supplied by the platform layer
#[async_trait]
pub trait PositionSource: Send + Sync {
    async fn current_position(&self) -> Result<Coordinates, LocationErrorKind>;
}

/// Where sampled positions go; the channel session in production
#[async_trait]
pub trait LocationPublisher: Send + Sync {
    async fn publish(&self, event: &ClientEvent) -> Result<(), SyncError>;
}

#[async_trait]
impl LocationPublisher for ChannelSession {
    async fn publish(&self, event: &ClientEvent) -> Result<(), SyncError> {
        self.send(event).await
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub interval: Duration,
    pub sample_timeout: Duration,
}

/// Handle to a running sampling loop. The loop stops on `stop()` or when the handle is dropped.
pub struct LocationLoop {
    ride_id: RideId,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl LocationLoop {
    pub fn start(
        ride_id: &str,
        driver_id: &str,
        source: Arc<dyn PositionSource>,
        publisher: Arc<dyn LocationPublisher>,
        settings: LoopSettings,
        updates: mpsc::Sender<SyncUpdate>,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run_loop(
            ride_id.to_string(),
            driver_id.to_string(),
            source,
            publisher,
            settings,
            updates,
            stop_rx,
        ));
        LocationLoop {
            ride_id: ride_id.to_string(),
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn ride_id(&self) -> &str {
        &self.ride_id
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Stop the loop and wait for it to finish
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for LocationLoop {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run_loop(
    ride_id: RideId,
    driver_id: UserId,
    source: Arc<dyn PositionSource>,
    publisher: Arc<dyn LocationPublisher>,
    settings: LoopSettings,
    updates: mpsc::Sender<SyncUpdate>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Location broadcast started for ride {} every {:?}", ride_id, settings.interval);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        let sampled = tokio::time::timeout(settings.sample_timeout, source.current_position()).await;
        let coordinates = match sampled {
            Ok(Ok(coordinates)) => coordinates,
            Ok(Err(kind)) => {
                report_failure(&updates, &ride_id, kind);
                continue;
            }
            Err(_) => {
                report_failure(&updates, &ride_id, LocationErrorKind::Timeout);
                continue;
            }
        };

        let event = ClientEvent::UpdateLocation {
            ride_id: ride_id.clone(),
            driver_id: driver_id.clone(),
            location: coordinates,
        };
        if let Err(e) = publisher.publish(&event).await {
            debug!("Location for ride {} not sent: {}", ride_id, e);
        }
        let sample = LocationSample {
            ride_id: ride_id.clone(),
            coordinates,
            observed_at: Utc::now(),
        };
        if updates.try_send(SyncUpdate::LocationUpdated(sample)).is_err() {
            debug!("Update channel full, dropping local location sample");
        }
    }

    info!("Location broadcast stopped for ride {}", ride_id);
}

fn report_failure(updates: &mpsc::Sender<SyncUpdate>, ride_id: &str, kind: LocationErrorKind) {
    warn!("Location sample for ride {} failed: {}", ride_id, kind);
    let update = SyncUpdate::LocationError {
        ride_id: ride_id.to_string(),
        kind,
        message: kind.user_message().to_string(),
    };
    if updates.try_send(update).is_err() {
        debug!("Update channel full, dropping location error");
    }
}

/// Latest known position per watched ride; no history is kept
#[derive(Debug, Default)]
pub struct LocationCache {
    latest: HashMap<RideId, Option<LocationSample>>,
}

impl LocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, ride_id: &str) {
        self.latest.entry(ride_id.to_string()).or_insert(None);
    }

    pub fn unwatch(&mut self, ride_id: &str) {
        self.latest.remove(ride_id);
    }

    pub fn is_watching(&self, ride_id: &str) -> bool {
        self.latest.contains_key(ride_id)
    }

    pub fn latest(&self, ride_id: &str) -> Option<&LocationSample> {
        self.latest.get(ride_id).and_then(|s| s.as_ref())
    }

    /// Keep the sample if its ride is watched and it is not older than what we have
    pub fn apply(&mut self, sample: LocationSample) -> bool {
        let Some(slot) = self.latest.get_mut(&sample.ride_id) else {
            debug!("Ignoring location for unwatched ride {}", sample.ride_id);
            return false;
        };
        if let Some(current) = slot {
            if current.observed_at > sample.observed_at {
                debug!("Ignoring stale location for ride {}", sample.ride_id);
                return false;
            }
        }
        *slot = Some(sample);
        true
    }
}
