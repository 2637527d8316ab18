// Ride session state machine
// Canonical per-ride state, fed by local actions (optimistic where allowed) and by
// server events. Local actions are split in two steps so the caller can do the
// network round trip in between: `begin_*` validates and applies the optimistic
// part, `settle` applies the ack. Every path goes through the identity-keyed ledger.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;

pub mod transitions;

use crate::channel::{AckResponse, ClientEvent, ServerEvent};
use crate::error::{SyncError, ValidationError};
use crate::ledger::{EntryState, Ledger, LedgerEntity};
use crate::models::{Identity, RideId, RideSession, RideStatus, TempId, UserId};

impl LedgerEntity for RideSession {
    type Key = RideId;

    fn identity(&self) -> Identity<RideId> {
        Identity::Server(self.id.clone())
    }
}

/// A locally initiated ride action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RideAction {
    Start,
    ConfirmPickup { passenger_id: UserId },
    ConfirmDropoff { passenger_id: UserId },
    CancelPassenger { passenger_id: UserId },
    /// `passenger_id` is set when a passenger cancels their own booking
    CancelRide { passenger_id: Option<UserId> },
    Complete,
}

impl RideAction {
    /// Whether the authoritative ride already shows this action as done (or moot)
    fn is_satisfied_by(&self, ride: &RideSession) -> bool {
        let passenger = |id: &str| ride.passenger(id);
        match self {
            RideAction::Start => ride.status.rank() >= RideStatus::InProgress.rank(),
            RideAction::ConfirmPickup { passenger_id } => passenger(passenger_id.as_str()).map_or(true, |p| p.picked_up),
            RideAction::ConfirmDropoff { passenger_id } => passenger(passenger_id.as_str()).map_or(true, |p| p.dropped_off),
            RideAction::CancelPassenger { passenger_id } | RideAction::CancelRide { passenger_id: Some(passenger_id) } => {
                ride.status.is_terminal() || passenger(passenger_id.as_str()).map_or(true, |p| p.cancelled)
            }
            RideAction::CancelRide { passenger_id: None } => ride.status == RideStatus::Cancelled,
            RideAction::Complete => ride.status == RideStatus::Completed,
        }
    }
}

/// An action that passed validation; emit `event`, then hand the ack to `RideStore::settle`
#[derive(Debug, Clone)]
pub struct PendingRideAction {
    pub temp_id: TempId,
    pub ride_id: RideId,
    pub action: RideAction,
    pub event: ClientEvent,
}

#[derive(Debug, Clone)]
struct InFlight {
    ride_id: RideId,
    action: RideAction,
    optimistic: bool,
}

pub struct RideStore {
    viewer: Option<UserId>,
    rides: Ledger<RideSession>,
    in_flight: HashMap<TempId, InFlight>,
}

impl RideStore {
    pub fn new(viewer: Option<UserId>) -> Self {
        RideStore {
            viewer,
            rides: Ledger::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn set_viewer(&mut self, viewer: UserId) {
        self.viewer = Some(viewer);
    }

    pub fn viewer(&self) -> Option<&str> {
        self.viewer.as_deref()
    }

    pub fn ride(&self, ride_id: &str) -> Option<&RideSession> {
        self.rides.get_by_key(&ride_id.to_string())
    }

    pub fn rides(&self) -> impl Iterator<Item = &RideSession> {
        self.rides.values()
    }

    /// `Pending` while an optimistic action on the ride awaits its ack
    pub fn ride_state(&self, ride_id: &str) -> Option<EntryState> {
        self.rides.state(&Identity::Server(ride_id.to_string()))
    }

    /// Whether an action is still waiting for an ack or an authoritative event
    pub fn is_in_flight(&self, temp_id: TempId) -> bool {
        self.in_flight.contains_key(&temp_id)
    }

    fn require_viewer(&self) -> Result<UserId, ValidationError> {
        self.viewer.clone().ok_or(ValidationError::ViewerUnknown)
    }

    fn require_ride(&self, ride_id: &str) -> Result<RideSession, ValidationError> {
        self.ride(ride_id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownRide(ride_id.to_string()))
    }

    fn require_driver(&self, ride_id: &str) -> Result<(UserId, RideSession), ValidationError> {
        let viewer = self.require_viewer()?;
        let ride = self.require_ride(ride_id)?;
        if !ride.is_driver(&viewer) {
            return Err(ValidationError::NotDriver);
        }
        Ok((viewer, ride))
    }

    fn record(&mut self, ride_id: &str, action: RideAction, optimistic: bool, temp_id: TempId, event: ClientEvent) -> PendingRideAction {
        self.in_flight.insert(
            temp_id,
            InFlight { ride_id: ride_id.to_string(), action: action.clone(), optimistic },
        );
        debug!("Ride {}: {:?} in flight as {}", ride_id, action, temp_id);
        PendingRideAction { temp_id, ride_id: ride_id.to_string(), action, event }
    }

    fn optimistic<F>(&mut self, temp_id: TempId, ride_id: &str, mutation: F)
    where
        F: Fn(&mut RideSession) + Send + Sync + 'static,
    {
        if self.rides.begin_optimistic_update(temp_id, &ride_id.to_string(), mutation).is_none() {
            warn!("Ride {} vanished before optimistic update", ride_id);
        }
    }

    /// Driver starts the ride; optimistic `in_progress`
    pub fn begin_start(&mut self, ride_id: &str) -> Result<PendingRideAction, SyncError> {
        let (driver_id, ride) = self.require_driver(ride_id)?;
        if !ride.status.is_pre_start() {
            return Err(match ride.status {
                s if s.is_terminal() => ValidationError::RideTerminal(s),
                s => ValidationError::InvalidTransition { from: s, to: RideStatus::InProgress },
            }
            .into());
        }
        let temp_id = TempId::new();
        self.optimistic(temp_id, ride_id, |r| {
            let _ = transitions::start(r);
        });
        let event = ClientEvent::StartRide { ride_id: ride_id.to_string(), driver_id };
        Ok(self.record(ride_id, RideAction::Start, true, temp_id, event))
    }

    /// Driver confirms a pickup with the passenger's OTP. Nothing changes locally
    /// until the server accepts the OTP.
    pub fn begin_pickup(&mut self, ride_id: &str, passenger_id: &str, otp: &str) -> Result<PendingRideAction, SyncError> {
        let (driver_id, ride) = self.require_driver(ride_id)?;
        if ride.status != RideStatus::InProgress {
            return Err(ValidationError::RideNotInProgress.into());
        }
        let passenger = ride.passenger(passenger_id).ok_or_else(|| ValidationError::UnknownPassenger {
            ride_id: ride_id.to_string(),
            passenger_id: passenger_id.to_string(),
        })?;
        if passenger.cancelled {
            return Err(ValidationError::AlreadyCancelled.into());
        }
        if passenger.picked_up {
            return Err(ValidationError::AlreadyPickedUp.into());
        }
        let event = ClientEvent::ConfirmPickup {
            ride_id: ride_id.to_string(),
            passenger_id: passenger_id.to_string(),
            driver_id,
            otp: otp.to_string(),
        };
        let action = RideAction::ConfirmPickup { passenger_id: passenger_id.to_string() };
        Ok(self.record(ride_id, action, false, TempId::new(), event))
    }

    /// Driver drops a passenger off; optimistic `droppedOff` stamped with the local clock
    pub fn begin_dropoff(&mut self, ride_id: &str, passenger_id: &str) -> Result<PendingRideAction, SyncError> {
        let (driver_id, ride) = self.require_driver(ride_id)?;
        let passenger = ride.passenger(passenger_id).ok_or_else(|| ValidationError::UnknownPassenger {
            ride_id: ride_id.to_string(),
            passenger_id: passenger_id.to_string(),
        })?;
        if passenger.cancelled {
            return Err(ValidationError::AlreadyCancelled.into());
        }
        if !passenger.picked_up {
            return Err(ValidationError::NotPickedUp.into());
        }
        if passenger.dropped_off {
            return Err(ValidationError::AlreadyDroppedOff.into());
        }
        let temp_id = TempId::new();
        let at = Utc::now();
        let pid = passenger_id.to_string();
        self.optimistic(temp_id, ride_id, move |r| {
            let _ = transitions::drop_off(r, &pid, at);
        });
        let event = ClientEvent::ConfirmDropoff {
            ride_id: ride_id.to_string(),
            passenger_id: passenger_id.to_string(),
            driver_id,
        };
        let action = RideAction::ConfirmDropoff { passenger_id: passenger_id.to_string() };
        Ok(self.record(ride_id, action, true, temp_id, event))
    }

    /// Driver removes a passenger who has not been picked up; optimistic
    pub fn begin_cancel_passenger(&mut self, ride_id: &str, passenger_id: &str, reason: &str) -> Result<PendingRideAction, SyncError> {
        let (driver_id, ride) = self.require_driver(ride_id)?;
        let mut probe = ride;
        transitions::cancel_passenger(&mut probe, passenger_id, Some(reason))?;

        let temp_id = TempId::new();
        let pid = passenger_id.to_string();
        let why = reason.to_string();
        self.optimistic(temp_id, ride_id, move |r| {
            let _ = transitions::cancel_passenger(r, &pid, Some(&why));
        });
        let event = ClientEvent::CancelPassengerRide {
            ride_id: ride_id.to_string(),
            passenger_id: passenger_id.to_string(),
            driver_id,
            reason: reason.to_string(),
        };
        let action = RideAction::CancelPassenger { passenger_id: passenger_id.to_string() };
        Ok(self.record(ride_id, action, true, temp_id, event))
    }

    /// The driver cancels the whole ride; a passenger cancels their own booking,
    /// which is refused once they have been picked up
    pub fn begin_cancel_ride(&mut self, ride_id: &str, reason: &str) -> Result<PendingRideAction, SyncError> {
        let viewer = self.require_viewer()?;
        let ride = self.require_ride(ride_id)?;
        if ride.status.is_terminal() {
            return Err(ValidationError::RideTerminal(ride.status).into());
        }

        let temp_id = TempId::new();
        let action = if ride.is_driver(&viewer) {
            self.optimistic(temp_id, ride_id, |r| {
                let _ = transitions::cancel(r);
            });
            RideAction::CancelRide { passenger_id: None }
        } else {
            let passenger = ride.passenger(&viewer).ok_or(ValidationError::NotParticipant)?;
            if passenger.picked_up {
                return Err(ValidationError::AlreadyPickedUp.into());
            }
            if passenger.cancelled {
                return Err(ValidationError::AlreadyCancelled.into());
            }
            let pid = viewer.clone();
            let why = reason.to_string();
            self.optimistic(temp_id, ride_id, move |r| {
                let _ = transitions::cancel_passenger(r, &pid, Some(&why));
            });
            RideAction::CancelRide { passenger_id: Some(viewer.clone()) }
        };
        let event = ClientEvent::CancelRide {
            ride_id: ride_id.to_string(),
            user_id: viewer,
            reason: reason.to_string(),
        };
        Ok(self.record(ride_id, action, true, temp_id, event))
    }

    /// Driver ends the ride explicitly; applied once acknowledged
    pub fn begin_complete(&mut self, ride_id: &str) -> Result<PendingRideAction, SyncError> {
        let (driver_id, ride) = self.require_driver(ride_id)?;
        if ride.status != RideStatus::InProgress {
            return Err(match ride.status {
                s if s.is_terminal() => ValidationError::RideTerminal(s),
                _ => ValidationError::RideNotInProgress,
            }
            .into());
        }
        let event = ClientEvent::CompleteRide { ride_id: ride_id.to_string(), driver_id };
        Ok(self.record(ride_id, RideAction::Complete, false, TempId::new(), event))
    }

    /// Apply the ack for an action started with one of the `begin_*` methods.
    ///
    /// Success makes the action authoritative. A rejection or a send failure
    /// rolls back the optimistic part and returns the error. A timeout leaves the
    /// action in flight: the next authoritative event settles it. An action
    /// already settled by such an event ignores its late ack.
    pub fn settle(&mut self, temp_id: TempId, outcome: Result<AckResponse, SyncError>) -> Result<(), SyncError> {
        let Some(flight) = self.in_flight.get(&temp_id).cloned() else {
            debug!("Ack for {} after it was settled, ignoring", temp_id);
            return Ok(());
        };

        match outcome {
            Ok(_) => {
                self.in_flight.remove(&temp_id);
                if flight.optimistic {
                    self.rides.confirm_in_place(temp_id);
                } else {
                    self.apply_acknowledged(&flight);
                }
                info!("Ride {}: {:?} acknowledged", flight.ride_id, flight.action);
                self.after_authoritative_change(&flight.ride_id);
                Ok(())
            }
            Err(e) if e.is_ambiguous() => {
                warn!("Ride {}: {:?} outcome unknown, waiting for the server: {}", flight.ride_id, flight.action, e);
                Err(e)
            }
            Err(e) => {
                self.in_flight.remove(&temp_id);
                if flight.optimistic {
                    self.rides.reject(temp_id, &e.to_string());
                    info!("Ride {}: rolled back {:?}: {}", flight.ride_id, flight.action, e);
                }
                Err(e)
            }
        }
    }

    fn apply_acknowledged(&mut self, flight: &InFlight) {
        let now = Utc::now();
        let key = Identity::Server(flight.ride_id.clone());
        self.rides.update_base(&key, |ride| {
            let result = match &flight.action {
                RideAction::ConfirmPickup { passenger_id } => transitions::confirm_pickup(ride, passenger_id, now),
                RideAction::Complete => transitions::confirm_completed(ride),
                other => {
                    warn!("Unexpected non-optimistic action {:?}", other);
                    Ok(false)
                }
            };
            if let Err(e) = result {
                warn!("Ride {}: acknowledged {:?} no longer applies: {}", ride.id, flight.action, e);
            }
        });
    }

    /// Merge ride lists fetched over REST
    pub fn merge_snapshot(&mut self, rides: Vec<RideSession>) -> Vec<RideSession> {
        let mut changed = Vec::new();
        for ride in rides {
            let ride_id = ride.id.clone();
            self.upsert(ride);
            if let Some(ride) = self.ride(&ride_id) {
                changed.push(ride.clone());
            }
        }
        changed
    }

    fn upsert(&mut self, mut ride: RideSession) {
        let ride_id = ride.id.clone();
        transitions::normalize(&mut ride);
        transitions::derive_completion(&mut ride);
        self.rides.reconcile_external_with(ride, transitions::merge_snapshot);
        self.after_authoritative_change(&ride_id);
    }

    /// Single entry point for server-pushed ride events. Returns the ride if the
    /// event concerned a known ride, so the caller can publish it.
    pub fn apply_inbound(&mut self, event: &ServerEvent) -> Option<RideSession> {
        let ride_id = event.ride_id()?.to_string();

        if let ServerEvent::RideUpdate { ride, cancelled_passenger_id } = event {
            self.upsert(ride.clone());
            if let Some(passenger_id) = cancelled_passenger_id {
                self.apply_base(&ride_id, |r| transitions::cancel_passenger(r, passenger_id, None));
            }
            return self.ride(&ride_id).cloned();
        }

        let Some(current) = self.rides.authoritative(&ride_id) else {
            debug!("Ignoring event for ride {} not mirrored locally", ride_id);
            return None;
        };
        if current.status.is_terminal() {
            debug!("Ignoring event for {} ride {}", current.status, ride_id);
            return None;
        }

        let now = Utc::now();
        match event {
            ServerEvent::RideStarted { .. } => self.apply_base(&ride_id, transitions::start),
            ServerEvent::PickupConfirmed { passenger_id, pickup_time, .. } => {
                let at = pickup_time.unwrap_or(now);
                self.apply_base(&ride_id, |r| transitions::confirm_pickup(r, passenger_id, at))
            }
            ServerEvent::PassengerDroppedOff { passenger_id, dropoff_time, .. } => {
                let at = dropoff_time.unwrap_or(now);
                self.apply_base(&ride_id, |r| transitions::confirm_dropoff(r, passenger_id, at))
            }
            ServerEvent::RideCompleted { .. } => self.apply_base(&ride_id, transitions::confirm_completed),
            ServerEvent::RideCancelled { cancelled_passenger_id: Some(passenger_id), reason, .. } => {
                self.apply_base(&ride_id, |r| transitions::cancel_passenger(r, passenger_id, reason.as_deref()))
            }
            ServerEvent::RideCancelled { cancelled_passenger_id: None, .. } => self.apply_base(&ride_id, transitions::cancel),
            // Approach notices and locations carry no ride state
            _ => return None,
        }
        self.ride(&ride_id).cloned()
    }

    fn apply_base<F>(&mut self, ride_id: &str, change: F)
    where
        F: FnOnce(&mut RideSession) -> Result<bool, ValidationError>,
    {
        let Some(mut next) = self.rides.authoritative(&ride_id.to_string()).cloned() else {
            return;
        };
        match change(&mut next) {
            Ok(true) => {
                debug!("Ride {} updated from server", ride_id);
                let key = Identity::Server(ride_id.to_string());
                self.rides.update_base(&key, |ride| *ride = next);
            }
            Ok(false) => debug!("Ride {}: duplicate event, no change", ride_id),
            Err(e) => {
                warn!("Ride {}: ignoring inconsistent server event: {}", ride_id, e);
                return;
            }
        }
        self.after_authoritative_change(ride_id);
    }

    /// Re-derive completion and settle in-flight actions the server has already carried out
    fn after_authoritative_change(&mut self, ride_id: &str) {
        let key = Identity::Server(ride_id.to_string());
        self.rides.update_base(&key, |ride| {
            if transitions::derive_completion(ride) {
                info!("Ride {} completed: every active passenger dropped off", ride.id);
            }
        });

        let Some(base) = self.rides.authoritative(&ride_id.to_string()).cloned() else {
            return;
        };
        let settled: Vec<(TempId, bool)> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.ride_id == ride_id && f.action.is_satisfied_by(&base))
            .map(|(temp_id, f)| (*temp_id, f.optimistic))
            .collect();
        for (temp_id, optimistic) in settled {
            self.in_flight.remove(&temp_id);
            if optimistic {
                self.rides.confirm_in_place(temp_id);
            }
            debug!("Ride {}: {} settled by server event", ride_id, temp_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Booking, Coordinates, PassengerState};
    use std::time::Duration;

    fn ride(id: &str, status: RideStatus, passengers: &[&str]) -> RideSession {
        RideSession {
            id: id.to_string(),
            status,
            driver_id: "D1".to_string(),
            start_location: Coordinates { lat: 52.37, lng: 4.89 },
            end_location: Coordinates { lat: 52.09, lng: 5.12 },
            passengers: passengers
                .iter()
                .map(|p| PassengerState::new(*p, Booking::SeatsBooked(1)))
                .collect(),
        }
    }

    fn driver_store(r: RideSession) -> RideStore {
        let mut store = RideStore::new(Some("D1".to_string()));
        store.merge_snapshot(vec![r]);
        store
    }

    fn timeout() -> SyncError {
        SyncError::ChannelTimeout { event: "x".to_string(), timeout: Duration::from_millis(10) }
    }

    fn rejection(reason: &str) -> SyncError {
        SyncError::ServerRejection { action: "x".to_string(), reason: reason.to_string() }
    }

    #[test]
    fn test_start_is_optimistic_and_rolls_back_on_rejection() {
        let mut store = driver_store(ride("R1", RideStatus::Delayed, &["U1"]));
        let pending = store.begin_start("R1").unwrap();
        assert_eq!(store.ride("R1").unwrap().status, RideStatus::InProgress);
        assert_eq!(store.ride_state("R1"), Some(EntryState::Pending));
        assert!(matches!(pending.event, ClientEvent::StartRide { .. }));

        let err = store.settle(pending.temp_id, Err(rejection("vehicle not verified"))).unwrap_err();
        assert_eq!(err, rejection("vehicle not verified"));
        assert_eq!(store.ride("R1").unwrap().status, RideStatus::Delayed);
        assert_eq!(store.ride_state("R1"), Some(EntryState::Confirmed));
    }

    #[test]
    fn test_only_driver_may_start() {
        let mut store = RideStore::new(Some("U1".to_string()));
        store.merge_snapshot(vec![ride("R1", RideStatus::Scheduled, &["U1"])]);
        assert_eq!(store.begin_start("R1").unwrap_err(), SyncError::Validation(ValidationError::NotDriver));
        assert_eq!(store.ride("R1").unwrap().status, RideStatus::Scheduled);
    }

    #[test]
    fn test_pickup_is_not_optimistic() {
        let mut store = driver_store(ride("R1", RideStatus::InProgress, &["U1"]));
        let pending = store.begin_pickup("R1", "U1", "0000").unwrap();
        assert!(!store.ride("R1").unwrap().passenger("U1").unwrap().picked_up);

        let err = store.settle(pending.temp_id, Err(rejection("Invalid OTP"))).unwrap_err();
        assert!(matches!(err, SyncError::ServerRejection { .. }));
        assert!(!store.ride("R1").unwrap().passenger("U1").unwrap().picked_up);

        let pending = store.begin_pickup("R1", "U1", "4821").unwrap();
        store.settle(pending.temp_id, Ok(AckResponse::ok())).unwrap();
        assert!(store.ride("R1").unwrap().passenger("U1").unwrap().picked_up);
    }

    #[test]
    fn test_dropoff_before_pickup_is_rejected_locally() {
        let mut store = driver_store(ride("R1", RideStatus::InProgress, &["U1"]));
        let before = store.ride("R1").cloned();
        let err = store.begin_dropoff("R1", "U1").unwrap_err();
        assert_eq!(err, SyncError::Validation(ValidationError::NotPickedUp));
        assert_eq!(store.ride("R1").cloned(), before);
        assert_eq!(store.ride_state("R1"), Some(EntryState::Confirmed));
    }

    #[test]
    fn test_dropoff_ack_derives_completion() {
        let mut store = driver_store(ride("R1", RideStatus::InProgress, &["U1"]));
        let pickup = store.begin_pickup("R1", "U1", "1234").unwrap();
        store.settle(pickup.temp_id, Ok(AckResponse::ok())).unwrap();

        let dropoff = store.begin_dropoff("R1", "U1").unwrap();
        assert!(store.ride("R1").unwrap().passenger("U1").unwrap().dropped_off);
        assert_eq!(store.ride("R1").unwrap().status, RideStatus::InProgress);

        store.settle(dropoff.temp_id, Ok(AckResponse::ok())).unwrap();
        assert_eq!(store.ride("R1").unwrap().status, RideStatus::Completed);
    }

    #[test]
    fn test_ride_completed_event_before_dropoff_ack() {
        let mut r = ride("R1", RideStatus::InProgress, &["U1"]);
        r.passengers[0].picked_up = true;
        let mut store = driver_store(r);
        let dropoff = store.begin_dropoff("R1", "U1").unwrap();

        store.apply_inbound(&ServerEvent::PassengerDroppedOff {
            ride_id: "R1".into(),
            passenger_id: "U1".into(),
            dropoff_time: None,
        });
        store.apply_inbound(&ServerEvent::RideCompleted { ride_id: "R1".into() });
        assert_eq!(store.ride("R1").unwrap().status, RideStatus::Completed);
        assert!(!store.is_in_flight(dropoff.temp_id));

        // The late ack is a no-op
        let snapshot = store.ride("R1").cloned();
        store.settle(dropoff.temp_id, Ok(AckResponse::ok())).unwrap();
        assert_eq!(store.ride("R1").cloned(), snapshot);
        assert_eq!(store.ride_state("R1"), Some(EntryState::Confirmed));
    }

    #[test]
    fn test_timeout_keeps_action_pending_until_server_event() {
        let mut store = driver_store(ride("R1", RideStatus::Scheduled, &["U1"]));
        let start = store.begin_start("R1").unwrap();
        assert!(store.settle(start.temp_id, Err(timeout())).unwrap_err().is_ambiguous());
        assert_eq!(store.ride("R1").unwrap().status, RideStatus::InProgress);
        assert_eq!(store.ride_state("R1"), Some(EntryState::Pending));
        assert!(store.is_in_flight(start.temp_id));

        store.apply_inbound(&ServerEvent::RideStarted { ride_id: "R1".into() });
        assert!(!store.is_in_flight(start.temp_id));
        assert_eq!(store.ride_state("R1"), Some(EntryState::Confirmed));
        assert_eq!(store.ride("R1").unwrap().status, RideStatus::InProgress);
    }

    #[test]
    fn test_duplicate_pickup_event_is_idempotent() {
        let mut store = driver_store(ride("R1", RideStatus::InProgress, &["U1", "U2"]));
        let event = ServerEvent::PickupConfirmed {
            ride_id: "R1".into(),
            passenger_id: "U1".into(),
            pickup_time: None,
        };
        let once = store.apply_inbound(&event).unwrap();
        let twice = store.apply_inbound(&event).unwrap();
        assert_eq!(once, twice);
        assert!(twice.passenger("U1").unwrap().picked_up);
    }

    #[test]
    fn test_cancel_passenger_after_pickup_is_rejected_before_emission() {
        let mut r = ride("R1", RideStatus::InProgress, &["U1"]);
        r.passengers[0].picked_up = true;
        let mut store = driver_store(r);
        let err = store.begin_cancel_passenger("R1", "U1", "rude").unwrap_err();
        assert_eq!(err, SyncError::Validation(ValidationError::AlreadyPickedUp));
        assert!(!store.ride("R1").unwrap().passenger("U1").unwrap().cancelled);
        assert_eq!(store.ride_state("R1"), Some(EntryState::Confirmed));
    }

    #[test]
    fn test_cancel_passenger_removes_route_stops() {
        let mut store = driver_store(ride("R1", RideStatus::Scheduled, &["U1", "U2"]));
        assert_eq!(store.ride("R1").unwrap().route_stops().len(), 4);
        store.begin_cancel_passenger("R1", "U2", "no show").unwrap();
        let r = store.ride("R1").unwrap();
        assert!(r.route_stops().iter().all(|s| s.passenger_id == "U1"));
        assert_eq!(r.active_passengers().count(), 1);
    }

    #[test]
    fn test_picked_up_passenger_cannot_cancel_ride() {
        let mut r = ride("R1", RideStatus::InProgress, &["U1"]);
        r.passengers[0].picked_up = true;
        let mut store = RideStore::new(Some("U1".to_string()));
        store.merge_snapshot(vec![r]);
        assert_eq!(
            store.begin_cancel_ride("R1", "changed my mind").unwrap_err(),
            SyncError::Validation(ValidationError::AlreadyPickedUp)
        );
    }

    #[test]
    fn test_passenger_cancel_only_touches_own_booking() {
        let mut store = RideStore::new(Some("U2".to_string()));
        store.merge_snapshot(vec![ride("R1", RideStatus::Scheduled, &["U1", "U2"])]);
        let pending = store.begin_cancel_ride("R1", "busy").unwrap();
        assert_eq!(pending.action, RideAction::CancelRide { passenger_id: Some("U2".into()) });
        let r = store.ride("R1").unwrap();
        assert_eq!(r.status, RideStatus::Scheduled);
        assert!(r.passenger("U2").unwrap().cancelled);
        assert!(!r.passenger("U1").unwrap().cancelled);
    }

    #[test]
    fn test_events_for_terminal_rides_are_ignored() {
        let mut store = driver_store(ride("R1", RideStatus::Cancelled, &["U1"]));
        assert!(store.apply_inbound(&ServerEvent::RideStarted { ride_id: "R1".into() }).is_none());
        assert_eq!(store.ride("R1").unwrap().status, RideStatus::Cancelled);
    }

    #[test]
    fn test_ride_update_cancelled_passenger_filtered_from_active() {
        let mut store = driver_store(ride("R1", RideStatus::InProgress, &["U1", "U2"]));
        let updated = store
            .apply_inbound(&ServerEvent::RideUpdate {
                ride: ride("R1", RideStatus::InProgress, &["U1", "U2"]),
                cancelled_passenger_id: Some("U2".into()),
            })
            .unwrap();
        let active: Vec<&str> = updated.active_passengers().map(|p| p.user_id.as_str()).collect();
        assert_eq!(active, vec!["U1"]);
    }

    #[test]
    fn test_inconsistent_pickup_event_does_not_start_ride() {
        let mut store = driver_store(ride("R1", RideStatus::Scheduled, &["U1", "U2"]));
        store.apply_inbound(&ServerEvent::RideUpdate {
            ride: ride("R1", RideStatus::Scheduled, &["U1", "U2"]),
            cancelled_passenger_id: Some("U2".into()),
        });

        for passenger in ["GHOST", "U2"] {
            store.apply_inbound(&ServerEvent::PickupConfirmed {
                ride_id: "R1".into(),
                passenger_id: passenger.into(),
                pickup_time: None,
            });
        }
        store.apply_inbound(&ServerEvent::PassengerDroppedOff {
            ride_id: "R1".into(),
            passenger_id: "GHOST".into(),
            dropoff_time: None,
        });

        let r = store.ride("R1").unwrap();
        assert_eq!(r.status, RideStatus::Scheduled);
        assert!(!r.passenger("U1").unwrap().picked_up);
        assert!(!r.passenger("U2").unwrap().picked_up);
        assert_eq!(store.ride_state("R1"), Some(EntryState::Confirmed));

        store.apply_inbound(&ServerEvent::PickupConfirmed {
            ride_id: "R1".into(),
            passenger_id: "U1".into(),
            pickup_time: None,
        });
        assert_eq!(store.ride("R1").unwrap().status, RideStatus::InProgress);
    }
}
