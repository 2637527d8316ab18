// Pure transition functions for a ride and its passengers
// Ride level: `scheduled | rescheduled | delayed -> in_progress -> completed`,
// and `cancelled` from any non-terminal status. Passenger level:
// `booked -> picked_up -> dropped_off`, and `booked -> cancelled`.
// Every function returns `Ok(true)` when it changed the ride, `Ok(false)`
// when the ride was already in the target state (so replaying an event is a
// no-op) and `Err` when the move is not allowed.

use chrono::{DateTime, Utc};
use log::warn;

use crate::error::ValidationError;
use crate::models::{PassengerState, RideSession, RideStatus};

pub fn can_transition(from: RideStatus, to: RideStatus) -> bool {
    match (from, to) {
        _ if from.is_terminal() => false,
        (_, RideStatus::Cancelled) => true,
        (_, RideStatus::InProgress) => from.is_pre_start(),
        (RideStatus::InProgress, RideStatus::Completed) => true,
        // The server may delay or reschedule a ride that has not started
        (_, _) if from.is_pre_start() && to.is_pre_start() => true,
        _ => false,
    }
}

pub fn set_status(ride: &mut RideSession, to: RideStatus) -> Result<bool, ValidationError> {
    if ride.status == to {
        return Ok(false);
    }
    if ride.status.is_terminal() {
        return Err(ValidationError::RideTerminal(ride.status));
    }
    if !can_transition(ride.status, to) {
        return Err(ValidationError::InvalidTransition { from: ride.status, to });
    }
    ride.status = to;
    Ok(true)
}

pub fn start(ride: &mut RideSession) -> Result<bool, ValidationError> {
    set_status(ride, RideStatus::InProgress)
}

pub fn complete(ride: &mut RideSession) -> Result<bool, ValidationError> {
    set_status(ride, RideStatus::Completed)
}

pub fn cancel(ride: &mut RideSession) -> Result<bool, ValidationError> {
    set_status(ride, RideStatus::Cancelled)
}

fn passenger_mut<'a>(ride: &'a mut RideSession, passenger_id: &str) -> Result<&'a mut PassengerState, ValidationError> {
    let ride_id = ride.id.clone();
    ride.passenger_mut(passenger_id).ok_or_else(|| ValidationError::UnknownPassenger {
        ride_id,
        passenger_id: passenger_id.to_string(),
    })
}

pub fn pick_up(ride: &mut RideSession, passenger_id: &str, at: DateTime<Utc>) -> Result<bool, ValidationError> {
    let in_progress = ride.status == RideStatus::InProgress;
    let passenger = passenger_mut(ride, passenger_id)?;
    if passenger.picked_up {
        return Ok(false);
    }
    if passenger.cancelled {
        return Err(ValidationError::AlreadyCancelled);
    }
    if !in_progress {
        return Err(ValidationError::RideNotInProgress);
    }
    passenger.picked_up = true;
    passenger.pickup_time = Some(at);
    Ok(true)
}

pub fn drop_off(ride: &mut RideSession, passenger_id: &str, at: DateTime<Utc>) -> Result<bool, ValidationError> {
    let passenger = passenger_mut(ride, passenger_id)?;
    if passenger.dropped_off {
        return Ok(false);
    }
    if passenger.cancelled {
        return Err(ValidationError::AlreadyCancelled);
    }
    if !passenger.picked_up {
        return Err(ValidationError::NotPickedUp);
    }
    passenger.dropped_off = true;
    passenger.dropoff_time = Some(at);
    Ok(true)
}

pub fn cancel_passenger(ride: &mut RideSession, passenger_id: &str, reason: Option<&str>) -> Result<bool, ValidationError> {
    if ride.status.is_terminal() {
        return Err(ValidationError::RideTerminal(ride.status));
    }
    let passenger = passenger_mut(ride, passenger_id)?;
    if passenger.cancelled {
        return Ok(false);
    }
    if passenger.picked_up {
        return Err(ValidationError::AlreadyPickedUp);
    }
    passenger.cancelled = true;
    passenger.cancellation_reason = reason.map(str::to_string);
    Ok(true)
}

/// A confirmed pickup proves the ride has started, even if `ride_started` has not arrived yet.
/// Nothing changes when the passenger cannot be picked up.
pub fn confirm_pickup(ride: &mut RideSession, passenger_id: &str, at: DateTime<Utc>) -> Result<bool, ValidationError> {
    all_or_nothing(ride, |next| {
        let promoted = promote_to_in_progress(next);
        Ok(pick_up(next, passenger_id, at)? || promoted)
    })
}

/// A confirmed dropoff also proves the pickup
pub fn confirm_dropoff(ride: &mut RideSession, passenger_id: &str, at: DateTime<Utc>) -> Result<bool, ValidationError> {
    all_or_nothing(ride, |next| {
        let promoted = promote_to_in_progress(next);
        let passenger = passenger_mut(next, passenger_id)?;
        let mut changed = promoted;
        if !passenger.picked_up && !passenger.cancelled {
            passenger.picked_up = true;
            changed = true;
        }
        Ok(drop_off(next, passenger_id, at)? || changed)
    })
}

/// Server-announced completion; a ride still in a pre-start status passes through `in_progress`
pub fn confirm_completed(ride: &mut RideSession) -> Result<bool, ValidationError> {
    all_or_nothing(ride, |next| {
        let promoted = promote_to_in_progress(next);
        Ok(complete(next)? || promoted)
    })
}

// Run a multi-step change on a copy; the ride only takes it on success
fn all_or_nothing<F>(ride: &mut RideSession, change: F) -> Result<bool, ValidationError>
where
    F: FnOnce(&mut RideSession) -> Result<bool, ValidationError>,
{
    let mut next = ride.clone();
    let changed = change(&mut next)?;
    *ride = next;
    Ok(changed)
}

fn promote_to_in_progress(ride: &mut RideSession) -> bool {
    if ride.status.is_pre_start() {
        ride.status = RideStatus::InProgress;
        true
    } else {
        false
    }
}

/// True when the ride is underway and every non-cancelled passenger is dropped off
pub fn is_complete(ride: &RideSession) -> bool {
    if ride.status != RideStatus::InProgress {
        return false;
    }
    let mut active = ride.active_passengers().peekable();
    active.peek().is_some() && active.all(|p| p.dropped_off)
}

/// Apply the completion rule; returns whether the ride just completed
pub fn derive_completion(ride: &mut RideSession) -> bool {
    if is_complete(ride) {
        ride.status = RideStatus::Completed;
        true
    } else {
        false
    }
}

/// Repair passenger flags that contradict each other in a server payload
pub fn normalize(ride: &mut RideSession) {
    for passenger in ride.passengers.iter_mut() {
        if passenger.dropped_off && !passenger.picked_up {
            passenger.picked_up = true;
        }
        if passenger.picked_up && passenger.cancelled {
            warn!(
                "Ride {}: passenger {} is both picked up and cancelled, keeping pickup",
                ride.id, passenger.user_id
            );
            passenger.cancelled = false;
            passenger.cancellation_reason = None;
        }
    }
    if ride.passengers.iter().any(|p| p.picked_up) {
        promote_to_in_progress(ride);
    }
}

/// Merge a server snapshot into the local authoritative copy.
/// Status never moves backwards and passenger flags never revert; a terminal ride is left untouched.
pub fn merge_snapshot(current: &RideSession, incoming: RideSession) -> RideSession {
    if current.status.is_terminal() {
        return current.clone();
    }
    let mut merged = incoming;
    if merged.status.rank() < current.status.rank() {
        merged.status = current.status;
    }
    for passenger in merged.passengers.iter_mut() {
        let Some(local) = current.passenger(&passenger.user_id) else {
            continue;
        };
        if local.picked_up && !passenger.picked_up {
            passenger.picked_up = true;
            passenger.pickup_time = passenger.pickup_time.or(local.pickup_time);
        }
        if local.dropped_off && !passenger.dropped_off {
            passenger.dropped_off = true;
            passenger.dropoff_time = passenger.dropoff_time.or(local.dropoff_time);
        }
        if local.cancelled && !passenger.cancelled && !passenger.picked_up {
            passenger.cancelled = true;
            passenger.cancellation_reason = passenger
                .cancellation_reason
                .take()
                .or_else(|| local.cancellation_reason.clone());
        }
    }
    normalize(&mut merged);
    derive_completion(&mut merged);
    merged
}
