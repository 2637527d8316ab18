// Client-side synchronization for shared rides: ride lifecycle, live location,
// chat and notifications over one persistent channel plus REST snapshots.

pub mod channel;
pub mod chat;
pub mod config;
pub mod error;
pub mod ledger;
pub mod location;
pub mod models;
pub mod notifications;
pub mod rest;
pub mod ride;
pub mod sync;

pub use channel::{ChannelSession, ConnectionStatus};
pub use config::SyncConfig;
pub use error::{LocationErrorKind, SyncError, ValidationError};
pub use models::*;
pub use sync::{Collaborators, SyncState, SyncUpdate, Synchronizer};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ride_snapshot_parses_from_wire_format() {
        let ride: RideSession = serde_json::from_value(serde_json::json!({
            "id": "R1",
            "status": "in_progress",
            "driverId": "D1",
            "startLocation": { "lat": 52.52, "lng": 13.40 },
            "endLocation": { "lat": 48.13, "lng": 11.58 },
            "passengers": [
                { "userId": "U1", "seatsBooked": 2, "pickedUp": true },
                { "userId": "U2", "cargoBooked": 1, "cancelled": true, "cancellationReason": "sick" }
            ]
        }))
        .unwrap();

        assert_eq!(ride.status, RideStatus::InProgress);
        assert_eq!(ride.passengers[0].booking, Booking::SeatsBooked(2));
        assert_eq!(ride.passengers[0].phase(), PassengerPhase::PickedUp);
        assert_eq!(ride.passengers[1].booking, Booking::CargoBooked(1));
        assert_eq!(ride.active_passengers().count(), 1);
    }

    #[test]
    fn test_route_stops_skip_served_and_cancelled_passengers() {
        let mut picked = PassengerState::new("U1", Booking::SeatsBooked(1));
        picked.picked_up = true;
        let waiting = PassengerState::new("U2", Booking::SeatsBooked(1));
        let mut cancelled = PassengerState::new("U3", Booking::SeatsBooked(1));
        cancelled.cancelled = true;

        let ride = RideSession {
            id: "R1".into(),
            status: RideStatus::InProgress,
            driver_id: "D1".into(),
            start_location: Coordinates { lat: 0.0, lng: 0.0 },
            end_location: Coordinates { lat: 1.0, lng: 1.0 },
            passengers: vec![picked, waiting, cancelled],
        };
        let stops: Vec<(String, StopKind)> = ride
            .route_stops()
            .into_iter()
            .map(|s| (s.passenger_id, s.kind))
            .collect();
        assert_eq!(
            stops,
            vec![
                ("U2".to_string(), StopKind::Pickup),
                ("U1".to_string(), StopKind::Dropoff),
                ("U2".to_string(), StopKind::Dropoff),
            ]
        );
    }
}
