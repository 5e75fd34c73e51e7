// src/core/presence/relay_select.rs

//! Relay selection for a connecting client (§4.7): the two geographically
//! nearest online relays, relays with unknown location sorting last, or two
//! at random if the client itself has no location.

use crate::core::model::Relay;
use rand::seq::SliceRandom;

const EARTH_RADIUS_KM: f64 = 6371.0;

fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Picks up to two relays for a client at `client_geo`. With no client
/// location, the choice is random rather than biased toward whichever
/// relays happen first in the online set.
pub fn select_relays(client_geo: Option<(f64, f64)>, relays: &[Relay]) -> Vec<Relay> {
    let Some(client_geo) = client_geo else {
        let mut pool: Vec<Relay> = relays.to_vec();
        pool.shuffle(&mut rand::thread_rng());
        pool.truncate(2);
        return pool;
    };

    let mut ranked: Vec<(Option<f64>, &Relay)> = relays
        .iter()
        .map(|r| {
            let distance = match (r.lat, r.lon) {
                (Some(lat), Some(lon)) => Some(haversine_km(client_geo, (lat, lon))),
                _ => None,
            };
            (distance, r)
        })
        .collect();

    ranked.sort_by(|(a, _), (b, _)| match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });

    ranked.into_iter().take(2).map(|(_, r)| r.clone()).collect()
}
