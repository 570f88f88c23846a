use crate::models::LocationSample;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Distance grand-cercle entre deux points, en mètres.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Longueur cumulée d'une trace, en kilomètres.
pub fn route_km(samples: &[LocationSample]) -> f64 {
    samples
        .windows(2)
        .map(|w| haversine_m(w[0].latitude, w[0].longitude, w[1].latitude, w[1].longitude))
        .sum::<f64>()
        / 1000.0
}
