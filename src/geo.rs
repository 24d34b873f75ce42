//! Pure geo math used by the impossible-travel and simultaneous-locations
//! rules. No I/O, no adapter dependency — the core trusts adapter-provided
//! coordinates verbatim (spec.md §9: "the core should depend on
//! adapter-provided normalized strings and not re-derive").

const EARTH_RADIUS_KM: f64 = 6371.0;

/// A point on the earth's surface in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        GeoPoint { lat, lon }
    }
}

/// Great-circle distance between two points, in kilometers (haversine).
pub fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let sin_dlat = (dlat / 2.0).sin();
    let sin_dlon = (dlon / 2.0).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().asin();
    EARTH_RADIUS_KM * c
}

/// Speed in km/h required to cover `distance_km` in `elapsed_hours`.
///
/// Returns `f64::INFINITY` if `elapsed_hours <= 0.0` and the distance is
/// nonzero — an instantaneous relocation is always "impossible".
pub fn required_speed_kmh(distance_km: f64, elapsed_hours: f64) -> f64 {
    if elapsed_hours <= 0.0 {
        return if distance_km > 0.0 { f64::INFINITY } else { 0.0 };
    }
    distance_km / elapsed_hours
}
