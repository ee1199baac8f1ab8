pub mod pricing;

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6_371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        valid_latitude(self.lat) && valid_longitude(self.lng)
    }
}

pub fn valid_latitude(lat: f64) -> bool {
    lat.is_finite() && (-90.0..=90.0).contains(&lat)
}

pub fn valid_longitude(lng: f64) -> bool {
    lng.is_finite() && (-180.0..=180.0).contains(&lng)
}

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().atan2((1.0 - haversine).sqrt());

    EARTH_RADIUS_KM * central_angle
}

/// Route distance as stored on an order, rounded to 10 m.
pub fn route_distance_km(pickup: &GeoPoint, dropoff: &GeoPoint) -> f64 {
    pricing::round2(haversine_km(pickup, dropoff))
}

#[cfg(test)]
mod tests {
    use super::{haversine_km, route_distance_km, valid_latitude, valid_longitude, GeoPoint};

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 55.7558,
            lng: 37.6173,
        };
        let distance = haversine_km(&p, &p);
        assert!(distance < 1e-9);
    }

    #[test]
    fn moscow_to_saint_petersburg_is_around_634_km() {
        let moscow = GeoPoint {
            lat: 55.7558,
            lng: 37.6173,
        };
        let spb = GeoPoint {
            lat: 59.9343,
            lng: 30.3351,
        };
        let distance = route_distance_km(&moscow, &spb);
        assert!((distance - 634.0).abs() < 5.0);
        assert_eq!(distance, (distance * 100.0).round() / 100.0);
    }

    #[test]
    fn coordinate_bounds_are_inclusive() {
        assert!(valid_latitude(90.0));
        assert!(valid_latitude(-90.0));
        assert!(!valid_latitude(91.0));
        assert!(!valid_latitude(f64::NAN));
        assert!(valid_longitude(-180.0));
        assert!(!valid_longitude(180.5));
    }
}
