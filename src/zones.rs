//! Weather-zone classification by great-circle distance.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Weather zones in canonical enumeration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    North,
    Centre,
    South,
}

impl Zone {
    pub const ALL: [Zone; 3] = [Zone::North, Zone::Centre, Zone::South];

    /// Fixed (lat, lon) anchor of the zone's weather station.
    pub fn anchor(self) -> (f64, f64) {
        match self {
            Zone::North => (53.38, -6.26),
            Zone::Centre => (53.34, -6.26),
            Zone::South => (53.29, -6.26),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Zone::North => "north",
            Zone::Centre => "centre",
            Zone::South => "south",
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Zone {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Zone::ALL
            .into_iter()
            .find(|z| z.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| PipelineError::InvalidInput(format!("unknown weather zone `{s}`")))
    }
}

/// Haversine distance in kilometres between two (lat, lon) points in degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Nearest zone anchor; exact ties go to the earlier zone in [`Zone::ALL`].
/// Non-finite coordinates get no zone.
pub fn classify(lat: f64, lon: f64) -> Option<Zone> {
    let anchors = Zone::ALL.map(|z| (z, z.anchor()));
    nearest_anchor(lat, lon, &anchors)
}

/// First anchor of minimum distance, in slice order.
pub(crate) fn nearest_anchor(lat: f64, lon: f64, anchors: &[(Zone, (f64, f64))]) -> Option<Zone> {
    if !lat.is_finite() || !lon.is_finite() {
        return None;
    }

    let mut best: Option<(Zone, f64)> = None;
    for &(zone, (alat, alon)) in anchors {
        let d = haversine_km(lat, lon, alat, alon);
        match best {
            Some((_, best_d)) if d >= best_d => {}
            _ => best = Some((zone, d)),
        }
    }
    best.map(|(zone, _)| zone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_points_classify_to_themselves() {
        for zone in Zone::ALL {
            let (lat, lon) = zone.anchor();
            assert_eq!(classify(lat, lon), Some(zone));
        }
    }

    #[test]
    fn test_exact_tie_goes_to_first_zone() {
        let anchors = [
            (Zone::South, (53.30, -6.20)),
            (Zone::North, (53.30, -6.20)),
        ];
        assert_eq!(nearest_anchor(53.35, -6.25, &anchors), Some(Zone::South));
    }

    #[test]
    fn test_classification_is_repeatable() {
        let first = classify(53.31, -6.20);
        let second = classify(53.31, -6.20);
        assert_eq!(first, second);
        assert_eq!(first, Some(Zone::South));
    }

    #[test]
    fn test_non_finite_coordinates_get_no_zone() {
        assert_eq!(classify(f64::NAN, -6.26), None);
        assert_eq!(classify(53.3, f64::INFINITY), None);
    }

    #[test]
    fn test_haversine_one_degree_of_latitude() {
        let d = haversine_km(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111.19).abs() < 0.01);
    }

    #[test]
    fn test_zone_parses_case_insensitively() {
        assert_eq!("Centre".parse::<Zone>().unwrap(), Zone::Centre);
        assert!("east".parse::<Zone>().is_err());
    }
}
