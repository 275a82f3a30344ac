//! Minute join: raw vehicle samples + per-trip delays + static trip routes.

use std::collections::HashMap;

use tracing::debug;

use crate::types::{DelaySample, MinuteRecord, TripRef, VehicleSample};

/// Floors an epoch timestamp to the start of its minute.
pub fn floor_minute(ts: i64) -> i64 {
    ts.div_euclid(60) * 60
}

/// Latest delay reading per `(trip_id, minute)`.
///
/// Readings without a value are ignored. When two readings share a timestamp
/// the later one in table order wins.
pub fn delay_lookup(delays: &[DelaySample]) -> HashMap<(String, i64), f64> {
    let mut latest: HashMap<(String, i64), (i64, f64)> = HashMap::new();
    for d in delays {
        let Some(delay) = d.delay_sec else { continue };
        let key = (d.trip_id.clone(), floor_minute(d.timestamp));
        match latest.get(&key) {
            Some(&(ts, _)) if ts > d.timestamp => {}
            _ => {
                latest.insert(key, (d.timestamp, delay));
            }
        }
    }
    latest.into_iter().map(|(k, (_, v))| (k, v)).collect()
}

/// Builds one [`MinuteRecord`] per raw sample, in input order.
pub fn join_minutes(
    vehicles: Vec<VehicleSample>,
    delays: &[DelaySample],
    trips: &[TripRef],
) -> Vec<MinuteRecord> {
    let routes: HashMap<&str, &str> = trips
        .iter()
        .map(|t| (t.trip_id.as_str(), t.route_id.as_str()))
        .collect();
    let lookup = delay_lookup(delays);

    let mut with_delay = 0usize;
    let rows: Vec<MinuteRecord> = vehicles
        .into_iter()
        .map(|v| {
            let minute = floor_minute(v.timestamp);
            let route_id = v
                .route_id
                .filter(|r| !r.is_empty())
                .or_else(|| routes.get(v.trip_id.as_str()).map(|r| r.to_string()));
            let delay_sec = lookup.get(&(v.trip_id.clone(), minute)).copied();
            if delay_sec.is_some() {
                with_delay += 1;
            }

            MinuteRecord {
                vehicle_id: v.vehicle_id,
                trip_id: v.trip_id,
                route_id,
                direction_id: v.direction_id,
                timestamp: minute,
                lat: v.lat,
                lon: v.lon,
                speed_kph: v.speed_kph,
                delay_sec,
                ..Default::default()
            }
        })
        .collect();

    debug!(rows = rows.len(), with_delay, "Minute join complete");
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(trip: &str, route: Option<&str>, ts: i64) -> VehicleSample {
        VehicleSample {
            vehicle_id: "bus-1".into(),
            trip_id: trip.into(),
            route_id: route.map(String::from),
            direction_id: Some(0),
            timestamp: ts,
            lat: Some(53.35),
            lon: Some(-6.26),
            speed_kph: Some(22.0),
        }
    }

    fn delay(trip: &str, ts: i64, secs: Option<f64>) -> DelaySample {
        DelaySample {
            trip_id: trip.into(),
            timestamp: ts,
            delay_sec: secs,
        }
    }

    #[test]
    fn test_floor_minute() {
        assert_eq!(floor_minute(1_720_000_019), 1_719_999_960);
        assert_eq!(floor_minute(120), 120);
        assert_eq!(floor_minute(-1), -60);
    }

    #[test]
    fn test_latest_delay_in_minute_wins() {
        let delays = vec![
            delay("t1", 1_020, Some(60.0)),
            delay("t1", 1_050, Some(120.0)),
            delay("t1", 1_030, Some(90.0)),
            delay("t1", 1_055, None),
        ];
        let rows = join_minutes(vec![sample("t1", Some("r1"), 1_025)], &delays, &[]);
        assert_eq!(rows[0].timestamp, 1_020);
        assert_eq!(rows[0].delay_sec, Some(120.0));
    }

    #[test]
    fn test_missing_delay_stays_empty() {
        let rows = join_minutes(
            vec![sample("t1", Some("r1"), 1_025)],
            &[delay("t2", 1_025, Some(30.0))],
            &[],
        );
        assert_eq!(rows[0].delay_sec, None);
    }

    #[test]
    fn test_route_filled_from_trips() {
        let trips = vec![TripRef {
            trip_id: "t1".into(),
            route_id: "r9".into(),
            shape_id: None,
        }];
        let rows = join_minutes(
            vec![
                sample("t1", None, 60),
                sample("t1", Some(""), 60),
                sample("t1", Some("r1"), 60),
                sample("unknown", None, 60),
            ],
            &[],
            &trips,
        );
        assert_eq!(rows[0].route_id.as_deref(), Some("r9"));
        assert_eq!(rows[1].route_id.as_deref(), Some("r9"));
        assert_eq!(rows[2].route_id.as_deref(), Some("r1"));
        assert_eq!(rows[3].route_id, None);
    }

    #[test]
    fn test_blank_direction_does_not_drop_the_table() {
        let path = std::env::temp_dir().join(format!("bus_stress_join_dir_{}.csv", std::process::id()));
        std::fs::write(
            &path,
            "vehicle_id,trip_id,route_id,direction_id,timestamp,lat,lon,speed_kph\n\
             v1,t1,r1,,1720000800,53.34,-6.26,20\n\
             v2,t2,r1,1,1720000800,53.34,-6.26,20\n",
        )
        .unwrap();
        let vehicles: Vec<VehicleSample> = crate::table::read_table(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let rows = join_minutes(vehicles, &[], &[]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].direction_id, None);
        assert_eq!(rows[1].direction_id, Some(1));
    }
}
