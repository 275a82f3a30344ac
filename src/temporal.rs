//! Zone-partitioned nearest-time join of vehicle minutes with weather.
//!
//! Each zone has its own weather series, so a vehicle-minute is only ever
//! matched against readings from the zone it was classified into.

use std::collections::HashMap;

use chrono::{DateTime, Timelike};
use chrono_tz::Europe::Dublin;
use tracing::debug;

use crate::join::floor_minute;
use crate::types::{MinuteRecord, WeatherObservation};
use crate::zones::{Zone, classify};

/// Largest accepted gap between a vehicle-minute and its weather reading.
pub const WEATHER_TOLERANCE_SECS: i64 = 7 * 60 + 30;

/// Minute-floored readings of one zone, sorted by time.
#[derive(Debug, Default)]
pub struct ZoneSeries {
    minutes: Vec<i64>,
    readings: Vec<(Option<f64>, Option<f64>)>,
}

impl ZoneSeries {
    /// Index of the reading closest to `minute`, within `tolerance` inclusive.
    ///
    /// An equidistant earlier and later reading resolves to the earlier one;
    /// duplicate timestamps resolve to the last reading loaded.
    pub fn nearest(&self, minute: i64, tolerance: i64) -> Option<usize> {
        let split = self.minutes.partition_point(|&m| m <= minute);
        let before = split.checked_sub(1);
        // last of the run sharing the first later minute
        let after = self.minutes.get(split).map(|&next| {
            split + self.minutes[split..].partition_point(|&m| m <= next) - 1
        });

        let pick = match (before, after) {
            (Some(b), Some(a)) => {
                if minute - self.minutes[b] <= self.minutes[a] - minute {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return None,
        };

        ((self.minutes[pick] - minute).abs() <= tolerance).then_some(pick)
    }

    pub fn reading(&self, idx: usize) -> (Option<f64>, Option<f64>) {
        self.readings[idx]
    }

    pub fn len(&self) -> usize {
        self.minutes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.minutes.is_empty()
    }
}

/// Splits weather readings into per-zone series. Readings for zones outside
/// the fixed zone set are dropped.
pub fn weather_by_zone(observations: &[WeatherObservation]) -> HashMap<Zone, ZoneSeries> {
    let mut tagged: Vec<(Zone, i64, usize)> = Vec::with_capacity(observations.len());
    let mut unknown = 0usize;
    for (i, obs) in observations.iter().enumerate() {
        match obs.zone.parse::<Zone>() {
            Ok(zone) => tagged.push((zone, floor_minute(obs.timestamp), i)),
            Err(_) => unknown += 1,
        }
    }
    if unknown > 0 {
        debug!(unknown, "Weather readings with unknown zone dropped");
    }

    // stable: equal minutes keep table order
    tagged.sort_by_key(|&(zone, minute, _)| (zone, minute));

    let mut series: HashMap<Zone, ZoneSeries> = HashMap::new();
    for (zone, minute, i) in tagged {
        let entry = series.entry(zone).or_default();
        entry.minutes.push(minute);
        entry.readings.push((observations[i].rain_mm, observations[i].temp_c));
    }
    series
}

/// Irish civic wall-clock time for an epoch timestamp, offset discarded.
pub fn local_time_ie(ts: i64) -> Option<String> {
    let utc = DateTime::from_timestamp(ts, 0)?;
    Some(
        utc.with_timezone(&Dublin)
            .naive_local()
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    )
}

/// Hour of day (0-23) in Irish civic time.
pub fn local_hour_ie(ts: i64) -> Option<u32> {
    let utc = DateTime::from_timestamp(ts, 0)?;
    Some(utc.with_timezone(&Dublin).hour())
}

/// Left-preserving weather join. Output rows are in input order.
///
/// Rows without usable coordinates get no zone and therefore no weather.
pub fn join_weather(
    rows: Vec<MinuteRecord>,
    observations: &[WeatherObservation],
) -> Vec<MinuteRecord> {
    let series = weather_by_zone(observations);
    let mut matched = 0usize;

    let out: Vec<MinuteRecord> = rows
        .into_iter()
        .map(|mut row| {
            let minute = floor_minute(row.timestamp);
            row.zone = row.position().and_then(|(lat, lon)| classify(lat, lon));
            row.datetime_ie = local_time_ie(row.timestamp);

            let reading = row
                .zone
                .and_then(|z| series.get(&z))
                .and_then(|s| s.nearest(minute, WEATHER_TOLERANCE_SECS).map(|i| s.reading(i)));
            match reading {
                Some((rain, temp)) => {
                    matched += 1;
                    row.rain_mm = rain;
                    row.temp_c = temp;
                }
                None => {
                    row.rain_mm = None;
                    row.temp_c = None;
                }
            }
            row
        })
        .collect();

    debug!(rows = out.len(), matched, unmatched = out.len() - matched, "Weather join complete");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_720_000_800; // 2024-07-03 10:00:00 UTC, a 15-minute mark

    fn obs(zone: &str, ts: i64, rain: f64, temp: f64) -> WeatherObservation {
        WeatherObservation {
            zone: zone.into(),
            timestamp: ts,
            rain_mm: Some(rain),
            temp_c: Some(temp),
        }
    }

    fn minute_at(zone: Zone, ts: i64) -> MinuteRecord {
        let (lat, lon) = zone.anchor();
        MinuteRecord {
            vehicle_id: "v".into(),
            trip_id: "t".into(),
            timestamp: ts,
            lat: Some(lat),
            lon: Some(lon),
            ..Default::default()
        }
    }

    #[test]
    fn test_match_seven_minutes_away() {
        // minute flooring puts the vehicle at T0 + 7m, inside the 7m30s bound
        let weather = vec![obs("centre", T0, 1.0, 20.0)];
        let out = join_weather(vec![minute_at(Zone::Centre, T0 + 459)], &weather);
        assert_eq!(out[0].temp_c, Some(20.0));
    }

    #[test]
    fn test_no_match_beyond_tolerance() {
        // minute-floored vehicle time sits 8 minutes from the only reading
        let weather = vec![obs("centre", T0, 1.0, 20.0)];
        let out = join_weather(vec![minute_at(Zone::Centre, T0 + 480)], &weather);
        assert_eq!(out[0].zone, Some(Zone::Centre));
        assert_eq!(out[0].temp_c, None);
        assert_eq!(out[0].rain_mm, None);
    }

    #[test]
    fn test_join_is_zone_partitioned() {
        // the north reading is closer in time but belongs to another zone
        let weather = vec![
            obs("north", T0, 0.0, 30.0),
            obs("south", T0 + 420, 2.0, 12.0),
        ];
        let out = join_weather(vec![minute_at(Zone::South, T0)], &weather);
        assert_eq!(out[0].zone, Some(Zone::South));
        assert_eq!(out[0].temp_c, Some(12.0));
    }

    #[test]
    fn test_equidistant_prefers_earlier_reading() {
        let weather = vec![
            obs("north", T0 + 600, 0.0, 16.0),
            obs("north", T0, 0.0, 14.0),
        ];
        let out = join_weather(vec![minute_at(Zone::North, T0 + 300)], &weather);
        assert_eq!(out[0].temp_c, Some(14.0));
    }

    #[test]
    fn test_duplicate_minute_takes_last_loaded_on_either_side() {
        let later = vec![obs("centre", T0 + 300, 1.0, 15.0), obs("centre", T0 + 300, 2.0, 15.0)];
        let out = join_weather(vec![minute_at(Zone::Centre, T0)], &later);
        assert_eq!(out[0].rain_mm, Some(2.0));

        let earlier = vec![obs("centre", T0, 1.0, 15.0), obs("centre", T0, 2.0, 15.0)];
        let out = join_weather(vec![minute_at(Zone::Centre, T0 + 300)], &earlier);
        assert_eq!(out[0].rain_mm, Some(2.0));
    }

    #[test]
    fn test_series_tolerance_is_inclusive() {
        let series = weather_by_zone(&[obs("centre", T0, 0.0, 10.0)]);
        let centre = &series[&Zone::Centre];
        assert_eq!(centre.nearest(T0 + WEATHER_TOLERANCE_SECS, WEATHER_TOLERANCE_SECS), Some(0));
        assert_eq!(centre.nearest(T0 - WEATHER_TOLERANCE_SECS - 1, WEATHER_TOLERANCE_SECS), None);
    }

    #[test]
    fn test_rows_without_position_are_kept_unmatched() {
        let weather = vec![obs("centre", T0, 1.0, 20.0)];
        let mut row = minute_at(Zone::Centre, T0);
        row.lat = None;
        let out = join_weather(vec![row], &weather);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].zone, None);
        assert_eq!(out[0].temp_c, None);
    }

    #[test]
    fn test_output_keeps_input_order() {
        let weather = vec![obs("centre", T0, 1.0, 20.0), obs("north", T0, 0.0, 18.0)];
        let rows = vec![
            minute_at(Zone::North, T0 + 60),
            minute_at(Zone::Centre, T0),
            minute_at(Zone::North, T0),
        ];
        let out = join_weather(rows, &weather);
        let stamps: Vec<i64> = out.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![T0 + 60, T0, T0]);
        assert_eq!(out[1].temp_c, Some(20.0));
    }

    #[test]
    fn test_local_time_follows_irish_summer_time() {
        assert_eq!(local_time_ie(1_720_000_000).as_deref(), Some("2024-07-03 10:46:40"));
        assert_eq!(local_time_ie(1_704_067_200).as_deref(), Some("2024-01-01 00:00:00"));
        assert_eq!(local_hour_ie(1_720_000_000), Some(10));
        assert_eq!(local_hour_ie(1_704_067_200), Some(0));
    }
}
