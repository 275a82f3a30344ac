//! Row types for every table the pipeline reads or writes.

use serde::{Deserialize, Serialize};

use crate::table::Table;
use crate::zones::Zone;

/// One raw position sample from the vehicle telemetry table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleSample {
    pub vehicle_id: String,
    pub trip_id: String,
    pub route_id: Option<String>,
    pub direction_id: Option<u8>,
    pub timestamp: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub speed_kph: Option<f64>,
}

impl Table for VehicleSample {
    const NAME: &'static str = "vehicles";
    const COLUMNS: &'static [&'static str] = &[
        "vehicle_id",
        "trip_id",
        "route_id",
        "direction_id",
        "timestamp",
        "lat",
        "lon",
        "speed_kph",
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelaySample {
    pub trip_id: String,
    pub timestamp: i64,
    pub delay_sec: Option<f64>,
}

impl Table for DelaySample {
    const NAME: &'static str = "delay";
    const COLUMNS: &'static [&'static str] = &["trip_id", "timestamp", "delay_sec"];
}

/// One zone reading at the ~15 minute weather cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub zone: String,
    pub timestamp: i64,
    pub rain_mm: Option<f64>,
    pub temp_c: Option<f64>,
}

impl Table for WeatherObservation {
    const NAME: &'static str = "weather";
    const COLUMNS: &'static [&'static str] = &["zone", "timestamp", "rain_mm", "temp_c"];
}

/// Scheduled bounds of a trip for the day, epoch seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripSchedule {
    pub trip_id: String,
    pub scheduled_start: i64,
    pub scheduled_end: i64,
}

impl Table for TripSchedule {
    const NAME: &'static str = "trip_schedule";
    const COLUMNS: &'static [&'static str] = &["trip_id", "scheduled_start", "scheduled_end"];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripRef {
    pub trip_id: String,
    pub route_id: String,
    pub shape_id: Option<String>,
}

impl Table for TripRef {
    const NAME: &'static str = "trips";
    const COLUMNS: &'static [&'static str] = &["trip_id", "route_id"];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRef {
    pub route_id: String,
    pub route_short_name: String,
    pub route_long_name: Option<String>,
}

impl Table for RouteRef {
    const NAME: &'static str = "routes";
    const COLUMNS: &'static [&'static str] = &["route_id", "route_short_name", "route_long_name"];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapePoint {
    pub shape_id: String,
    pub seq: i64,
    pub lat: f64,
    pub lon: f64,
}

impl Table for ShapePoint {
    const NAME: &'static str = "shapes";
    const COLUMNS: &'static [&'static str] = &["shape_id", "seq", "lat", "lon"];
}

/// A vehicle-minute and every column derived for it downstream.
///
/// Each stage fills in its own columns and leaves the rest untouched, so one
/// row type serves every intermediate table. Columns a stage has not reached
/// yet are empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinuteRecord {
    pub vehicle_id: String,
    pub trip_id: String,
    pub route_id: Option<String>,
    pub direction_id: Option<u8>,
    /// Epoch seconds, floored to the minute.
    pub timestamp: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub speed_kph: Option<f64>,
    pub delay_sec: Option<f64>,

    pub zone: Option<Zone>,
    pub datetime_ie: Option<String>,
    pub rain_mm: Option<f64>,
    pub temp_c: Option<f64>,

    pub vanish_anchor: bool,

    pub free_kph: Option<f64>,
    pub delay_norm: Option<f64>,
    pub speed_norm: Option<f64>,
    pub rain_norm: Option<f64>,
    pub heat_norm: Option<f64>,
    pub cold_norm: Option<f64>,
    pub row_stress: Option<f64>,
}

impl MinuteRecord {
    /// Both coordinates, when present and finite.
    pub fn position(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }

    pub fn pair_key(&self) -> (&str, &str) {
        (&self.vehicle_id, &self.trip_id)
    }
}

impl Table for MinuteRecord {
    const NAME: &'static str = "veh_minute";
    const COLUMNS: &'static [&'static str] = &[
        "vehicle_id",
        "trip_id",
        "route_id",
        "direction_id",
        "timestamp",
        "lat",
        "lon",
        "speed_kph",
        "delay_sec",
        "zone",
        "datetime_ie",
        "rain_mm",
        "temp_c",
        "vanish_anchor",
        "free_kph",
        "delay_norm",
        "speed_norm",
        "rain_norm",
        "heat_norm",
        "cold_norm",
        "row_stress",
    ];
}
