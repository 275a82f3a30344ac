//! Census polygon (ED) assignment and per-polygon aggregation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use geo::{BoundingRect, Contains, LineString, MultiPolygon, Point, Polygon};
use geojson::{Feature, GeoJson, Value};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::stats::{mean, quantile, share};
use crate::table::Table;
use crate::types::MinuteRecord;

pub const DEFAULT_ID_KEY: &str = "ED_ID_STR";
pub const DEFAULT_NAME_KEY: &str = "ED_ENGLISH";
pub const DEFAULT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct CensusZone {
    pub id: String,
    pub name: String,
    pub shape: MultiPolygon<f64>,
}

/// Polygons in file order with a bounding-box index.
pub struct CensusZones {
    zones: Vec<CensusZone>,
    tree: RTree<GeomWithData<Rectangle<[f64; 2]>, usize>>,
}

fn ring(coords: &[Vec<f64>]) -> LineString<f64> {
    coords
        .iter()
        .filter(|c| c.len() >= 2)
        .map(|c| (c[0], c[1]))
        .collect::<Vec<_>>()
        .into()
}

fn polygon(rings: &[Vec<Vec<f64>>]) -> Option<Polygon<f64>> {
    let (exterior, holes) = rings.split_first()?;
    Some(Polygon::new(
        ring(exterior),
        holes.iter().map(|h| ring(h)).collect(),
    ))
}

fn shape_of(value: &Value) -> Option<MultiPolygon<f64>> {
    match value {
        Value::Polygon(rings) => polygon(rings).map(|p| MultiPolygon::new(vec![p])),
        Value::MultiPolygon(parts) => {
            let polys: Vec<Polygon<f64>> = parts.iter().filter_map(|p| polygon(p)).collect();
            (!polys.is_empty()).then(|| MultiPolygon::new(polys))
        }
        _ => None,
    }
}

fn property_text(feature: &Feature, key: &str) -> Option<String> {
    match feature.property(key)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts a missing `crs` member or one naming WGS84.
fn check_crs(members: Option<&geojson::JsonObject>) -> Result<(), PipelineError> {
    let Some(crs) = members.and_then(|m| m.get("crs")) else {
        return Ok(());
    };
    let name = crs
        .pointer("/properties/name")
        .and_then(|n| n.as_str())
        .unwrap_or_default();
    if name.contains("4326") || name.contains("CRS84") {
        Ok(())
    } else {
        Err(PipelineError::InvalidInput(format!(
            "census polygons must be WGS84, found crs `{name}`"
        )))
    }
}

impl CensusZones {
    pub fn new(zones: Vec<CensusZone>) -> Self {
        let items = zones
            .iter()
            .enumerate()
            .filter_map(|(i, z)| {
                let rect = z.shape.bounding_rect()?;
                let corners = Rectangle::from_corners(
                    [rect.min().x, rect.min().y],
                    [rect.max().x, rect.max().y],
                );
                Some(GeomWithData::new(corners, i))
            })
            .collect();
        CensusZones {
            zones,
            tree: RTree::bulk_load(items),
        }
    }

    /// Reads a FeatureCollection. Features without a polygon geometry or
    /// without an identifier are skipped; a missing name falls back to the id.
    pub fn from_geojson_str(text: &str, id_key: &str, name_key: &str) -> Result<Self> {
        let collection = match text.parse::<GeoJson>()? {
            GeoJson::FeatureCollection(fc) => fc,
            _ => bail!("census polygons must be a FeatureCollection"),
        };
        check_crs(collection.foreign_members.as_ref())?;

        let mut zones = Vec::new();
        let mut skipped = 0usize;
        for feature in &collection.features {
            let shape = feature.geometry.as_ref().and_then(|g| shape_of(&g.value));
            let id = property_text(feature, id_key);
            match (shape, id) {
                (Some(shape), Some(id)) => {
                    let name = property_text(feature, name_key).unwrap_or_else(|| id.clone());
                    zones.push(CensusZone { id, name, shape });
                }
                _ => skipped += 1,
            }
        }
        debug!(zones = zones.len(), skipped, "Census polygons loaded");
        Ok(CensusZones::new(zones))
    }

    pub fn load(path: &Path, id_key: &str, name_key: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading census polygons {}", path.display()))?;
        Self::from_geojson_str(&text, id_key, name_key)
    }

    pub fn zones(&self) -> &[CensusZone] {
        &self.zones
    }

    /// First polygon in file order strictly containing the point.
    /// Points on a boundary are not within it.
    pub fn locate(&self, lat: f64, lon: f64) -> Option<&CensusZone> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        let p = Point::new(lon, lat);
        let mut hits: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&AABB::from_point([lon, lat]))
            .map(|item| item.data)
            .collect();
        hits.sort_unstable();
        hits.into_iter()
            .map(|i| &self.zones[i])
            .find(|z| z.shape.contains(&p))
    }
}

/// A scored minute assigned to a census polygon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdMinute {
    pub vehicle_id: String,
    pub trip_id: String,
    pub route_id: Option<String>,
    pub timestamp: i64,
    pub row_stress: Option<f64>,
    pub vanish_anchor: bool,
    pub ed_id: String,
    pub ed_name: String,
}

impl Table for EdMinute {
    const NAME: &'static str = "veh_minute_ed";
    const COLUMNS: &'static [&'static str] = &[
        "vehicle_id",
        "trip_id",
        "route_id",
        "timestamp",
        "row_stress",
        "vanish_anchor",
        "ed_id",
        "ed_name",
    ];
}

/// Assigns every positioned minute to its polygon; the rest are dropped.
pub fn join_points(zones: &CensusZones, rows: &[MinuteRecord]) -> Vec<EdMinute> {
    let out: Vec<EdMinute> = rows
        .iter()
        .filter_map(|r| {
            let (lat, lon) = r.position()?;
            let zone = zones.locate(lat, lon)?;
            Some(EdMinute {
                vehicle_id: r.vehicle_id.clone(),
                trip_id: r.trip_id.clone(),
                route_id: r.route_id.clone(),
                timestamp: r.timestamp,
                row_stress: r.row_stress,
                vanish_anchor: r.vanish_anchor,
                ed_id: zone.id.clone(),
                ed_name: zone.name.clone(),
            })
        })
        .collect();
    debug!(
        rows = rows.len(),
        matched = out.len(),
        unmatched = rows.len() - out.len(),
        "Census join complete"
    );
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdMetric {
    #[default]
    Avg,
    Max,
    /// Count and share of minutes above the threshold.
    Share,
}

impl FromStr for EdMetric {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "avg" => Ok(EdMetric::Avg),
            "max" => Ok(EdMetric::Max),
            "share" | "%>threshold" => Ok(EdMetric::Share),
            other => Err(PipelineError::InvalidInput(format!("unknown metric `{other}`"))),
        }
    }
}

impl fmt::Display for EdMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdMetric::Avg => f.write_str("avg"),
            EdMetric::Max => f.write_str("max"),
            EdMetric::Share => f.write_str("share"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdStressRow {
    pub ed_id: String,
    pub ed_name: String,
    pub value: f64,
    pub n: usize,
    pub count_hi: usize,
    pub share_hi: f64,
}

impl Table for EdStressRow {
    const NAME: &'static str = "ed_stress";
    const COLUMNS: &'static [&'static str] =
        &["ed_id", "ed_name", "value", "n", "count_hi", "share_hi"];
}

/// One row per polygon, polygons without minutes included as zeros.
///
/// Only the selected metric is computed: `count_hi` and `share_hi` stay 0
/// unless the metric is [`EdMetric::Share`], where `value` is `share_hi`.
pub fn aggregate(
    zones: &CensusZones,
    minutes: &[EdMinute],
    metric: EdMetric,
    threshold: f64,
) -> Vec<EdStressRow> {
    let mut stress: HashMap<&str, Vec<f64>> = HashMap::new();
    for m in minutes {
        if let Some(s) = m.row_stress.filter(|s| !s.is_nan()) {
            stress.entry(m.ed_id.as_str()).or_default().push(s);
        }
    }

    zones
        .zones()
        .iter()
        .map(|z| {
            let values = stress.get(z.id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            let n = values.len();
            let (value, count_hi, share_hi) = match metric {
                EdMetric::Avg => (mean(values), 0, 0.0),
                EdMetric::Max => (values.iter().copied().fold(0.0, f64::max), 0, 0.0),
                EdMetric::Share => {
                    let hi = values.iter().filter(|&&s| s > threshold).count();
                    (share(hi, n), hi, share(hi, n))
                }
            };
            EdStressRow {
                ed_id: z.id.clone(),
                ed_name: z.name.clone(),
                value,
                n,
                count_hi,
                share_hi,
            }
        })
        .collect()
}

/// Colour scale reference for the exceed counts in view: their 95th
/// percentile, never below 1.
pub fn exceed_scale(rows: &[EdStressRow]) -> f64 {
    let counts: Vec<f64> = rows.iter().map(|r| r.count_hi as f64).collect();
    quantile(&counts, 0.95).unwrap_or(1.0).max(1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Shade {
    /// Nothing above the threshold; drawn apart from the ramp.
    Muted,
    /// Intensity in (0,1].
    Ramp(f64),
}

pub fn shade(count_hi: usize, scale: f64) -> Shade {
    if count_hi == 0 {
        Shade::Muted
    } else {
        Shade::Ramp((count_hi as f64 / scale.max(1.0)).min(1.0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdVanishRow {
    pub ed_id: String,
    pub ed_name: String,
    pub vanish_count: usize,
}

impl Table for EdVanishRow {
    const NAME: &'static str = "ed_vanish";
    const COLUMNS: &'static [&'static str] = &["ed_id", "ed_name", "vanish_count"];
}

/// Distinct anchored (vehicle, trip) pairs per polygon, every polygon listed.
pub fn vanish_counts(zones: &CensusZones, minutes: &[EdMinute]) -> Vec<EdVanishRow> {
    let mut pairs: HashMap<&str, HashSet<(&str, &str)>> = HashMap::new();
    for m in minutes.iter().filter(|m| m.vanish_anchor) {
        pairs
            .entry(m.ed_id.as_str())
            .or_default()
            .insert((m.vehicle_id.as_str(), m.trip_id.as_str()));
    }
    zones
        .zones()
        .iter()
        .map(|z| EdVanishRow {
            ed_id: z.id.clone(),
            ed_name: z.name.clone(),
            vanish_count: pairs.get(z.id.as_str()).map_or(0, HashSet::len),
        })
        .collect()
}
