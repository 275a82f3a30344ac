//! Route shapes cut into straight segments, and nearest-segment snapping.
//!
//! Snapping happens in a local equirectangular plane centred on the network,
//! so distances come out in metres. Over a city-sized extent the error of the
//! projection is far below the snapping bound.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use rstar::primitives::{GeomWithData, Line};
use rstar::{PointDistance, RTree};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::table::{Table, read_table, write_table};
use crate::temporal::local_hour_ie;
use crate::types::{MinuteRecord, ShapePoint};

pub const SNAP_MAX_METERS: f64 = 50.0;
const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: String,
    pub shape_id: String,
    pub seq: usize,
    pub lat1: f64,
    pub lon1: f64,
    pub lat2: f64,
    pub lon2: f64,
}

impl Table for Segment {
    const NAME: &'static str = "segments";
    const COLUMNS: &'static [&'static str] =
        &["segment_id", "shape_id", "seq", "lat1", "lon1", "lat2", "lon2"];
}

/// One segment per consecutive pair of points of each shape, in
/// (shape_id, seq) order. Points with non-finite coordinates are skipped.
pub fn build_segments(points: &[ShapePoint]) -> Vec<Segment> {
    let mut shapes: BTreeMap<&str, Vec<&ShapePoint>> = BTreeMap::new();
    for p in points {
        if p.lat.is_finite() && p.lon.is_finite() {
            shapes.entry(p.shape_id.as_str()).or_default().push(p);
        }
    }

    let mut segments = Vec::new();
    for (shape_id, mut pts) in shapes {
        pts.sort_by_key(|p| p.seq);
        for (i, pair) in pts.windows(2).enumerate() {
            segments.push(Segment {
                segment_id: format!("{shape_id}_{i}"),
                shape_id: shape_id.to_string(),
                seq: i,
                lat1: pair[0].lat,
                lon1: pair[0].lon,
                lat2: pair[1].lat,
                lon2: pair[1].lon,
            });
        }
    }
    segments
}

/// Reads the segment cache, building it from the shapes table when it is
/// absent or `overwrite` is set.
pub fn load_or_build(cache: &Path, shapes: &Path, overwrite: bool) -> Result<Vec<Segment>> {
    if cache.exists() && !overwrite {
        debug!(path = %cache.display(), "Segment cache hit");
        return read_table(cache);
    }
    if !shapes.exists() {
        return Err(PipelineError::missing_input("segments", shapes).into());
    }

    let points: Vec<ShapePoint> = read_table(shapes)?;
    let segments = build_segments(&points);
    write_table(cache, &segments)?;
    info!(
        points = points.len(),
        segments = segments.len(),
        path = %cache.display(),
        "Segment cache built"
    );
    Ok(segments)
}

/// Equirectangular projection to metres around a reference point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalProjection {
    lat0: f64,
    lon0: f64,
    cos_lat0: f64,
}

impl LocalProjection {
    pub fn new(lat0: f64, lon0: f64) -> Self {
        LocalProjection {
            lat0,
            lon0,
            cos_lat0: lat0.to_radians().cos(),
        }
    }

    /// Centred on the mean of `points`, or on the origin when empty.
    pub fn around(points: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let (mut lat, mut lon, mut n) = (0.0, 0.0, 0usize);
        for (la, lo) in points {
            lat += la;
            lon += lo;
            n += 1;
        }
        if n == 0 {
            return LocalProjection::new(0.0, 0.0);
        }
        LocalProjection::new(lat / n as f64, lon / n as f64)
    }

    pub fn project(&self, lat: f64, lon: f64) -> [f64; 2] {
        [
            EARTH_RADIUS_M * (lon - self.lon0).to_radians() * self.cos_lat0,
            EARTH_RADIUS_M * (lat - self.lat0).to_radians(),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snap {
    /// Position in [`SegmentIndex::segments`].
    pub segment: usize,
    pub distance_m: f64,
}

pub struct SegmentIndex {
    projection: LocalProjection,
    segments: Vec<Segment>,
    tree: RTree<GeomWithData<Line<[f64; 2]>, usize>>,
}

impl SegmentIndex {
    pub fn new(segments: Vec<Segment>) -> Self {
        let projection = LocalProjection::around(
            segments
                .iter()
                .flat_map(|s| [(s.lat1, s.lon1), (s.lat2, s.lon2)]),
        );
        let items = segments
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let line = Line::new(
                    projection.project(s.lat1, s.lon1),
                    projection.project(s.lat2, s.lon2),
                );
                GeomWithData::new(line, i)
            })
            .collect();
        SegmentIndex {
            projection,
            segments,
            tree: RTree::bulk_load(items),
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Nearest segment to a point, if it lies within `max_m` metres (inclusive).
    pub fn snap(&self, lat: f64, lon: f64, max_m: f64) -> Option<Snap> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        let p = self.projection.project(lat, lon);
        let nearest = self.tree.nearest_neighbor(&p)?;
        let distance_m = nearest.distance_2(&p).sqrt();
        (distance_m <= max_m).then_some(Snap {
            segment: nearest.data,
            distance_m,
        })
    }
}

/// Which scored minutes enter a corridor view.
#[derive(Debug, Clone, Default)]
pub struct MinuteFilter {
    /// Empty keeps every route.
    pub routes: Vec<String>,
    /// Inclusive local-hour window; `(22, 3)` wraps past midnight.
    pub hours: Option<(u32, u32)>,
}

impl MinuteFilter {
    pub fn matches(&self, row: &MinuteRecord) -> bool {
        if !self.routes.is_empty() {
            let Some(route) = row.route_id.as_deref() else {
                return false;
            };
            if !self.routes.iter().any(|r| r == route) {
                return false;
            }
        }
        if let Some((start, end)) = self.hours {
            let Some(hour) = local_hour_ie(row.timestamp) else {
                return false;
            };
            let inside = if start <= end {
                (start..=end).contains(&hour)
            } else {
                hour >= start || hour <= end
            };
            if !inside {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorridorRow {
    pub segment_id: String,
    pub shape_id: String,
    pub seq: usize,
    pub n: usize,
    pub avg_stress: f64,
    pub pct_hi: f64,
    pub lat1: f64,
    pub lon1: f64,
    pub lat2: f64,
    pub lon2: f64,
}

impl Table for CorridorRow {
    const NAME: &'static str = "corridors";
    const COLUMNS: &'static [&'static str] = &[
        "segment_id",
        "shape_id",
        "seq",
        "n",
        "avg_stress",
        "pct_hi",
        "lat1",
        "lon1",
        "lat2",
        "lon2",
    ];
}

/// Mean stress and share above `threshold` per segment, over the rows that
/// pass `filter` and snap within [`SNAP_MAX_METERS`].
///
/// Segments without any matched minute are not emitted. Output follows
/// segment order.
pub fn corridor_stats(
    index: &SegmentIndex,
    rows: &[MinuteRecord],
    filter: &MinuteFilter,
    threshold: f64,
) -> Vec<CorridorRow> {
    // per segment: (n, stress sum, count above threshold)
    let mut acc: BTreeMap<usize, (usize, f64, usize)> = BTreeMap::new();
    let (mut considered, mut unmatched) = (0usize, 0usize);

    for row in rows.iter().filter(|r| filter.matches(r)) {
        let (Some(stress), Some((lat, lon))) = (row.row_stress, row.position()) else {
            continue;
        };
        considered += 1;
        match index.snap(lat, lon, SNAP_MAX_METERS) {
            Some(snap) => {
                let e = acc.entry(snap.segment).or_default();
                e.0 += 1;
                e.1 += stress;
                if stress > threshold {
                    e.2 += 1;
                }
            }
            None => unmatched += 1,
        }
    }

    debug!(
        considered,
        matched = considered - unmatched,
        unmatched,
        segments = acc.len(),
        "Corridor aggregation complete"
    );

    acc.into_iter()
        .map(|(i, (n, sum, hi))| {
            let s = &index.segments()[i];
            CorridorRow {
                segment_id: s.segment_id.clone(),
                shape_id: s.shape_id.clone(),
                seq: s.seq,
                n,
                avg_stress: sum / n as f64,
                pct_hi: hi as f64 / n as f64,
                lat1: s.lat1,
                lon1: s.lon1,
                lat2: s.lat2,
                lon2: s.lon2,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    const LAT: f64 = 53.35;

    fn point(shape: &str, seq: i64, lat: f64, lon: f64) -> ShapePoint {
        ShapePoint { shape_id: shape.into(), seq, lat, lon }
    }

    /// Latitude offset that moves a point `m` metres north.
    fn north_of(lat: f64, m: f64) -> f64 {
        lat + (m / EARTH_RADIUS_M).to_degrees()
    }

    /// One east-west segment centred on (LAT, -6.26).
    fn straight_index() -> SegmentIndex {
        SegmentIndex::new(build_segments(&[
            point("s1", 1, LAT, -6.27),
            point("s1", 2, LAT, -6.25),
        ]))
    }

    fn scored(lat: f64, lon: f64, stress: f64) -> MinuteRecord {
        MinuteRecord {
            route_id: Some("r1".into()),
            lat: Some(lat),
            lon: Some(lon),
            row_stress: Some(stress),
            ..Default::default()
        }
    }

    #[test]
    fn test_segments_follow_sequence_order() {
        let segs = build_segments(&[
            point("b", 3, 3.0, 3.0),
            point("b", 1, 1.0, 1.0),
            point("a", 0, 0.0, 0.0),
            point("b", 2, 2.0, 2.0),
            point("a", 1, 0.5, 0.5),
        ]);
        let ids: Vec<&str> = segs.iter().map(|s| s.segment_id.as_str()).collect();
        assert_eq!(ids, vec!["a_0", "b_0", "b_1"]);
        assert_eq!((segs[1].lat1, segs[1].lat2), (1.0, 2.0));
        assert_eq!((segs[2].lat1, segs[2].lat2), (2.0, 3.0));
    }

    #[test]
    fn test_single_point_shape_has_no_segments() {
        assert!(build_segments(&[point("lonely", 0, 1.0, 1.0)]).is_empty());
    }

    #[test]
    fn test_snap_bound_in_metres() {
        let index = straight_index();
        let near = index.snap(north_of(LAT, 49.9), -6.26, SNAP_MAX_METERS).unwrap();
        assert!((near.distance_m - 49.9).abs() < 0.01, "{near:?}");
        assert!(index.snap(north_of(LAT, 50.1), -6.26, SNAP_MAX_METERS).is_none());
    }

    #[test]
    fn test_snap_boundary_is_inclusive() {
        let index = straight_index();
        let lat = north_of(LAT, 50.0);
        let d = index.snap(lat, -6.26, f64::INFINITY).unwrap().distance_m;
        assert!(index.snap(lat, -6.26, d).is_some());
    }

    #[test]
    fn test_snap_picks_nearest_segment() {
        let index = SegmentIndex::new(build_segments(&[
            point("south", 0, LAT, -6.27),
            point("south", 1, LAT, -6.25),
            point("north", 0, north_of(LAT, 60.0), -6.27),
            point("north", 1, north_of(LAT, 60.0), -6.25),
        ]));
        let snap = index.snap(north_of(LAT, 40.0), -6.26, SNAP_MAX_METERS).unwrap();
        assert_eq!(index.segments()[snap.segment].shape_id, "north");
    }

    #[test]
    fn test_empty_index_never_matches() {
        let index = SegmentIndex::new(Vec::new());
        assert!(index.snap(LAT, -6.26, f64::INFINITY).is_none());
    }

    #[test]
    fn test_corridor_stats_exclude_far_points() {
        let index = straight_index();
        let rows = vec![
            scored(north_of(LAT, 10.0), -6.26, 0.2),
            scored(north_of(LAT, 20.0), -6.26, 0.8),
            scored(north_of(LAT, 500.0), -6.26, 1.0),
        ];
        let out = corridor_stats(&index, &rows, &MinuteFilter::default(), 0.5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].segment_id, "s1_0");
        assert_eq!(out[0].n, 2);
        assert!((out[0].avg_stress - 0.5).abs() < 1e-9);
        assert!((out[0].pct_hi - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_filter_by_route_and_hour() {
        // 2024-07-03 10:46:40 in Dublin
        let mut row = scored(LAT, -6.26, 0.4);
        row.timestamp = 1_720_000_000;

        let by_route = MinuteFilter { routes: vec!["r2".into()], hours: None };
        assert!(!by_route.matches(&row));

        let morning = MinuteFilter { routes: vec!["r1".into()], hours: Some((7, 10)) };
        assert!(morning.matches(&row));

        let overnight = MinuteFilter { routes: Vec::new(), hours: Some((22, 3)) };
        assert!(!overnight.matches(&row));
        row.timestamp = 1_704_067_200;
        assert!(overnight.matches(&row));
    }

    #[test]
    fn test_cache_is_built_once() {
        let dir = env::temp_dir().join(format!("bus_stress_segments_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let shapes = dir.join("shapes.csv");
        let cache = dir.join("segments.v1.csv.gz");
        fs::write(&shapes, "shape_id,seq,lat,lon\ns1,1,53.35,-6.27\ns1,2,53.35,-6.25\n").unwrap();

        let built = load_or_build(&cache, &shapes, false).unwrap();
        assert_eq!(built.len(), 1);

        // the cache is now authoritative even without the source table
        fs::remove_file(&shapes).unwrap();
        assert_eq!(load_or_build(&cache, &shapes, false).unwrap(), built);

        let err = load_or_build(&cache, &shapes, true).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingInput { stage: "segments", .. })
        ));

        fs::remove_dir_all(&dir).unwrap();
    }
}
