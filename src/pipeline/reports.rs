//! Reference builds and the aggregation outputs read by the dashboard.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info};

use super::layout::{DayLayout, Stage};
use super::stages::require;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::freeflow::FreeFlowModel;
use crate::polygons::{
    CensusZones, EdMetric, EdMinute, EdStressRow, EdVanishRow, Shade, aggregate, exceed_scale,
    shade, vanish_counts,
};
use crate::routes::RouteNames;
use crate::segments::{CorridorRow, MinuteFilter, SegmentIndex, corridor_stats, load_or_build};
use crate::summary::{DaySummary, TrendPoint, VANISH_WINDOW_DAYS, VanishWindow};
use crate::table::{read_table, write_json};
use crate::types::{MinuteRecord, RouteRef};

/// Inclusive run of days.
pub fn days(from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    from.iter_days().take_while(move |d| *d <= to)
}

/// Day folders under the data root that hold a scored table, oldest first.
pub fn scored_days(config: &PipelineConfig) -> Result<Vec<NaiveDate>> {
    let mut dates = Vec::new();
    if !config.data_root.exists() {
        return Ok(dates);
    }
    for entry in std::fs::read_dir(&config.data_root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Ok(date) = NaiveDate::parse_from_str(&name.to_string_lossy(), "%Y-%m-%d") else {
            continue;
        };
        if DayLayout::new(&config.data_root, date).scored().exists() {
            dates.push(date);
        }
    }
    dates.sort();
    Ok(dates)
}

/// Rebuilds the free-flow table from the delay-normalised minutes of every
/// day in range. Days without that table are skipped.
#[tracing::instrument(skip(config), fields(path = %config.freeflow_path.display()))]
pub fn build_freeflow(
    config: &PipelineConfig,
    from: NaiveDate,
    to: NaiveDate,
    overwrite: bool,
) -> Result<Option<FreeFlowModel>> {
    if config.freeflow_path.exists() && !overwrite {
        info!(reason = "output exists", "Free-flow build skipped");
        return Ok(None);
    }

    let mut rows: Vec<MinuteRecord> = Vec::new();
    let mut used = 0usize;
    for date in days(from, to) {
        let path = DayLayout::new(&config.data_root, date).output(Stage::DelayNorm);
        if !path.exists() {
            debug!(%date, "No delay-normalised minutes for day");
            continue;
        }
        rows.extend(read_table::<MinuteRecord>(&path)?);
        used += 1;
    }
    if used == 0 {
        return Err(PipelineError::InvalidInput(format!(
            "no delay-normalised days between {from} and {to}"
        ))
        .into());
    }

    let model = FreeFlowModel::estimate(&rows);
    model.save(&config.freeflow_path)?;
    info!(days = used, rows = rows.len(), entries = model.len(), "Free-flow rebuilt");
    Ok(Some(model))
}

pub fn build_segments(config: &PipelineConfig, overwrite: bool) -> Result<usize> {
    Ok(load_or_build(&config.segments_path(), &config.shapes_path(), overwrite)?.len())
}

fn scored_rows(config: &PipelineConfig, stage: &'static str, date: NaiveDate) -> Result<Vec<MinuteRecord>> {
    let path = DayLayout::new(&config.data_root, date).scored();
    require(stage, &[path.as_path()])?;
    read_table(&path)
}

fn ed_rows(config: &PipelineConfig, stage: &'static str, dates: &[NaiveDate]) -> Result<Vec<EdMinute>> {
    let mut rows = Vec::new();
    for &date in dates {
        let path = DayLayout::new(&config.data_root, date).output(Stage::EdJoin);
        require(stage, &[path.as_path()])?;
        rows.extend(read_table::<EdMinute>(&path)?);
    }
    Ok(rows)
}

/// Where an aggregation over `dates` is written: the day's `agg/` folder for
/// a single day, `<data_root>/agg` with the date span otherwise.
pub fn agg_path(config: &PipelineConfig, dates: &[NaiveDate], stem: &str) -> PathBuf {
    match dates {
        [date] => DayLayout::new(&config.data_root, *date)
            .agg_dir()
            .join(format!("{stem}.json")),
        _ => {
            let first = dates.iter().min().map(|d| d.to_string()).unwrap_or_default();
            let last = dates.iter().max().map(|d| d.to_string()).unwrap_or_default();
            config
                .data_root
                .join("agg")
                .join(format!("{stem}_{first}_{last}.json"))
        }
    }
}

fn load_zones(config: &PipelineConfig, stage: &'static str) -> Result<CensusZones> {
    require(stage, &[config.census_path.as_path()])?;
    CensusZones::load(&config.census_path, &config.census_id_key, &config.census_name_key)
}

fn route_names(config: &PipelineConfig) -> Result<RouteNames> {
    let path = config.routes_path();
    if !path.exists() {
        info!(path = %path.display(), "No routes table, labelling by route id");
        return Ok(RouteNames::default());
    }
    Ok(RouteNames::from_routes(&read_table::<RouteRef>(&path)?))
}

#[tracing::instrument(skip_all, fields(%date))]
pub fn corridors(
    config: &PipelineConfig,
    date: NaiveDate,
    filter: &MinuteFilter,
    threshold: f64,
) -> Result<PathBuf> {
    let segments = load_or_build(&config.segments_path(), &config.shapes_path(), false)?;
    let index = SegmentIndex::new(segments);
    let rows = scored_rows(config, "corridors", date)?;

    let stats: Vec<CorridorRow> = corridor_stats(&index, &rows, filter, threshold);
    let out = agg_path(config, &[date], "corridors");
    write_json(&out, &stats)?;
    info!(segments = stats.len(), path = %out.display(), "Corridor view written");
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct ShadedEdRow {
    #[serde(flatten)]
    pub row: EdStressRow,
    /// Only set for the share metric.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shade: Option<Shade>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdView {
    pub dates: Vec<NaiveDate>,
    pub metric: EdMetric,
    pub threshold: f64,
    /// Reference for the exceed-count colour ramp, share metric only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    pub rows: Vec<ShadedEdRow>,
}

pub fn ed_view(
    zones: &CensusZones,
    minutes: &[EdMinute],
    dates: &[NaiveDate],
    metric: EdMetric,
    threshold: f64,
) -> EdView {
    let rows = aggregate(zones, minutes, metric, threshold);
    let scale = (metric == EdMetric::Share).then(|| exceed_scale(&rows));
    EdView {
        dates: dates.to_vec(),
        metric,
        threshold,
        scale,
        rows: rows
            .into_iter()
            .map(|row| ShadedEdRow {
                shade: scale.map(|s| shade(row.count_hi, s)),
                row,
            })
            .collect(),
    }
}

#[tracing::instrument(skip_all, fields(%metric, days = dates.len()))]
pub fn eds(
    config: &PipelineConfig,
    dates: &[NaiveDate],
    metric: EdMetric,
    threshold: f64,
) -> Result<PathBuf> {
    let zones = load_zones(config, "eds")?;
    let minutes = ed_rows(config, "eds", dates)?;
    let view = ed_view(&zones, &minutes, dates, metric, threshold);

    let out = agg_path(config, dates, &format!("ed_{metric}"));
    write_json(&out, &view)?;
    info!(polygons = view.rows.len(), scale = ?view.scale, path = %out.display(), "ED view written");
    Ok(out)
}

#[tracing::instrument(skip_all, fields(days = dates.len()))]
pub fn vanish_eds(config: &PipelineConfig, dates: &[NaiveDate]) -> Result<PathBuf> {
    let zones = load_zones(config, "vanish-eds")?;
    let minutes = ed_rows(config, "vanish-eds", dates)?;
    let counts: Vec<EdVanishRow> = vanish_counts(&zones, &minutes);

    let out = agg_path(config, dates, "ed_vanish");
    write_json(&out, &counts)?;
    info!(
        polygons = counts.len(),
        vanished = counts.iter().map(|c| c.vanish_count).sum::<usize>(),
        path = %out.display(),
        "ED vanish counts written"
    );
    Ok(out)
}

/// Writes the day summary and its vanish window, and refreshes the
/// cross-day trend.
#[tracing::instrument(skip_all, fields(%date))]
pub fn summary(config: &PipelineConfig, date: NaiveDate, threshold: f64) -> Result<PathBuf> {
    let names = route_names(config)?;
    let rows = scored_rows(config, "summary", date)?;
    let day = DaySummary::build(date, &rows, &names, threshold);
    let out = agg_path(config, &[date], "summary");
    write_json(&out, &day)?;

    let window = vanish_window(config, date, &names)?;
    write_json(&agg_path(config, &[date], "vanish_window"), &window)?;

    let trend = daily_trend(config, threshold)?;
    let trend_path = config.data_root.join("agg").join("trend.json");
    write_json(&trend_path, &trend)?;

    info!(
        share = day.trend.share,
        anchors = day.vanish.anchors,
        window_days = window.dates.len(),
        trend_days = trend.len(),
        path = %out.display(),
        "Summary written"
    );
    Ok(out)
}

/// The last scored days up to and including `date`.
pub fn vanish_window(config: &PipelineConfig, date: NaiveDate, names: &RouteNames) -> Result<VanishWindow> {
    let mut dates: Vec<NaiveDate> = scored_days(config)?.into_iter().filter(|d| *d <= date).collect();
    let skip = dates.len().saturating_sub(VANISH_WINDOW_DAYS);
    dates.drain(..skip);

    let days = dates
        .into_iter()
        .map(|d| Ok((d, scored_rows(config, "summary", d)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(VanishWindow::build(date, &days, names))
}

/// Threshold share for every scored day.
pub fn daily_trend(config: &PipelineConfig, threshold: f64) -> Result<Vec<TrendPoint>> {
    scored_days(config)?
        .into_iter()
        .map(|date| {
            let rows = scored_rows(config, "summary", date)?;
            Ok(TrendPoint::for_day(date, &rows, threshold))
        })
        .collect()
}

/// Aggregation outputs of a day, sorted by file name.
pub fn day_artifacts(layout: &DayLayout) -> Result<Vec<PathBuf>> {
    let dir = layout.agg_dir();
    require("publish", &[dir.as_path()])?;
    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "json"))
        .collect();
    files.sort();
    Ok(files)
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, d).unwrap()
    }

    #[test]
    fn test_days_inclusive() {
        let all: Vec<NaiveDate> = days(date(1), date(3)).collect();
        assert_eq!(all, vec![date(1), date(2), date(3)]);
        assert_eq!(days(date(3), date(1)).count(), 0);
    }

    #[test]
    fn test_agg_path_single_and_span() {
        let config = PipelineConfig::default();
        assert_eq!(
            agg_path(&config, &[date(3)], "ed_avg"),
            PathBuf::from("data_hist/2024-07-03/agg/ed_avg.json")
        );
        assert_eq!(
            agg_path(&config, &[date(5), date(3)], "ed_vanish"),
            PathBuf::from("data_hist/agg/ed_vanish_2024-07-03_2024-07-05.json")
        );
    }

    fn two_zones() -> CensusZones {
        CensusZones::from_geojson_str(
            r#"{"type":"FeatureCollection","features":[
              {"type":"Feature","properties":{"ED_ID_STR":"A"},
               "geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1],[0,0]]]}},
              {"type":"Feature","properties":{"ED_ID_STR":"B"},
               "geometry":{"type":"Polygon","coordinates":[[[1,0],[2,0],[2,1],[1,1],[1,0]]]}}
            ]}"#,
            "ED_ID_STR",
            "ED_ENGLISH",
        )
        .unwrap()
    }

    fn hot_minute_in_a() -> Vec<EdMinute> {
        vec![EdMinute {
            vehicle_id: "v".into(),
            trip_id: "t".into(),
            route_id: None,
            timestamp: 0,
            row_stress: Some(0.9),
            vanish_anchor: false,
            ed_id: "A".into(),
            ed_name: "A".into(),
        }]
    }

    #[test]
    fn test_ed_view_shades_zero_as_muted() {
        let view = ed_view(&two_zones(), &hot_minute_in_a(), &[date(3)], EdMetric::Share, 0.5);
        assert_eq!(view.scale, Some(1.0));
        assert_eq!(view.rows[0].shade, Some(Shade::Ramp(1.0)));
        assert_eq!(view.rows[1].shade, Some(Shade::Muted));

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["rows"][0]["ed_id"], "A");
        assert_eq!(json["rows"][0]["count_hi"], 1);
    }

    #[test]
    fn test_avg_and_max_views_carry_no_exceed_shading() {
        for metric in [EdMetric::Avg, EdMetric::Max] {
            let view = ed_view(&two_zones(), &hot_minute_in_a(), &[date(3)], metric, 0.5);
            assert_eq!(view.scale, None);
            assert_eq!(view.rows[0].row.value, 0.9);
            assert!(view.rows.iter().all(|r| r.shade.is_none()));

            let json = serde_json::to_value(&view).unwrap();
            assert!(json.get("scale").is_none());
            assert!(json["rows"][0].get("shade").is_none());
        }
    }
}
