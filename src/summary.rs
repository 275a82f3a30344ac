//! Day-level summaries over scored minutes: threshold share, vanish KPIs,
//! time-to-vanish and route leaderboards, plus the week-long vanish window.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::routes::RouteNames;
use crate::stats::{mean, quantile, share};
use crate::temporal::local_hour_ie;
use crate::types::MinuteRecord;

/// Longest first-seen to anchor span kept in time-to-vanish, exclusive.
pub const MAX_TIME_TO_VANISH_MIN: f64 = 360.0;
pub const LEADERBOARD_SIZE: usize = 10;
/// Scored days looked back over by the vanish baseline and heatmap.
pub const VANISH_WINDOW_DAYS: usize = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub minutes: usize,
    /// Share of all vehicle-minutes with `row_stress` above the threshold.
    pub share: f64,
}

impl TrendPoint {
    pub fn for_day(date: NaiveDate, rows: &[MinuteRecord], threshold: f64) -> Self {
        let hi = rows
            .iter()
            .filter(|r| r.row_stress.is_some_and(|s| s > threshold))
            .count();
        TrendPoint {
            date,
            minutes: rows.len(),
            share: share(hi, rows.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VanishKpis {
    /// Distinct anchored (vehicle, trip) pairs.
    pub anchors: usize,
    pub vehicle_minutes: usize,
    pub rate_per_1000: f64,
    /// Local hour holding the most anchors; earliest hour on ties.
    pub worst_hour: Option<u32>,
}

pub fn vanish_kpis(rows: &[MinuteRecord]) -> VanishKpis {
    let mut pairs: HashSet<(&str, &str)> = HashSet::new();
    let mut by_hour: BTreeMap<u32, usize> = BTreeMap::new();
    for r in rows.iter().filter(|r| r.vanish_anchor) {
        pairs.insert(r.pair_key());
        if let Some(h) = local_hour_ie(r.timestamp) {
            *by_hour.entry(h).or_default() += 1;
        }
    }

    let worst_hour = by_hour
        .iter()
        .fold(None::<(u32, usize)>, |best, (&h, &c)| match best {
            Some((_, bc)) if bc >= c => best,
            _ => Some((h, c)),
        })
        .map(|(h, _)| h);

    let anchors = pairs.len();
    VanishKpis {
        anchors,
        vehicle_minutes: rows.len(),
        rate_per_1000: share(anchors, rows.len()) * 1000.0,
        worst_hour,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeToVanish {
    pub vehicle_id: String,
    pub trip_id: String,
    pub route_id: Option<String>,
    pub minutes: f64,
}

/// Minutes from each vanished pair's first observation to its anchor.
/// Spans outside `[0, 360)` are dropped. Sorted by vehicle then trip.
pub fn time_to_vanish(rows: &[MinuteRecord]) -> Vec<TimeToVanish> {
    let mut first: HashMap<(&str, &str), i64> = HashMap::new();
    let mut anchor: BTreeMap<(&str, &str), &MinuteRecord> = BTreeMap::new();

    for r in rows {
        let key = r.pair_key();
        first
            .entry(key)
            .and_modify(|t| *t = (*t).min(r.timestamp))
            .or_insert(r.timestamp);
        if r.vanish_anchor {
            anchor
                .entry(key)
                .and_modify(|a| {
                    if r.timestamp >= a.timestamp {
                        *a = r;
                    }
                })
                .or_insert(r);
        }
    }

    anchor
        .into_iter()
        .filter_map(|(key, a)| {
            let minutes = (a.timestamp - first[&key]) as f64 / 60.0;
            (0.0..MAX_TIME_TO_VANISH_MIN)
                .contains(&minutes)
                .then(|| TimeToVanish {
                    vehicle_id: a.vehicle_id.clone(),
                    trip_id: a.trip_id.clone(),
                    route_id: a.route_id.clone(),
                    minutes,
                })
        })
        .collect()
}

/// Spread of time-to-vanish spans, in minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeToVanishStats {
    pub trips: usize,
    pub median: f64,
    pub p25: f64,
    pub p75: f64,
    /// Share of trips gone within 2 minutes of first being seen.
    pub share_within_2_min: f64,
    pub share_over_30_min: f64,
}

impl TimeToVanishStats {
    /// `None` when nothing vanished.
    pub fn from_spans(spans: &[TimeToVanish]) -> Option<Self> {
        let minutes: Vec<f64> = spans.iter().map(|s| s.minutes).collect();
        let early = minutes.iter().filter(|&&m| m <= 2.0).count();
        let late = minutes.iter().filter(|&&m| m > 30.0).count();
        Some(TimeToVanishStats {
            trips: minutes.len(),
            median: quantile(&minutes, 0.5)?,
            p25: quantile(&minutes, 0.25)?,
            p75: quantile(&minutes, 0.75)?,
            share_within_2_min: share(early, minutes.len()),
            share_over_30_min: share(late, minutes.len()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTrips {
    pub route: String,
    pub trips: usize,
}

/// Routes with the most vanished trips, by display name. Spans without a
/// route are left out.
pub fn vanished_by_route(spans: &[TimeToVanish], names: &RouteNames, n: usize) -> Vec<RouteTrips> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for route in spans.iter().filter_map(|s| s.route_id.as_deref()) {
        *counts.entry(names.label(route)).or_default() += 1;
    }
    let mut rows: Vec<RouteTrips> = counts
        .into_iter()
        .map(|(route, trips)| RouteTrips {
            route: route.to_string(),
            trips,
        })
        .collect();
    rows.sort_by(|a, b| b.trips.cmp(&a.trips).then_with(|| a.route.cmp(&b.route)));
    rows.truncate(n);
    rows
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub route: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Leaderboard {
    pub by_avg: Vec<LeaderboardRow>,
    pub by_max: Vec<LeaderboardRow>,
}

fn top(mut rows: Vec<LeaderboardRow>, n: usize) -> Vec<LeaderboardRow> {
    rows.sort_by(|a, b| {
        b.value
            .partial_cmp(&a.value)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.route.cmp(&b.route))
    });
    rows.truncate(n);
    rows
}

/// Worst `n` routes by mean and by max stress, keyed by display name.
pub fn route_leaderboard(rows: &[MinuteRecord], names: &RouteNames, n: usize) -> Leaderboard {
    let mut by_route: HashMap<&str, (usize, f64, f64)> = HashMap::new();
    for r in rows {
        let (Some(route), Some(stress)) = (r.route_id.as_deref(), r.row_stress) else {
            continue;
        };
        if stress.is_nan() {
            continue;
        }
        let e = by_route
            .entry(names.label(route))
            .or_insert((0, 0.0, f64::NEG_INFINITY));
        e.0 += 1;
        e.1 += stress;
        e.2 = e.2.max(stress);
    }

    let avg = by_route
        .iter()
        .map(|(&route, &(count, sum, _))| LeaderboardRow {
            route: route.to_string(),
            value: sum / count as f64,
        })
        .collect();
    let max = by_route
        .iter()
        .map(|(&route, &(_, _, max))| LeaderboardRow {
            route: route.to_string(),
            value: max,
        })
        .collect();

    Leaderboard {
        by_avg: top(avg, n),
        by_max: top(max, n),
    }
}

/// Everything the `summary` command reports for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub threshold: f64,
    pub trend: TrendPoint,
    pub vanish: VanishKpis,
    pub time_to_vanish: Vec<TimeToVanish>,
    pub time_to_vanish_stats: Option<TimeToVanishStats>,
    pub vanished_routes: Vec<RouteTrips>,
    pub leaderboard: Leaderboard,
}

impl DaySummary {
    pub fn build(date: NaiveDate, rows: &[MinuteRecord], names: &RouteNames, threshold: f64) -> Self {
        let spans = time_to_vanish(rows);
        DaySummary {
            date,
            threshold,
            trend: TrendPoint::for_day(date, rows, threshold),
            vanish: vanish_kpis(rows),
            time_to_vanish_stats: TimeToVanishStats::from_spans(&spans),
            vanished_routes: vanished_by_route(&spans, names, LEADERBOARD_SIZE),
            time_to_vanish: spans,
            leaderboard: route_leaderboard(rows, names, LEADERBOARD_SIZE),
        }
    }
}

/// Mean daily vanish figures over a window of days.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VanishBaseline {
    pub days: usize,
    pub mean_anchors: f64,
    /// Days without any vehicle-minutes carry no rate and are left out.
    pub mean_rate_per_1000: f64,
}

impl VanishBaseline {
    pub fn from_days(days: &[VanishKpis]) -> Self {
        let anchors: Vec<f64> = days.iter().map(|k| k.anchors as f64).collect();
        let rates: Vec<f64> = days
            .iter()
            .filter(|k| k.vehicle_minutes > 0)
            .map(|k| k.rate_per_1000)
            .collect();
        VanishBaseline {
            days: days.len(),
            mean_anchors: mean(&anchors),
            mean_rate_per_1000: mean(&rates),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeatmapCell {
    pub weekday: Weekday,
    /// Local hour.
    pub hour: u32,
    pub count: usize,
}

/// Anchor rows per (weekday of the day folder, local hour), Monday first.
pub fn vanish_heatmap<'a>(
    days: impl IntoIterator<Item = (NaiveDate, &'a [MinuteRecord])>,
) -> Vec<HeatmapCell> {
    let mut cells: BTreeMap<(u32, u32), (Weekday, usize)> = BTreeMap::new();
    for (date, rows) in days {
        let weekday = date.weekday();
        for r in rows.iter().filter(|r| r.vanish_anchor) {
            let Some(hour) = local_hour_ie(r.timestamp) else {
                continue;
            };
            cells
                .entry((weekday.num_days_from_monday(), hour))
                .or_insert((weekday, 0))
                .1 += 1;
        }
    }
    cells
        .into_iter()
        .map(|((_, hour), (weekday, count))| HeatmapCell {
            weekday,
            hour,
            count,
        })
        .collect()
}

/// One day's vanish figures set against the scored days leading up to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VanishWindow {
    pub date: NaiveDate,
    /// Days in the window, oldest first; includes `date` when it is scored.
    pub dates: Vec<NaiveDate>,
    pub today: VanishKpis,
    pub baseline: VanishBaseline,
    pub delta_anchors: f64,
    pub delta_rate_per_1000: f64,
    pub heatmap: Vec<HeatmapCell>,
    pub time_to_vanish: Option<TimeToVanishStats>,
    pub vanished_routes: Vec<RouteTrips>,
}

impl VanishWindow {
    pub fn build(date: NaiveDate, days: &[(NaiveDate, Vec<MinuteRecord>)], names: &RouteNames) -> Self {
        let kpis: Vec<VanishKpis> = days.iter().map(|(_, rows)| vanish_kpis(rows)).collect();
        let today = days
            .iter()
            .position(|(d, _)| *d == date)
            .map(|i| kpis[i].clone())
            .unwrap_or_else(|| vanish_kpis(&[]));
        let baseline = VanishBaseline::from_days(&kpis);
        let spans: Vec<TimeToVanish> = days.iter().flat_map(|(_, rows)| time_to_vanish(rows)).collect();

        VanishWindow {
            date,
            dates: days.iter().map(|(d, _)| *d).collect(),
            delta_anchors: today.anchors as f64 - baseline.mean_anchors,
            delta_rate_per_1000: today.rate_per_1000 - baseline.mean_rate_per_1000,
            today,
            baseline,
            heatmap: vanish_heatmap(days.iter().map(|(d, rows)| (*d, rows.as_slice()))),
            time_to_vanish: TimeToVanishStats::from_spans(&spans),
            vanished_routes: vanished_by_route(&spans, names, LEADERBOARD_SIZE),
        }
    }
}
