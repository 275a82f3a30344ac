//! Free-flow speed reference per (route, direction).
//!
//! Built offline from a window of days and read by the speed normaliser.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::normalize::MIN_FREE_KPH;
use crate::stats::quantile;
use crate::table::{Table, read_table, write_table};
use crate::types::MinuteRecord;

/// Samples slower than this are left out of the estimate entirely.
pub const FREEFLOW_MIN_SPEED_KPH: f64 = 10.0;
pub const FREEFLOW_QUANTILE: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeFlowRow {
    pub route_id: String,
    pub direction_id: u8,
    pub free_kph: f64,
}

impl Table for FreeFlowRow {
    const NAME: &'static str = "freeflow";
    const COLUMNS: &'static [&'static str] = &["route_id", "direction_id", "free_kph"];
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FreeFlowModel {
    entries: BTreeMap<String, BTreeMap<u8, f64>>,
}

impl FreeFlowModel {
    /// 95th percentile of moving speed per (route, direction).
    pub fn estimate<'a>(minutes: impl IntoIterator<Item = &'a MinuteRecord>) -> Self {
        let mut speeds: BTreeMap<(String, u8), Vec<f64>> = BTreeMap::new();
        let mut kept = 0usize;
        for m in minutes {
            let (Some(route), Some(direction), Some(speed)) =
                (m.route_id.as_ref(), m.direction_id, m.speed_kph)
            else {
                continue;
            };
            if speed.is_nan() || speed < FREEFLOW_MIN_SPEED_KPH {
                continue;
            }
            kept += 1;
            speeds
                .entry((route.clone(), direction))
                .or_default()
                .push(speed);
        }

        let mut model = FreeFlowModel::default();
        for ((route, direction), samples) in speeds {
            if let Some(p) = quantile(&samples, FREEFLOW_QUANTILE) {
                model.insert(route, direction, p);
            }
        }
        debug!(samples = kept, entries = model.len(), "Free-flow estimated");
        model
    }

    fn insert(&mut self, route: String, direction: u8, free_kph: f64) {
        self.entries
            .entry(route)
            .or_default()
            .insert(direction, free_kph.max(MIN_FREE_KPH));
    }

    pub fn get(&self, route_id: &str, direction_id: u8) -> Option<f64> {
        self.entries.get(route_id)?.get(&direction_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows sorted by route then direction.
    pub fn rows(&self) -> Vec<FreeFlowRow> {
        self.entries
            .iter()
            .flat_map(|(route, dirs)| {
                dirs.iter().map(move |(&direction_id, &free_kph)| FreeFlowRow {
                    route_id: route.clone(),
                    direction_id,
                    free_kph,
                })
            })
            .collect()
    }

    pub fn from_rows(rows: Vec<FreeFlowRow>) -> Self {
        let mut model = FreeFlowModel::default();
        for r in rows {
            model.insert(r.route_id, r.direction_id, r.free_kph);
        }
        model
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::from_rows(read_table(path)?))
    }

    /// Replaces the table at `path` in one rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_table(path, &self.rows())?;
        info!(entries = self.len(), path = %path.display(), "Free-flow table written");
        Ok(())
    }

    /// Copies the reference speed onto each row; unknown pairs stay empty.
    pub fn attach(&self, rows: &mut [MinuteRecord]) {
        let mut missing = 0usize;
        for row in rows.iter_mut() {
            row.free_kph = match (row.route_id.as_deref(), row.direction_id) {
                (Some(route), Some(direction)) => self.get(route, direction),
                _ => None,
            };
            if row.free_kph.is_none() {
                missing += 1;
            }
        }
        debug!(rows = rows.len(), missing, "Free-flow attached");
    }
}
