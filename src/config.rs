//! Locations of the data tree and the shared reference artifacts.

use std::path::PathBuf;

use crate::polygons::{DEFAULT_ID_KEY, DEFAULT_NAME_KEY};

/// Where the pipeline reads and writes. Values come from the environment
/// (after `.env` is loaded) and can be overridden on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Parent of the `YYYY-MM-DD` day folders.
    pub data_root: PathBuf,
    /// Static route tables: trips, routes, shapes.
    pub static_dir: PathBuf,
    /// Segment cache location.
    pub cache_dir: PathBuf,
    pub freeflow_path: PathBuf,
    pub census_path: PathBuf,
    pub census_id_key: String,
    pub census_name_key: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig::from_lookup(|_| None)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        PipelineConfig::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or blank keys take the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        PipelineConfig {
            data_root: get("STRESS_DATA_ROOT", "data_hist").into(),
            static_dir: get("STRESS_STATIC_DIR", "gtfs_static").into(),
            cache_dir: get("STRESS_CACHE_DIR", "cache").into(),
            freeflow_path: get("STRESS_FREEFLOW_PATH", "norm_codes/freeflow_95pct.v1.csv").into(),
            census_path: get(
                "STRESS_CENSUS_PATH",
                "gtfs_static/census/dublin_ed_trimmed.geojson",
            )
            .into(),
            census_id_key: get("STRESS_CENSUS_ID_KEY", DEFAULT_ID_KEY),
            census_name_key: get("STRESS_CENSUS_NAME_KEY", DEFAULT_NAME_KEY),
        }
    }

    pub fn trips_path(&self) -> PathBuf {
        self.static_dir.join("trips.csv")
    }

    pub fn routes_path(&self) -> PathBuf {
        self.static_dir.join("routes.csv")
    }

    pub fn shapes_path(&self) -> PathBuf {
        self.static_dir.join("shapes.csv")
    }

    pub fn segments_path(&self) -> PathBuf {
        self.cache_dir.join("segments.v1.csv.gz")
    }
}
