//! Per-day directory layout and the ordered list of day stages.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::NaiveDate;

use crate::error::PipelineError;

/// Schema tag carried by every table the pipeline writes.
pub const SCHEMA_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Join,
    Weather,
    Vanish,
    DelayNorm,
    SpeedNorm,
    WeatherNorm,
    Score,
    EdJoin,
}

impl Stage {
    /// Execution order of a full day run.
    pub const ALL: [Stage; 8] = [
        Stage::Join,
        Stage::Weather,
        Stage::Vanish,
        Stage::DelayNorm,
        Stage::SpeedNorm,
        Stage::WeatherNorm,
        Stage::Score,
        Stage::EdJoin,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Join => "join",
            Stage::Weather => "weather",
            Stage::Vanish => "vanish",
            Stage::DelayNorm => "delay-norm",
            Stage::SpeedNorm => "speed-norm",
            Stage::WeatherNorm => "weather-norm",
            Stage::Score => "score",
            Stage::EdJoin => "ed-join",
        }
    }

    /// Output table relative to the day folder, without schema tag and extension.
    fn table(self) -> &'static str {
        match self {
            Stage::Join => "veh_minute",
            Stage::Weather => "veh_minute_w",
            Stage::Vanish => "veh_minute_wv",
            Stage::DelayNorm => "norms/veh_minute_d",
            Stage::SpeedNorm => "norms/veh_minute_ds",
            Stage::WeatherNorm => "norms/veh_minute_dsw",
            Stage::Score => "norms/veh_minute_scored",
            Stage::EdJoin => "veh_minute_ed",
        }
    }

    /// The stage whose output this stage reads, if any.
    pub fn upstream(self) -> Option<Stage> {
        let i = Stage::ALL.iter().position(|&s| s == self)?;
        match self {
            Stage::Join => None,
            _ => Some(Stage::ALL[i - 1]),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name() == s.to_ascii_lowercase().replace('_', "-"))
            .ok_or_else(|| PipelineError::InvalidInput(format!("unknown stage `{s}`")))
    }
}

/// Raw tables delivered into each day folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawInput {
    Vehicles,
    Delay,
    Weather,
    TripSchedule,
}

impl RawInput {
    fn stem(self) -> &'static str {
        match self {
            RawInput::Vehicles => "vehicles",
            RawInput::Delay => "delay",
            RawInput::Weather => "weather",
            RawInput::TripSchedule => "trip_schedule",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayLayout {
    pub date: NaiveDate,
    pub dir: PathBuf,
}

impl DayLayout {
    pub fn new(data_root: &Path, date: NaiveDate) -> Self {
        DayLayout {
            date,
            dir: data_root.join(date.format("%Y-%m-%d").to_string()),
        }
    }

    /// `<stem>.csv`, or `<stem>.csv.gz` when only the compressed file exists.
    pub fn raw(&self, input: RawInput) -> PathBuf {
        let plain = self.dir.join(format!("{}.csv", input.stem()));
        let gz = self.dir.join(format!("{}.csv.gz", input.stem()));
        if !plain.exists() && gz.exists() { gz } else { plain }
    }

    pub fn output(&self, stage: Stage) -> PathBuf {
        self.dir
            .join(format!("{}.{SCHEMA_VERSION}.csv.gz", stage.table()))
    }

    /// Terminal scored table.
    pub fn scored(&self) -> PathBuf {
        self.output(Stage::Score)
    }

    pub fn agg_dir(&self) -> PathBuf {
        self.dir.join("agg")
    }
}
