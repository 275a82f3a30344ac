use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::info;

use super::layout::{DayLayout, RawInput, Stage};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::freeflow::FreeFlowModel;
use crate::join::join_minutes;
use crate::normalize::{cold_norm, delay_norm, heat_norm, rain_norm, speed_norm};
use crate::polygons::{CensusZones, join_points};
use crate::scoring::{StressWeights, score_rows};
use crate::table::{read_table, write_table};
use crate::temporal::join_weather;
use crate::types::{
    DelaySample, MinuteRecord, TripRef, TripSchedule, VehicleSample, WeatherObservation,
};
use crate::vanish::flag_vanished;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Output already present and overwrite not requested.
    Skipped,
    Written { rows: usize },
}

/// Fails with [`PipelineError::MissingInput`] for the first absent path.
pub(crate) fn require(stage: &'static str, paths: &[&Path]) -> Result<(), PipelineError> {
    match paths.iter().find(|p| !p.exists()) {
        Some(missing) => Err(PipelineError::missing_input(stage, *missing)),
        None => Ok(()),
    }
}

/// One calendar day of the scoring pipeline.
#[derive(Debug, Clone)]
pub struct DayRun<'a> {
    pub config: &'a PipelineConfig,
    pub layout: DayLayout,
    pub weights: StressWeights,
    pub overwrite: bool,
}

impl<'a> DayRun<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        date: chrono::NaiveDate,
        weights: StressWeights,
        overwrite: bool,
    ) -> Self {
        DayRun {
            config,
            layout: DayLayout::new(&config.data_root, date),
            weights,
            overwrite,
        }
    }

    /// Every stage in order. Stops at the first failure; outputs of stages
    /// that already finished stay in place.
    pub fn run_all(&self) -> Result<Vec<(Stage, StageOutcome)>> {
        let mut outcomes = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            outcomes.push((stage, self.run_stage(stage)?));
        }
        Ok(outcomes)
    }

    #[tracing::instrument(skip_all, fields(date = %self.layout.date, stage = %stage))]
    pub fn run_stage(&self, stage: Stage) -> Result<StageOutcome> {
        let out = self.layout.output(stage);
        if out.exists() && !self.overwrite {
            info!(path = %out.display(), reason = "output exists", "Stage skipped");
            return Ok(StageOutcome::Skipped);
        }

        let rows = match stage {
            Stage::Join => self.join(&out)?,
            Stage::Weather => self.weather(&out)?,
            Stage::Vanish => self.vanish(&out)?,
            Stage::DelayNorm => self.delay_norm(&out)?,
            Stage::SpeedNorm => self.speed_norm(&out)?,
            Stage::WeatherNorm => self.weather_norm(&out)?,
            Stage::Score => self.score(&out)?,
            Stage::EdJoin => self.ed_join(&out)?,
        };

        info!(rows, path = %out.display(), "Stage complete");
        Ok(StageOutcome::Written { rows })
    }

    /// Rows written by the stage feeding `stage`.
    fn upstream_rows(&self, stage: Stage) -> Result<Vec<MinuteRecord>> {
        let Some(upstream) = stage.upstream() else {
            return Ok(Vec::new());
        };
        let path = self.layout.output(upstream);
        require(stage.name(), &[path.as_path()])?;
        read_table(&path)
    }

    fn raw_input(&self, stage: Stage, input: RawInput) -> Result<PathBuf, PipelineError> {
        let path = self.layout.raw(input);
        require(stage.name(), &[path.as_path()])?;
        Ok(path)
    }

    fn write(&self, out: &Path, rows: &[MinuteRecord]) -> Result<usize> {
        write_table(out, rows)?;
        Ok(rows.len())
    }

    fn join(&self, out: &Path) -> Result<usize> {
        let vehicles = self.raw_input(Stage::Join, RawInput::Vehicles)?;
        let delay = self.raw_input(Stage::Join, RawInput::Delay)?;
        let trips = self.config.trips_path();
        require(Stage::Join.name(), &[trips.as_path()])?;

        let vehicles: Vec<VehicleSample> = read_table(&vehicles)?;
        let delay: Vec<DelaySample> = read_table(&delay)?;
        let trips: Vec<TripRef> = read_table(&trips)?;
        self.write(out, &join_minutes(vehicles, &delay, &trips))
    }

    fn weather(&self, out: &Path) -> Result<usize> {
        let weather = self.raw_input(Stage::Weather, RawInput::Weather)?;
        let rows = self.upstream_rows(Stage::Weather)?;
        let weather: Vec<WeatherObservation> = read_table(&weather)?;
        self.write(out, &join_weather(rows, &weather))
    }

    fn vanish(&self, out: &Path) -> Result<usize> {
        let schedule = self.raw_input(Stage::Vanish, RawInput::TripSchedule)?;
        let mut rows = self.upstream_rows(Stage::Vanish)?;
        let schedule: Vec<TripSchedule> = read_table(&schedule)?;
        let summary = flag_vanished(&mut rows, &schedule);
        info!(vanished = summary.vanished, pairs = summary.pairs, "Vanish anchors flagged");
        self.write(out, &rows)
    }

    fn delay_norm(&self, out: &Path) -> Result<usize> {
        let mut rows = self.upstream_rows(Stage::DelayNorm)?;
        let delay: Vec<Option<f64>> = rows.iter().map(|r| r.delay_sec).collect();
        for (row, v) in rows.iter_mut().zip(delay_norm(&delay)) {
            row.delay_norm = Some(v);
        }
        self.write(out, &rows)
    }

    fn speed_norm(&self, out: &Path) -> Result<usize> {
        let freeflow = &self.config.freeflow_path;
        require(Stage::SpeedNorm.name(), &[freeflow.as_path()])?;
        let model = FreeFlowModel::load(freeflow)?;

        let mut rows = self.upstream_rows(Stage::SpeedNorm)?;
        model.attach(&mut rows);
        let speed: Vec<Option<f64>> = rows.iter().map(|r| r.speed_kph).collect();
        let free: Vec<Option<f64>> = rows.iter().map(|r| r.free_kph).collect();
        for (row, v) in rows.iter_mut().zip(speed_norm(&speed, &free)) {
            row.speed_norm = v;
        }
        self.write(out, &rows)
    }

    fn weather_norm(&self, out: &Path) -> Result<usize> {
        let mut rows = self.upstream_rows(Stage::WeatherNorm)?;
        let rain: Vec<Option<f64>> = rows.iter().map(|r| r.rain_mm).collect();
        let temp: Vec<Option<f64>> = rows.iter().map(|r| r.temp_c).collect();
        let (rain, heat, cold) = (rain_norm(&rain), heat_norm(&temp), cold_norm(&temp));
        for (i, row) in rows.iter_mut().enumerate() {
            row.rain_norm = Some(rain[i]);
            row.heat_norm = Some(heat[i]);
            row.cold_norm = Some(cold[i]);
        }
        self.write(out, &rows)
    }

    fn score(&self, out: &Path) -> Result<usize> {
        let mut rows = self.upstream_rows(Stage::Score)?;
        score_rows(&mut rows, &self.weights);
        self.write(out, &rows)
    }

    fn ed_join(&self, out: &Path) -> Result<usize> {
        let census = &self.config.census_path;
        require(Stage::EdJoin.name(), &[census.as_path()])?;
        let zones = CensusZones::load(
            census,
            &self.config.census_id_key,
            &self.config.census_name_key,
        )?;

        let rows = self.upstream_rows(Stage::EdJoin)?;
        let joined = join_points(&zones, &rows);
        write_table(out, &joined)?;
        Ok(joined.len())
    }
}
