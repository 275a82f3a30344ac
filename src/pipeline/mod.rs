//! Per-day orchestration on top of the in-memory stage functions.

pub mod layout;
pub mod publish;
pub mod reports;
pub mod stages;

use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use tokio::sync::Semaphore;
use tracing::{Instrument, error, info};

use crate::config::PipelineConfig;
use crate::scoring::StressWeights;

pub use layout::{DayLayout, RawInput, Stage};
pub use stages::{DayRun, StageOutcome};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RangeReport {
    pub succeeded: Vec<NaiveDate>,
    pub failed: Vec<NaiveDate>,
}

/// Runs every day in `[from, to]` with at most `concurrency` days in flight.
///
/// Days are independent: a failing day is logged and reported, the others
/// carry on. Shared reference artifacts must exist before calling this; no
/// day rebuilds them.
#[tracing::instrument(skip(config, weights))]
pub async fn run_range(
    config: Arc<PipelineConfig>,
    from: NaiveDate,
    to: NaiveDate,
    weights: StressWeights,
    overwrite: bool,
    concurrency: usize,
) -> Result<RangeReport> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = Vec::new();

    for date in reports::days(from, to) {
        let sem = semaphore.clone();
        let config = config.clone();
        let span = tracing::info_span!("day", %date);

        let task = tokio::spawn(
            async move {
                let _permit = sem.acquire_owned().await?;
                let result = tokio::task::spawn_blocking(move || {
                    DayRun::new(&config, date, weights, overwrite).run_all()
                })
                .await?;
                anyhow::Ok((date, result))
            }
            .instrument(span),
        );
        tasks.push(task);
    }

    let mut report = RangeReport::default();
    for task in tasks {
        let (date, result) = task.await??;
        match result {
            Ok(outcomes) => {
                let written = outcomes
                    .iter()
                    .filter(|(_, o)| matches!(o, StageOutcome::Written { .. }))
                    .count();
                info!(%date, written, "Day complete");
                report.succeeded.push(date);
            }
            Err(e) => {
                error!(%date, error = %e, "Day failed");
                report.failed.push(date);
            }
        }
    }
    Ok(report)
}
