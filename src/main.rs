//! CLI entry point for the bus stress pipeline.
//!
//! Runs the per-day scoring stages, rebuilds the shared reference tables,
//! writes the aggregation views and publishes them.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bus_stress::config::PipelineConfig;
use bus_stress::pipeline::publish::{ArtifactSink, LocalDirSink, S3Sink, publish_day};
use bus_stress::pipeline::{DayLayout, DayRun, Stage, StageOutcome, reports, run_range};
use bus_stress::polygons::{DEFAULT_THRESHOLD, EdMetric};
use bus_stress::scoring::{StressWeights, WeightPreset};
use bus_stress::segments::MinuteFilter;
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "bus_stress")]
#[command(about = "Scores bus vehicle-minutes for stress and aggregates them", long_about = None)]
struct Cli {
    /// Parent directory of the YYYY-MM-DD day folders
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    /// Directory holding trips.csv, routes.csv and shapes.csv
    #[arg(long, global = true)]
    static_dir: Option<PathBuf>,

    /// Directory for the segment cache
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Free-flow speed table
    #[arg(long, global = true)]
    freeflow: Option<PathBuf>,

    /// Census polygons (GeoJSON)
    #[arg(long, global = true)]
    census: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct WeightArgs {
    /// Named weight preset
    #[arg(long, default_value = "standard")]
    weights: WeightPreset,

    /// JSON file with one weight per term, overrides --weights
    #[arg(long, conflicts_with = "weights")]
    weights_file: Option<PathBuf>,
}

impl WeightArgs {
    fn resolve(&self) -> Result<StressWeights> {
        match &self.weights_file {
            Some(path) => StressWeights::from_json_file(path),
            None => Ok(StressWeights::preset(self.weights)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage for one day
    Run {
        /// Day to process (default: yesterday, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Rebuild outputs that already exist
        #[arg(long, default_value_t = false)]
        overwrite: bool,

        #[command(flatten)]
        weights: WeightArgs,
    },
    /// Run a single stage for one day
    Stage {
        /// join, weather, vanish, delay-norm, speed-norm, weather-norm, score, ed-join
        #[arg(value_name = "STAGE")]
        stage: Stage,

        #[arg(long)]
        date: Option<NaiveDate>,

        #[arg(long, default_value_t = false)]
        overwrite: bool,

        #[command(flatten)]
        weights: WeightArgs,
    },
    /// Run every stage for a range of days in parallel
    RunRange {
        #[arg(long)]
        from: NaiveDate,

        #[arg(long)]
        to: NaiveDate,

        /// Maximum number of days processed at once
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,

        #[arg(long, default_value_t = false)]
        overwrite: bool,

        #[command(flatten)]
        weights: WeightArgs,
    },
    /// Rebuild the free-flow speed table from a window of days
    BuildFreeflow {
        #[arg(long)]
        from: NaiveDate,

        #[arg(long)]
        to: NaiveDate,

        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Rebuild the route segment cache from shapes.csv
    BuildSegments {
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Per-segment stress for one day
    Corridors {
        #[arg(long)]
        date: Option<NaiveDate>,

        #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: f64,

        /// Only these route ids (repeatable)
        #[arg(long = "route")]
        routes: Vec<String>,

        /// Local hour window, e.g. 7-10 or 22-3
        #[arg(long, value_parser = parse_hours)]
        hours: Option<(u32, u32)>,
    },
    /// Per-census-polygon stress over one or more days
    Eds {
        #[arg(long = "date", required = true)]
        dates: Vec<NaiveDate>,

        /// avg, max or share
        #[arg(long, default_value = "avg")]
        metric: EdMetric,

        #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: f64,
    },
    /// Distinct vanished trips per census polygon
    VanishEds {
        #[arg(long = "date", required = true)]
        dates: Vec<NaiveDate>,
    },
    /// Day summary: trend share, vanish KPIs, time-to-vanish, leaderboard
    Summary {
        #[arg(long)]
        date: Option<NaiveDate>,

        #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: f64,
    },
    /// Upload a day's aggregation outputs
    Publish {
        #[arg(long)]
        date: Option<NaiveDate>,

        /// S3 bucket name to upload to (e.g., "my-bucket")
        #[arg(long, conflicts_with = "local_dir", required_unless_present = "local_dir")]
        s3_bucket: Option<String>,

        /// Directory to copy the artifacts into instead
        #[arg(long)]
        local_dir: Option<PathBuf>,
    },
}

fn parse_hours(s: &str) -> Result<(u32, u32), String> {
    let (a, b) = s
        .split_once('-')
        .ok_or_else(|| format!("expected H1-H2, got `{s}`"))?;
    let hour = |v: &str| -> Result<u32, String> {
        let h: u32 = v.trim().parse().map_err(|_| format!("bad hour `{v}`"))?;
        if h > 23 {
            return Err(format!("hour {h} out of range 0-23"));
        }
        Ok(h)
    };
    Ok((hour(a)?, hour(b)?))
}

fn yesterday() -> Result<NaiveDate> {
    Utc::now()
        .date_naive()
        .pred_opt()
        .context("no day before today")
}

fn day_or_yesterday(date: Option<NaiveDate>) -> Result<NaiveDate> {
    date.map_or_else(yesterday, Ok)
}

fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/bus_stress.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("logs"))
        .to_path_buf();
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("bus_stress.log"))
        .to_os_string();

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("info")));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(
            EnvFilter::try_from_env("RUST_LOG_JSON").unwrap_or_else(|_| EnvFilter::new("debug")),
        );

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file
    let _file_guard = init_logging();

    let cli = Cli::parse();

    let mut config = PipelineConfig::from_env();
    if let Some(v) = cli.data_root {
        config.data_root = v;
    }
    if let Some(v) = cli.static_dir {
        config.static_dir = v;
    }
    if let Some(v) = cli.cache_dir {
        config.cache_dir = v;
    }
    if let Some(v) = cli.freeflow {
        config.freeflow_path = v;
    }
    if let Some(v) = cli.census {
        config.census_path = v;
    }

    match cli.command {
        Commands::Run {
            date,
            overwrite,
            weights,
        } => {
            let date = day_or_yesterday(date)?;
            let run = DayRun::new(&config, date, weights.resolve()?, overwrite);
            let outcomes = run.run_all()?;
            let skipped = outcomes
                .iter()
                .filter(|(_, o)| *o == StageOutcome::Skipped)
                .count();
            info!(%date, stages = outcomes.len(), skipped, "Day finished");
        }
        Commands::Stage {
            stage,
            date,
            overwrite,
            weights,
        } => {
            let date = day_or_yesterday(date)?;
            let run = DayRun::new(&config, date, weights.resolve()?, overwrite);
            run.run_stage(stage)?;
        }
        Commands::RunRange {
            from,
            to,
            concurrency,
            overwrite,
            weights,
        } => {
            let report = run_range(
                Arc::new(config),
                from,
                to,
                weights.resolve()?,
                overwrite,
                concurrency,
            )
            .await?;
            info!(
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "Range finished"
            );
            if !report.failed.is_empty() {
                bail!("{} day(s) failed: {:?}", report.failed.len(), report.failed);
            }
        }
        Commands::BuildFreeflow {
            from,
            to,
            overwrite,
        } => {
            reports::build_freeflow(&config, from, to, overwrite)?;
        }
        Commands::BuildSegments { overwrite } => {
            let count = reports::build_segments(&config, overwrite)?;
            info!(segments = count, "Segments ready");
        }
        Commands::Corridors {
            date,
            threshold,
            routes,
            hours,
        } => {
            let filter = MinuteFilter { routes, hours };
            reports::corridors(&config, day_or_yesterday(date)?, &filter, threshold)?;
        }
        Commands::Eds {
            dates,
            metric,
            threshold,
        } => {
            reports::eds(&config, &dates, metric, threshold)?;
        }
        Commands::VanishEds { dates } => {
            reports::vanish_eds(&config, &dates)?;
        }
        Commands::Summary { date, threshold } => {
            reports::summary(&config, day_or_yesterday(date)?, threshold)?;
        }
        Commands::Publish {
            date,
            s3_bucket,
            local_dir,
        } => {
            let layout = DayLayout::new(&config.data_root, day_or_yesterday(date)?);
            let sink: Box<dyn ArtifactSink> = match (s3_bucket, local_dir) {
                (Some(bucket), _) => {
                    info!(bucket = %bucket, "S3 upload enabled");
                    Box::new(S3Sink::from_env(bucket).await)
                }
                (None, Some(dir)) => Box::new(LocalDirSink::new(dir)),
                (None, None) => bail!("either --s3-bucket or --local-dir is required"),
            };
            publish_day(&layout, sink.as_ref()).await?;
        }
    }

    Ok(())
}
