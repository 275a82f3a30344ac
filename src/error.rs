//! Failure taxonomy for the scoring pipeline.
//!
//! Only conditions that abort a stage live here. Missing optional values and
//! geometric non-matches are handled in-line by the stages and never surface
//! as errors.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A table the stage cannot run without is absent for the requested day.
    #[error("stage `{stage}` is missing required input {}", path.display())]
    MissingInput { stage: &'static str, path: PathBuf },

    /// A table exists but its header does not satisfy the column contract.
    #[error("table `{table}` is missing column `{column}`")]
    MissingColumn { table: &'static str, column: String },

    /// Composite weights that would break the [0,1] bound of `row_stress`.
    #[error("invalid stress weights: {reason}")]
    InvalidWeights { reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl PipelineError {
    pub fn missing_input(stage: &'static str, path: impl Into<PathBuf>) -> Self {
        PipelineError::MissingInput {
            stage,
            path: path.into(),
        }
    }
}
