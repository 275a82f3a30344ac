//! Composite `row_stress` from the normalised columns and the vanish flag.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::types::MinuteRecord;

/// Allowed drift of the weight sum from exactly 1.00.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

/// Weights as written in a configuration file, before validation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RawWeights {
    pub delay: f64,
    pub speed: f64,
    pub rain: f64,
    pub heat: f64,
    pub cold: f64,
    pub vanish: f64,
}

/// Composite weights, guaranteed non-negative and summing to 1.00.
///
/// Only constructible through validation, so any [`StressWeights`] in hand
/// keeps `row_stress` inside [0,1] when its inputs are.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWeights", into = "RawWeights")]
pub struct StressWeights {
    delay: f64,
    speed: f64,
    rain: f64,
    heat: f64,
    cold: f64,
    vanish: f64,
}

impl TryFrom<RawWeights> for StressWeights {
    type Error = PipelineError;

    fn try_from(w: RawWeights) -> Result<Self, Self::Error> {
        let named = [
            ("delay", w.delay),
            ("speed", w.speed),
            ("rain", w.rain),
            ("heat", w.heat),
            ("cold", w.cold),
            ("vanish", w.vanish),
        ];
        for (name, value) in named {
            if !value.is_finite() || value < 0.0 {
                return Err(PipelineError::InvalidWeights {
                    reason: format!("{name} weight must be a non-negative number, got {value}"),
                });
            }
        }

        let sum: f64 = named.iter().map(|(_, v)| v).sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(PipelineError::InvalidWeights {
                reason: format!("weights sum to {sum}, expected 1.00"),
            });
        }

        Ok(StressWeights {
            delay: w.delay,
            speed: w.speed,
            rain: w.rain,
            heat: w.heat,
            cold: w.cold,
            vanish: w.vanish,
        })
    }
}

impl From<StressWeights> for RawWeights {
    fn from(w: StressWeights) -> Self {
        RawWeights {
            delay: w.delay,
            speed: w.speed,
            rain: w.rain,
            heat: w.heat,
            cold: w.cold,
            vanish: w.vanish,
        }
    }
}

/// Named weight presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightPreset {
    #[default]
    Standard,
    Seasonal,
}

impl WeightPreset {
    pub fn raw(self) -> RawWeights {
        match self {
            WeightPreset::Standard => RawWeights {
                delay: 0.30,
                speed: 0.30,
                rain: 0.00,
                heat: 0.15,
                cold: 0.00,
                vanish: 0.25,
            },
            WeightPreset::Seasonal => RawWeights {
                delay: 0.40,
                speed: 0.30,
                rain: 0.10,
                heat: 0.08,
                cold: 0.02,
                vanish: 0.10,
            },
        }
    }
}

impl FromStr for WeightPreset {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(WeightPreset::Standard),
            "seasonal" => Ok(WeightPreset::Seasonal),
            other => Err(PipelineError::InvalidWeights {
                reason: format!("unknown preset `{other}`"),
            }),
        }
    }
}

impl fmt::Display for WeightPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightPreset::Standard => f.write_str("standard"),
            WeightPreset::Seasonal => f.write_str("seasonal"),
        }
    }
}

impl StressWeights {
    pub fn preset(preset: WeightPreset) -> Self {
        // presets are constants that satisfy the invariant
        let w = preset.raw();
        StressWeights {
            delay: w.delay,
            speed: w.speed,
            rain: w.rain,
            heat: w.heat,
            cold: w.cold,
            vanish: w.vanish,
        }
    }

    /// Loads and validates weights from a JSON object with one key per term.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading weights file {}", path.display()))?;
        let raw: RawWeights = serde_json::from_str(&content)
            .with_context(|| format!("parsing weights file {}", path.display()))?;
        Ok(StressWeights::try_from(raw)?)
    }

    /// Weighted sum over already-normalised terms.
    pub fn combine(&self, terms: &StressTerms) -> f64 {
        self.delay * terms.delay
            + self.speed * terms.speed
            + self.rain * terms.rain
            + self.heat * terms.heat
            + self.cold * terms.cold
            + self.vanish * if terms.vanish { 1.0 } else { 0.0 }
    }
}

impl Default for StressWeights {
    fn default() -> Self {
        StressWeights::preset(WeightPreset::Standard)
    }
}

/// Normalised inputs of one vehicle-minute.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StressTerms {
    pub delay: f64,
    pub speed: f64,
    pub rain: f64,
    pub heat: f64,
    pub cold: f64,
    pub vanish: bool,
}

impl StressTerms {
    /// Reads the normalised columns of a row. An empty column counts as 0;
    /// for `speed_norm` that is a moving vehicle on a route with no
    /// free-flow reference.
    pub fn from_record(row: &MinuteRecord) -> Self {
        StressTerms {
            delay: row.delay_norm.unwrap_or(0.0),
            speed: row.speed_norm.unwrap_or(0.0),
            rain: row.rain_norm.unwrap_or(0.0),
            heat: row.heat_norm.unwrap_or(0.0),
            cold: row.cold_norm.unwrap_or(0.0),
            vanish: row.vanish_anchor,
        }
    }
}

/// Fills `row_stress` on every row.
pub fn score_rows(rows: &mut [MinuteRecord], weights: &StressWeights) {
    let mut speed_filled = 0usize;
    for row in rows.iter_mut() {
        if row.speed_norm.is_none() {
            speed_filled += 1;
        }
        row.row_stress = Some(weights.combine(&StressTerms::from_record(row)));
    }
    debug!(rows = rows.len(), speed_filled, "Rows scored");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(delay: f64, speed: f64, rain: f64, heat: f64, cold: f64, vanish: f64) -> RawWeights {
        RawWeights { delay, speed, rain, heat, cold, vanish }
    }

    fn scenario_terms(vanish: bool) -> StressTerms {
        StressTerms {
            delay: 0.70,
            speed: 0.50,
            rain: 0.0,
            heat: 0.0,
            cold: 0.0,
            vanish,
        }
    }

    #[test]
    fn test_presets_are_valid() {
        for preset in [WeightPreset::Standard, WeightPreset::Seasonal] {
            assert!(StressWeights::try_from(preset.raw()).is_ok(), "{preset}");
        }
    }

    #[test]
    fn test_standard_scenario_scores() {
        let w = StressWeights::default();
        assert!((w.combine(&scenario_terms(false)) - 0.36).abs() < 1e-9);
        assert!((w.combine(&scenario_terms(true)) - 0.61).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_sum_off_one() {
        let err = StressWeights::try_from(raw(0.30, 0.30, 0.0, 0.15, 0.0, 0.24)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidWeights { .. }));
        assert!(StressWeights::try_from(raw(0.5, 0.5, 0.5, 0.0, 0.0, 0.0)).is_err());
    }

    #[test]
    fn test_rejects_negative_or_nan() {
        assert!(StressWeights::try_from(raw(1.2, -0.2, 0.0, 0.0, 0.0, 0.0)).is_err());
        assert!(StressWeights::try_from(raw(f64::NAN, 1.0, 0.0, 0.0, 0.0, 0.0)).is_err());
    }

    #[test]
    fn test_bound_holds_at_extremes() {
        let configs = [
            raw(1.0, 0.0, 0.0, 0.0, 0.0, 0.0),
            raw(0.0, 0.0, 0.0, 0.0, 0.0, 1.0),
            WeightPreset::Standard.raw(),
            WeightPreset::Seasonal.raw(),
            raw(0.1, 0.2, 0.3, 0.15, 0.05, 0.2),
        ];
        let extremes = [
            StressTerms::default(),
            StressTerms { delay: 1.0, speed: 1.0, rain: 1.0, heat: 1.0, cold: 1.0, vanish: true },
            StressTerms { delay: 1.0, speed: 0.0, rain: 1.0, heat: 0.0, cold: 1.0, vanish: false },
        ];
        for c in configs {
            let w = StressWeights::try_from(c).unwrap();
            for t in &extremes {
                let s = w.combine(t);
                assert!((0.0..=1.0 + 1e-12).contains(&s), "{c:?} {t:?} -> {s}");
            }
        }
    }

    #[test]
    fn test_weights_json_is_validated() {
        let ok: Result<StressWeights, _> = serde_json::from_str(
            r#"{"delay":0.4,"speed":0.3,"rain":0.1,"heat":0.08,"cold":0.02,"vanish":0.1}"#,
        );
        assert!(ok.is_ok());
        let bad: Result<StressWeights, _> = serde_json::from_str(
            r#"{"delay":0.4,"speed":0.3,"rain":0.1,"heat":0.08,"cold":0.02,"vanish":0.09}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_score_rows_zero_fills_missing_speed() {
        let mut rows = vec![MinuteRecord {
            delay_norm: Some(0.7),
            speed_norm: None,
            rain_norm: Some(0.0),
            heat_norm: Some(0.0),
            cold_norm: Some(0.0),
            ..Default::default()
        }];
        score_rows(&mut rows, &StressWeights::default());
        assert!((rows[0].row_stress.unwrap() - 0.21).abs() < 1e-9);
    }

    #[test]
    fn test_preset_names() {
        assert_eq!("Seasonal".parse::<WeightPreset>().unwrap(), WeightPreset::Seasonal);
        assert!("winter".parse::<WeightPreset>().is_err());
    }
}
