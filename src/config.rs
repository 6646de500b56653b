//! Engine configuration.
//!
//! The two step lists select and reorder the matching pipelines; an empty
//! list means the full default catalog. Per-step confidence overrides feed
//! straight into the reported fixed-point confidences.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::basic_block_steps::{basic_block_step_by_name, default_basic_block_steps};
use crate::function_steps::{default_function_steps, function_step_by_name};
use crate::matching::{BasicBlockStep, FunctionStep};
use crate::DiffError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub confidence: Option<f64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Function pipeline; empty means the default catalog.
    pub function_matching_steps: Vec<StepConfig>,
    /// Basic-block pipeline; empty means the default catalog.
    pub basic_block_matching_steps: Vec<StepConfig>,
    /// Matches below this confidence are left out of the result.
    pub min_confidence_to_report: f64,
    /// Worker threads for topology computation and per-pair basic-block
    /// matching.
    pub parallelism: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            function_matching_steps: Vec::new(),
            basic_block_matching_steps: Vec::new(),
            min_confidence_to_report: 0.0,
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl DiffConfig {
    pub fn validate(&self) -> Result<(), DiffError> {
        if self.parallelism < 1 {
            return Err(DiffError::Config("parallelism must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.min_confidence_to_report) {
            return Err(DiffError::Config(
                "min_confidence_to_report must be within [0, 1]".into(),
            ));
        }
        for step in self
            .function_matching_steps
            .iter()
            .chain(&self.basic_block_matching_steps)
        {
            if let Some(confidence) = step.confidence {
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(DiffError::Config(format!(
                        "confidence for step '{}' must be within [0, 1]",
                        step.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolves the configured function pipeline.
    pub fn function_steps(&self) -> Result<Vec<Arc<dyn FunctionStep>>, DiffError> {
        if self.function_matching_steps.is_empty() {
            return Ok(default_function_steps());
        }
        self.function_matching_steps
            .iter()
            .filter(|s| s.enabled)
            .map(|s| {
                function_step_by_name(&s.name, s.confidence).ok_or_else(|| {
                    DiffError::Config(format!("unknown function matching step '{}'", s.name))
                })
            })
            .collect()
    }

    /// Resolves the configured basic-block pipeline.
    pub fn basic_block_steps(&self) -> Result<Vec<Arc<dyn BasicBlockStep>>, DiffError> {
        if self.basic_block_matching_steps.is_empty() {
            return Ok(default_basic_block_steps());
        }
        self.basic_block_matching_steps
            .iter()
            .filter(|s| s.enabled)
            .map(|s| {
                basic_block_step_by_name(&s.name, s.confidence).ok_or_else(|| {
                    DiffError::Config(format!("unknown basic block matching step '{}'", s.name))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function_steps::FunctionStepPrimeSignature;

    #[test]
    fn default_config_resolves_full_catalogs() {
        let config = DiffConfig::default();
        config.validate().unwrap();
        assert!(config.function_steps().unwrap().len() >= 10);
        assert!(config.basic_block_steps().unwrap().len() >= 12);
    }

    #[test]
    fn disabled_steps_are_dropped() {
        let config = DiffConfig {
            function_matching_steps: vec![
                StepConfig {
                    name: FunctionStepPrimeSignature::NAME.into(),
                    enabled: true,
                    confidence: Some(0.42),
                },
                StepConfig {
                    name: "function: hash matching".into(),
                    enabled: false,
                    confidence: None,
                },
            ],
            ..Default::default()
        };
        let steps = config.function_steps().unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name(), FunctionStepPrimeSignature::NAME);
        assert_eq!(steps[0].confidence(), 0.42);
    }

    #[test]
    fn unknown_step_is_a_config_error() {
        let config = DiffConfig {
            function_matching_steps: vec![StepConfig {
                name: "function: astrology".into(),
                enabled: true,
                confidence: None,
            }],
            ..Default::default()
        };
        assert!(matches!(
            config.function_steps(),
            Err(DiffError::Config(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = DiffConfig {
            parallelism: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.parallelism = 2;
        config.min_confidence_to_report = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let json = r#"{
            "function_matching_steps": [
                {"name": "function: prime signature matching", "confidence": 0.5}
            ],
            "min_confidence_to_report": 0.1,
            "parallelism": 4
        }"#;
        let config: DiffConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.function_matching_steps[0].confidence, Some(0.5));
        assert!(config.function_matching_steps[0].enabled);
    }
}
