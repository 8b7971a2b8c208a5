//! JSON output format for sample series
//!
//! The whole run is emitted as a single document once the child is done.

use serde::Serialize;

use crate::sampler::{RunSummary, StepRecord};

/// Root JSON output structure
#[derive(Debug, Clone, Serialize)]
pub struct JsonOutput {
    /// Format version identifier
    pub version: String,
    /// Format name
    pub format: String,
    /// Samples, when step reporting is enabled
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepRecord>,
    /// Final summary, unless suppressed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
}

impl JsonOutput {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            format: "ruse-json-v1".to_string(),
            steps: Vec::new(),
            summary: None,
        }
    }

    pub fn add_step(&mut self, step: StepRecord) {
        self.steps.push(step);
    }

    pub fn set_summary(&mut self, summary: RunSummary) {
        self.summary = Some(summary);
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Default for JsonOutput {
    fn default() -> Self {
        Self::new()
    }
}
