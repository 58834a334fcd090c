//! Engine configuration
//!
//! Defaults, optional JSON file, then environment overrides (`.env` is loaded
//! by the binary before this runs).

use crate::error::{EngineError, Result};
use crate::session::GenerationPath;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum pattern confidence accepted without consulting the language model
    pub acceptance_threshold: f64,
    pub pattern_matching_enabled: bool,
    pub enabled_paths: Vec<GenerationPath>,
    pub llm_timeout_secs: u64,
    pub dry_run_timeout_secs: u64,
    pub dry_run_row_limit: u64,
    /// Pseudo-count pulling a pattern's success rate towards 0.5 while it has little history
    pub usage_prior_weight: f64,
    pub few_shot_examples: usize,
    pub self_consistency_threshold: f64,
    pub business_rule_penalty: f64,
    pub llm: LlmSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.6,
            pattern_matching_enabled: true,
            enabled_paths: GenerationPath::ALL.to_vec(),
            llm_timeout_secs: 30,
            dry_run_timeout_secs: 15,
            dry_run_row_limit: 10,
            usage_prior_weight: 10.0,
            few_shot_examples: 3,
            self_consistency_threshold: 0.5,
            business_rule_penalty: 0.1,
            llm: LlmSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&content)
            .map_err(|e| EngineError::Configuration(format!("Invalid engine config {}: {}", path.as_ref().display(), e)))?;
        config.with_env_overrides()
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            self.llm.model = model;
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(v) = env_parse::<f64>("SQLSAGE_ACCEPTANCE_THRESHOLD")? {
            self.acceptance_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("SQLSAGE_LLM_TIMEOUT_SECS")? {
            self.llm_timeout_secs = v;
        }
        if let Some(v) = env_parse::<u64>("SQLSAGE_DRY_RUN_TIMEOUT_SECS")? {
            self.dry_run_timeout_secs = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.acceptance_threshold) {
            return Err(EngineError::Configuration(format!(
                "acceptance_threshold must be within [0, 1], got {}",
                self.acceptance_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.self_consistency_threshold) {
            return Err(EngineError::Configuration(format!(
                "self_consistency_threshold must be within [0, 1], got {}",
                self.self_consistency_threshold
            )));
        }
        if self.dry_run_row_limit == 0 {
            return Err(EngineError::Configuration("dry_run_row_limit must be positive".to_string()));
        }
        if self.usage_prior_weight < 0.0 {
            return Err(EngineError::Configuration("usage_prior_weight must not be negative".to_string()));
        }
        Ok(())
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn dry_run_timeout(&self) -> Duration {
        Duration::from_secs(self.dry_run_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| EngineError::Configuration(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
