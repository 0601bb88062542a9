//! Project configuration, model tiers and the pricing table.
//!
//! Configuration lives at `<project>/.mao/config.yaml` and is created by
//! `mao init`. Every section has serde defaults so a partial file loads.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MaoError, MaoResult};
use crate::store;

/// Model tier for agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Complex implementation, architecture decisions.
    Opus,
    /// Balanced default for ordinary coding tasks.
    #[default]
    Sonnet,
    /// Simple tasks, light fixes, research sweeps.
    Haiku,
}

impl ModelTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Sonnet => "sonnet",
            Self::Haiku => "haiku",
        }
    }

    /// Collapse any model identifier to its tier.
    ///
    /// Full model names ("claude-sonnet-4-...") and short names both map;
    /// unknown strings fall back to sonnet.
    pub fn from_model_name(model: &str) -> Self {
        let lower = model.to_lowercase();
        if lower.contains("opus") {
            Self::Opus
        } else if lower.contains("haiku") {
            Self::Haiku
        } else {
            Self::Sonnet
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = MaoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opus" => Ok(Self::Opus),
            "sonnet" => Ok(Self::Sonnet),
            "haiku" => Ok(Self::Haiku),
            other => Err(MaoError::validation(format!(
                "unknown model tier '{other}' (expected opus, sonnet or haiku)"
            ))),
        }
    }
}

/// Agent execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Tier used when neither the spawn directive nor the role names one.
    #[serde(default)]
    pub default_model: ModelTier,
    /// Retry ceiling for a rejected or failed sub-task.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds an agent may run without emitting a completion marker.
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_agent_timeout() -> u64 {
    1800
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_model: ModelTier::Sonnet,
            max_retries: default_max_retries(),
            timeout_secs: default_agent_timeout(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Orchestrator log file, relative to the project root.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    ".mao/orchestrator.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Security settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// When true, agent panes launch the LLM with
    /// `--dangerously-skip-permissions`.
    #[serde(default)]
    pub allow_unsafe_operations: bool,
}

/// Multiplexer grid settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmuxConfig {
    #[serde(default = "default_grid_width")]
    pub grid_width: u16,
    #[serde(default = "default_grid_height")]
    pub grid_height: u16,
    /// Number of worker panes next to the CTO pane.
    #[serde(default = "default_num_agents")]
    pub num_agents: usize,
    #[serde(default = "default_session_name")]
    pub session_name: String,
}

fn default_grid_width() -> u16 {
    240
}

fn default_grid_height() -> u16 {
    60
}

fn default_num_agents() -> usize {
    8
}

fn default_session_name() -> String {
    "mao".to_string()
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            grid_width: default_grid_width(),
            grid_height: default_grid_height(),
            num_agents: default_num_agents(),
            session_name: default_session_name(),
        }
    }
}

/// Per-model price in dollars per million tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            input: 3.0,
            output: 15.0,
        }
    }
}

/// Pricing table for the cost estimate shown in orchestrator stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_pricing_models")]
    pub models: std::collections::HashMap<String, ModelPricing>,
    #[serde(default)]
    pub default: ModelPricing,
}

fn default_pricing_models() -> std::collections::HashMap<String, ModelPricing> {
    let mut models = std::collections::HashMap::new();
    models.insert(
        "opus".to_string(),
        ModelPricing {
            input: 15.0,
            output: 75.0,
        },
    );
    models.insert(
        "sonnet".to_string(),
        ModelPricing {
            input: 3.0,
            output: 15.0,
        },
    );
    models.insert(
        "haiku".to_string(),
        ModelPricing {
            input: 0.25,
            output: 1.25,
        },
    );
    models
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            models: default_pricing_models(),
            default: ModelPricing::default(),
        }
    }
}

impl PricingConfig {
    /// Estimated cost in USD for a token usage under `model`.
    ///
    /// Full model names are collapsed to their tier before lookup; models
    /// missing from the table use the default price.
    pub fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let tier = ModelTier::from_model_name(model);
        let price = self
            .models
            .get(model)
            .or_else(|| self.models.get(tier.as_str()))
            .unwrap_or(&self.default);
        input_tokens as f64 / 1_000_000.0 * price.input
            + output_tokens as f64 / 1_000_000.0 * price.output
    }
}

/// Top-level project configuration, persisted at `.mao/config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project_name: String,
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default)]
    pub agents: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub tmux: TmuxConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
}

fn default_language() -> String {
    "python".to_string()
}

impl ProjectConfig {
    /// A fresh configuration for `mao init`.
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            default_language: default_language(),
            agents: AgentConfig::default(),
            logging: LoggingConfig::default(),
            security: SecurityConfig::default(),
            tmux: TmuxConfig::default(),
            pricing: PricingConfig::default(),
        }
    }

    fn config_path(project_path: &Path) -> PathBuf {
        crate::mao_dir(project_path).join("config.yaml")
    }

    /// Load the configuration for a project.
    ///
    /// Missing file is a hard error pointing the operator at `mao init`.
    pub fn load(project_path: &Path) -> MaoResult<Self> {
        let path = Self::config_path(project_path);
        match store::read_yaml::<Self>(&path)? {
            Some(config) => Ok(config),
            None => Err(MaoError::validation(format!(
                "configuration not found at {}; run 'mao init' first",
                path.display()
            ))),
        }
    }

    /// Load the configuration, or fall back to defaults for an
    /// uninitialised project.
    pub fn load_or_default(project_path: &Path) -> Self {
        let name = project_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());
        Self::load(project_path).unwrap_or_else(|_| Self::new(name))
    }

    /// Persist the configuration atomically.
    pub fn save(&self, project_path: &Path) -> MaoResult<()> {
        store::write_yaml(&Self::config_path(project_path), self)
    }
}
