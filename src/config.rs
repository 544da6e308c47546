//! Pipeline configuration. Passed explicitly into the orchestrator; nothing here is global.

use crate::parser::registry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Extraction tool invocation
    pub tool: ToolConfig,
    /// Plugins to run, in output order
    pub plugins: Vec<String>,
    /// Subprocess timeout and worker pool
    pub runner: RunnerConfig,
    /// Feature schema selection
    pub features: FeaturesConfig,
    /// Dump discovery, persisted artifacts, feature cache
    pub output: OutputConfig,
    /// Optional linear model for the classifier/explainer boundary
    pub classifier: ClassifierConfig,
    /// Conversational assistant endpoint
    pub assistant: AssistantConfig,
    /// Logging
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Executable, e.g. `vol` or `python3`
    pub program: PathBuf,
    /// Leading arguments, e.g. `["/opt/volatility3/vol.py", "-q"]`
    pub args: Vec<String>,
    /// Flag that points the tool at its output directory; `None` to omit
    pub output_flag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Per-plugin timeout (seconds)
    pub timeout_secs: u64,
    /// Concurrent plugin invocations; 0 picks from available parallelism
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Feature schema version handed to the classifier
    pub schema_version: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Where uploaded dumps land; newest `*.mem`/`*.raw`/`*.vmem` is picked when no path is given
    pub dumps_dir: PathBuf,
    /// Root for per-dump analysis directories
    pub output_dir: PathBuf,
    /// SQLite feature cache; disabled when `None`
    pub cache_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Ollama-compatible base URL; assistant disabled when `None`
    pub endpoint: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    /// Process feature rows included in the conversation context
    pub max_processes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tool: ToolConfig::default(),
            plugins: registry::DEFAULT_PLUGINS.iter().map(|p| p.to_string()).collect(),
            runner: RunnerConfig::default(),
            features: FeaturesConfig::default(),
            output: OutputConfig::default(),
            classifier: ClassifierConfig::default(),
            assistant: AssistantConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("vol"),
            args: Vec::new(),
            output_flag: Some("-o".to_string()),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            workers: 0,
        }
    }
}

impl RunnerConfig {
    /// Worker count actually used: configured value, else host parallelism capped at 4.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4)
    }
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            schema_version: crate::features::CURRENT_SCHEMA_VERSION,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dumps_dir: PathBuf::from("data/dumps"),
            output_dir: PathBuf::from("data/analysis"),
            cache_path: None,
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: "llama3".to_string(),
            timeout_secs: 120,
            max_processes: 15,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl PipelineConfig {
    /// Load from JSON file if present; otherwise return default
    pub fn load(path: &std::path::Path) -> Self {
        if path.exists() {
            if let Ok(data) = std::fs::read_to_string(path) {
                match serde_json::from_str::<PipelineConfig>(&data) {
                    Ok(c) => return c,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "invalid config; using defaults")
                    }
                }
            }
        }
        Self::default()
    }
}
