//! Configuration for the conductor, read from `conductor.toml`.
//!
//! Layering is file → environment (`.env` is loaded first) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! dev_mode = false
//!
//! [runtime]
//! poll_interval_ms = 100
//! retain_finished_secs = 300
//! stage_timeout_secs = 120
//!
//! [logging]
//! format = "pretty"
//! filter = "info,conductor=debug"
//! directory = "logs"
//!
//! [search]
//! endpoint = "https://search.example.com/v1/search"
//! api_key = "..."
//!
//! [stages.research]
//! api_base = "https://llm.example.com/v1"
//! api_key = "..."
//! model = "small-model"
//! prompt = "Gather multiple perspectives..."
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::stages::StageKind;

pub const CONFIG_FILE: &str = "conductor.toml";

/// Placeholder shown instead of a stored credential. Sending it back in an
/// update leaves the stored value unchanged.
pub const MASK: &str = "********";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub stages: BTreeMap<String, StageSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enables permissive CORS for local dashboards.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Upper bound on how long a suspended run sleeps between flag checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a finished run stays in the registry.
    #[serde(default = "default_retain_finished_secs")]
    pub retain_finished_secs: u64,
    /// Optional per-stage timeout. Unset means stages may run indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timeout_secs: Option<u64>,
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_retain_finished_secs() -> u64 {
    300
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            retain_finished_secs: default_retain_finished_secs(),
            stage_timeout_secs: None,
        }
    }
}

impl RuntimeSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn retain_finished(&self) -> Duration {
        Duration::from_secs(self.retain_finished_secs)
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Directory for daily rolling log files. Logs go to stderr only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl SearchSection {
    pub fn is_live(&self) -> bool {
        non_empty(&self.endpoint) && non_empty(&self.api_key)
    }
}

/// Connection settings for one stage's completion endpoint.
///
/// All fields are opaque strings handed to the stage's client. A stage with
/// both `api_base` and `api_key` talks to a real endpoint; otherwise it runs
/// against the demo client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl StageSettings {
    pub fn is_live(&self) -> bool {
        non_empty(&self.api_base) && non_empty(&self.api_key)
    }

    pub fn masked(&self) -> Self {
        Self {
            api_key: mask(&self.api_key),
            ..self.clone()
        }
    }

    /// Overlay the fields present in `update`. A masked `api_key` is ignored.
    pub fn apply(&mut self, update: StageSettings) {
        if let Some(api_base) = update.api_base {
            self.api_base = Some(api_base);
        }
        if let Some(api_key) = update.api_key
            && api_key != MASK
        {
            self.api_key = Some(api_key);
        }
        if let Some(model) = update.model {
            self.model = Some(model);
        }
        if let Some(prompt) = update.prompt {
            self.prompt = Some(prompt);
        }
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn mask(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(|_| MASK.to_string())
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `path` if it exists, otherwise the built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Overlay `CONDUCTOR_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay settings from `lookup`, which maps a variable name to its value.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(host) = lookup("CONDUCTOR_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("CONDUCTOR_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(endpoint) = lookup("CONDUCTOR_SEARCH_ENDPOINT") {
            self.search.endpoint = Some(endpoint);
        }
        if let Some(api_key) = lookup("CONDUCTOR_SEARCH_API_KEY") {
            self.search.api_key = Some(api_key);
        }

        for kind in StageKind::ALL {
            let prefix = format!("CONDUCTOR_{}", kind.as_str().to_uppercase());
            let update = StageSettings {
                api_base: lookup(&format!("{}_API_BASE", prefix)),
                api_key: lookup(&format!("{}_API_KEY", prefix)),
                model: lookup(&format!("{}_MODEL", prefix)),
                prompt: lookup(&format!("{}_PROMPT", prefix)),
            };
            if update != StageSettings::default() {
                self.stages
                    .entry(kind.as_str().to_string())
                    .or_default()
                    .apply(update);
            }
        }
    }

    /// Copy of this configuration with every credential replaced by [`MASK`].
    pub fn masked(&self) -> Self {
        let mut masked = self.clone();
        masked.search.api_key = mask(&self.search.api_key);
        for settings in masked.stages.values_mut() {
            settings.api_key = mask(&settings.api_key);
        }
        masked
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.runtime.poll_interval_ms == 0 {
            warnings.push("runtime.poll_interval_ms is 0; using 1ms".to_string());
        }
        if self.runtime.stage_timeout_secs == Some(0) {
            warnings.push("runtime.stage_timeout_secs is 0; every stage will time out".to_string());
        }
        for name in self.stages.keys() {
            if name.parse::<StageKind>().is_err() {
                warnings.push(format!("Unknown stage '{}' in [stages]", name));
            }
        }
        if non_empty(&self.search.api_key) && !non_empty(&self.search.endpoint) {
            warnings.push("search.api_key is set but search.endpoint is not".to_string());
        }

        warnings
    }
}

/// Runtime-updatable per-stage settings shared by the server and the planner.
///
/// Every known stage always has an entry; missing prompts are filled with the
/// stage's default prompt.
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<RwLock<BTreeMap<String, StageSettings>>>,
}

impl SettingsStore {
    pub fn new(configured: &BTreeMap<String, StageSettings>) -> Self {
        let mut settings = BTreeMap::new();
        for kind in StageKind::ALL {
            let mut entry = configured.get(kind.as_str()).cloned().unwrap_or_default();
            if entry.prompt.as_deref().is_none_or(str::is_empty) {
                entry.prompt = Some(kind.default_prompt().to_string());
            }
            settings.insert(kind.as_str().to_string(), entry);
        }
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn get(&self, stage: &str) -> Option<StageSettings> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stage)
            .cloned()
    }

    pub fn masked(&self) -> BTreeMap<String, StageSettings> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, settings)| (name.clone(), settings.masked()))
            .collect()
    }

    /// Apply `updates` and return the masked result. Unknown stages are ignored.
    pub fn update(&self, updates: BTreeMap<String, StageSettings>) -> BTreeMap<String, StageSettings> {
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            for (name, update) in updates {
                match inner.get_mut(&name) {
                    Some(existing) => existing.apply(update),
                    None => tracing::debug!(stage = %name, "Ignoring settings for unknown stage"),
                }
            }
        }
        self.masked()
    }
}
