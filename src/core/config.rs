//! Configuration management for the routing gateway.
//!
//! This module handles loading and parsing the model registry and routing
//! policies from YAML files, with support for environment variable
//! expansion, plus the environment-derived server settings.
//!
//! The loaded [`RouterConfig`] is immutable; [`RuntimeConfig`] holds the
//! current snapshot behind a pointer that an admin reload can swap without
//! disturbing in-flight requests.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

/// Main routing configuration: model registry, provider endpoints, policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Model registry entries
    #[serde(default)]
    pub models: Vec<ModelSpec>,

    /// Upstream provider endpoints keyed by the `provider` tag of models
    #[serde(default)]
    pub providers: Vec<ProviderEndpointConfig>,

    /// Routing policies keyed by task type (`"default"` is the fallback)
    #[serde(default)]
    pub policies: HashMap<String, RoutingPolicy>,

    /// Chunking parameters for buffered streaming
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Optional executable evaluation of code responses
    #[serde(default)]
    pub code_eval: Option<CodeEvalConfig>,

    /// Optional judge model for borderline responses
    #[serde(default)]
    pub judge: Option<JudgeConfig>,
}

/// A single entry of the model registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Unique model id, referenced by policies and the attempt log
    pub id: String,

    /// Provider tag, must match a [`ProviderEndpointConfig`] name
    pub provider: String,

    /// Back-end model identifier sent on the wire
    pub backend_model: String,

    /// Context window size in tokens
    pub context_tokens: u32,

    /// Capability per task type, 0-5 (`"default"` applies when a task is absent)
    #[serde(default)]
    pub capabilities: HashMap<String, u8>,

    /// Relative cost weight, 0-1+
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,

    /// Whether this model participates in routing
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ModelSpec {
    /// Capability of this model for the given task type.
    ///
    /// Falls back to the `"default"` capability entry, then to 0.
    pub fn capability(&self, task: &str) -> u8 {
        self.capabilities
            .get(task)
            .or_else(|| self.capabilities.get("default"))
            .copied()
            .unwrap_or(0)
    }
}

/// Upstream endpoint for one provider tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpointConfig {
    /// Provider tag (e.g. "openai", "google")
    pub name: String,

    /// Base URL for the provider's OpenAI-compatible API
    pub api_base: String,

    /// API key for authentication
    #[serde(default)]
    pub api_key: String,

    /// Soft token budget; models are score-penalized near this limit
    #[serde(default)]
    pub soft_limit_tokens: Option<u64>,

    /// Hard token budget; models of this provider are excluded at the limit
    #[serde(default)]
    pub hard_limit_tokens: Option<u64>,
}

/// Routing policy for one task type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Ordered allow-list of model ids; empty means all registry models
    #[serde(default)]
    pub preferred: Vec<String>,

    /// Minimum capability a model must have for the task
    #[serde(default)]
    pub min_capability: u8,

    /// Quality gate the evaluated score must clear
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    /// Maximum candidates attempted per cycle
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_cycle: usize,

    /// Sleep between cycles
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Per-request wall-clock budget
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Soft quarantine applied after a quality-gate failure
    #[serde(default = "default_degrade_ms")]
    pub degrade_ms: u64,

    /// Scorer weight overrides, merged onto the defaults
    #[serde(default)]
    pub weights: ScoreWeightOverrides,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            preferred: Vec::new(),
            min_capability: 0,
            quality_threshold: default_quality_threshold(),
            max_attempts_per_cycle: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            max_wait_ms: default_max_wait_ms(),
            degrade_ms: default_degrade_ms(),
            weights: ScoreWeightOverrides::default(),
        }
    }
}

/// Partial scorer weights declared by a policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreWeightOverrides {
    pub capability: Option<f64>,
    pub reliability: Option<f64>,
    pub cost: Option<f64>,
    pub latency: Option<f64>,
    pub degrade: Option<f64>,
    pub budget: Option<f64>,
}

/// Chunking parameters for buffered streaming responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Characters per SSE chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Delay between chunks in milliseconds
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

/// Executable code-evaluation hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeEvalConfig {
    /// Shell command; the candidate text is provided on stdin
    pub command: String,

    /// Hard kill timeout for the subprocess
    #[serde(default = "default_code_eval_timeout_ms")]
    pub timeout_ms: u64,

    /// Added to the heuristic score on exit 0
    #[serde(default = "default_code_eval_weight")]
    pub weight: f64,

    /// Subtracted from the heuristic score on non-zero exit
    #[serde(default = "default_code_eval_penalty")]
    pub failure_penalty: f64,
}

/// Judge model consulted for borderline scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Registry id of the judge model
    pub model_id: String,

    /// Minimum heuristic score to bother the judge (default: threshold - 0.2)
    #[serde(default)]
    pub min_score: Option<f64>,
}

fn default_cost_weight() -> f64 {
    0.5
}

fn default_enabled() -> bool {
    true
}

fn default_quality_threshold() -> f64 {
    0.7
}

fn default_max_attempts() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    1_500
}

fn default_max_wait_ms() -> u64 {
    30_000
}

fn default_degrade_ms() -> u64 {
    30_000
}

fn default_chunk_size() -> usize {
    80
}

fn default_chunk_delay_ms() -> u64 {
    20
}

fn default_code_eval_timeout_ms() -> u64 {
    10_000
}

fn default_code_eval_weight() -> f64 {
    0.3
}

fn default_code_eval_penalty() -> f64 {
    0.4
}

impl RouterConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use llm_router_rust::core::config::RouterConfig;
    ///
    /// let config = RouterConfig::load("config.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let expanded = expand_env_vars(&content);

        let config: RouterConfig = serde_yaml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-references between models, providers, and policies.
    pub fn validate(&self) -> Result<()> {
        for model in &self.models {
            if !self.providers.iter().any(|p| p.name == model.provider) {
                anyhow::bail!(
                    "model '{}' references unknown provider '{}'",
                    model.id,
                    model.provider
                );
            }
        }
        for provider in &self.providers {
            if let (Some(soft), Some(hard)) =
                (provider.soft_limit_tokens, provider.hard_limit_tokens)
            {
                if soft > hard {
                    anyhow::bail!(
                        "provider '{}': soft limit {} exceeds hard limit {}",
                        provider.name,
                        soft,
                        hard
                    );
                }
            }
        }
        if let Some(judge) = &self.judge {
            if !self.models.iter().any(|m| m.id == judge.model_id) {
                anyhow::bail!("judge model '{}' is not in the registry", judge.model_id);
            }
        }
        Ok(())
    }

    /// Look up the routing policy for a task type, falling back to `"default"`.
    pub fn policy_for(&self, task: &str) -> RoutingPolicy {
        self.policies
            .get(task)
            .or_else(|| self.policies.get("default"))
            .cloned()
            .unwrap_or_default()
    }

    /// Find a registry model by id.
    pub fn model(&self, id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Find a provider endpoint by tag.
    pub fn provider(&self, name: &str) -> Option<&ProviderEndpointConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

/// Server settings derived from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to
    pub port: u16,

    /// Path of the embedded state database file
    pub state_db_path: String,

    /// Shared secret gating the resume path
    pub admin_token: Option<String>,

    /// Allow resume without the admin token
    pub allow_insecure_resume: bool,

    /// Upstream request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            state_db_path: "data/state.sqlite".to_string(),
            admin_token: None,
            allow_insecure_resume: false,
            request_timeout_secs: 300,
        }
    }
}

impl ServerConfig {
    /// Read server settings from `PORT`, `STATE_DB_PATH`, `ADMIN_TOKEN`,
    /// `ALLOW_INSECURE_RESUME`, and `REQUEST_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let port = match std::env::var("PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("Invalid PORT value: {}", value))?,
            Err(_) => defaults.port,
        };

        let state_db_path =
            std::env::var("STATE_DB_PATH").unwrap_or(defaults.state_db_path);

        let admin_token = std::env::var("ADMIN_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());

        let allow_insecure_resume = std::env::var("ALLOW_INSECURE_RESUME")
            .map(|v| str_to_bool(&v))
            .unwrap_or(false);

        let request_timeout_secs = std::env::var("REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.request_timeout_secs);

        Ok(Self {
            port,
            state_db_path,
            admin_token,
            allow_insecure_resume,
            request_timeout_secs,
        })
    }
}

/// Holder for the current [`RouterConfig`] snapshot.
///
/// Requests clone the `Arc` once at arrival and keep routing against that
/// snapshot; `replace` swaps the pointer for subsequent requests only, so
/// reload never blocks the request path.
pub struct RuntimeConfig {
    inner: ArcSwap<RouterConfig>,
}

impl RuntimeConfig {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
        }
    }

    /// Current configuration snapshot.
    pub fn snapshot(&self) -> Arc<RouterConfig> {
        self.inner.load_full()
    }

    /// Atomically swap in a new configuration for subsequent requests.
    pub fn replace(&self, config: RouterConfig) {
        self.inner.store(Arc::new(config));
    }
}

/// Substitute `${VAR}` references in raw configuration text with values
/// from the environment. `${VAR:-fallback}` and `${VAR:fallback}` supply a
/// replacement for unset variables; a reference with no fallback expands to
/// the empty string.
pub fn expand_env_vars(content: &str) -> String {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-?([^}]*))?\}")
        .expect("env reference pattern is valid");

    pattern
        .replace_all(content, |caps: &regex::Captures| {
            let fallback = caps.get(2).map_or("", |m| m.as_str());
            match std::env::var(&caps[1]) {
                Ok(value) => value,
                Err(_) => fallback.to_string(),
            }
        })
        .into_owned()
}

/// Interpret a flag value from configuration or a request header.
///
/// Anything other than an affirmative ("true", "1", "yes", "on", in any
/// case) is false.
pub fn str_to_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    ["true", "1", "yes", "on"].contains(&normalized.as_str())
}
