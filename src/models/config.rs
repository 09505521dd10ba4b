//! Configuration models for tierqa.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! The user resolves these unknowns at runtime via config file.

use serde::{Deserialize, Serialize};
use regex::{Captures, Regex};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Top-level configuration for tierqa.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// OpenAI-compatible endpoints, referenced by name from models
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,

    /// Candidate models under evaluation
    pub candidates: Vec<CandidateSpec>,

    /// Judge model (semantic equivalence oracle)
    pub judge: ModelSpec,

    /// Concurrency, retry and batching settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Output settings
    #[serde(default)]
    pub output: OutputConfig,

    /// Optional prompt overrides
    #[serde(default)]
    pub prompts: PromptConfig,
}

/// Configuration for an LLM endpoint.
///
/// K_i: All endpoints must be OpenAI-compatible (chat completions API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Base URL for the API (e.g., "http://localhost:11434/v1")
    pub base_url: String,

    /// API key (optional, can be omitted for local endpoints)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Custom headers; values can contain ${ENV_VAR}
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// HTTP timeout in seconds (default: 600)
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    /// HTTP-level attempts for rate limits and network errors (default: 2)
    #[serde(default = "default_http_retries")]
    pub max_retries: u32,
}

fn default_http_timeout() -> u64 {
    600
}

fn default_http_retries() -> u32 {
    2
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            api_key_env: None,
            headers: HashMap::new(),
            timeout_secs: default_http_timeout(),
            max_retries: default_http_retries(),
        }
    }
}

/// Specification for a model on an endpoint.
///
/// K_i: Model ID format depends on the endpoint.
/// - Hosted: "provider/model" or the vendor name (e.g., "gpt-4o")
/// - vLLM/Ollama: model name as loaded (e.g., "qwen2.5:72b")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Endpoint name, references [endpoints.<name>]
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Model ID sent to the endpoint
    pub id: String,

    /// Human-readable label
    #[serde(default)]
    pub label: Option<String>,

    /// Maximum tokens for this model
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature; candidates default to 0.7, the judge to 0.0
    #[serde(default)]
    pub temperature: Option<f64>,
}

fn default_endpoint() -> String {
    "default".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

pub const DEFAULT_CANDIDATE_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_JUDGE_TEMPERATURE: f64 = 0.0;

/// A candidate slot: a named model that may be switched off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSpec {
    /// Stable candidate name used as the result key (e.g., "model1")
    pub name: String,

    /// Disabled candidates are recorded but never invoked
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(flatten)]
    pub model: ModelSpec,
}

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Items processed concurrently (outer pool width)
    #[serde(default = "default_item_concurrency")]
    pub item_concurrency: usize,

    /// Candidates dispatched concurrently per item (inner pool width)
    #[serde(default = "default_candidate_concurrency")]
    pub candidate_concurrency: usize,

    /// Finalized items buffered before a flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Retries per candidate call after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base of the exponential backoff between retries
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Timeout per candidate call
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Timeout per judge call
    #[serde(default = "default_judge_timeout")]
    pub judge_timeout_secs: u64,

    /// Skip items already persisted by a previous run
    #[serde(default = "default_true")]
    pub resume: bool,
}

fn default_item_concurrency() -> usize {
    4
}

fn default_candidate_concurrency() -> usize {
    3
}

fn default_batch_size() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_timeout() -> u64 {
    600
}

fn default_judge_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            item_concurrency: default_item_concurrency(),
            candidate_concurrency: default_candidate_concurrency(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_timeout(),
            judge_timeout_secs: default_judge_timeout(),
            resume: true,
        }
    }
}

/// Physical encoding of partition files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Whole-collection JSON array, rewritten on flush
    #[default]
    Json,
    /// One record per line, appended on flush
    Jsonl,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Jsonl => "jsonl",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "jsonl" => Ok(Self::Jsonl),
            other => Err(format!("unknown output format '{other}' (expected json or jsonl)")),
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory holding partitions, summary and audit log
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    #[serde(default)]
    pub format: OutputFormat,

    /// Record raw model and judge exchanges to audit.jsonl
    #[serde(default = "default_true")]
    pub audit_log: bool,

    /// Keep judge reasoning and timings on candidate results
    #[serde(default)]
    pub debug: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            format: OutputFormat::default(),
            audit_log: true,
            debug: false,
        }
    }
}

/// Prompt overrides (paths to text files).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default)]
    pub candidate_system: Option<PathBuf>,

    #[serde(default)]
    pub judge_system: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candidates.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[candidates]] entry is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for candidate in &self.candidates {
            if !seen.insert(candidate.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate candidate name '{}'",
                    candidate.name
                )));
            }
        }

        let p = &self.pipeline;
        if p.item_concurrency == 0 || p.candidate_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "pipeline concurrency widths must be at least 1".to_string(),
            ));
        }
        if p.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.batch_size must be at least 1".to_string(),
            ));
        }

        self.validate_endpoints()
    }

    /// Endpoints that a run will actually call: enabled candidates plus the judge.
    pub fn referenced_endpoints(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self
            .candidates
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.model.endpoint.as_str())
            .chain([self.judge.endpoint.as_str()])
            .collect();
        names.into_iter().map(str::to_string).collect()
    }

    /// K_i: every referenced endpoint has an `[endpoints.<name>]` table.
    pub fn validate_endpoints(&self) -> Result<(), ConfigError> {
        match self
            .referenced_endpoints()
            .into_iter()
            .find(|name| !self.endpoints.contains_key(name))
        {
            Some(missing) => Err(ConfigError::EndpointNotFound(missing)),
            None => Ok(()),
        }
    }

    /// Resolve the API key for an endpoint.
    ///
    /// An inline `api_key` wins (with `${VAR}` expansion), then `api_key_env`.
    /// Endpoints with neither run unauthenticated.
    pub fn resolve_endpoint_api_key(&self, name: &str) -> Result<Option<String>, ConfigError> {
        let endpoint = self
            .endpoints
            .get(name)
            .ok_or_else(|| ConfigError::EndpointNotFound(name.to_string()))?;

        match (&endpoint.api_key, &endpoint.api_key_env) {
            (Some(key), _) => Ok(Some(expand_env_vars(key))),
            (None, Some(var)) => match std::env::var(var) {
                Ok(key) if !key.trim().is_empty() => Ok(Some(key)),
                _ => Err(ConfigError::MissingApiKey {
                    endpoint: name.to_string(),
                    env_var: var.clone(),
                }),
            },
            (None, None) => Ok(None),
        }
    }

    /// Number of candidates switched on.
    pub fn enabled_candidates(&self) -> usize {
        self.candidates.iter().filter(|c| c.enabled).count()
    }
}

fn env_placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"))
}

/// Substitute `${VAR}` placeholders from the environment.
///
/// Unset variables keep their placeholder so the failure is visible downstream.
pub fn expand_env_vars(s: &str) -> String {
    env_placeholder()
        .replace_all(s, |caps: &Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Expand placeholders in every header value.
pub fn expand_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| (name.clone(), expand_env_vars(value)))
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error(
        "Missing API key for endpoint '{endpoint}': set {env_var} env var or api_key in config"
    )]
    MissingApiKey { endpoint: String, env_var: String },

    #[error("Endpoint not found: '{0}' (referenced by a model but not configured in [endpoints.*])")]
    EndpointNotFound(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
