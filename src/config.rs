//! Configuration loading and validation.
//!
//! A single `config.toml` holds everything; environment variables override
//! individual fields at startup (`AGENTFLOW_<SECTION>_<FIELD>`), matching the
//! defaults-then-file-then-env precedence the rest of the ambient stack uses.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Sandbox backend selection and resource limits.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Executor scheduling configuration.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Block synthesizer configuration.
    #[serde(default)]
    pub synthesizer: SynthesizerConfig,

    /// Language capability (generation + embedding) configuration.
    #[serde(default)]
    pub capability: CapabilityConfig,

    /// Block registry configuration.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Sandbox network egress policy.
    #[serde(default)]
    pub egress: EgressConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            executor: ExecutorConfig::default(),
            synthesizer: SynthesizerConfig::default(),
            capability: CapabilityConfig::default(),
            registry: RegistryConfig::default(),
            egress: EgressConfig::default(),
        }
    }
}

/// Which sandbox backend to use for Python execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackendKind {
    /// Detect Docker at startup, fall back to subprocess.
    #[default]
    Auto,
    /// Always use the container backend.
    Docker,
    /// Always use the subprocess backend.
    Subprocess,
}

/// How sandboxes are allocated across a pipeline run (open question in
/// `SPEC_FULL.md` §9, resolved there in favor of per-block by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// Every python node gets its own disposable sandbox.
    #[default]
    PerBlock,
    /// One sandbox per run, packages installed once, nodes run serially
    /// through it.
    SharedFlow,
}

/// Sandbox resource limits and backend selection.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Which backend to use.
    #[serde(default)]
    pub backend: SandboxBackendKind,

    /// Per-block vs. shared-flow sandbox allocation.
    #[serde(default)]
    pub mode: SandboxMode,

    /// Memory limit in megabytes.
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,

    /// CPU core limit.
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: f64,

    /// Default execution timeout in seconds.
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,

    /// Base Docker image for the container backend.
    #[serde(default = "default_sandbox_image")]
    pub image: String,

    /// Optional Docker runtime override (e.g. `"runsc"` for gVisor).
    #[serde(default)]
    pub runtime: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackendKind::default(),
            mode: SandboxMode::default(),
            memory_mb: default_memory_mb(),
            cpu_cores: default_cpu_cores(),
            exec_timeout_secs: default_exec_timeout_secs(),
            image: default_sandbox_image(),
            runtime: None,
        }
    }
}

/// Network egress policy for `Input`-category blocks with `needs_network`.
#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// Domains the sandbox's forward proxy permits beyond package
    /// registries (which are always allowed).
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
        }
    }
}

/// Executor (DAG scheduler) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of nodes running concurrently (spec §4.F default: 4).
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
        }
    }
}

/// Block synthesizer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SynthesizerConfig {
    /// Maximum generate-compile-execute-validate-repair iterations before
    /// `SynthesisError.MaxIterations` (spec §4.C default: 6).
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Deadline for the synthesis loop's language calls, in seconds.
    #[serde(default = "default_synthesis_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            deadline_secs: default_synthesis_deadline_secs(),
        }
    }
}

/// Language capability (generation + embedding) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilityConfig {
    /// Provider: "ollama" or "openai_compatible" (covers OpenAI and
    /// Anthropic's OpenAI-compatible surface).
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model identifier used for generation.
    #[serde(default = "default_model")]
    pub model: String,

    /// Model identifier used for embeddings.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Base URL for the provider's API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable name holding the API key (empty for local
    /// providers that need none).
    #[serde(default)]
    pub api_key_env: String,

    /// Minimum gap between consecutive generate/embed calls, in seconds
    /// (spec §5 default: 5s for free-tier endpoints).
    #[serde(default = "default_rate_limit_gap_secs")]
    pub rate_limit_gap_secs: u64,

    /// Default deadline for a single `generate` call, in seconds.
    #[serde(default = "default_generate_deadline_secs")]
    pub generate_deadline_secs: u64,

    /// Embedding vector dimensionality.
    #[serde(default = "default_embedding_dims")]
    pub embedding_dims: usize,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            base_url: default_base_url(),
            api_key_env: String::new(),
            rate_limit_gap_secs: default_rate_limit_gap_secs(),
            generate_deadline_secs: default_generate_deadline_secs(),
            embedding_dims: default_embedding_dims(),
        }
    }
}

/// Block registry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Cache time-to-live in seconds (spec §4.A default: 300s / 5 minutes).
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Text-match weight in hybrid search (spec §4.A default: 0.4).
    #[serde(default = "default_text_weight")]
    pub text_weight: f32,

    /// Vector-similarity weight in hybrid search (spec §4.A default: 0.6).
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            text_weight: default_text_weight(),
            vector_weight: default_vector_weight(),
        }
    }
}

/// Resolved runtime paths under `~/.agentflow`.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    /// Runtime root directory.
    pub root: PathBuf,
    /// Config file path.
    pub config_toml: PathBuf,
    /// Registry + execution SQLite database path.
    pub db_path: PathBuf,
    /// Workspace directory mounted into sandboxes.
    pub workspace_dir: PathBuf,
    /// Scripts directory for persisted block wrapper sources.
    pub scripts_dir: PathBuf,
    /// Log directory.
    pub logs_dir: PathBuf,
}

fn default_memory_mb() -> u32 {
    512
}
fn default_cpu_cores() -> f64 {
    1.0
}
fn default_exec_timeout_secs() -> u64 {
    30
}
fn default_sandbox_image() -> String {
    "agentflow-sandbox:latest".to_owned()
}
fn default_parallelism() -> usize {
    4
}
fn default_max_iterations() -> u32 {
    6
}
fn default_synthesis_deadline_secs() -> u64 {
    120
}
fn default_provider() -> String {
    "ollama".to_owned()
}
fn default_model() -> String {
    "llama3".to_owned()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_owned()
}
fn default_base_url() -> String {
    "http://localhost:11434".to_owned()
}
fn default_rate_limit_gap_secs() -> u64 {
    5
}
fn default_generate_deadline_secs() -> u64 {
    60
}
fn default_embedding_dims() -> usize {
    768
}
fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_text_weight() -> f32 {
    0.4
}
fn default_vector_weight() -> f32 {
    0.6
}

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Load configuration from `path` if it exists, otherwise fall back to
/// built-in defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be parsed.
pub fn load_config_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

/// Resolve the default runtime directory (`~/.agentflow/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".agentflow"))
}

/// Resolve runtime paths under `~/.agentflow`.
///
/// # Errors
///
/// Returns an error when the base config directory cannot be determined.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    let root = config_dir()?;
    Ok(RuntimePaths {
        config_toml: root.join("config.toml"),
        db_path: root.join("agentflow.db"),
        workspace_dir: root.join("workspace"),
        scripts_dir: root.join("scripts"),
        logs_dir: root.join("logs"),
        root,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.executor.parallelism, 4);
        assert_eq!(cfg.synthesizer.max_iterations, 6);
        assert_eq!(cfg.registry.cache_ttl_secs, 300);
        assert!((cfg.registry.text_weight - 0.4).abs() < f32::EPSILON);
        assert!((cfg.registry.vector_weight - 0.6).abs() < f32::EPSILON);
        assert_eq!(cfg.capability.rate_limit_gap_secs, 5);
        assert_eq!(cfg.sandbox.mode, SandboxMode::PerBlock);
    }

    #[test]
    fn test_load_config_from_toml() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[executor]
parallelism = 8

[synthesizer]
max_iterations = 3

[sandbox]
mode = "shared_flow"
"#,
        )
        .expect("write config");

        let cfg = load_config(&path).expect("parse config");
        assert_eq!(cfg.executor.parallelism, 8);
        assert_eq!(cfg.synthesizer.max_iterations, 3);
        assert_eq!(cfg.sandbox.mode, SandboxMode::SharedFlow);
        // Unset sections fall back to defaults.
        assert_eq!(cfg.capability.rate_limit_gap_secs, 5);
    }

    #[test]
    fn test_load_config_or_default_missing_file() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("missing.toml");
        let cfg = load_config_or_default(&path).expect("default config");
        assert_eq!(cfg.executor.parallelism, 4);
    }
}
