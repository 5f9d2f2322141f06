//! Configuration structures for AxonFleet
//!
//! One `FleetConfig` describes a whole fleet. The supervisor fans it out into
//! one copy per serving identity; each worker then runs with its own copy.
//! Configurations are loaded from YAML files and can be overridden by
//! environment variables of the form `AXONFLEET__SECTION__KEY`.

use crate::error::{FleetError, Result};
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "AXONFLEET_CONFIG";

/// Prefix for per-key environment overrides
pub const ENV_PREFIX: &str = "AXONFLEET";

/// Top-level configuration for AxonFleet components
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Wallet / key configuration
    #[serde(default)]
    pub wallet: WalletConfig,

    /// Serving endpoint configuration
    #[serde(default)]
    pub axon: AxonConfig,

    /// Serving loop configuration
    #[serde(default)]
    pub neuron: NeuronConfig,

    /// Reference model configuration
    #[serde(default)]
    pub model: ModelConfig,

    /// Shared state configuration
    #[serde(default)]
    pub metagraph: MetagraphConfig,

    /// Process supervision configuration
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Wallet configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Coldkey (wallet) name
    #[serde(default = "default_wallet_name")]
    pub name: String,

    /// Hotkey name
    #[serde(default = "default_hotkey")]
    pub hotkey: String,

    /// Comma-separated `coldkey:hotkey` list; one worker process per entry
    #[serde(default)]
    pub shared_keys: Option<String>,
}

/// Axon (serving endpoint) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxonConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Serving port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Comma-separated ports, parallel to `wallet.shared_keys`
    #[serde(default)]
    pub shared_ports: Option<String>,

    /// Bind the serving port at startup so two workers cannot share it
    #[serde(default = "default_reserve_port")]
    pub reserve_port: bool,
}

/// Serving loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeuronConfig {
    /// Neuron name, used in the working directory path
    #[serde(default = "default_neuron_name")]
    pub name: String,

    /// Compute device ("cpu", "cuda", "cuda:N")
    #[serde(default = "default_device")]
    pub device: String,

    /// Local steps between publish/pull cycles
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,

    /// Successful local steps per training epoch
    #[serde(default = "default_local_epochs")]
    pub local_epochs: u64,

    /// Smoothing constant for the running weight row
    #[serde(default = "default_smoothing")]
    pub smoothing: f32,

    /// Initial learning rate
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    /// SGD momentum
    #[serde(default = "default_momentum")]
    pub momentum: f32,

    /// Sequences per training batch
    #[serde(default = "default_batch_size")]
    pub batch_size_train: usize,

    /// Tokens per sequence
    #[serde(default = "default_sequence_length")]
    pub sequence_length: usize,

    /// Local steps between info-level progress logs
    #[serde(default = "default_log_interval")]
    pub log_interval: u64,

    /// Extra attempts for a failed publish/pull cycle before escalating
    #[serde(default = "default_sync_retries")]
    pub sync_retries: u32,

    /// Pause between publish/pull attempts in milliseconds
    #[serde(default = "default_sync_retry_backoff")]
    pub sync_retry_backoff_ms: u64,

    /// Stop after this many epochs (unbounded when unset)
    #[serde(default)]
    pub max_epochs: Option<u64>,

    /// Root directory for per-identity state
    #[serde(default = "default_datapath")]
    pub datapath: PathBuf,

    /// Shared parameter file (defaults to `{datapath}/shared_parameters.bin`)
    #[serde(default)]
    pub parameters_path: Option<PathBuf>,

    /// Trial identifier recorded in checkpoints
    #[serde(default)]
    pub trial_id: Option<String>,
}

/// Reference model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,

    /// Embedding dimension
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Seed for shared parameter initialization
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Shared state backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetagraphBackend {
    /// Process-local state (single-process mode and tests)
    Memory,

    /// JSON document on disk, shared by all worker processes
    File,
}

impl Default for MetagraphBackend {
    fn default() -> Self {
        MetagraphBackend::File
    }
}

/// Shared state configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetagraphConfig {
    /// Backend
    #[serde(default)]
    pub backend: MetagraphBackend,

    /// Location of the shared document (file backend)
    #[serde(default = "default_metagraph_path")]
    pub path: PathBuf,

    /// Upper bound on waiting for a publish to be included, in milliseconds
    #[serde(default = "default_inclusion_timeout")]
    pub inclusion_timeout_ms: u64,
}

/// Process supervision configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Liveness poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound on draining an exited worker's reports, in milliseconds
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_ms: u64,

    /// Directory for per-worker config files (defaults to `{datapath}/runs`)
    #[serde(default)]
    pub run_dir: Option<PathBuf>,
}

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Dump Prometheus metrics to the log on shutdown
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

/// Default value functions
fn default_wallet_name() -> String {
    "default".to_string()
}

fn default_hotkey() -> String {
    "default".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8091
}

fn default_reserve_port() -> bool {
    true
}

fn default_neuron_name() -> String {
    "core_server".to_string()
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_sync_interval() -> u64 {
    100
}

fn default_local_epochs() -> u64 {
    10
}

fn default_smoothing() -> f32 {
    0.03
}

fn default_learning_rate() -> f32 {
    0.01
}

fn default_momentum() -> f32 {
    0.98
}

fn default_batch_size() -> usize {
    4
}

fn default_sequence_length() -> usize {
    20
}

fn default_log_interval() -> u64 {
    10
}

fn default_sync_retries() -> u32 {
    2
}

fn default_sync_retry_backoff() -> u64 {
    500
}

fn default_datapath() -> PathBuf {
    PathBuf::from("data")
}

fn default_vocab_size() -> usize {
    1024
}

fn default_embedding_dim() -> usize {
    32
}

fn default_seed() -> u64 {
    42
}

fn default_metagraph_path() -> PathBuf {
    PathBuf::from("data/metagraph.json")
}

fn default_inclusion_timeout() -> u64 {
    12_000
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_settle_timeout() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            name: default_wallet_name(),
            hotkey: default_hotkey(),
            shared_keys: None,
        }
    }
}

impl Default for AxonConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            shared_ports: None,
            reserve_port: default_reserve_port(),
        }
    }
}

impl Default for NeuronConfig {
    fn default() -> Self {
        Self {
            name: default_neuron_name(),
            device: default_device(),
            sync_interval: default_sync_interval(),
            local_epochs: default_local_epochs(),
            smoothing: default_smoothing(),
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            batch_size_train: default_batch_size(),
            sequence_length: default_sequence_length(),
            log_interval: default_log_interval(),
            sync_retries: default_sync_retries(),
            sync_retry_backoff_ms: default_sync_retry_backoff(),
            max_epochs: None,
            datapath: default_datapath(),
            parameters_path: None,
            trial_id: None,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            embedding_dim: default_embedding_dim(),
            seed: default_seed(),
        }
    }
}

impl Default for MetagraphConfig {
    fn default() -> Self {
        Self {
            backend: MetagraphBackend::default(),
            path: default_metagraph_path(),
            inclusion_timeout_ms: default_inclusion_timeout(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            settle_timeout_ms: default_settle_timeout(),
            run_dir: None,
        }
    }
}

impl FleetConfig {
    /// Load configuration from a YAML file, applying `AXONFLEET__*` overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(path.as_ref(), None)
    }

    /// Load configuration from a YAML file with an explicit override map
    /// standing in for the process environment.
    pub fn load(path: &Path, env: Option<config::Map<String, String>>) -> Result<Self> {
        if !path.exists() {
            return Err(FleetError::config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .map_err(|e| FleetError::config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let config: FleetConfig = settings
            .try_deserialize()
            .map_err(|e| FleetError::config(format!("Failed to parse config file {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string (no environment overrides)
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: FleetConfig = serde_yaml::from_str(content)
            .map_err(|e| FleetError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as YAML
    pub fn write_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let neuron = &self.neuron;

        if !(neuron.momentum > 0.0 && neuron.momentum < 1.0) {
            return Err(FleetError::config("neuron.momentum must be a value between 0 and 1"));
        }
        if neuron.batch_size_train == 0 {
            return Err(FleetError::config("neuron.batch_size_train must be a positive value"));
        }
        if !(neuron.learning_rate > 0.0) {
            return Err(FleetError::config("neuron.learning_rate must be a positive value"));
        }
        if neuron.sync_interval == 0 {
            return Err(FleetError::config("neuron.sync_interval must be a positive value"));
        }
        if !(neuron.smoothing > 0.0 && neuron.smoothing <= 1.0) {
            return Err(FleetError::config("neuron.smoothing must be in (0, 1]"));
        }
        if neuron.local_epochs == 0 {
            return Err(FleetError::config("neuron.local_epochs must be a positive value"));
        }
        // Training pairs each token with its successor.
        if neuron.sequence_length < 2 {
            return Err(FleetError::config("neuron.sequence_length must be at least 2"));
        }
        if self.model.vocab_size == 0 || self.model.embedding_dim == 0 {
            return Err(FleetError::config("model.vocab_size and model.embedding_dim must be positive"));
        }
        if self.supervisor.poll_interval_ms == 0 {
            return Err(FleetError::config("supervisor.poll_interval_ms must be a positive value"));
        }

        match (&self.wallet.shared_keys, &self.axon.shared_ports) {
            (Some(_), None) => {
                return Err(FleetError::config(
                    "wallet.shared_keys is set but axon.shared_ports is missing",
                ));
            }
            (None, Some(_)) => {
                return Err(FleetError::config(
                    "axon.shared_ports is set but wallet.shared_keys is missing",
                ));
            }
            _ => {}
        }

        Ok(())
    }

    /// Whether this configuration fans out into several worker processes
    pub fn is_shared(&self) -> bool {
        self.wallet.shared_keys.is_some()
    }

    /// The identity this configuration serves under
    pub fn identity(&self) -> Identity {
        Identity {
            coldkey: self.wallet.name.clone(),
            hotkey: self.wallet.hotkey.clone(),
            port: self.axon.port,
        }
    }

    /// Substitute an identity, producing an independent worker configuration
    pub fn with_identity(&self, identity: &Identity) -> FleetConfig {
        let mut config = self.clone();
        config.wallet.name = identity.coldkey.clone();
        config.wallet.hotkey = identity.hotkey.clone();
        config.axon.port = identity.port;
        config.wallet.shared_keys = None;
        config.axon.shared_ports = None;
        config
    }

    /// Per-identity working directory: `{datapath}/{wallet}/{hotkey}/{neuron}`
    pub fn full_path(&self) -> PathBuf {
        self.neuron
            .datapath
            .join(&self.wallet.name)
            .join(&self.wallet.hotkey)
            .join(&self.neuron.name)
    }

    /// Validate and create the per-identity working directory
    pub fn check(&self) -> Result<PathBuf> {
        self.validate()?;
        let full_path = self.full_path();
        std::fs::create_dir_all(&full_path).map_err(|e| {
            FleetError::config(format!("Failed to create {}: {}", full_path.display(), e))
        })?;
        Ok(full_path)
    }

    /// Shared parameter file location
    pub fn parameters_path(&self) -> PathBuf {
        self.neuron
            .parameters_path
            .clone()
            .unwrap_or_else(|| self.neuron.datapath.join("shared_parameters.bin"))
    }

    /// Directory for per-worker config files
    pub fn run_dir(&self) -> PathBuf {
        self.supervisor
            .run_dir
            .clone()
            .unwrap_or_else(|| self.neuron.datapath.join("runs"))
    }

    /// Axon endpoint as `address:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.axon.bind_address, self.axon.port)
    }

    /// Get liveness poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor.poll_interval_ms)
    }

    /// Get report settle bound as Duration
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.supervisor.settle_timeout_ms)
    }

    /// Get publish inclusion bound as Duration
    pub fn inclusion_timeout(&self) -> Duration {
        Duration::from_millis(self.metagraph.inclusion_timeout_ms)
    }

    /// Get pause between publish attempts as Duration
    pub fn sync_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.neuron.sync_retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SHARED_YAML: &str = r#"
wallet:
  name: default
  hotkey: default
  shared_keys: "A:a,B:b"
axon:
  port: 8091
  shared_ports: "9000,9001"
neuron:
  sync_interval: 100
  device: cpu
metagraph:
  backend: memory
"#;

    #[test]
    fn test_defaults_match_serving_neuron() {
        let config = FleetConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.neuron.sync_interval, 100);
        assert_eq!(config.neuron.local_epochs, 10);
        assert!((config.neuron.smoothing - 0.03).abs() < f32::EPSILON);
        assert_eq!(config.supervisor.poll_interval_ms, 1000);
        assert_eq!(config.wallet.shared_keys, None);
        assert!(!config.is_shared());
    }

    #[test]
    fn test_parse_shared_config() {
        let config = FleetConfig::from_yaml_str(SHARED_YAML).unwrap();
        assert!(config.is_shared());
        assert_eq!(config.axon.shared_ports.as_deref(), Some("9000,9001"));
        assert_eq!(config.metagraph.backend, MetagraphBackend::Memory);
    }

    #[test]
    fn test_config_validation() {
        let mut config = FleetConfig::default();
        assert!(config.validate().is_ok());

        config.neuron.momentum = 1.0;
        assert!(config.validate().is_err());

        let mut config = FleetConfig::default();
        config.neuron.sync_interval = 0;
        assert!(config.validate().is_err());

        let mut config = FleetConfig::default();
        config.neuron.batch_size_train = 0;
        assert!(config.validate().is_err());

        let mut config = FleetConfig::default();
        config.neuron.learning_rate = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_sequence_length() {
        let mut config = FleetConfig::default();
        config.neuron.sequence_length = 1;
        assert!(matches!(config.validate(), Err(FleetError::Config(_))));

        config.neuron.sequence_length = 2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_keys_without_ports() {
        let mut config = FleetConfig::default();
        config.wallet.shared_keys = Some("A:a".to_string());
        assert!(matches!(config.validate(), Err(FleetError::Config(_))));
    }

    #[test]
    fn test_with_identity_is_independent() {
        let base = FleetConfig::from_yaml_str(SHARED_YAML).unwrap();
        let identity = Identity {
            coldkey: "B".to_string(),
            hotkey: "b".to_string(),
            port: 9001,
        };

        let mut worker = base.with_identity(&identity);
        assert_eq!(worker.identity(), identity);
        assert!(!worker.is_shared());

        worker.neuron.datapath.push("elsewhere");
        assert_eq!(base.neuron.datapath, PathBuf::from("data"));
        assert_eq!(base.wallet.name, "default");
    }

    #[test]
    fn test_full_path_layout() {
        let mut config = FleetConfig::default();
        config.neuron.datapath = PathBuf::from("/tmp/fleet");
        config.wallet.name = "cold".to_string();
        config.wallet.hotkey = "hot".to_string();
        assert_eq!(
            config.full_path(),
            PathBuf::from("/tmp/fleet/cold/hot/core_server")
        );
    }

    #[test]
    fn test_from_file_with_env_overrides() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(SHARED_YAML.as_bytes()).unwrap();

        let mut env = config::Map::new();
        env.insert("AXONFLEET__NEURON__SYNC_INTERVAL".to_string(), "5".to_string());
        env.insert("AXONFLEET__WALLET__SHARED_KEYS".to_string(), "C:c,D:d".to_string());

        let config = FleetConfig::load(file.path(), Some(env)).unwrap();
        assert_eq!(config.neuron.sync_interval, 5);
        assert_eq!(config.wallet.shared_keys.as_deref(), Some("C:c,D:d"));
        assert_eq!(config.axon.shared_ports.as_deref(), Some("9000,9001"));
    }

    #[test]
    fn test_yaml_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker-0.yaml");

        let config = FleetConfig::from_yaml_str(SHARED_YAML).unwrap();
        config.write_yaml(&path).unwrap();

        let loaded = FleetConfig::load(&path, Some(config::Map::new())).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let err = FleetConfig::from_file("/nonexistent/fleet.yaml").unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
    }
}
