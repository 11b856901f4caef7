//! Configuration loading for the ODV off-chain core.
//!
//! Loads a TOML file with `${VAR}` environment substitution, applies a
//! small set of environment overrides, and validates before anything
//! touches the network.

use odv_types::{AssetId, PolicyId, MIN_TRANSPORT_PAIRS};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("File not found: {0}")]
	FileNotFound(String),

	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Validation error: {0}")]
	ValidationError(String),

	#[error("Environment variable not found: {0}")]
	EnvVarNotFound(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}

/// Token names marking the four oracle output roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenNames {
	#[serde(default = "default_settings_token")]
	pub settings: String,
	#[serde(default = "default_reward_account_token")]
	pub reward_account: String,
	#[serde(default = "default_transport_token")]
	pub transport: String,
	#[serde(default = "default_agg_state_token")]
	pub agg_state: String,
}

fn default_settings_token() -> String {
	"CoreSettings".into()
}
fn default_reward_account_token() -> String {
	"RewardAccount".into()
}
fn default_transport_token() -> String {
	"RewardTransport".into()
}
fn default_agg_state_token() -> String {
	"AggregationState".into()
}

impl Default for TokenNames {
	fn default() -> Self {
		Self {
			settings: default_settings_token(),
			reward_account: default_reward_account_token(),
			transport: default_transport_token(),
			agg_state: default_agg_state_token(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSection {
	/// Script address holding every oracle output.
	pub contract_address: String,
	/// Wallet address providing fee-paying inputs and receiving change.
	pub funding_address: String,
	/// Minting policy scoping the oracle's state tokens, hex-encoded.
	pub policy_id: String,
	/// Optional fee-token policy/name; absent means base-currency fees.
	pub fee_token_policy: Option<String>,
	pub fee_token_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
	/// Transport/agg-state pairs minted at deployment.
	#[serde(default = "default_transport_pairs")]
	pub transport_pairs: usize,
	/// Upper bound on transports resolved per rewards transaction.
	#[serde(default = "default_collect_batch")]
	pub collect_batch_size: usize,
}

fn default_transport_pairs() -> usize {
	MIN_TRANSPORT_PAIRS
}
fn default_collect_batch() -> usize {
	10
}

impl Default for PoolSection {
	fn default() -> Self {
		Self {
			transport_pairs: default_transport_pairs(),
			collect_batch_size: default_collect_batch(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSection {
	/// Minimum liveness remaining before an aggregate submit is advised.
	#[serde(default = "default_submit_margin")]
	pub submit_margin_ms: u64,
	#[serde(default = "default_poll_interval")]
	pub confirm_poll_interval_ms: u64,
	#[serde(default = "default_confirm_timeout")]
	pub confirm_timeout_ms: u64,
}

fn default_submit_margin() -> u64 {
	60_000
}
fn default_poll_interval() -> u64 {
	5_000
}
fn default_confirm_timeout() -> u64 {
	180_000
}

impl Default for TimingSection {
	fn default() -> Self {
		Self {
			submit_margin_ms: default_submit_margin(),
			confirm_poll_interval_ms: default_poll_interval(),
			confirm_timeout_ms: default_confirm_timeout(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "default_initial_backoff")]
	pub initial_backoff_ms: u64,
	#[serde(default = "default_max_backoff")]
	pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
	5
}
fn default_initial_backoff() -> u64 {
	500
}
fn default_max_backoff() -> u64 {
	30_000
}

impl Default for BackendSection {
	fn default() -> Self {
		Self {
			max_retries: default_max_retries(),
			initial_backoff_ms: default_initial_backoff(),
			max_backoff_ms: default_max_backoff(),
		}
	}
}

/// Full off-chain core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
	pub oracle: OracleSection,
	#[serde(default)]
	pub pool: PoolSection,
	#[serde(default)]
	pub timing: TimingSection,
	#[serde(default)]
	pub backend: BackendSection,
	#[serde(default)]
	pub token_names: TokenNames,
}

impl OracleConfig {
	pub fn policy(&self) -> Result<PolicyId, ConfigError> {
		PolicyId::from_hex(&self.oracle.policy_id)
			.map_err(|e| ConfigError::ValidationError(format!("policy_id: {}", e)))
	}

	pub fn fee_token(&self) -> Result<Option<AssetId>, ConfigError> {
		match (&self.oracle.fee_token_policy, &self.oracle.fee_token_name) {
			(Some(policy), Some(name)) => {
				let policy = PolicyId::from_hex(policy)
					.map_err(|e| ConfigError::ValidationError(format!("fee_token_policy: {}", e)))?;
				Ok(Some(AssetId::new(policy, name.clone())))
			}
			(None, None) => Ok(None),
			_ => Err(ConfigError::ValidationError(
				"fee_token_policy and fee_token_name must be set together".into(),
			)),
		}
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.oracle.contract_address.is_empty() {
			return Err(ConfigError::ValidationError(
				"contract_address is empty".into(),
			));
		}
		if self.oracle.funding_address.is_empty() {
			return Err(ConfigError::ValidationError(
				"funding_address is empty".into(),
			));
		}
		self.policy()?;
		self.fee_token()?;
		if self.pool.transport_pairs < MIN_TRANSPORT_PAIRS {
			return Err(ConfigError::ValidationError(format!(
				"transport_pairs {} below minimum {}",
				self.pool.transport_pairs, MIN_TRANSPORT_PAIRS
			)));
		}
		if self.pool.collect_batch_size == 0 {
			return Err(ConfigError::ValidationError(
				"collect_batch_size must be positive".into(),
			));
		}
		if self.backend.initial_backoff_ms == 0
			|| self.backend.max_backoff_ms < self.backend.initial_backoff_ms
		{
			return Err(ConfigError::ValidationError(
				"backoff bounds must satisfy 0 < initial <= max".into(),
			));
		}
		Ok(())
	}
}

/// Configuration loader with environment variable substitution.
#[derive(Default)]
pub struct ConfigLoader {
	file_path: Option<String>,
	env_prefix: String,
}

impl ConfigLoader {
	pub fn new() -> Self {
		Self {
			file_path: None,
			env_prefix: "ODV_".to_string(),
		}
	}

	pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
		self.file_path = Some(path.as_ref().to_string_lossy().to_string());
		self
	}

	pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.env_prefix = prefix.into();
		self
	}

	pub async fn load(&self) -> Result<OracleConfig, ConfigError> {
		let file_path = self.file_path.as_ref().ok_or_else(|| {
			ConfigError::FileNotFound("No configuration file specified".to_string())
		})?;

		let mut config = self.load_from_file(file_path).await?;
		self.apply_env_overrides(&mut config);
		config.validate()?;
		Ok(config)
	}

	async fn load_from_file(&self, file_path: &str) -> Result<OracleConfig, ConfigError> {
		let content = tokio::fs::read_to_string(file_path).await?;
		let substituted = self.substitute_env_vars(&content)?;
		toml::from_str(&substituted).map_err(|e| ConfigError::ParseError(e.to_string()))
	}

	fn substitute_env_vars(&self, content: &str) -> Result<String, ConfigError> {
		let mut result = content.to_string();
		let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern");

		for cap in re.captures_iter(content) {
			let full_match = &cap[0];
			let var_name = &cap[1];
			let env_value = env::var(var_name)
				.map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
			result = result.replace(full_match, &env_value);
		}

		Ok(result)
	}

	fn apply_env_overrides(&self, config: &mut OracleConfig) {
		if let Ok(addr) = env::var(format!("{}CONTRACT_ADDRESS", self.env_prefix)) {
			config.oracle.contract_address = addr;
		}
		if let Ok(policy) = env::var(format!("{}POLICY_ID", self.env_prefix)) {
			config.oracle.policy_id = policy;
		}
		if let Ok(addr) = env::var(format!("{}FUNDING_ADDRESS", self.env_prefix)) {
			config.oracle.funding_address = addr;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn base_toml() -> String {
		format!(
			"[oracle]\ncontract_address = \"addr_test1example\"\nfunding_address = \"addr_test1funding\"\npolicy_id = \"{}\"\n",
			"ab".repeat(28)
		)
	}

	#[tokio::test]
	async fn loads_config_with_defaults() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(base_toml().as_bytes()).unwrap();

		let config = ConfigLoader::new()
			.with_file(file.path())
			.load()
			.await
			.unwrap();
		assert_eq!(config.pool.transport_pairs, MIN_TRANSPORT_PAIRS);
		assert_eq!(config.token_names.transport, "RewardTransport");
		assert!(config.fee_token().unwrap().is_none());
	}

	#[tokio::test]
	async fn rejects_pool_below_minimum() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		let toml = format!("{}\n[pool]\ntransport_pairs = 2\n", base_toml());
		file.write_all(toml.as_bytes()).unwrap();

		let result = ConfigLoader::new().with_file(file.path()).load().await;
		assert!(matches!(result, Err(ConfigError::ValidationError(_))));
	}

	#[test]
	fn rejects_half_configured_fee_token() {
		let config: OracleConfig = toml::from_str(&format!(
			"{}fee_token_name = \"Fee\"\n",
			base_toml()
		))
		.unwrap();
		assert!(config.validate().is_err());
	}
}
