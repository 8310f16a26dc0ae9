//! Configuration for the ledger service.
//!
//! Supports a YAML file and environment variable overrides.

use crate::sync::RetryPolicy;

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "TABLEDGER_CONFIG";
/// Environment variable overriding `datadir`.
pub const DATA_DIR_ENV: &str = "TABLEDGER_DATA_DIR";
/// Environment variable overriding `event_mode`.
pub const EVENT_MODE_ENV: &str = "TABLEDGER_EVENT_MODE";

const DEFAULT_CONFIG_FILE: &str = "tabledger.yaml";

/// Service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Root of the git checkout holding the ledger.
	pub datadir: PathBuf,
	/// Ledger file layout, relative to `datadir`.
	pub ledger: LedgerPaths,
	/// Fixed accounts used by the transaction shapes.
	pub accounts: AccountNames,
	/// Price products with `event_price` instead of `price`.
	pub event_mode: bool,
	pub retry: RetryConfig,
	/// Kept so existing config files parse; the HTTP layer lives elsewhere.
	pub http: HttpConfig,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			datadir: PathBuf::from("mut_data"),
			ledger: LedgerPaths::default(),
			accounts: AccountNames::default(),
			event_mode: false,
			retry: RetryConfig::default(),
			http: HttpConfig::default(),
		}
	}
}

/// Where the ledger files live inside the data directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LedgerPaths {
	/// Root ledger file handed to the engine.
	pub root: PathBuf,
	/// Shared file listing one `include` per instance ledger.
	pub dynamic: PathBuf,
	/// Directory holding the instance ledgers.
	pub instance_dir: PathBuf,
	/// Product definition list.
	pub products: PathBuf,
}

impl Default for LedgerPaths {
	fn default() -> Self {
		Self {
			root: PathBuf::from("bartab.beancount"),
			dynamic: PathBuf::from("ledger/dynamic.beancount"),
			instance_dir: PathBuf::from("ledger"),
			products: PathBuf::from("static/products.yml"),
		}
	}
}

/// Account names the core books against.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AccountNames {
	/// Parent of every member account.
	pub members: String,
	/// The cash drawer.
	pub cash: String,
	/// Receives the margin of every sale.
	pub income: String,
	/// Source of item units on purchase.
	pub inventory: String,
}

impl Default for AccountNames {
	fn default() -> Self {
		Self {
			members: "Liabilities:Bar:Members".to_string(),
			cash: "Assets:Cash:Bar".to_string(),
			income: "Income:Bar".to_string(),
			inventory: "Assets:Bar:Inventory".to_string(),
		}
	}
}

/// Retry configuration for push conflicts and name collisions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
	/// Upper bound on push attempts per operation; unbounded when absent.
	pub max_push_attempts: Option<u32>,
	/// Delay before trying another instance ledger name.
	pub allocation_delay_ms: u64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_push_attempts: None,
			allocation_delay_ms: 1000,
		}
	}
}

impl RetryConfig {
	pub fn policy(&self) -> RetryPolicy {
		RetryPolicy {
			max_push_attempts: self.max_push_attempts,
			allocation_delay: Duration::from_millis(self.allocation_delay_ms),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
	pub listen: String,
	pub port: u16,
}

impl Default for HttpConfig {
	fn default() -> Self {
		Self {
			listen: "localhost".to_string(),
			port: 80,
		}
	}
}

impl Config {
	/// Load configuration from file and environment.
	///
	/// Priority (highest to lowest):
	/// 1. Environment variables
	/// 2. Config file (`path`, else `TABLEDGER_CONFIG`, else `tabledger.yaml`)
	/// 3. Defaults
	///
	/// An explicitly named file must exist; the default file is optional.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let explicit = path
			.map(Path::to_path_buf)
			.or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));

		let mut config = match explicit {
			Some(path) => Self::from_file(&path)?,
			None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
				Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
			}
			None => Self::default(),
		};

		config.apply_overrides(|key| std::env::var(key).ok());
		Ok(config)
	}

	/// Load configuration from a YAML file.
	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path)
			.map_err(|e| ConfigError::FileRead(path.display().to_string(), e.to_string()))?;

		Self::from_yaml(&content)
	}

	pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
		serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
	}

	/// Apply overrides looked up by variable name.
	pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
		if let Some(dir) = lookup(DATA_DIR_ENV) {
			self.datadir = PathBuf::from(dir);
		}

		if let Some(mode) = lookup(EVENT_MODE_ENV) {
			match mode.trim().to_ascii_lowercase().as_str() {
				"1" | "true" | "yes" | "on" => self.event_mode = true,
				"0" | "false" | "no" | "off" | "" => self.event_mode = false,
				other => tracing::warn!("Ignoring invalid {}={}", EVENT_MODE_ENV, other),
			}
		}
	}

	/// Absolute location of a path from [`LedgerPaths`].
	pub fn data_path(&self, relative: &Path) -> PathBuf {
		self.datadir.join(relative)
	}
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Failed to read config file '{0}': {1}")]
	FileRead(String, String),

	#[error("Failed to parse config: {0}")]
	Parse(String),
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	#[test]
	fn test_default_config() {
		let config = Config::default();
		assert_eq!(config.ledger.root, PathBuf::from("bartab.beancount"));
		assert_eq!(config.ledger.dynamic, PathBuf::from("ledger/dynamic.beancount"));
		assert_eq!(config.accounts.cash, "Assets:Cash:Bar");
		assert_eq!(config.retry.max_push_attempts, None);
		assert!(!config.event_mode);
	}

	#[test]
	fn test_parse_yaml() {
		let yaml = r#"
datadir: /srv/bar
event_mode: true
retry:
  max_push_attempts: 5
http:
  listen: 0.0.0.0
  port: 8080
"#;
		let config = Config::from_yaml(yaml).unwrap();
		assert_eq!(config.datadir, PathBuf::from("/srv/bar"));
		assert!(config.event_mode);
		assert_eq!(config.retry.max_push_attempts, Some(5));
		assert_eq!(config.retry.allocation_delay_ms, 1000);
		assert_eq!(config.http.port, 8080);
		assert_eq!(config.accounts.members, "Liabilities:Bar:Members");
	}

	#[test]
	fn test_overrides() {
		let vars: HashMap<&str, &str> =
			HashMap::from([(DATA_DIR_ENV, "/tmp/ledger"), (EVENT_MODE_ENV, "yes")]);
		let mut config = Config::default();
		config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
		assert_eq!(config.datadir, PathBuf::from("/tmp/ledger"));
		assert!(config.event_mode);
	}

	#[test]
	fn test_missing_explicit_file_fails() {
		let err = Config::from_file(Path::new("/nonexistent/tabledger.yaml")).unwrap_err();
		assert!(matches!(err, ConfigError::FileRead(..)));
	}
}
