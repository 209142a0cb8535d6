//! # Config Loader
//!
//! Configuration loading and parsing module.
//!
//! Responsibilities:
//! - Parse TOML/JSON configuration files
//! - Apply `TELEMETRY_*` environment overrides
//! - Validate configuration legality
//! - Produce `PlatformConfig`
//!
//! # Example
//!
//! ```no_run
//! use config_loader::ConfigLoader;
//! use std::path::Path;
//!
//! let config = ConfigLoader::load(Some(Path::new("telemetry.toml"))).unwrap();
//! println!("instance: {}", config.instance_id);
//! ```

mod env;
mod parser;
mod validator;

pub use contracts::PlatformConfig;
pub use env::{apply_env_overrides, apply_overrides, ENV_PREFIX};
pub use parser::ConfigFormat;
pub use validator::validate;

use contracts::ContractError;
use std::path::Path;

/// Configuration loader
///
/// Provides static methods to load configuration from files or strings.
pub struct ConfigLoader;

impl ConfigLoader {
    /// File (optional) + process environment, then validate
    ///
    /// Without a file every field starts from its default.
    pub fn load(path: Option<&Path>) -> Result<PlatformConfig, ContractError> {
        let mut config = match path {
            Some(path) => Self::parse_file(path)?,
            None => PlatformConfig::default(),
        };
        apply_env_overrides(&mut config)?;
        validator::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from file path
    ///
    /// Automatically detects format from file extension (.toml / .json).
    /// Environment overrides are not applied.
    ///
    /// # Errors
    /// - File read failure
    /// - Unsupported format
    /// - Parse failure
    /// - Validation failure
    pub fn load_from_path(path: &Path) -> Result<PlatformConfig, ContractError> {
        let config = Self::parse_file(path)?;
        validator::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from string
    ///
    /// # Errors
    /// - Parse failure
    /// - Validation failure
    pub fn load_from_str(
        content: &str,
        format: ConfigFormat,
    ) -> Result<PlatformConfig, ContractError> {
        let config = parser::parse(content, format)?;
        validator::validate(&config)?;
        Ok(config)
    }

    /// Serialize PlatformConfig to TOML string
    pub fn to_toml(config: &PlatformConfig) -> Result<String, ContractError> {
        toml::to_string_pretty(config)
            .map_err(|e| ContractError::config_parse(format!("TOML serialize error: {e}")))
    }

    /// Serialize PlatformConfig to JSON string
    pub fn to_json(config: &PlatformConfig) -> Result<String, ContractError> {
        serde_json::to_string_pretty(config)
            .map_err(|e| ContractError::config_parse(format!("JSON serialize error: {e}")))
    }
}

impl ConfigLoader {
    fn parse_file(path: &Path) -> Result<PlatformConfig, ContractError> {
        let format = Self::detect_format(path)?;
        let content = Self::read_file(path)?;
        parser::parse(&content, format)
    }

    /// Infer configuration format from file extension
    fn detect_format(path: &Path) -> Result<ConfigFormat, ContractError> {
        let ext = path.extension().and_then(|e| e.to_str()).ok_or_else(|| {
            ContractError::config_parse("cannot determine file format from extension")
        })?;

        ConfigFormat::from_extension(ext).ok_or_else(|| {
            ContractError::config_parse(format!("unsupported config format: .{ext}"))
        })
    }

    /// Read configuration file content
    fn read_file(path: &Path) -> Result<String, ContractError> {
        Ok(std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_TOML: &str = r#"
instance_id = "node-1"

[producer_pool]
max_size = 2
idle_ttl_secs = 60

[ingest]
source_topics = ["telemetry-ingest"]
max_window_size = 500
dlq_topic = "telemetry-dlq"

[router]
global_topic = "telemetry-global"
staleness_threshold_minutes = 30
"#;

    #[test]
    fn test_load_from_str_toml() {
        let config = ConfigLoader::load_from_str(SAMPLE_TOML, ConfigFormat::Toml).unwrap();
        assert_eq!(config.instance_id, "node-1");
        assert_eq!(config.producer_pool.max_size, 2);
        assert_eq!(config.router.staleness_threshold_minutes, 30);
    }

    #[test]
    fn test_round_trip_toml() {
        let config = ConfigLoader::load_from_str(SAMPLE_TOML, ConfigFormat::Toml).unwrap();
        let serialized = ConfigLoader::to_toml(&config).unwrap();
        let again = ConfigLoader::load_from_str(&serialized, ConfigFormat::Toml).unwrap();
        assert_eq!(config.ingest.max_window_size, again.ingest.max_window_size);
        assert_eq!(config.router.global_topic, again.router.global_topic);
    }

    #[test]
    fn test_round_trip_json() {
        let config = ConfigLoader::load_from_str(SAMPLE_TOML, ConfigFormat::Toml).unwrap();
        let json = ConfigLoader::to_json(&config).unwrap();
        let again = ConfigLoader::load_from_str(&json, ConfigFormat::Json).unwrap();
        assert_eq!(config.instance_id, again.instance_id);
    }

    #[test]
    fn test_validation_runs_after_parse() {
        let content = "[ingest]\nconsumer_count = 0\n";
        let err = ConfigLoader::load_from_str(content, ConfigFormat::Toml).unwrap_err();
        assert!(err.to_string().contains("consumer_count"));
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE_TOML.as_bytes()).unwrap();

        let config = ConfigLoader::load_from_path(file.path()).unwrap();
        assert_eq!(config.ingest.max_window_size, 500);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let err = ConfigLoader::load_from_path(file.path()).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }
}
