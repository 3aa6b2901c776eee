//! Configuration file loading and saving.

use std::path::{Path, PathBuf};

use super::types::Config;
use crate::error::{ConfidantError, Result};

const FILE_NAME: &str = "confidant.kdl";

impl Config {
    /// Get the explicit ~/.config/confidant/confidant.kdl path (XDG-style, cross-platform)
    fn xdg_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".config/confidant").join(FILE_NAME))
    }

    /// Get the list of config file search paths in priority order
    fn get_config_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(FILE_NAME)];

        if let Some(xdg_path) = Self::xdg_config_path() {
            paths.push(xdg_path);
        }

        // Skip the native dir when it is the XDG path (Linux)
        if let Some(config_dir) = dirs::config_dir() {
            let native_path = config_dir.join("confidant").join(FILE_NAME);
            if Self::xdg_config_path().as_ref() != Some(&native_path) {
                paths.push(native_path);
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join("confidant").join(FILE_NAME));
        }

        paths
    }

    /// Find existing config file by searching all standard locations
    pub fn find_existing_config() -> Option<PathBuf> {
        Self::get_config_search_paths()
            .into_iter()
            .find(|path| path.exists())
    }

    /// Get the default config path (~/.config/confidant/confidant.kdl)
    pub fn default_config_path() -> PathBuf {
        Self::xdg_config_path().unwrap_or_else(|| PathBuf::from(FILE_NAME))
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        knuffel::parse::<Config>(FILE_NAME, content)
            .map_err(|e| ConfidantError::config(format!("invalid {}: {}", FILE_NAME, e)))
    }

    /// Load configuration. An explicit path must exist; otherwise the search
    /// paths are tried in order and defaults are used when none exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfidantError::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Self::load_from_path(path);
        }

        match Self::find_existing_config() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Config::default()),
        }
    }

    /// Generate a config file with default values
    pub fn generate_config_file(path: Option<PathBuf>, overwrite: bool) -> Result<PathBuf> {
        let config_path = path.unwrap_or_else(Self::default_config_path);

        if config_path.exists() && !overwrite {
            return Err(ConfidantError::AlreadyExists(format!(
                "Config file already exists at: {}. Use --overwrite to replace it.",
                config_path.display()
            )));
        }

        if let Some(parent) = config_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }

        let kdl_content = r#"// confidant configuration

database path="./confidant.db"

// Names of the environment variables holding key material.
// The server key (hex X25519 private key) seals integration metadata;
// the passphrase wraps project private keys stored with store_private_key.
crypto server_key_env="CONFIDANT_SERVER_KEY" passphrase_env="CONFIDANT_KEY_PASSPHRASE"

// Failed jobs are retried after retry_backoff_secs * 2^retries
queue poll_interval_ms=500 retry_limit=5 retry_backoff_secs=5

// Pending cleanup entries are abandoned after max_attempts failed retries
reconciler schedule="*/5 * * * *" max_attempts=5

// RUST_LOG overrides level; format is "text" or "json"
logging level="info" format="text"
"#;

        std::fs::write(&config_path, kdl_content)?;
        Ok(config_path)
    }

    /// Serialize the effective configuration to KDL
    pub fn to_kdl(&self) -> String {
        let mut output = String::new();
        let logging = self.logging();

        output.push_str("// confidant configuration file\n\n");
        output.push_str(&format!(
            "database path=\"{}\"\n",
            self.db_path().display()
        ));
        output.push_str(&format!(
            "crypto server_key_env=\"{}\" passphrase_env=\"{}\"\n",
            self.server_key_env(),
            self.passphrase_env()
        ));
        output.push_str(&format!(
            "queue poll_interval_ms={} retry_limit={} retry_backoff_secs={}\n",
            self.poll_interval_ms(),
            self.retry_limit(),
            self.retry_backoff_secs()
        ));
        output.push_str(&format!(
            "reconciler schedule=\"{}\" max_attempts={}\n",
            self.reconcile_schedule(),
            self.max_attempts()
        ));
        output.push_str(&format!(
            "logging level=\"{}\" format=\"{}\"\n",
            logging.level(),
            if logging.json() { "json" } else { "text" }
        ));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.db_path(), PathBuf::from("./confidant.db"));
        assert_eq!(config.reconcile_schedule(), "*/5 * * * *");
        assert_eq!(config.max_attempts(), 5);
        assert_eq!(config.server_key_env(), "CONFIDANT_SERVER_KEY");
        assert!(!config.logging().json());
    }

    #[test]
    fn parses_every_node() {
        let config = Config::parse(
            r#"
            database path="/var/lib/confidant.db"
            queue poll_interval_ms=50 retry_limit=2 retry_backoff_secs=1
            reconciler schedule="0 * * * *" max_attempts=3
            logging level="debug" format="json"
            "#,
        )
        .unwrap();

        assert_eq!(config.db_path(), PathBuf::from("/var/lib/confidant.db"));
        assert_eq!(config.poll_interval_ms(), 50);
        assert_eq!(config.retry_limit(), 2);
        assert_eq!(config.reconcile_schedule(), "0 * * * *");
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.logging().level(), "debug");
        assert!(config.logging().json());
        assert_eq!(config.get("queue.retry_backoff_secs").unwrap(), "1");
    }

    #[test]
    fn unknown_setting_is_rejected() {
        let err = Config::default().get("queue.nope").unwrap_err();
        assert!(err.to_string().contains("Valid settings"));
    }

    #[test]
    fn generated_file_parses_and_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/confidant.kdl");

        let written = Config::generate_config_file(Some(path.clone()), false).unwrap();
        assert_eq!(written, path);
        assert!(Config::generate_config_file(Some(path.clone()), false).is_err());

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.retry_limit(), 5);

        let reparsed = Config::parse(&config.to_kdl()).unwrap();
        assert_eq!(reparsed.to_kdl(), config.to_kdl());
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.kdl"))).is_err());
    }
}
