//! Configuration file handling for gog.
//!
//! The configuration file is stored at `$GOG_CONFIG_DIR/config.json` and holds the settings that
//! feed account and credential resolution: the keyring backend override, the account alias table
//! and the location of the OAuth client credentials. The file is optional; a missing file means
//! default settings, and it is created the first time a setting is saved.

use crate::error::AuthError;
use crate::secrets::KeyringBackend;
use crate::{utils, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const APP_NAME: &str = "gog";
const CONFIG_VERSION: u8 = 1;
const CONFIG_JSON: &str = "config.json";
const CREDENTIALS_JSON: &str = "credentials.json";
const KEYRING_DIR: &str = "keyring";

/// The `Config` object represents the configuration of the app. You instantiate it by providing
/// the path to the config directory and from there it loads `config.json`, if it exists. It
/// provides paths to other items that are expected in a certain location within the config
/// directory.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
    config_path: PathBuf,
    exists: bool,
    config_file: ConfigFile,
}

impl Config {
    /// Loads `config.json` from `dir`. A missing directory or file yields the default settings.
    ///
    /// # Errors
    /// - Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let root = utils::expand_home(&dir.into());
        let config_path = root.join(CONFIG_JSON);
        let exists = config_path.is_file();
        let config_file = if exists {
            ConfigFile::load(&config_path).await?
        } else {
            debug!("No config file at {}, using defaults", config_path.display());
            ConfigFile::default()
        };
        Ok(Self {
            root,
            config_path,
            exists,
            config_file,
        })
    }

    /// Writes the current settings to `config.json`, creating the config directory if needed.
    pub async fn save(&mut self) -> Result<()> {
        utils::make_private_dir(&self.root)
            .await
            .context("Unable to create the config directory")?;
        self.config_file.save(&self.config_path).await?;
        self.exists = true;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Whether `config.json` existed when loaded (or has since been saved).
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// The directory used by the file keyring backend.
    pub fn keyring_dir(&self) -> PathBuf {
        self.root.join(KEYRING_DIR)
    }

    pub fn keyring_backend(&self) -> Option<KeyringBackend> {
        self.config_file.keyring_backend
    }

    pub fn set_keyring_backend(&mut self, backend: KeyringBackend) {
        self.config_file.keyring_backend = Some(backend);
    }

    /// Returns the stored `client_credentials_path` if it is absolute, otherwise resolves the
    /// relative path against the config directory.
    pub fn client_credentials_path(&self) -> PathBuf {
        let p = self.config_file.client_credentials_path();
        if p.is_absolute() {
            return p;
        }
        self.root.join(p)
    }

    /// All aliases, keyed by normalized alias.
    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.config_file.account_aliases
    }

    /// Looks up the email for `alias`.
    pub fn resolve_alias(&self, alias: &str) -> Option<&str> {
        self.config_file
            .account_aliases
            .get(&normalize_alias(alias))
            .map(String::as_str)
    }

    /// Maps `alias` to `email`, replacing any previous mapping. Call `save` to persist.
    pub fn set_alias(&mut self, alias: &str, email: &str) -> Result<()> {
        let alias = normalize_alias(alias);
        if alias.is_empty() {
            return Err(AuthError::validation("empty alias").into());
        }
        if alias.contains('@') {
            return Err(AuthError::validation(format!(
                "alias '{alias}' must not contain '@', aliases are short names for emails"
            ))
            .into());
        }
        if is_auto_sentinel(&alias) {
            return Err(AuthError::validation(format!(
                "'{alias}' is reserved and cannot be used as an alias"
            ))
            .into());
        }
        let email = utils::normalize_email(email);
        if !email.contains('@') {
            return Err(AuthError::validation(format!("'{email}' is not an email address")).into());
        }
        self.config_file.account_aliases.insert(alias, email);
        Ok(())
    }

    /// Removes `alias`, returning `false` if it did not exist. Call `save` to persist.
    pub fn unset_alias(&mut self, alias: &str) -> bool {
        self.config_file
            .account_aliases
            .remove(&normalize_alias(alias))
            .is_some()
    }
}

/// Normalizes an alias for storage and lookup.
pub fn normalize_alias(alias: &str) -> String {
    alias.trim().to_lowercase()
}

/// The values `auto` and `default` (any case) mean "pick for me" rather than naming an account.
pub fn is_auto_sentinel(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "auto" | "default")
}

/// Represents the serialization and deserialization format of the configuration file.
///
/// Example configuration:
/// ```json
/// {
///   "app_name": "gog",
///   "config_version": 1,
///   "keyring_backend": "file",
///   "account_aliases": {
///     "work": "me@work.example.com"
///   },
///   "client_credentials_path": "credentials.json"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
struct ConfigFile {
    /// Application name, should always be "gog"
    app_name: String,

    /// Configuration file version
    config_version: u8,

    /// Overrides the platform default secret store backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    keyring_backend: Option<KeyringBackend>,

    /// Short names for account emails
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    account_aliases: BTreeMap<String, String>,

    /// Path to the OAuth 2.0 client credentials file (optional, relative to config.json or
    /// absolute). Defaults to $GOG_CONFIG_DIR/credentials.json if not specified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_credentials_path: Option<PathBuf>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            app_name: APP_NAME.to_string(),
            config_version: CONFIG_VERSION,
            keyring_backend: None,
            account_aliases: BTreeMap::new(),
            client_credentials_path: None,
        }
    }
}

impl ConfigFile {
    /// Loads a ConfigFile asynchronously from the specified path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config: ConfigFile = utils::deserialize(path).await?;

        anyhow::ensure!(
            config.app_name == APP_NAME,
            "Invalid app_name in config file: expected '{}', got '{}'",
            APP_NAME,
            config.app_name
        );

        Ok(config)
    }

    /// Saves the ConfigFile to the specified path.
    async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let p = path.as_ref();
        let data = serde_json::to_string_pretty(self).context("Unable to serialize config")?;
        utils::write(p, data)
            .await
            .context("Unable to write config file")
    }

    /// Gets the client credentials path.
    ///
    /// If the path is relative, it should be interpreted as relative to the config directory.
    fn client_credentials_path(&self) -> PathBuf {
        self.client_credentials_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(CREDENTIALS_JSON))
    }
}
