//! The secret store: per-account refresh tokens and the default-account pointer.
//!
//! The store is a thin typed layer over a [`Backend`], which is a flat string key/value map. Which
//! backend is used is decided by [`KeyringBackendInfo::resolve`] and the backend is handed to
//! [`SecretStore::new`], so that tests and other components can inject their own.
//!
//! Key layout inside a backend:
//! - `token:<email>` holds a JSON-serialized [`Token`]
//! - `default_account` holds the default email
//!
//! Nothing is cached: every call reads the backend again, since another process may have changed
//! the keychain in the meantime.

mod crypto;
mod file;
mod keychain;
#[cfg(test)]
pub(crate) mod memory;

use crate::error::AuthError;
use crate::utils::normalize_email;
use crate::{Config, Result};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub(crate) use file::FileBackend;
pub(crate) use keychain::KeychainBackend;

/// Environment variable that overrides the configured keyring backend.
pub const KEYRING_BACKEND_ENV: &str = "GOG_KEYRING_BACKEND";

/// Environment variable holding the password for the encrypted file backend.
pub const KEYRING_PASSWORD_ENV: &str = "GOG_KEYRING_PASSWORD";

const TOKEN_KEY_PREFIX: &str = "token:";
const DEFAULT_ACCOUNT_KEY: &str = "default_account";

/// The supported secret storage backends.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    serde::Serialize,
    serde::Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum KeyringBackend {
    /// Use the OS keychain, falling back to the file backend when it cannot be reached.
    #[default]
    Auto,
    /// The OS keychain (macOS Keychain, Windows Credential Manager, Secret Service).
    Keychain,
    /// Files under the config directory, encrypted when `GOG_KEYRING_PASSWORD` is set.
    File,
}

serde_plain::derive_display_from_serialize!(KeyringBackend);
serde_plain::derive_fromstr_from_deserialize!(KeyringBackend);

/// Why a particular backend was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendSource {
    Env,
    Config,
    Default,
}

serde_plain::derive_display_from_serialize!(BackendSource);

/// The resolved backend selection and the reason for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyringBackendInfo {
    value: KeyringBackend,
    source: BackendSource,
}

impl KeyringBackendInfo {
    /// Resolves the backend from the environment and the config file. This never touches the
    /// keychain.
    pub fn resolve(config: &Config) -> Result<Self> {
        let env = std::env::var(KEYRING_BACKEND_ENV).ok();
        Self::from_sources(env.as_deref(), config.keyring_backend())
    }

    /// The pure part of `resolve`: an environment override wins over the config file, which wins
    /// over the platform default.
    pub fn from_sources(env: Option<&str>, config: Option<KeyringBackend>) -> Result<Self> {
        if let Some(value) = env.map(str::trim).filter(|v| !v.is_empty()) {
            let value: KeyringBackend = value.to_lowercase().parse().map_err(|_| {
                AuthError::validation(format!(
                    "invalid {KEYRING_BACKEND_ENV} value '{value}', expected one of: auto, \
                    keychain, file"
                ))
            })?;
            return Ok(Self {
                value,
                source: BackendSource::Env,
            });
        }
        if let Some(value) = config {
            return Ok(Self {
                value,
                source: BackendSource::Config,
            });
        }
        Ok(Self {
            value: KeyringBackend::default(),
            source: BackendSource::Default,
        })
    }

    pub fn value(&self) -> KeyringBackend {
        self.value
    }

    pub fn source(&self) -> BackendSource {
        self.source
    }
}

/// A flat key/value store for secrets. Implementations must make single-key writes atomic, but
/// nothing more: there are no cross-key transactions.
pub trait Backend: Send + Sync {
    /// The name used in messages, e.g. `keychain`.
    fn name(&self) -> &'static str;

    /// Checks that the backend can be reached, e.g. that the keychain is unlocked.
    fn probe(&self) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key`, returning `false` if it did not exist.
    fn remove(&self, key: &str) -> Result<bool>;

    /// All keys, including ones that are not tokens.
    fn keys(&self) -> Result<Vec<String>>;
}

/// One stored OAuth credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Token {
    #[zeroize(skip)]
    email: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    #[zeroize(skip)]
    services: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    #[zeroize(skip)]
    scopes: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[zeroize(skip)]
    created_at: Option<DateTime<Utc>>,
    refresh_token: String,
}

impl Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("email", &self.email)
            .field("services", &self.services)
            .field("scopes", &self.scopes)
            .field("created_at", &self.created_at)
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

impl Token {
    pub fn new(email: &str, refresh_token: impl Into<String>) -> Self {
        Self {
            email: normalize_email(email),
            services: BTreeSet::new(),
            scopes: BTreeSet::new(),
            created_at: None,
            refresh_token: refresh_token.into(),
        }
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_created_at(mut self, created_at: Option<DateTime<Utc>>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn services(&self) -> &BTreeSet<String> {
        &self.services
    }

    pub fn scopes(&self) -> &BTreeSet<String> {
        &self.scopes
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }
}

/// Returns the backend key under which the token for `email` is stored.
pub fn token_key(email: &str) -> String {
    format!("{TOKEN_KEY_PREFIX}{}", normalize_email(email))
}

/// Parses a backend key produced by [`token_key`] back into its email. Returns `None` for keys
/// that are not token keys or that could not have been produced by `token_key`.
pub fn parse_token_key(key: &str) -> Option<String> {
    let email = key.strip_prefix(TOKEN_KEY_PREFIX)?;
    if email.is_empty() || email.chars().any(char::is_whitespace) {
        return None;
    }
    if email != email.to_lowercase() {
        return None;
    }
    Some(email.to_string())
}

/// Typed access to tokens and the default account on top of a [`Backend`].
#[derive(Clone)]
pub struct SecretStore {
    backend: Arc<dyn Backend>,
}

impl Debug for SecretStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl SecretStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Opens the backend described by `info`. With `auto`, the keychain is probed and the file
    /// backend is used when the keychain cannot be reached.
    pub fn open(info: &KeyringBackendInfo, config: &Config) -> Result<Self> {
        let file_backend = || -> Arc<dyn Backend> {
            let password = std::env::var(KEYRING_PASSWORD_ENV)
                .ok()
                .filter(|p| !p.is_empty());
            Arc::new(FileBackend::new(config.keyring_dir(), password))
        };
        let backend: Arc<dyn Backend> = match info.value() {
            KeyringBackend::Keychain => Arc::new(KeychainBackend::new()),
            KeyringBackend::File => file_backend(),
            KeyringBackend::Auto => {
                let keychain = KeychainBackend::new();
                match keychain.probe() {
                    Ok(()) => Arc::new(keychain),
                    Err(e) => {
                        warn!(
                            "The OS keychain is not reachable ({e}), using the file backend in \
                            {}. Set {KEYRING_BACKEND_ENV}=file to silence this warning.",
                            config.keyring_dir().display()
                        );
                        file_backend()
                    }
                }
            }
        };
        debug!("Using the {} secret store backend", backend.name());
        Ok(Self::new(backend))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Pre-flight check to run before starting work whose result must be stored, so that the user
    /// does not complete an OAuth flow only to find the keychain locked.
    pub fn ensure_available(&self) -> Result<()> {
        self.backend.probe()
    }

    /// Stores `token` under the normalized `email`, replacing any existing token.
    pub fn set_token(&self, email: &str, token: &Token) -> Result<()> {
        let email = require_email(email)?;
        let mut token = token.clone();
        token.email = email.clone();
        let json = serde_json::to_string(&token).context("Unable to serialize the token")?;
        self.backend
            .set(&token_key(&email), &json)
            .with_context(|| format!("Unable to store the token for {email}"))?;
        debug!("Stored token for {email} in the {} backend", self.backend.name());
        Ok(())
    }

    pub fn get_token(&self, email: &str) -> Result<Token> {
        let email = require_email(email)?;
        let json = self
            .backend
            .get(&token_key(&email))?
            .ok_or_else(|| AuthError::not_found(format!("token for {email}")))?;
        serde_json::from_str(&json)
            .with_context(|| format!("The stored token for {email} is not valid JSON"))
    }

    /// Deletes the token for `email`. If `email` was the default account, the default is cleared
    /// as well.
    pub fn delete_token(&self, email: &str) -> Result<()> {
        let email = require_email(email)?;
        if !self.backend.remove(&token_key(&email))? {
            return Err(AuthError::not_found(format!("token for {email}")).into());
        }
        if self.default_account()?.as_deref() == Some(email.as_str()) {
            self.backend.remove(DEFAULT_ACCOUNT_KEY)?;
            debug!("Cleared the default account since its token was deleted");
        }
        Ok(())
    }

    /// All stored tokens, sorted by email. Keys that do not parse as token keys are skipped, as
    /// are entries that disappear between listing and reading.
    pub fn list_tokens(&self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        for key in self.backend.keys()? {
            let Some(email) = parse_token_key(&key) else {
                continue;
            };
            match self.get_token(&email) {
                Ok(token) => tokens.push(token),
                Err(e) if matches!(e.downcast_ref::<AuthError>(), Some(AuthError::NotFound { .. })) => {
                    debug!("Token for {email} vanished while listing");
                }
                Err(e) => return Err(e),
            }
        }
        tokens.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(tokens)
    }

    /// Raw backend keys, which may include non-token entries.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = self.backend.keys()?;
        keys.sort();
        Ok(keys)
    }

    /// The default account, or `None` when no default has been set.
    pub fn default_account(&self) -> Result<Option<String>> {
        Ok(self
            .backend
            .get(DEFAULT_ACCOUNT_KEY)?
            .map(|email| normalize_email(&email))
            .filter(|email| !email.is_empty()))
    }

    pub fn set_default_account(&self, email: &str) -> Result<()> {
        let email = require_email(email)?;
        self.backend
            .set(DEFAULT_ACCOUNT_KEY, &email)
            .context("Unable to store the default account")
    }
}

fn require_email(email: &str) -> Result<String> {
    let email = normalize_email(email);
    if email.is_empty() {
        return Err(AuthError::validation("empty email").into());
    }
    Ok(email)
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryBackend;
    use super::*;
    use crate::error::auth_error;

    fn store() -> (SecretStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::default());
        (SecretStore::new(backend.clone()), backend)
    }

    fn token(email: &str) -> Token {
        Token::new(email, format!("refresh-{email}"))
            .with_services(["gmail", "drive"])
            .with_scopes(["openid", "email"])
            .with_created_at(Some(Utc::now()))
    }

    #[test]
    fn test_set_then_get_round_trip() {
        let (store, _) = store();
        for email in ["a@example.com", "b.c+tag@example.org"] {
            let t = token(email);
            store.set_token(email, &t).unwrap();
            assert_eq!(t, store.get_token(email).unwrap());
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let (store, backend) = store();
        store.set_token("Work@Example.com", &token("work@example.com")).unwrap();
        assert_eq!("work@example.com", store.get_token("WORK@example.COM").unwrap().email());
        assert!(backend.contains("token:work@example.com"));
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let (store, _) = store();
        let err = store.delete_token("nobody@example.com").unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::NotFound { .. })));
    }

    #[test]
    fn test_get_after_delete_is_not_found() {
        let (store, _) = store();
        store.set_token("a@example.com", &token("a@example.com")).unwrap();
        store.delete_token("a@example.com").unwrap();
        let err = store.get_token("a@example.com").unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::NotFound { .. })));
    }

    #[test]
    fn test_delete_clears_matching_default() {
        let (store, _) = store();
        store.set_token("a@example.com", &token("a@example.com")).unwrap();
        store.set_token("b@example.com", &token("b@example.com")).unwrap();
        store.set_default_account("a@example.com").unwrap();
        store.delete_token("b@example.com").unwrap();
        assert_eq!(Some("a@example.com".to_string()), store.default_account().unwrap());
        store.delete_token("a@example.com").unwrap();
        assert_eq!(None, store.default_account().unwrap());
    }

    #[test]
    fn test_list_empty() {
        let (store, _) = store();
        assert!(store.list_tokens().unwrap().is_empty());
        assert_eq!(None, store.default_account().unwrap());
    }

    #[test]
    fn test_list_ignores_malformed_keys() {
        let (store, backend) = store();
        store.set_token("b@example.com", &token("b@example.com")).unwrap();
        store.set_token("a@example.com", &token("a@example.com")).unwrap();
        store.set_default_account("a@example.com").unwrap();
        backend.set("token:", "garbage").unwrap();
        backend.set("token:Upper@Example.com", "garbage").unwrap();
        backend.set("something-else", "garbage").unwrap();

        let emails: Vec<_> = store
            .list_tokens()
            .unwrap()
            .iter()
            .map(|t| t.email().to_string())
            .collect();
        assert_eq!(vec!["a@example.com", "b@example.com"], emails);
        assert_eq!(6, store.keys().unwrap().len());
    }

    #[test]
    fn test_token_key_round_trip() {
        for email in ["a@example.com", "x:y@example.com", "token:odd@example.com"] {
            assert_eq!(Some(email.to_string()), parse_token_key(&token_key(email)));
        }
        assert_eq!(None, parse_token_key("default_account"));
        assert_eq!(None, parse_token_key("token: a@example.com"));
    }

    #[test]
    fn test_unavailable_backend() {
        let (store, backend) = store();
        backend.set_unavailable(true);
        let err = store.set_token("a@example.com", &token("a@example.com")).unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::StoreUnavailable { .. })));
        assert!(store.ensure_available().is_err());
    }

    #[test]
    fn test_empty_email_rejected() {
        let (store, _) = store();
        let err = store.set_token("  ", &token("a@example.com")).unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::Validation(_))));
    }

    #[test]
    fn test_debug_redacts_refresh_token() {
        let t = token("a@example.com");
        let debug = format!("{t:?}");
        assert!(!debug.contains("refresh-a@example.com"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_backend_resolution() {
        let info = KeyringBackendInfo::from_sources(None, None).unwrap();
        assert_eq!(KeyringBackend::Auto, info.value());
        assert_eq!(BackendSource::Default, info.source());

        let info = KeyringBackendInfo::from_sources(None, Some(KeyringBackend::File)).unwrap();
        assert_eq!(KeyringBackend::File, info.value());
        assert_eq!(BackendSource::Config, info.source());

        let info =
            KeyringBackendInfo::from_sources(Some(" Keychain "), Some(KeyringBackend::File))
                .unwrap();
        assert_eq!(KeyringBackend::Keychain, info.value());
        assert_eq!(BackendSource::Env, info.source());

        let info = KeyringBackendInfo::from_sources(Some(""), Some(KeyringBackend::File)).unwrap();
        assert_eq!(BackendSource::Config, info.source());

        let err = KeyringBackendInfo::from_sources(Some("vault"), None).unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::Validation(_))));
    }
}
