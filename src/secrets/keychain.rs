//! The OS keychain backend.
//!
//! Keychains cannot enumerate their entries in a portable way, so the set of keys we have written
//! is kept in an extra `__keys__` entry. The index is only a listing aid: `get` always reads the
//! entry itself.

use super::Backend;
use crate::error::AuthError;
use crate::Result;
use anyhow::Context;
use std::collections::BTreeSet;
use tracing::debug;

const SERVICE: &str = "gogcli";
const INDEX_KEY: &str = "__keys__";

pub(crate) struct KeychainBackend {
    service: String,
}

impl KeychainBackend {
    pub(crate) fn new() -> Self {
        Self {
            service: SERVICE.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, key).map_err(|e| self.map_error(e))
    }

    fn map_error(&self, e: keyring::Error) -> anyhow::Error {
        match e {
            keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => {
                AuthError::unavailable(self.name(), e).into()
            }
            other => anyhow::Error::new(other).context("Keychain operation failed"),
        }
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(self.map_error(e)),
        }
    }

    fn index(&self) -> Result<BTreeSet<String>> {
        match self.read(INDEX_KEY)? {
            None => Ok(BTreeSet::new()),
            Some(json) => serde_json::from_str(&json).context("The keychain key index is corrupt"),
        }
    }

    fn update_index(&self, f: impl FnOnce(&mut BTreeSet<String>) -> bool) -> Result<()> {
        let mut index = self.index()?;
        if !f(&mut index) {
            return Ok(());
        }
        let json = serde_json::to_string(&index).context("Unable to serialize the key index")?;
        self.entry(INDEX_KEY)?
            .set_password(&json)
            .map_err(|e| self.map_error(e))
    }
}

impl Backend for KeychainBackend {
    fn name(&self) -> &'static str {
        "keychain"
    }

    fn probe(&self) -> Result<()> {
        self.read(INDEX_KEY).map(|_| ())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        self.read(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| self.map_error(e))?;
        self.update_index(|index| index.insert(key.to_string()))
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let existed = match self.entry(key)?.delete_password() {
            Ok(()) => true,
            Err(keyring::Error::NoEntry) => false,
            Err(e) => return Err(self.map_error(e)),
        };
        self.update_index(|index| index.remove(key))?;
        Ok(existed)
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for key in self.index()? {
            // Entries deleted outside of this program linger in the index until the next write.
            if self.read(&key)?.is_some() {
                keys.push(key);
            } else {
                debug!("Skipping stale keychain index entry {key}");
            }
        }
        Ok(keys)
    }
}
