//! A secret store backend that keeps one file per key.
//!
//! Filenames are the base64url encoding of the key so that any key maps to exactly one valid
//! filename and back. When a password is configured, each file is
//! `MAGIC || salt || nonce || ciphertext+tag`, otherwise the value is stored as-is. Either way the
//! directory is 0700 and the files are 0600.

use super::{crypto, Backend, KEYRING_PASSWORD_ENV};
use crate::error::AuthError;
use crate::{utils, Result};
use anyhow::{bail, Context};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{trace, warn};
use zeroize::Zeroizing;

const MAGIC: &[u8] = b"GOGENC1\0";

pub(crate) struct FileBackend {
    dir: PathBuf,
    password: Option<Zeroizing<String>>,
}

impl FileBackend {
    pub(crate) fn new(dir: impl Into<PathBuf>, password: Option<String>) -> Self {
        let dir = dir.into();
        if password.is_none() {
            warn!(
                "{KEYRING_PASSWORD_ENV} is not set, secrets in {} are stored unencrypted \
                (readable by your user only)",
                dir.display()
            );
        }
        Self {
            dir,
            password: password.map(Zeroizing::new),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(URL_SAFE_NO_PAD.encode(key))
    }

    fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| AuthError::unavailable(self.name(), format!("{}: {e}", self.dir.display())))?;
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.dir, Permissions::from_mode(0o700))
                .with_context(|| format!("Failed to set permissions on {}", self.dir.display()))?;
        }
        Ok(())
    }

    fn seal(&self, value: &str) -> Result<Vec<u8>> {
        let Some(password) = &self.password else {
            return Ok(value.as_bytes().to_vec());
        };
        let salt = crypto::new_salt();
        let key = crypto::derive_key(password, &salt)?;
        let sealed = crypto::encrypt(&key, value.as_bytes())?;
        let mut out = Vec::with_capacity(MAGIC.len() + salt.len() + sealed.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn open(&self, path: &Path, data: &[u8]) -> Result<String> {
        let plain = match data.strip_prefix(MAGIC) {
            None => data.to_vec(),
            Some(rest) => {
                let Some(password) = &self.password else {
                    bail!(
                        "{} is encrypted, set {KEYRING_PASSWORD_ENV} to read it",
                        path.display()
                    );
                };
                if rest.len() < crypto::SALT_SIZE {
                    bail!("{} is truncated", path.display());
                }
                let (salt, sealed) = rest.split_at(crypto::SALT_SIZE);
                let key = crypto::derive_key(password, salt)?;
                crypto::decrypt(&key, sealed)
                    .with_context(|| format!("Unable to decrypt {}", path.display()))?
            }
        };
        String::from_utf8(plain).with_context(|| format!("{} is not valid UTF-8", path.display()))
    }
}

impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn probe(&self) -> Result<()> {
        self.ensure_dir()
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read file at {}", path.display()))
            }
        };
        self.open(&path, &data).map(Some)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_dir()?;
        let path = self.path_for(key);
        trace!("Writing {}", path.display());
        utils::write_private_sync(&path, self.seal(value)?)
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Unable to remove {}", path.display())),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Unable to list {}", self.dir.display()))
            }
        };
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("Unable to list {}", self.dir.display()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Temp files from in-progress writes start with a dot.
            if name.starts_with('.') {
                continue;
            }
            let Ok(decoded) = URL_SAFE_NO_PAD.decode(name) else {
                continue;
            };
            if let Ok(key) = String::from_utf8(decoded) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
