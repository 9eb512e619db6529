//! `gog auth service-account set|unset|status` and `gog auth keep`.

use crate::commands::{confirm_destructive, Flags, Out};
use crate::error::AuthError;
use crate::service_account::{ResolvedKey, ServiceAccountKey, ServiceAccountRegistry};
use crate::utils::{self, normalize_email};
use crate::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// What `service-account status` reports.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceAccountStatus {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<ResolvedKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_email: Option<String>,
}

/// Stores the key at `key_path` (or stdin for `-`) for impersonating `email`.
pub async fn service_account_set(
    registry: &ServiceAccountRegistry,
    email: &str,
    key_path: &Path,
) -> Result<Out<Vec<PathBuf>>> {
    store(registry, email, key_path, false).await
}

/// Like `service_account_set`, and also fills the Keep slot. Keep cannot be authorized with
/// OAuth, so this is the only way to use it.
pub async fn keep(
    registry: &ServiceAccountRegistry,
    email: &str,
    key_path: &Path,
) -> Result<Out<Vec<PathBuf>>> {
    store(registry, email, key_path, true).await
}

async fn store(
    registry: &ServiceAccountRegistry,
    email: &str,
    key_path: &Path,
    keep: bool,
) -> Result<Out<Vec<PathBuf>>> {
    let data = utils::read_input(key_path).await?;
    let key = ServiceAccountKey::parse(&data)?;
    let written = registry.store(email, &data, keep).await?;
    let email = normalize_email(email);
    let what = if keep { "Keep service account" } else { "service account" };
    Ok(Out::new(
        format!(
            "Stored {what} {} for {email} (remember to grant it domain-wide delegation in the \
            Workspace admin console)",
            key.client_email()
        ),
        written,
    ))
}

pub async fn service_account_unset(
    registry: &ServiceAccountRegistry,
    email: &str,
    flags: &Flags,
) -> Result<Out<Vec<PathBuf>>> {
    let email = normalize_email(email);
    if registry.resolve(&email).await?.is_none() {
        return Err(AuthError::not_found(format!("service account for {email}")).into());
    }
    confirm_destructive(flags, &format!("delete the service account keys for {email}"))?;
    let removed = registry.remove(&email).await?;
    Ok(Out::new(
        format!(
            "Removed {} service account key file(s) for {email}",
            removed.len()
        ),
        removed,
    ))
}

pub async fn service_account_status(
    registry: &ServiceAccountRegistry,
    email: &str,
) -> Result<Out<ServiceAccountStatus>> {
    let email = normalize_email(email);
    if registry.resolve(&email).await?.is_none() {
        return Ok(Out::new(
            format!("No service account is configured for {email}"),
            ServiceAccountStatus {
                email,
                key: None,
                client_email: None,
            },
        ));
    }
    let (resolved, key) = registry.load(&email).await?;
    Ok(Out::new(
        format!(
            "{email} uses service account {} from {} (slot {:?}, modified {})",
            key.client_email(),
            resolved.path().display(),
            resolved.slot(),
            resolved.modified().to_rfc3339()
        ),
        ServiceAccountStatus {
            email,
            client_email: Some(key.client_email().to_string()),
            key: Some(resolved),
        },
    ))
}
