//! Authentication command handlers.
//!
//! This module implements the CLI commands for:
//! - `gog auth credentials` - store the OAuth client
//! - `gog auth add` - the OAuth consent flow for one account
//! - `gog auth list|status|whoami|services` - read-only views
//! - `gog auth default|remove|keyring` - changes to stored state
//! - `gog auth manage` - the browser-based account manager

use crate::accounts::ResolvedAccount;
use crate::api::{
    parse_services, same_email, services_info, AuthorizationRequest, Authorizer,
    ClientCredentials, Flow, ManageServer, ScopeOptions, ServiceInfo, StopReason,
};
use crate::args::{AddArgs, ManageArgs};
use crate::commands::{tokens, Flags, Out, TokenSummary};
use crate::error::{auth_error, AuthError};
use crate::secrets::{KeyringBackend, KeyringBackendInfo, SecretStore, KEYRING_BACKEND_ENV};
use crate::service_account::ServiceAccountRegistry;
use crate::utils::{self, normalize_email};
use crate::{Config, Result};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How an identity can authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthKind {
    #[serde(rename = "oauth")]
    OAuth,
    #[serde(rename = "service_account")]
    ServiceAccount,
    #[serde(rename = "oauth+service_account")]
    Both,
}

serde_plain::derive_display_from_serialize!(AuthKind);

/// One row of `gog auth list`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AccountListing {
    pub email: String,
    pub kind: AuthKind,
    pub default: bool,
    pub services: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Set by `--check`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialsSaved {
    pub client_id: String,
    pub path: PathBuf,
}

/// What `gog auth status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub config_path: PathBuf,
    pub config_exists: bool,
    pub credentials_path: PathBuf,
    pub credentials_present: bool,
    pub keyring: KeyringBackendInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<ResolvedAccount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_error: Option<String>,
}

/// What `gog auth whoami` reports.
#[derive(Debug, Clone, Serialize)]
pub struct Whoami {
    #[serde(flatten)]
    pub account: ResolvedAccount,
    pub oauth: bool,
    pub service_account: bool,
}

/// Handles `gog auth credentials <path|->`: validates the OAuth client JSON and saves it to the
/// config directory.
pub async fn credentials(config: &Config, path: &Path) -> Result<Out<CredentialsSaved>> {
    let data = utils::read_input(path).await?;
    let creds = ClientCredentials::parse(&data)?;
    let target = config.client_credentials_path();
    creds.save(&target).await?;
    Ok(Out::new(
        format!(
            "Saved OAuth client {} to {}. Next: gog auth add <email>",
            creds.client_id(),
            target.display()
        ),
        CredentialsSaved {
            client_id: creds.client_id().to_string(),
            path: target,
        },
    ))
}

/// Handles `gog auth add <email>`: runs the consent flow and stores the token if, and only if,
/// Google confirms that the consenting account is `email`.
///
/// # Arguments
/// * `input` - where the manual flow reads the pasted redirect URL from, normally stdin
///
/// # Errors
/// Scope and service problems are reported before anything is sent to Google.
pub async fn add<R>(
    authorizer: &Authorizer,
    args: &AddArgs,
    cancel: &CancellationToken,
    input: R,
) -> Result<Out<TokenSummary>>
where
    R: AsyncBufRead + Unpin + Send,
{
    let email = normalize_email(args.email());
    if !email.contains('@') {
        return Err(AuthError::validation(format!("'{email}' is not an email address")).into());
    }
    let services = parse_services(args.services())?;
    let options = ScopeOptions {
        readonly: args.readonly(),
        drive_scope: args.drive_scope(),
    };
    let request = AuthorizationRequest::new(&services, options)?
        .with_force_consent(args.force_consent())
        .with_expected_email(Some(email.as_str()));
    let flow = if args.manual() {
        Flow::Manual
    } else {
        Flow::Automatic {
            port: args.port(),
            open_browser: !args.no_browser(),
        }
    };
    debug!("Authorizing {email} for {} scopes", request.scopes().len());
    let token = authorizer
        .authorize(&request, flow, args.timeout(), cancel, input)
        .await?;
    let summary = TokenSummary::from(&token);
    Ok(Out::new(
        format!(
            "Stored a token for {} ({})",
            summary.email,
            summary.services.join(", ")
        ),
        summary,
    ))
}

pub fn services() -> Out<Vec<ServiceInfo>> {
    let info = services_info();
    let lines: Vec<String> = info
        .iter()
        .map(|s| {
            let mut line = format!("  {:<10} {}", s.service().to_string(), s.apis().join(", "));
            if !s.user() {
                line.push_str(" (not in `user`)");
            }
            if !s.note().is_empty() {
                line.push_str(&format!(": {}", s.note()));
            }
            line
        })
        .collect();
    Out::new(format!("Services:\n{}", lines.join("\n")), info)
}

/// Handles `gog auth list`: every identity with a token, a service account key, or both.
///
/// With `check`, every refresh token is exchanged for an access token and the account it belongs
/// to is compared to the stored email. Failures are reported per row and do not fail the command.
pub async fn list(
    store: &SecretStore,
    registry: &ServiceAccountRegistry,
    check: Option<(&Authorizer, Duration)>,
) -> Result<Out<Vec<AccountListing>>> {
    let default = store.default_account()?;
    let mut rows: BTreeMap<String, AccountListing> = BTreeMap::new();
    for token in store.list_tokens()? {
        let (valid, error) = match check {
            None => (None, None),
            Some((authorizer, timeout)) => {
                let scopes: Vec<String> = token.scopes().iter().cloned().collect();
                match authorizer
                    .check_refresh_token(token.refresh_token(), &scopes, timeout)
                    .await
                {
                    Ok(actual) if same_email(&actual, token.email()) => (Some(true), None),
                    Ok(actual) => (
                        Some(false),
                        Some(format!("token authenticates {actual}")),
                    ),
                    Err(e) => (Some(false), Some(format!("{e:#}"))),
                }
            }
        };
        rows.insert(
            token.email().to_string(),
            AccountListing {
                email: token.email().to_string(),
                kind: AuthKind::OAuth,
                default: default.as_deref() == Some(token.email()),
                services: token.services().iter().cloned().collect(),
                created_at: token.created_at(),
                valid,
                error,
            },
        );
    }
    for email in registry.emails().await? {
        rows.entry(email.clone())
            .and_modify(|row| row.kind = AuthKind::Both)
            .or_insert_with(|| AccountListing {
                default: default.as_deref() == Some(email.as_str()),
                email,
                kind: AuthKind::ServiceAccount,
                services: Vec::new(),
                created_at: None,
                valid: None,
                error: None,
            });
    }

    let rows: Vec<AccountListing> = rows.into_values().collect();
    if rows.is_empty() {
        return Ok(Out::new(
            "No accounts. Add one with `gog auth add <email>`",
            rows,
        ));
    }
    let lines: Vec<String> = rows
        .iter()
        .map(|row| {
            let mut line = format!("  {} [{}]", row.email, row.kind);
            if row.default {
                line.push_str(" (default)");
            }
            match (row.valid, &row.error) {
                (Some(true), _) => line.push_str(" ok"),
                (Some(false), Some(e)) => line.push_str(&format!(" INVALID: {e}")),
                _ => {}
            }
            line
        })
        .collect();
    Ok(Out::new(format!("Accounts:\n{}", lines.join("\n")), rows))
}

/// Handles `gog auth status`. Problems are reported rather than returned, since this is the
/// command people run when something is wrong.
pub async fn status(
    config: &Config,
    keyring: KeyringBackendInfo,
    store: Option<&SecretStore>,
    flags: &Flags,
) -> Result<Out<Status>> {
    let credentials_path = config.client_credentials_path();
    let (backend, backend_error) = match store {
        None => (None, Some("the secret store could not be opened".to_string())),
        Some(store) => match store.ensure_available() {
            Ok(()) => (Some(store.backend_name().to_string()), None),
            Err(e) => (Some(store.backend_name().to_string()), Some(format!("{e:#}"))),
        },
    };
    let usable_store = store.filter(|_| backend_error.is_none());
    let (account, account_error) = match flags.resolve_account(config, usable_store) {
        Ok(account) => (Some(account), None),
        Err(e) => (None, Some(e.to_string())),
    };
    let status = Status {
        config_path: config.config_path().to_path_buf(),
        config_exists: config.exists(),
        credentials_present: tokio::fs::try_exists(&credentials_path)
            .await
            .unwrap_or(false),
        credentials_path,
        keyring,
        backend,
        backend_error,
        account,
        account_error,
    };

    let mut lines = vec![
        format!(
            "config: {}{}",
            status.config_path.display(),
            if status.config_exists { "" } else { " (not created yet)" }
        ),
        format!(
            "OAuth client: {}{}",
            status.credentials_path.display(),
            if status.credentials_present {
                ""
            } else {
                " (missing, run `gog auth credentials`)"
            }
        ),
        format!(
            "keyring: {} (from {})",
            status.keyring.value(),
            status.keyring.source()
        ),
    ];
    match (&status.backend, &status.backend_error) {
        (Some(name), None) => lines.push(format!("secret store: {name}")),
        (_, Some(e)) => lines.push(format!("secret store: unavailable: {e}")),
        (None, None) => {}
    }
    match (&status.account, &status.account_error) {
        (Some(a), _) => lines.push(format!("account: {} (from {})", a.email(), a.source())),
        (None, Some(e)) => lines.push(format!("account: none: {e}")),
        (None, None) => {}
    }
    Ok(Out::new(lines.join("\n"), status))
}

/// Handles `gog auth keyring <backend>`: saves the backend choice in the config file.
pub async fn keyring(config: &mut Config, backend: KeyringBackend) -> Result<Out<KeyringBackend>> {
    config.set_keyring_backend(backend);
    config.save().await?;
    if let Ok(env) = std::env::var(KEYRING_BACKEND_ENV) {
        if !env.trim().is_empty() {
            warn!(
                "{KEYRING_BACKEND_ENV}={env} is set and overrides the saved keyring backend '{backend}'"
            );
        }
    }
    Ok(Out::new(
        format!(
            "Saved keyring backend '{backend}' to {}",
            config.config_path().display()
        ),
        backend,
    ))
}

/// Handles `gog auth default <email>`. The account must have a stored token.
pub fn set_default(store: &SecretStore, email: &str) -> Result<Out<String>> {
    let token = store.get_token(email).map_err(|e| match auth_error(&e) {
        Some(AuthError::NotFound { .. }) => e.context(format!(
            "Cannot make {} the default; add it first with `gog auth add`",
            normalize_email(email)
        )),
        _ => e,
    })?;
    store.set_default_account(token.email())?;
    Ok(Out::new(
        format!("{} is now the default account", token.email()),
        token.email().to_string(),
    ))
}

/// Handles `gog auth remove <email>`: deletes the OAuth token after confirmation. Service account
/// keys are left alone, see `gog auth service-account unset`.
pub fn remove(store: &SecretStore, email: &str, flags: &Flags) -> Result<Out<()>> {
    tokens::tokens_delete(store, email, flags)?;
    Ok(Out::new_message(format!(
        "Removed the OAuth token for {}",
        normalize_email(email)
    )))
}

/// Handles `gog auth whoami`.
pub async fn whoami(
    config: &Config,
    store: Option<&SecretStore>,
    registry: &ServiceAccountRegistry,
    flags: &Flags,
) -> Result<Out<Whoami>> {
    let account = flags.resolve_account(config, store)?;
    let oauth = match store {
        Some(store) => match store.get_token(account.email()) {
            Ok(_) => true,
            Err(e) if matches!(auth_error(&e), Some(AuthError::NotFound { .. })) => false,
            Err(e) => return Err(e),
        },
        None => false,
    };
    let service_account = registry.resolve(account.email()).await?.is_some();
    let how = match (oauth, service_account) {
        (true, true) => "OAuth token and service account",
        (true, false) => "OAuth token",
        (false, true) => "service account",
        (false, false) => "no stored credentials",
    };
    Ok(Out::new(
        format!(
            "{} (from {}, {how})",
            account.email(),
            account.source()
        ),
        Whoami {
            account,
            oauth,
            service_account,
        },
    ))
}

/// Handles `gog auth manage`: serves the account page until timeout, `/shutdown` or Ctrl-C.
pub async fn manage(
    authorizer: &Authorizer,
    args: &ManageArgs,
    cancel: &CancellationToken,
) -> Result<Out<StopReason>> {
    let services = parse_services(args.services())?;
    let template = AuthorizationRequest::new(&services, ScopeOptions::default())?
        .with_force_consent(args.force_consent());
    authorizer
        .store()
        .ensure_available()
        .context("The secret store must be reachable to manage accounts")?;
    let server = ManageServer::bind(authorizer.clone(), template, args.port()).await?;
    let url = server.url();
    info!("Manage your accounts at {url}");
    if !args.no_browser() {
        if let Err(e) = open::that(&url) {
            warn!("Unable to open a browser: {e}");
        }
    }
    let reason = server.run(args.timeout(), cancel).await?;
    let message = match reason {
        StopReason::Timeout => format!(
            "The account manager stopped after {}s",
            args.timeout().as_secs()
        ),
        StopReason::Shutdown => "The account manager was closed".to_string(),
    };
    Ok(Out::new(message, reason))
}
