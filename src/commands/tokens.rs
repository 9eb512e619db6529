//! `gog auth tokens list|delete|export|import`: raw access to the secret store.

use crate::commands::{confirm_destructive, Flags, Out, TokenSummary};
use crate::error::AuthError;
use crate::secrets::{parse_token_key, SecretStore, Token};
use crate::utils::{self, normalize_email};
use crate::Result;
use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::path::Path;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The on-disk format of an exported token.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct TokenExport {
    #[zeroize(skip)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[zeroize(skip)]
    pub services: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[zeroize(skip)]
    pub scopes: Option<Vec<String>>,
    /// RFC3339.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[zeroize(skip)]
    pub created_at: Option<String>,
    pub refresh_token: String,
}

impl Debug for TokenExport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenExport")
            .field("email", &self.email)
            .field("services", &self.services)
            .field("scopes", &self.scopes)
            .field("created_at", &self.created_at)
            .field("refresh_token", &"[REDACTED]")
            .finish()
    }
}

impl From<&Token> for TokenExport {
    fn from(token: &Token) -> Self {
        let non_empty = |set: &std::collections::BTreeSet<String>| {
            (!set.is_empty()).then(|| set.iter().cloned().collect())
        };
        Self {
            email: token.email().to_string(),
            services: non_empty(token.services()),
            scopes: non_empty(token.scopes()),
            created_at: token
                .created_at()
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            refresh_token: token.refresh_token().to_string(),
        }
    }
}

impl TokenExport {
    /// Validates the export and turns it into a storable token.
    pub fn into_token(self) -> Result<Token> {
        let email = normalize_email(&self.email);
        if email.is_empty() {
            return Err(AuthError::validation("token file has an empty email").into());
        }
        if self.refresh_token.trim().is_empty() {
            return Err(
                AuthError::validation(format!("token file for {email} has no refresh_token"))
                    .into(),
            );
        }
        let created_at = match self.created_at.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| {
                        AuthError::validation(format!(
                            "token file for {email} has an invalid created_at '{raw}' ({e}), \
                            expected RFC3339"
                        ))
                    })?
                    .with_timezone(&Utc),
            ),
        };
        Ok(Token::new(&email, self.refresh_token.trim())
            .with_services(self.services.clone().unwrap_or_default())
            .with_scopes(self.scopes.clone().unwrap_or_default())
            .with_created_at(created_at))
    }
}

/// Lists the raw keys in the store, marking which ones are tokens.
pub fn tokens_list(store: &SecretStore) -> Result<Out<Vec<String>>> {
    let keys = store.keys()?;
    if keys.is_empty() {
        return Ok(Out::new(
            format!("The {} secret store is empty", store.backend_name()),
            keys,
        ));
    }
    let lines: Vec<String> = keys
        .iter()
        .map(|key| match parse_token_key(key) {
            Some(email) => format!("  {key} (token for {email})"),
            None => format!("  {key}"),
        })
        .collect();
    Ok(Out::new(
        format!(
            "Keys in the {} secret store:\n{}",
            store.backend_name(),
            lines.join("\n")
        ),
        keys,
    ))
}

pub fn tokens_delete(store: &SecretStore, email: &str, flags: &Flags) -> Result<Out<()>> {
    let email = normalize_email(email);
    // Fail on a missing token before asking.
    store.get_token(&email)?;
    confirm_destructive(flags, &format!("delete the stored token for {email}"))?;
    store.delete_token(&email)?;
    Ok(Out::new_message(format!("Deleted the token for {email}")))
}

/// Writes the token for `email` to `out` with owner-only permissions.
pub async fn tokens_export(
    store: &SecretStore,
    email: &str,
    out: &Path,
    overwrite: bool,
) -> Result<Out<TokenSummary>> {
    let token = store.get_token(email)?;
    let out = utils::expand_home(out);
    if !overwrite
        && tokio::fs::try_exists(&out)
            .await
            .with_context(|| format!("Unable to check {}", out.display()))?
    {
        return Err(AuthError::validation(format!(
            "{} already exists, pass --overwrite to replace it",
            out.display()
        ))
        .into());
    }
    let export = TokenExport::from(&token);
    let json = serde_json::to_string_pretty(&export).context("Unable to serialize the token")?;
    utils::write_private(&out, json).await?;
    warn!(
        "{} contains a refresh token for {}. Anyone with this file can act as that account; \
        keep it secret and delete it when done.",
        out.display(),
        token.email()
    );
    Ok(Out::new(
        format!("Exported the token for {} to {}", token.email(), out.display()),
        TokenSummary::from(&token),
    ))
}

/// Reads a token file (or stdin for `-`) and stores it, replacing any token for that email.
pub async fn tokens_import(store: &SecretStore, path: &Path) -> Result<Out<TokenSummary>> {
    let data = utils::read_input(path).await?;
    let export: TokenExport = serde_json::from_slice(&data)
        .map_err(|e| AuthError::validation(format!("the token file is not valid JSON: {e}")))?;
    let token = export.into_token()?;
    store.ensure_available()?;
    store.set_token(token.email(), &token)?;
    Ok(Out::new(
        format!("Imported the token for {}", token.email()),
        TokenSummary::from(&token),
    ))
}
