//! Command handlers for the gog CLI.
//!
//! This module contains implementations for all `gog auth` subcommands. Handlers receive their
//! collaborators (config, secret store, authorizer) from `main` so that tests can hand in fakes.

mod alias;
mod auth;
mod service_account;
mod tokens;

use crate::accounts::{AccountResolver, ResolvedAccount};
use crate::error::AuthError;
use crate::secrets::{SecretStore, Token};
use crate::{Config, Result};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Debug;
use std::io::IsTerminal;
use tracing::{debug, info};

pub use alias::{alias_list, alias_set, alias_unset};
pub use auth::{
    add, credentials, keyring, list, manage, remove, services, set_default, status, whoami,
    AccountListing, AuthKind, CredentialsSaved, Status, Whoami,
};
pub use service_account::{
    keep, service_account_set, service_account_status, service_account_unset,
    ServiceAccountStatus,
};
pub use tokens::{tokens_delete, tokens_export, tokens_import, tokens_list, TokenExport};

/// The output type for a command. This allows the command to return a consistent message and,
/// optionally, structured data.
#[derive(Debug, Clone, Serialize)]
pub struct Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// A message that can be printed to the user regarding the outcome of the command execution.
    message: String,

    /// Any structured data that needs to be output from the call.
    structure: Option<T>,
}

impl<T, S> From<S> for Out<T>
where
    T: Debug + Clone + Serialize,
    S: Into<String>,
{
    fn from(value: S) -> Self {
        Out::new_message(value)
    }
}

impl<T> Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// Create a new `Out` object that has `Some(structure)`.
    pub fn new<S>(message: S, structure: T) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: Some(structure),
        }
    }

    /// Create a new `Out` object that has `None` for `structure`.
    pub fn new_message<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: None,
        }
    }

    /// Get the `message`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the structured data stored in `structure`.
    pub fn structure(&self) -> Option<&T> {
        self.structure.as_ref()
    }

    /// Print the message to `info!` and the structured data (if it exists) as JSON to `debug!`.
    /// With `json`, the structured data goes to stdout instead so that it can be piped.
    pub fn print(&self, json: bool) {
        info!("{}", self.message);
        let Some(structure) = self.structure() else {
            return;
        };
        let Ok(rendered) = serde_json::to_string_pretty(structure) else {
            return;
        };
        if json {
            println!("{rendered}");
        } else {
            debug!("Command output:\n\n{rendered}\n\n");
        }
    }
}

/// The global flags that commands act on.
#[derive(Debug, Clone, Default)]
pub struct Flags {
    account: Option<String>,
    account_env: Option<String>,
    force: bool,
    no_input: bool,
}

impl Flags {
    pub fn new(account: Option<&str>, force: bool, no_input: bool) -> Self {
        Self {
            account: account.map(str::to_string),
            account_env: None,
            force,
            no_input,
        }
    }

    /// Sets the value of `GOG_ACCOUNT`.
    pub fn with_account_env(mut self, value: Option<String>) -> Self {
        self.account_env = value;
        self
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub fn account_env(&self) -> Option<&str> {
        self.account_env.as_deref()
    }

    pub fn force(&self) -> bool {
        self.force
    }

    pub fn no_input(&self) -> bool {
        self.no_input
    }

    /// Resolves the account these flags select.
    pub fn resolve_account(
        &self,
        config: &Config,
        store: Option<&SecretStore>,
    ) -> Result<ResolvedAccount> {
        AccountResolver::new(config.aliases(), store).resolve(self.account(), self.account_env())
    }
}

/// Gate for destructive operations. Passes with `--force`, otherwise asks on the terminal.
/// Refuses when prompting is not possible.
pub(crate) fn confirm_destructive(flags: &Flags, action: &str) -> Result<()> {
    if flags.force() {
        return Ok(());
    }
    if flags.no_input() || !std::io::stdin().is_terminal() {
        return Err(AuthError::validation(format!(
            "refusing to {action} without confirmation, pass --force"
        ))
        .into());
    }
    let confirmed = dialoguer::Confirm::new()
        .with_prompt(format!("Really {action}?"))
        .default(false)
        .interact()
        .context("Failed to read the confirmation from the terminal")?;
    if !confirmed {
        return Err(AuthError::cancelled(action).into());
    }
    Ok(())
}

/// A token without its secret, for output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TokenSummary {
    pub email: String,
    pub services: Vec<String>,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&Token> for TokenSummary {
    fn from(token: &Token) -> Self {
        Self {
            email: token.email().to_string(),
            services: token.services().iter().cloned().collect(),
            scopes: token.scopes().iter().cloned().collect(),
            created_at: token.created_at(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::auth_error;

    #[test]
    fn test_confirm_destructive_force() {
        let flags = Flags::new(None, true, true);
        confirm_destructive(&flags, "delete everything").unwrap();
    }

    #[test]
    fn test_confirm_destructive_no_input() {
        let flags = Flags::new(None, false, true);
        let err = confirm_destructive(&flags, "delete everything").unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::Validation(_))));
        assert!(err.to_string().contains("--force"));
    }

    #[test]
    fn test_token_summary_has_no_secret() {
        let token = Token::new("Me@Example.com", "super-secret").with_services(["gmail"]);
        let summary = TokenSummary::from(&token);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains("super-secret"));
        assert_eq!(vec!["gmail".to_string()], summary.services);
    }
}
