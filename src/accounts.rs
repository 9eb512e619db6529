//! Decides which Google account a command acts as.
//!
//! The sources are consulted in a fixed order and the first one that yields an account wins:
//! 1. the `--account` flag
//! 2. the `GOG_ACCOUNT` environment variable
//! 3. the default account saved in the secret store
//! 4. the only stored token, when exactly one exists
//!
//! Flag and environment values may be aliases, and the values `auto` and `default` mean "not
//! set" so that a script can explicitly ask for the fallback behavior.

use crate::config::{is_auto_sentinel, normalize_alias};
use crate::error::AuthError;
use crate::secrets::SecretStore;
use crate::utils::normalize_email;
use crate::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Environment variable consulted when no `--account` flag is given.
pub const ACCOUNT_ENV: &str = "GOG_ACCOUNT";

/// Where a resolved account came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountSource {
    Flag,
    Env,
    Default,
    SingleToken,
}

serde_plain::derive_display_from_serialize!(AccountSource);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAccount {
    email: String,
    source: AccountSource,
}

impl ResolvedAccount {
    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn source(&self) -> AccountSource {
        self.source
    }
}

/// Resolves accounts against an alias table and, optionally, a secret store. The store is
/// optional because a command may run where no backend can be opened; the store-backed sources
/// are then skipped.
pub struct AccountResolver<'a> {
    aliases: &'a BTreeMap<String, String>,
    store: Option<&'a SecretStore>,
}

impl<'a> AccountResolver<'a> {
    pub fn new(aliases: &'a BTreeMap<String, String>, store: Option<&'a SecretStore>) -> Self {
        Self { aliases, store }
    }

    /// Resolves the account from the `flag` and `env` values and the store.
    ///
    /// # Errors
    /// Returns `AuthError::MissingAccount` when no source yields an account.
    pub fn resolve(&self, flag: Option<&str>, env: Option<&str>) -> Result<ResolvedAccount> {
        if let Some(email) = self.selector(flag) {
            return Ok(resolved(email, AccountSource::Flag));
        }
        if let Some(email) = self.selector(env) {
            return Ok(resolved(email, AccountSource::Env));
        }
        let Some(store) = self.store else {
            return Err(AuthError::MissingAccount.into());
        };
        match store.default_account() {
            Ok(Some(email)) => return Ok(resolved(email, AccountSource::Default)),
            Ok(None) => {}
            Err(e) => debug!("Unable to read the default account: {e:#}"),
        }
        match store.list_tokens() {
            Ok(tokens) if tokens.len() == 1 => {
                return Ok(resolved(
                    tokens[0].email().to_string(),
                    AccountSource::SingleToken,
                ))
            }
            Ok(tokens) => trace!("{} stored tokens, not auto-selecting", tokens.len()),
            Err(e) => debug!("Unable to list stored tokens: {e:#}"),
        }
        Err(AuthError::MissingAccount.into())
    }

    /// Interprets one explicit selector. Returns `None` when the value is empty or a sentinel.
    fn selector(&self, value: Option<&str>) -> Option<String> {
        let value = value?.trim();
        if value.is_empty() || is_auto_sentinel(value) {
            return None;
        }
        if !value.contains('@') {
            if let Some(email) = self.aliases.get(&normalize_alias(value)) {
                trace!("Alias '{value}' resolved to {email}");
                return Some(email.clone());
            }
        }
        Some(value.to_string())
    }
}

fn resolved(email: String, source: AccountSource) -> ResolvedAccount {
    ResolvedAccount {
        email: normalize_email(&email),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::auth_error;
    use crate::secrets::memory::MemoryBackend;
    use crate::secrets::Token;
    use std::sync::Arc;

    fn aliases() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("work".to_string(), "work@example.com".to_string()),
            ("home".to_string(), "home@example.com".to_string()),
        ])
    }

    fn store_with(emails: &[&str]) -> SecretStore {
        let store = SecretStore::new(Arc::new(MemoryBackend::default()));
        for email in emails {
            store
                .set_token(email, &Token::new(email, "refresh"))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_flag_alias_wins() {
        let aliases = aliases();
        let store = store_with(&["third@example.com"]);
        store.set_default_account("third@example.com").unwrap();
        let resolver = AccountResolver::new(&aliases, Some(&store));
        let account = resolver
            .resolve(Some("work"), Some("other@example.com"))
            .unwrap();
        assert_eq!("work@example.com", account.email());
        assert_eq!(AccountSource::Flag, account.source());
    }

    #[test]
    fn test_sentinel_falls_through() {
        let aliases = aliases();
        let store = store_with(&["third@example.com"]);
        store.set_default_account("third@example.com").unwrap();
        let resolver = AccountResolver::new(&aliases, Some(&store));

        for sentinel in ["auto", "AUTO", "Default", " default "] {
            let account = resolver
                .resolve(Some(sentinel), Some("other@example.com"))
                .unwrap();
            assert_eq!("other@example.com", account.email());
            assert_eq!(AccountSource::Env, account.source());

            let account = resolver.resolve(Some(sentinel), Some(sentinel)).unwrap();
            assert_eq!("third@example.com", account.email());
            assert_eq!(AccountSource::Default, account.source());
        }
    }

    #[test]
    fn test_env_alias() {
        let aliases = aliases();
        let resolver = AccountResolver::new(&aliases, None);
        let account = resolver.resolve(None, Some("HOME")).unwrap();
        assert_eq!("home@example.com", account.email());
        assert_eq!(AccountSource::Env, account.source());
    }

    #[test]
    fn test_email_is_never_an_alias() {
        let mut aliases = aliases();
        aliases.insert("a@b.com".to_string(), "hijacked@example.com".to_string());
        let resolver = AccountResolver::new(&aliases, None);
        let account = resolver.resolve(Some("A@B.com"), None).unwrap();
        assert_eq!("a@b.com", account.email());
    }

    #[test]
    fn test_unknown_alias_is_literal() {
        let aliases = aliases();
        let resolver = AccountResolver::new(&aliases, None);
        let account = resolver.resolve(Some("personal"), None).unwrap();
        assert_eq!("personal", account.email());
    }

    #[test]
    fn test_single_token_auto_select() {
        let aliases = BTreeMap::new();
        let store = store_with(&["only@example.com"]);
        let resolver = AccountResolver::new(&aliases, Some(&store));
        let account = resolver.resolve(None, None).unwrap();
        assert_eq!("only@example.com", account.email());
        assert_eq!(AccountSource::SingleToken, account.source());
    }

    #[test]
    fn test_missing_account() {
        let aliases = BTreeMap::new();
        for emails in [vec![], vec!["a@example.com", "b@example.com"]] {
            let store = store_with(&emails);
            let resolver = AccountResolver::new(&aliases, Some(&store));
            let err = resolver.resolve(None, Some("  ")).unwrap_err();
            assert!(matches!(auth_error(&err), Some(AuthError::MissingAccount)));
        }

        let resolver = AccountResolver::new(&aliases, None);
        let err = resolver.resolve(Some("auto"), None).unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::MissingAccount)));
    }

    #[test]
    fn test_unavailable_store_is_skipped() {
        let aliases = BTreeMap::new();
        let backend = Arc::new(MemoryBackend::default());
        let store = SecretStore::new(backend.clone());
        store
            .set_token("only@example.com", &Token::new("only@example.com", "r"))
            .unwrap();
        backend.set_unavailable(true);
        let resolver = AccountResolver::new(&aliases, Some(&store));
        let err = resolver.resolve(None, None).unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::MissingAccount)));
    }
}
