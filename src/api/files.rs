//! The OAuth client (`credentials.json`) downloaded from Google Cloud Console and saved by
//! `gog auth credentials`.

use crate::error::AuthError;
use crate::{utils, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::path::Path;

const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Represents the structure of the credential file downloaded from Google Cloud Console.
///
/// Desktop application credentials have an "installed" wrapper around the actual credentials, web
/// application credentials have a "web" wrapper. Either is accepted; we always save "installed".
///
/// Example:
/// ```json
/// {
///   "installed": {
///     "client_id": "YOUR_CLIENT_ID.apps.googleusercontent.com",
///     "client_secret": "YOUR_CLIENT_SECRET",
///     "redirect_uris": ["http://localhost"],
///     "auth_uri": "https://accounts.google.com/o/oauth2/auth",
///     "token_uri": "https://oauth2.googleapis.com/token"
///   }
/// }
/// ```
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    installed: Option<ClientCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    web: Option<ClientCredentials>,
}

/// The OAuth client credentials nested within the credentials file.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientCredentials {
    /// OAuth client ID
    client_id: String,

    /// OAuth client secret
    client_secret: String,

    /// Google's OAuth authorization endpoint
    #[serde(default = "default_auth_uri")]
    auth_uri: String,

    /// Google's OAuth token endpoint
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

impl Debug for ClientCredentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("auth_uri", &self.auth_uri)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

fn default_auth_uri() -> String {
    GOOGLE_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_uri: default_auth_uri(),
            token_uri: default_token_uri(),
        }
    }

    /// Parses a credentials file downloaded from Google Cloud Console.
    ///
    /// # Errors
    /// Returns `AuthError::Validation` if the data is not an OAuth client JSON document.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let file: CredentialsFile = serde_json::from_slice(data)
            .map_err(|e| AuthError::validation(format!("invalid OAuth client JSON: {e}")))?;
        let creds = file.installed.or(file.web).ok_or_else(|| {
            AuthError::validation(
                "invalid OAuth client JSON: expected an \"installed\" or \"web\" object; download \
                a Desktop app OAuth client from Google Cloud Console",
            )
        })?;
        if creds.client_id.trim().is_empty() || creds.client_secret.trim().is_empty() {
            return Err(AuthError::validation(
                "invalid OAuth client JSON: client_id and client_secret are required",
            )
            .into());
        }
        Ok(creds)
    }

    /// Loads the OAuth client credentials saved by `gog auth credentials`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(AuthError::not_found(format!(
                "OAuth client credentials at {} (run `gog auth credentials <credentials.json>`)",
                path.display()
            ))
            .into());
        }
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read file at {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("Unable to use {}", path.display()))
    }

    /// Saves the credentials with restrictive permissions.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let file = CredentialsFile {
            installed: Some(self.clone()),
            web: None,
        };
        let json =
            serde_json::to_string_pretty(&file).context("Failed to serialize data to JSON")?;
        if let Some(parent) = path.parent() {
            utils::make_private_dir(parent).await?;
        }
        utils::write_private(path, json).await
    }

    /// Get the client ID
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Get the client secret
    pub(crate) fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Get the auth URI
    pub(crate) fn auth_uri(&self) -> &str {
        &self.auth_uri
    }

    /// Get the token URI
    pub(crate) fn token_uri(&self) -> &str {
        &self.token_uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::auth_error;
    use tempfile::TempDir;

    #[test]
    fn test_parse_installed() {
        let json = r#"
{
    "installed": {
        "client_id": "YOUR_CLIENT_ID.apps.googleusercontent.com",
        "client_secret": "YOUR_CLIENT_SECRET",
        "redirect_uris": ["http://localhost", "https://example.com:4040/whatever"],
        "auth_uri": "https://accounts.google.com/o/oauth2/auth",
        "token_uri": "https://oauth2.googleapis.com/token"
    }
}
"#;
        let creds = ClientCredentials::parse(json.as_bytes()).unwrap();
        assert_eq!("YOUR_CLIENT_ID.apps.googleusercontent.com", creds.client_id());
        assert_eq!(GOOGLE_TOKEN_URI, creds.token_uri());
        assert!(!format!("{creds:?}").contains("YOUR_CLIENT_SECRET"));
    }

    #[test]
    fn test_parse_web_with_defaults() {
        let json = r#"{"web": {"client_id": "id", "client_secret": "secret"}}"#;
        let creds = ClientCredentials::parse(json.as_bytes()).unwrap();
        assert_eq!(GOOGLE_AUTH_URI, creds.auth_uri());
        assert_eq!("secret", creds.client_secret());
    }

    #[test]
    fn test_parse_bad() {
        for json in [
            "nope",
            r#"{"other": {}}"#,
            r#"{"installed": {"client_id": "", "client_secret": "s"}}"#,
        ] {
            let err = ClientCredentials::parse(json.as_bytes()).unwrap_err();
            assert!(matches!(auth_error(&err), Some(AuthError::Validation(_))));
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gogcli").join("credentials.json");
        let err = ClientCredentials::load(&path).await.unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::NotFound { .. })));

        let creds = ClientCredentials::new("id", "secret");
        creds.save(&path).await.unwrap();
        assert_eq!(creds, ClientCredentials::load(&path).await.unwrap());
    }
}
