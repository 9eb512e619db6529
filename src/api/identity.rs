//! Confirms which Google account a refresh token belongs to.

use crate::api::oauth::OAuthClient;
use crate::error::AuthError;
use crate::utils::normalize_email;
use crate::Result;
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// How long identity verification may take after an authorization.
pub const IDENTITY_TIMEOUT: Duration = Duration::from_secs(15);

const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// Looks up the email address of the account an access token was issued to.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn email(&self, access_token: &str) -> Result<String>;
}

/// Uses the OpenID Connect userinfo endpoint, which needs the `openid` and `email` scopes.
pub struct GoogleIdentityVerifier {
    http: reqwest::Client,
    userinfo_url: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    email: Option<String>,
}

impl GoogleIdentityVerifier {
    pub fn new() -> Result<Self> {
        Self::with_userinfo_url(USERINFO_URL)
    }

    pub(crate) fn with_userinfo_url(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Unable to build the HTTP client")?;
        Ok(Self {
            http,
            userinfo_url: url.into(),
        })
    }
}

#[async_trait]
impl IdentityVerifier for GoogleIdentityVerifier {
    async fn email(&self, access_token: &str) -> Result<String> {
        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .context("Unable to reach the userinfo endpoint")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("The userinfo endpoint returned {status}: {}", body.trim());
        }
        let info: UserInfo = response
            .json()
            .await
            .context("Unable to parse the userinfo response")?;
        match info.email {
            Some(email) if !email.trim().is_empty() => Ok(email.trim().to_string()),
            _ => bail!("The userinfo response has no email; was the 'email' scope granted?"),
        }
    }
}

/// Trades `refresh_token` for an access token and asks `verifier` whose it is, all within
/// `timeout`.
///
/// # Errors
/// Returns `AuthError::Timeout` if the deadline passes, otherwise whatever the exchange or the
/// lookup fails with.
pub async fn fetch_authorized_email(
    oauth: &dyn OAuthClient,
    verifier: &dyn IdentityVerifier,
    refresh_token: &str,
    scopes: &[String],
    timeout: Duration,
) -> Result<String> {
    let lookup = async {
        let access_token = oauth.refresh(refresh_token, scopes).await?;
        verifier.email(&access_token).await
    };
    match tokio::time::timeout(timeout, lookup).await {
        Ok(result) => {
            let email = result?;
            debug!("The token belongs to {email}");
            Ok(email)
        }
        Err(_) => Err(AuthError::timeout("identity verification", timeout).into()),
    }
}

/// Compares emails the way they are stored, trimmed and lowercased.
pub fn same_email(a: &str, b: &str) -> bool {
    normalize_email(a) == normalize_email(b)
}
