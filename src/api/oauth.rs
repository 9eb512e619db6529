//! OAuth 2.0 authorization-code flow against Google, with PKCE (S256) and an anti-CSRF state.
//!
//! [`OAuthClient`] is the seam between the authorization engine and Google's token endpoint. The
//! production implementation is [`GoogleOAuthClient`], which uses the `oauth2` crate over
//! `reqwest`; tests inject a fake.

use crate::api::files::ClientCredentials;
use crate::error::AuthError;
use crate::Result;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse,
    TokenUrl,
};
use std::fmt::{Debug, Formatter};
use tracing::debug;
use url::Url;
use zeroize::Zeroizing;

/// The path on the loopback server that Google redirects to.
pub const CALLBACK_PATH: &str = "/oauth2/callback";

/// The redirect URI used by the manual flow. Nothing listens on it: the browser shows a
/// connection error and the user copies the URL from the address bar.
pub const MANUAL_REDIRECT_URI: &str = "http://127.0.0.1:1/oauth2/callback";

type GoogleClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// An authorization that has been started, i.e. the user has been (or is about to be) sent to the
/// consent page, and that is waiting for its authorization code.
#[derive(Clone)]
pub struct PendingAuthorization {
    url: String,
    state: String,
    pkce_verifier: Zeroizing<String>,
    redirect_uri: String,
}

impl Debug for PendingAuthorization {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("state", &self.state)
            .field("redirect_uri", &self.redirect_uri)
            .field("pkce_verifier", &"[REDACTED]")
            .finish()
    }
}

impl PendingAuthorization {
    pub fn new(
        url: impl Into<String>,
        state: impl Into<String>,
        pkce_verifier: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            state: state.into(),
            pkce_verifier: Zeroizing::new(pkce_verifier.into()),
            redirect_uri: redirect_uri.into(),
        }
    }

    /// The consent page URL to send the user to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The anti-CSRF state that the redirect must echo back.
    pub fn state(&self) -> &str {
        &self.state
    }

    pub(crate) fn pkce_verifier(&self) -> &str {
        &self.pkce_verifier
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }
}

/// The result of exchanging an authorization code.
#[derive(Clone, Default)]
pub struct Exchange {
    pub refresh_token: Option<String>,
    pub scopes: Vec<String>,
}

impl Debug for Exchange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// The operations of an OAuth 2.0 authorization server that the engine needs.
#[async_trait]
pub trait OAuthClient: Send + Sync {
    /// Builds the consent page URL for `scopes`, generating a fresh state and PKCE verifier.
    /// `access_type=offline` is always requested; `force_consent` adds `prompt=consent`.
    fn authorization(
        &self,
        scopes: &[String],
        redirect_uri: &str,
        force_consent: bool,
    ) -> Result<PendingAuthorization>;

    /// Exchanges `code` for tokens using the PKCE verifier of `pending`.
    async fn exchange_code(&self, pending: &PendingAuthorization, code: &str) -> Result<Exchange>;

    /// Mints an access token from `refresh_token`.
    async fn refresh(&self, refresh_token: &str, scopes: &[String]) -> Result<Zeroizing<String>>;
}

/// Talks to Google's OAuth endpoints using the client credentials from `credentials.json`.
pub struct GoogleOAuthClient {
    credentials: ClientCredentials,
    http: reqwest::Client,
}

impl Debug for GoogleOAuthClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleOAuthClient")
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl GoogleOAuthClient {
    pub fn new(credentials: ClientCredentials) -> Result<Self> {
        // Following redirects from the token endpoint would allow SSRF.
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Unable to build the HTTP client")?;
        Ok(Self { credentials, http })
    }

    fn client(&self) -> Result<GoogleClient> {
        let auth_uri = AuthUrl::new(self.credentials.auth_uri().to_string())
            .context("Invalid auth_uri in the OAuth client credentials")?;
        let token_uri = TokenUrl::new(self.credentials.token_uri().to_string())
            .context("Invalid token_uri in the OAuth client credentials")?;
        Ok(
            BasicClient::new(ClientId::new(self.credentials.client_id().to_string()))
                .set_client_secret(ClientSecret::new(
                    self.credentials.client_secret().to_string(),
                ))
                .set_auth_uri(auth_uri)
                .set_token_uri(token_uri),
        )
    }

    fn client_with_redirect(&self, redirect_uri: &str) -> Result<GoogleClient> {
        let redirect = RedirectUrl::new(redirect_uri.to_string())
            .with_context(|| format!("Invalid redirect URI '{redirect_uri}'"))?;
        Ok(self.client()?.set_redirect_uri(redirect))
    }
}

#[async_trait]
impl OAuthClient for GoogleOAuthClient {
    fn authorization(
        &self,
        scopes: &[String],
        redirect_uri: &str,
        force_consent: bool,
    ) -> Result<PendingAuthorization> {
        let client = self.client_with_redirect(redirect_uri)?;
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let mut request = client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(scopes.iter().map(|s| Scope::new(s.clone())))
            .set_pkce_challenge(challenge)
            .add_extra_param("access_type", "offline");
        if force_consent {
            request = request.add_extra_param("prompt", "consent");
        }
        let (url, state) = request.url();
        Ok(PendingAuthorization::new(
            url.to_string(),
            state.secret().clone(),
            verifier.secret().clone(),
            redirect_uri,
        ))
    }

    async fn exchange_code(&self, pending: &PendingAuthorization, code: &str) -> Result<Exchange> {
        let client = self.client_with_redirect(pending.redirect_uri())?;
        debug!("Exchanging the authorization code");
        let response = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(pending.pkce_verifier().to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| anyhow!(describe(&e)))
            .context("Unable to exchange the authorization code")?;
        Ok(Exchange {
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            scopes: response
                .scopes()
                .map(|scopes| scopes.iter().map(|s| s.as_str().to_string()).collect())
                .unwrap_or_default(),
        })
    }

    async fn refresh(&self, refresh_token: &str, scopes: &[String]) -> Result<Zeroizing<String>> {
        let client = self.client()?;
        let refresh_token = RefreshToken::new(refresh_token.to_string());
        let response = client
            .exchange_refresh_token(&refresh_token)
            .add_scopes(scopes.iter().map(|s| Scope::new(s.clone())))
            .request_async(&self.http)
            .await
            .map_err(|e| anyhow!(describe(&e)))
            .context("Unable to refresh the access token")?;
        Ok(Zeroizing::new(response.access_token().secret().clone()))
    }
}

/// Renders an error and its sources on one line.
fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    message
}

/// Extracts the authorization code from the query string of a redirect.
///
/// # Errors
/// - `AuthError::Validation` if the redirect carries an `error` or no `code`.
/// - `AuthError::StateMismatch` if `state` is missing or differs from `expected_state`.
pub fn code_from_query(query: &str, expected_state: &str) -> Result<String> {
    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
        match k.as_ref() {
            "code" => code = Some(v.into_owned()),
            "state" => state = Some(v.into_owned()),
            "error" => error = Some(v.into_owned()),
            _ => {}
        }
    }
    if let Some(error) = error {
        return Err(AuthError::validation(format!("authorization failed: {error}")).into());
    }
    if state.as_deref() != Some(expected_state) {
        return Err(AuthError::StateMismatch.into());
    }
    match code {
        Some(code) if !code.is_empty() => Ok(code),
        _ => Err(AuthError::validation("the redirect URL has no authorization code").into()),
    }
}

/// Extracts the authorization code from a redirect URL pasted by the user.
pub fn code_from_redirect_url(pasted: &str, expected_state: &str) -> Result<String> {
    let pasted = pasted.trim();
    if pasted.is_empty() {
        return Err(AuthError::validation("no redirect URL was pasted").into());
    }
    let url = Url::parse(pasted)
        .map_err(|e| AuthError::validation(format!("'{pasted}' is not a URL: {e}")))?;
    code_from_query(url.query().unwrap_or_default(), expected_state)
}
