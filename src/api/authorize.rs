//! The OAuth authorization engine.
//!
//! One attempt moves through these steps, and can fail at any of them:
//! 1. compute the scopes (`ScopeConflict` is raised here, before any I/O)
//! 2. send the user to the consent page, either through the loopback listener (automatic) or by
//!    printing the URL and reading the pasted redirect URL (manual)
//! 3. exchange the authorization code
//! 4. verify which account the new refresh token belongs to
//! 5. store the token
//!
//! Nothing is persisted unless every step succeeds.

use crate::api::callback::CallbackServer;
use crate::api::identity::{
    fetch_authorized_email, same_email, IdentityVerifier, IDENTITY_TIMEOUT,
};
use crate::api::oauth::{
    code_from_redirect_url, OAuthClient, PendingAuthorization, MANUAL_REDIRECT_URI,
};
use crate::api::scopes::{scopes_for, ScopeOptions, Service};
use crate::error::AuthError;
use crate::secrets::{SecretStore, Token};
use crate::utils::normalize_email;
use crate::Result;
use anyhow::{anyhow, Context};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The default bound on waiting for the user to finish consenting.
pub const DEFAULT_AUTHORIZE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The bound on exchanging an authorization code at the token endpoint.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// What to authorize, and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    services: Vec<Service>,
    scopes: Vec<String>,
    force_consent: bool,
    expected_email: Option<String>,
}

impl AuthorizationRequest {
    /// Computes the scopes for `services`.
    ///
    /// # Errors
    /// Returns `AuthError::ScopeConflict` for contradictory `options`.
    pub fn new(services: &[Service], options: ScopeOptions) -> Result<Self> {
        let scopes = scopes_for(services, options)?;
        let mut services = services.to_vec();
        services.sort();
        services.dedup();
        Ok(Self {
            services,
            scopes,
            force_consent: false,
            expected_email: None,
        })
    }

    pub fn with_force_consent(mut self, force_consent: bool) -> Self {
        self.force_consent = force_consent;
        self
    }

    /// Requires the authorized account to be `email`.
    pub fn with_expected_email(mut self, email: Option<&str>) -> Self {
        self.expected_email = email
            .map(normalize_email)
            .filter(|email| !email.is_empty());
        self
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn force_consent(&self) -> bool {
        self.force_consent
    }

    pub fn expected_email(&self) -> Option<&str> {
        self.expected_email.as_deref()
    }
}

/// How the authorization code gets back to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Print the URL and read the redirect URL that the user pastes.
    Manual,
    /// Listen on `127.0.0.1:<port>` (`0` for any free port) for the redirect.
    Automatic { port: u16, open_browser: bool },
}

/// Drives authorization attempts and persists their tokens.
#[derive(Clone)]
pub struct Authorizer {
    oauth: Arc<dyn OAuthClient>,
    verifier: Arc<dyn IdentityVerifier>,
    store: SecretStore,
    exchange_timeout: Duration,
    identity_timeout: Duration,
}

impl Authorizer {
    pub fn new(
        oauth: Arc<dyn OAuthClient>,
        verifier: Arc<dyn IdentityVerifier>,
        store: SecretStore,
    ) -> Self {
        Self {
            oauth,
            verifier,
            store,
            exchange_timeout: EXCHANGE_TIMEOUT,
            identity_timeout: IDENTITY_TIMEOUT,
        }
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    pub fn with_identity_timeout(mut self, timeout: Duration) -> Self {
        self.identity_timeout = timeout;
        self
    }

    pub fn store(&self) -> &SecretStore {
        &self.store
    }

    /// Runs a complete attempt and returns the stored token.
    ///
    /// # Arguments
    /// * `request` - the services, scopes and expected account
    /// * `flow` - manual or automatic
    /// * `timeout` - bound on waiting for the user
    /// * `cancel` - aborts the wait with `AuthError::Cancelled`
    /// * `input` - where the manual flow reads the pasted URL from
    ///
    /// # Errors
    /// Any step may fail; in every case the secret store is left untouched.
    pub async fn authorize<R>(
        &self,
        request: &AuthorizationRequest,
        flow: Flow,
        timeout: Duration,
        cancel: &CancellationToken,
        input: R,
    ) -> Result<Token>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        self.store
            .ensure_available()
            .context("The secret store must be reachable before authorizing")?;

        let (pending, code) = match flow {
            Flow::Manual => {
                let pending = self.begin(request, MANUAL_REDIRECT_URI)?;
                let code = receive_pasted_code(&pending, timeout, cancel, input).await?;
                (pending, code)
            }
            Flow::Automatic { port, open_browser } => {
                let server = CallbackServer::bind(port).await?;
                let pending = self.begin(request, &server.redirect_uri())?;
                info!(
                    "Opening the browser for authorization. If it does not open, visit:\n\n{}\n",
                    pending.url()
                );
                if open_browser {
                    if let Err(e) = open::that(pending.url()) {
                        warn!("Unable to open a browser: {e}");
                    }
                }
                let code = server.wait_for_code(pending.state(), timeout, cancel).await?;
                (pending, code)
            }
        };
        debug!("Authorization code received");
        self.finish(request, &pending, &code, cancel).await
    }

    /// Starts an attempt that redirects to `redirect_uri`.
    pub fn begin(
        &self,
        request: &AuthorizationRequest,
        redirect_uri: &str,
    ) -> Result<PendingAuthorization> {
        self.oauth
            .authorization(request.scopes(), redirect_uri, request.force_consent())
    }

    /// Exchanges `code`, verifies the identity and stores the token.
    ///
    /// # Errors
    /// - an error suggesting `--force-consent` if Google sends no refresh token
    /// - `AuthError::Timeout` if the exchange or identity verification takes too long
    /// - `AuthError::Cancelled` if `cancel` fires before the token is stored
    /// - `AuthError::IdentityMismatch` if the account is not the expected one
    pub async fn finish(
        &self,
        request: &AuthorizationRequest,
        pending: &PendingAuthorization,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<Token> {
        let exchange = tokio::select! {
            exchanged = tokio::time::timeout(
                self.exchange_timeout,
                self.oauth.exchange_code(pending, code),
            ) => match exchanged {
                Ok(exchange) => exchange?,
                Err(_) => {
                    return Err(AuthError::timeout(
                        "exchanging the authorization code",
                        self.exchange_timeout,
                    )
                    .into())
                }
            },
            _ = cancel.cancelled() => return Err(AuthError::cancelled("authorization").into()),
        };
        let refresh_token = exchange.refresh_token.clone().ok_or_else(|| {
            anyhow!(
                "Google did not return a refresh token. This happens when the account already \
                granted access; retry with --force-consent"
            )
        })?;

        let verified = fetch_authorized_email(
            self.oauth.as_ref(),
            self.verifier.as_ref(),
            &refresh_token,
            request.scopes(),
            self.identity_timeout,
        );
        let email = tokio::select! {
            email = verified => email.context("Unable to verify the authorized account")?,
            _ = cancel.cancelled() => return Err(AuthError::cancelled("authorization").into()),
        };
        if let Some(expected) = request.expected_email() {
            if !same_email(expected, &email) {
                return Err(AuthError::IdentityMismatch {
                    expected: expected.to_string(),
                    actual: email,
                }
                .into());
            }
        }

        let scopes = if exchange.scopes.is_empty() {
            request.scopes().to_vec()
        } else {
            exchange.scopes.clone()
        };
        let token = Token::new(&email, refresh_token)
            .with_services(request.services().iter().map(Service::to_string))
            .with_scopes(scopes)
            .with_created_at(Some(Utc::now()));
        self.store.set_token(&email, &token)?;
        info!("Authorized {}", token.email());
        Ok(token)
    }

    /// Checks that `refresh_token` still works and returns the account it belongs to.
    pub async fn check_refresh_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
        timeout: Duration,
    ) -> Result<String> {
        fetch_authorized_email(
            self.oauth.as_ref(),
            self.verifier.as_ref(),
            refresh_token,
            scopes,
            timeout,
        )
        .await
    }
}

async fn receive_pasted_code<R>(
    pending: &PendingAuthorization,
    timeout: Duration,
    cancel: &CancellationToken,
    mut input: R,
) -> Result<String>
where
    R: AsyncBufRead + Unpin + Send,
{
    info!("Visit this URL to authorize:\n\n{}\n", pending.url());
    info!(
        "After approving, the browser will fail to load a 127.0.0.1 page. Copy the full URL from \
        the address bar and paste it here:"
    );
    let mut line = String::new();
    tokio::select! {
        read = input.read_line(&mut line) => {
            read.context("Unable to read the redirect URL")?;
        }
        _ = tokio::time::sleep(timeout) => {
            return Err(AuthError::timeout("waiting for the redirect URL", timeout).into());
        }
        _ = cancel.cancelled() => return Err(AuthError::cancelled("authorization").into()),
    }
    code_from_redirect_url(&line, pending.state())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::scopes::DriveScope;
    use crate::error::auth_error;
    use crate::test::{FakeIdentityVerifier, FakeOAuth, FAKE_STATE};

    fn request(expected: Option<&str>) -> AuthorizationRequest {
        AuthorizationRequest::new(&[Service::Gmail, Service::Drive], ScopeOptions::default())
            .unwrap()
            .with_expected_email(expected)
    }

    fn pasted(code: &str, state: &str) -> Vec<u8> {
        format!("{MANUAL_REDIRECT_URI}?state={state}&code={code}\n").into_bytes()
    }

    #[test]
    fn test_request_scope_conflict() {
        let err = AuthorizationRequest::new(
            &[Service::Gmail],
            ScopeOptions {
                readonly: true,
                drive_scope: DriveScope::File,
            },
        )
        .unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::ScopeConflict)));
    }

    #[tokio::test]
    async fn test_manual_flow_stores_verified_token() {
        let (authorizer, store) = crate::test::authorizer(FakeOAuth::default());
        let cancel = CancellationToken::new();
        let input = pasted("me@example.com", FAKE_STATE);
        let token = authorizer
            .authorize(
                &request(Some("Me@Example.com")),
                Flow::Manual,
                Duration::from_secs(5),
                &cancel,
                input.as_slice(),
            )
            .await
            .unwrap();
        assert_eq!("me@example.com", token.email());
        assert!(token.created_at().is_some());
        assert_eq!(
            vec!["drive", "gmail"],
            token.services().iter().map(String::as_str).collect::<Vec<_>>()
        );
        assert!(token.scopes().contains("openid"));
        assert_eq!(token, store.get_token("me@example.com").unwrap());
    }

    #[tokio::test]
    async fn test_identity_mismatch_stores_nothing() {
        let (authorizer, store) = crate::test::authorizer(FakeOAuth::default());
        let cancel = CancellationToken::new();
        let input = pasted("other@example.com", FAKE_STATE);
        let err = authorizer
            .authorize(
                &request(Some("me@example.com")),
                Flow::Manual,
                Duration::from_secs(5),
                &cancel,
                input.as_slice(),
            )
            .await
            .unwrap_err();
        match auth_error(&err) {
            Some(AuthError::IdentityMismatch { expected, actual }) => {
                assert_eq!("me@example.com", expected);
                assert_eq!("other@example.com", actual);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(store.list_tokens().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pasted_state_mismatch() {
        let (authorizer, store) = crate::test::authorizer(FakeOAuth::default());
        let cancel = CancellationToken::new();
        let input = pasted("me@example.com", "forged");
        let err = authorizer
            .authorize(
                &request(None),
                Flow::Manual,
                Duration::from_secs(5),
                &cancel,
                input.as_slice(),
            )
            .await
            .unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::StateMismatch)));
        assert!(store.list_tokens().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_refresh_token() {
        let oauth = FakeOAuth {
            omit_refresh_token: true,
            ..FakeOAuth::default()
        };
        let (authorizer, store) = crate::test::authorizer(oauth);
        let pending = authorizer.begin(&request(None), MANUAL_REDIRECT_URI).unwrap();
        let err = authorizer
            .finish(&request(None), &pending, "me@example.com", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--force-consent"));
        assert!(store.list_tokens().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_identity_timeout_stores_nothing() {
        let store = SecretStore::new(Arc::new(
            crate::secrets::memory::MemoryBackend::default(),
        ));
        let authorizer = Authorizer::new(
            Arc::new(FakeOAuth::default()),
            Arc::new(FakeIdentityVerifier::with_delay(Duration::from_secs(5))),
            store.clone(),
        )
        .with_identity_timeout(Duration::from_millis(50));
        let pending = authorizer.begin(&request(None), MANUAL_REDIRECT_URI).unwrap();
        let err = authorizer
            .finish(&request(None), &pending, "me@example.com", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::Timeout { .. })));
        assert!(store.list_tokens().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_exchange_times_out() {
        let oauth = FakeOAuth {
            exchange_delay: Some(Duration::from_secs(5)),
            ..FakeOAuth::default()
        };
        let (authorizer, store) = crate::test::authorizer(oauth);
        let authorizer = authorizer.with_exchange_timeout(Duration::from_millis(50));
        let pending = authorizer.begin(&request(None), MANUAL_REDIRECT_URI).unwrap();
        let err = authorizer
            .finish(&request(None), &pending, "me@example.com", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::Timeout { .. })));
        assert!(store.list_tokens().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_exchange() {
        let oauth = FakeOAuth {
            exchange_delay: Some(Duration::from_secs(30)),
            ..FakeOAuth::default()
        };
        let (authorizer, store) = crate::test::authorizer(oauth);
        let cancel = CancellationToken::new();
        let input = pasted("me@example.com", FAKE_STATE);
        let req = request(None);
        let attempt = authorizer.authorize(
            &req,
            Flow::Manual,
            Duration::from_secs(30),
            &cancel,
            input.as_slice(),
        );
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = tokio::time::timeout(Duration::from_secs(5), attempt)
            .await
            .expect("cancellation should end the attempt")
            .unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::Cancelled { .. })));
        assert!(store.list_tokens().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_before_consent() {
        let (authorizer, backend) = crate::test::authorizer_with_backend(FakeOAuth::default());
        backend.set_unavailable(true);
        let cancel = CancellationToken::new();
        let err = authorizer
            .authorize(
                &request(None),
                Flow::Manual,
                Duration::from_secs(5),
                &cancel,
                &b""[..],
            )
            .await
            .unwrap_err();
        assert!(matches!(
            auth_error(&err),
            Some(AuthError::StoreUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_manual_flow_cancelled() {
        let (authorizer, _store) = crate::test::authorizer(FakeOAuth::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        // A reader that never yields a line.
        let (_writer, reader) = tokio::io::duplex(64);
        let err = authorizer
            .authorize(
                &request(None),
                Flow::Manual,
                Duration::from_secs(5),
                &cancel,
                tokio::io::BufReader::new(reader),
            )
            .await
            .unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_automatic_flow() {
        let (authorizer, store) = crate::test::authorizer(FakeOAuth::default());
        let cancel = CancellationToken::new();
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let browser = tokio::spawn(async move {
            let url = format!(
                "http://127.0.0.1:{port}/oauth2/callback?state={FAKE_STATE}&code=me%40example.com"
            );
            for _ in 0..100 {
                if let Ok(response) = reqwest::get(&url).await {
                    return response.status();
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("the callback listener never came up");
        });
        let token = authorizer
            .authorize(
                &request(Some("me@example.com")),
                Flow::Automatic {
                    port,
                    open_browser: false,
                },
                Duration::from_secs(10),
                &cancel,
                &b""[..],
            )
            .await
            .unwrap();
        assert_eq!(reqwest::StatusCode::OK, browser.await.unwrap());
        assert_eq!(token, store.get_token("me@example.com").unwrap());
    }

    #[tokio::test]
    async fn test_check_refresh_token() {
        let (authorizer, _store) = crate::test::authorizer(FakeOAuth::default());
        let email = authorizer
            .check_refresh_token(
                &FakeOAuth::refresh_token_for("me@example.com"),
                &[],
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!("me@example.com", email);
        assert!(authorizer
            .check_refresh_token("revoked", &[], Duration::from_secs(1))
            .await
            .is_err());
    }
}
