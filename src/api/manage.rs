//! A local web page for adding, removing and choosing the default account.
//!
//! The server lives for a bounded time. It stops on timeout, on `POST /shutdown` or when the
//! cancellation token fires, and in every case the listener and all connections are dropped
//! before [`ManageServer::run`] returns.
//!
//! Routes:
//! - `GET /` the account page
//! - `GET /accounts` the accounts as JSON
//! - `GET /add[?email=]` starts an authorization and redirects to Google
//! - `GET /oauth2/callback` completes an authorization started by `/add`
//! - `POST /remove?email=&csrf=`, `POST /default?email=&csrf=`, `POST /shutdown?csrf=`

use crate::api::authorize::{AuthorizationRequest, Authorizer, DEFAULT_AUTHORIZE_TIMEOUT};
use crate::api::callback::{escape_html, respond, GRACE};
use crate::api::oauth::{code_from_query, PendingAuthorization, CALLBACK_PATH};
use crate::error::{auth_error, AuthError};
use crate::Result;
use anyhow::Context;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// The default lifetime of the manage server.
pub const DEFAULT_MANAGE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Why the server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Timeout,
    Shutdown,
}

serde_plain::derive_display_from_serialize!(StopReason);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AccountEntry {
    pub email: String,
    pub services: Vec<String>,
    pub default: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AccountsView {
    pub accounts: Vec<AccountEntry>,
    pub default: Option<String>,
}

/// At most this many `/add` attempts wait for their callback at once.
const MAX_ATTEMPTS: usize = 16;

/// Authorizations started by `/add` that wait for their callback, keyed by state. Attempts
/// expire after `ttl`, and starting one more than `MAX_ATTEMPTS` drops the oldest.
struct Attempts {
    ttl: Duration,
    entries: HashMap<String, Attempt>,
}

struct Attempt {
    request: AuthorizationRequest,
    pending: PendingAuthorization,
    started: Instant,
}

impl Attempts {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, request: AuthorizationRequest, pending: PendingAuthorization) {
        self.expire();
        while self.entries.len() >= MAX_ATTEMPTS {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, attempt)| attempt.started)
                .map(|(state, _)| state.clone());
            let Some(oldest) = oldest else { break };
            debug!("Dropping the oldest pending authorization");
            self.entries.remove(&oldest);
        }
        self.entries.insert(
            pending.state().to_string(),
            Attempt {
                request,
                pending,
                started: Instant::now(),
            },
        );
    }

    fn take(&mut self, state: &str) -> Option<(AuthorizationRequest, PendingAuthorization)> {
        self.expire();
        self.entries
            .remove(state)
            .map(|attempt| (attempt.request, attempt.pending))
    }

    fn expire(&mut self) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, attempt| attempt.started.elapsed() < ttl);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Shared {
    authorizer: Authorizer,
    template: AuthorizationRequest,
    redirect_uri: String,
    csrf: String,
    pending: Mutex<Attempts>,
    shutdown: CancellationToken,
}

/// A bound, not yet serving, manage server.
pub struct ManageServer {
    listener: TcpListener,
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl ManageServer {
    /// Binds `127.0.0.1:<port>` (`0` for any free port). Accounts added through the page are
    /// authorized with the services and scopes of `template`.
    pub async fn bind(
        authorizer: Authorizer,
        template: AuthorizationRequest,
        port: u16,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("Unable to listen on 127.0.0.1:{port}"))?;
        let addr = listener
            .local_addr()
            .context("Unable to read the listener address")?;
        let shared = Arc::new(Shared {
            authorizer,
            template,
            redirect_uri: format!("http://{addr}{CALLBACK_PATH}"),
            csrf: uuid::Uuid::new_v4().simple().to_string(),
            pending: Mutex::new(Attempts::new(DEFAULT_AUTHORIZE_TIMEOUT)),
            shutdown: CancellationToken::new(),
        });
        Ok(Self {
            listener,
            addr,
            shared,
        })
    }

    /// The address of the account page.
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[cfg(test)]
    pub(crate) fn csrf(&self) -> &str {
        &self.shared.csrf
    }

    /// Serves until `timeout` passes, `/shutdown` is posted or `cancel` fires.
    ///
    /// # Errors
    /// Returns `AuthError::Cancelled` when `cancel` fires.
    pub async fn run(self, timeout: Duration, cancel: &CancellationToken) -> Result<StopReason> {
        let Self {
            listener,
            addr,
            shared,
        } = self;
        info!(
            "Account manager running at http://{addr}/ for up to {}s",
            timeout.as_secs()
        );
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut connections = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            debug!("Accept failed: {e}");
                            continue;
                        }
                    };
                    trace!("Manage connection from {peer}");
                    let shared = shared.clone();
                    connections.spawn(async move {
                        let service = service_fn(move |req| {
                            let shared = shared.clone();
                            async move { Ok::<_, Infallible>(handle(&shared, req).await) }
                        });
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            trace!("Manage connection ended: {e}");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut deadline => break Ok(StopReason::Timeout),
                _ = shared.shutdown.cancelled() => break Ok(StopReason::Shutdown),
                _ = cancel.cancelled() => {
                    break Err(AuthError::cancelled("account manager").into())
                }
            }
        };

        drop(listener);
        let _ = tokio::time::timeout(GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        connections.shutdown().await;
        debug!("Account manager on {addr} stopped");
        outcome
    }
}

async fn handle(shared: &Shared, req: Request<Incoming>) -> Response<String> {
    let query = req.uri().query().unwrap_or_default().to_string();
    let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    trace!("{method} {path}");

    match (method, path.as_str()) {
        (Method::GET, "/") => page(shared, &params),
        (Method::GET, "/accounts") => match accounts(shared) {
            Ok(view) => json(&view),
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                escape_html(&format!("{e:#}")),
            ),
        },
        (Method::GET, "/add") => add(shared, params.get("email").map(String::as_str)),
        (Method::GET, CALLBACK_PATH) => callback(shared, &query).await,
        (Method::POST, "/remove" | "/default" | "/shutdown") => {
            if params.get("csrf") != Some(&shared.csrf) {
                warn!("Rejected {path} with a missing or wrong csrf token");
                return respond(StatusCode::FORBIDDEN, "Forbidden".to_string());
            }
            mutate(shared, &path, params.get("email").map(String::as_str))
        }
        (_, "/" | "/accounts" | "/add" | "/remove" | "/default" | "/shutdown" | CALLBACK_PATH) => {
            respond(
                StatusCode::METHOD_NOT_ALLOWED,
                "Method not allowed".to_string(),
            )
        }
        _ => respond(StatusCode::NOT_FOUND, "Not found".to_string()),
    }
}

fn accounts(shared: &Shared) -> Result<AccountsView> {
    let store = shared.authorizer.store();
    let default = store.default_account()?;
    let accounts = store
        .list_tokens()?
        .iter()
        .map(|token| AccountEntry {
            email: token.email().to_string(),
            services: token.services().iter().cloned().collect(),
            default: default.as_deref() == Some(token.email()),
        })
        .collect();
    Ok(AccountsView { accounts, default })
}

fn add(shared: &Shared, email: Option<&str>) -> Response<String> {
    let request = shared.template.clone().with_expected_email(email);
    match shared.authorizer.begin(&request, &shared.redirect_uri) {
        Ok(pending) => {
            let url = pending.url().to_string();
            if let Ok(mut attempts) = shared.pending.lock() {
                attempts.insert(request, pending);
            }
            redirect(StatusCode::FOUND, &url)
        }
        Err(e) => back(StatusCode::FOUND, "error", &format!("{e:#}")),
    }
}

async fn callback(shared: &Shared, query: &str) -> Response<String> {
    let state = url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default();
    let attempt = shared
        .pending
        .lock()
        .ok()
        .and_then(|mut attempts| attempts.take(&state));
    let Some((request, pending)) = attempt else {
        warn!("Rejected an OAuth redirect with an unknown state");
        return respond(
            StatusCode::BAD_REQUEST,
            escape_html(&AuthError::StateMismatch.to_string()),
        );
    };
    let code = match code_from_query(query, pending.state()) {
        Ok(code) => code,
        Err(e) => return back(StatusCode::FOUND, "error", &e.to_string()),
    };
    match shared
        .authorizer
        .finish(&request, &pending, &code, &shared.shutdown)
        .await
    {
        Ok(token) => back(
            StatusCode::FOUND,
            "status",
            &format!("Added {}", token.email()),
        ),
        Err(e) => {
            warn!("Unable to add the account: {e:#}");
            back(StatusCode::FOUND, "error", &format!("{e:#}"))
        }
    }
}

fn mutate(shared: &Shared, path: &str, email: Option<&str>) -> Response<String> {
    if path == "/shutdown" {
        shared.shutdown.cancel();
        return respond(
            StatusCode::OK,
            "Shutting down. You can close this window.".to_string(),
        );
    }
    let Some(email) = email.filter(|e| !e.trim().is_empty()) else {
        return respond(StatusCode::BAD_REQUEST, "Missing email".to_string());
    };
    let store = shared.authorizer.store();
    let result = if path == "/remove" {
        store
            .delete_token(email)
            .map(|_| format!("Removed {email}"))
    } else {
        store.get_token(email).and_then(|_| {
            store
                .set_default_account(email)
                .map(|_| format!("Default account is now {email}"))
        })
    };
    match result {
        Ok(message) => {
            info!("{message}");
            back(StatusCode::SEE_OTHER, "status", &message)
        }
        Err(e) if matches!(auth_error(&e), Some(AuthError::NotFound { .. })) => {
            respond(StatusCode::NOT_FOUND, escape_html(&e.to_string()))
        }
        Err(e) => back(StatusCode::SEE_OTHER, "error", &format!("{e:#}")),
    }
}

fn page(shared: &Shared, params: &HashMap<String, String>) -> Response<String> {
    let mut html = String::from(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>gog accounts</title></head>\
        <body><h1>gog accounts</h1>",
    );
    if let Some(status) = params.get("status") {
        html.push_str(&format!("<p class=\"status\">{}</p>", escape_html(status)));
    }
    if let Some(error) = params.get("error") {
        html.push_str(&format!("<p class=\"error\">{}</p>", escape_html(error)));
    }
    match accounts(shared) {
        Ok(view) if view.accounts.is_empty() => html.push_str("<p>No accounts yet.</p>"),
        Ok(view) => {
            html.push_str("<table><tr><th>Account</th><th>Services</th><th></th></tr>");
            for account in &view.accounts {
                let query = query_string(&[("email", &account.email), ("csrf", &shared.csrf)]);
                html.push_str(&format!(
                    "<tr><td>{}{}</td><td>{}</td><td>\
                    <form method=\"post\" action=\"/default?{query}\"><button>Make default</button>\
                    </form><form method=\"post\" action=\"/remove?{query}\"><button>Remove</button>\
                    </form></td></tr>",
                    escape_html(&account.email),
                    if account.default { " (default)" } else { "" },
                    escape_html(&account.services.join(", ")),
                ));
            }
            html.push_str("</table>");
        }
        Err(e) => html.push_str(&format!(
            "<p class=\"error\">{}</p>",
            escape_html(&format!("{e:#}"))
        )),
    }
    html.push_str(&format!(
        "<h2>Add an account</h2><form method=\"get\" action=\"/add\">\
        <input name=\"email\" placeholder=\"you@example.com\"><button>Add</button></form>\
        <form method=\"post\" action=\"/shutdown?{}\"><button>Done</button></form>\
        </body></html>",
        query_string(&[("csrf", &shared.csrf)])
    ));
    respond(StatusCode::OK, html)
}

fn query_string(pairs: &[(&str, &str)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs {
        serializer.append_pair(k, v);
    }
    escape_html(&serializer.finish())
}

fn json<T: Serialize>(value: &T) -> Response<String> {
    match serde_json::to_string_pretty(value) {
        Ok(body) => {
            let mut response = Response::new(body);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            escape_html(&e.to_string()),
        ),
    }
}

fn redirect(status: StatusCode, location: &str) -> Response<String> {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = respond(status, String::new());
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Bad redirect".to_string(),
        ),
    }
}

/// Redirects back to the account page with a status or error message.
fn back(status: StatusCode, key: &str, message: &str) -> Response<String> {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair(key, message)
        .finish();
    redirect(status, &format!("/?{query}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::scopes::{ScopeOptions, Service};
    use crate::secrets::{SecretStore, Token};
    use crate::test::{FakeOAuth, FAKE_STATE};

    fn http() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    async fn server(store_emails: &[&str]) -> (ManageServer, SecretStore) {
        let (authorizer, store) = crate::test::authorizer(FakeOAuth::default());
        for email in store_emails {
            store
                .set_token(
                    email,
                    &Token::new(email, FakeOAuth::refresh_token_for(email)),
                )
                .unwrap();
        }
        let template =
            AuthorizationRequest::new(&[Service::Gmail], ScopeOptions::default()).unwrap();
        let server = ManageServer::bind(authorizer, template, 0).await.unwrap();
        (server, store)
    }

    fn location(response: &reqwest::Response) -> String {
        response.headers()[LOCATION.as_str()]
            .to_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_stops_on_timeout_and_releases_port() {
        let (server, _store) = server(&[]).await;
        let addr = server.addr();
        let cancel = CancellationToken::new();
        let reason = server
            .run(Duration::from_millis(50), &cancel)
            .await
            .unwrap();
        assert_eq!(StopReason::Timeout, reason);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel() {
        let (server, _store) = server(&[]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = server
            .run(Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(auth_error(&err), Some(AuthError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_pages_and_mutations() {
        let (server, store) = server(&["a@example.com", "b@example.com"]).await;
        let base = server.url();
        let csrf = server.csrf().to_string();
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let cancel = cancel.clone();
            async move { server.run(Duration::from_secs(30), &cancel).await }
        });
        let client = http();

        let page = client.get(&base).send().await.unwrap().text().await.unwrap();
        assert!(page.contains("a@example.com"));
        assert!(page.contains(&csrf));

        // Mutations need the csrf token.
        let forbidden = client
            .post(format!("{base}default?email=b@example.com"))
            .send()
            .await
            .unwrap();
        assert_eq!(reqwest::StatusCode::FORBIDDEN, forbidden.status());
        assert_eq!(None, store.default_account().unwrap());

        let response = client
            .post(format!("{base}default?email=b@example.com&csrf={csrf}"))
            .send()
            .await
            .unwrap();
        assert_eq!(reqwest::StatusCode::SEE_OTHER, response.status());
        assert_eq!(
            Some("b@example.com".to_string()),
            store.default_account().unwrap()
        );

        let view: serde_json::Value = client
            .get(format!("{base}accounts"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!("b@example.com", view["default"]);
        assert_eq!(2, view["accounts"].as_array().unwrap().len());

        let response = client
            .post(format!("{base}remove?email=a@example.com&csrf={csrf}"))
            .send()
            .await
            .unwrap();
        assert_eq!(reqwest::StatusCode::SEE_OTHER, response.status());
        assert!(store.get_token("a@example.com").is_err());

        let missing = client
            .post(format!("{base}remove?email=a@example.com&csrf={csrf}"))
            .send()
            .await
            .unwrap();
        assert_eq!(reqwest::StatusCode::NOT_FOUND, missing.status());

        let wrong_method = client.get(format!("{base}shutdown")).send().await.unwrap();
        assert_eq!(reqwest::StatusCode::METHOD_NOT_ALLOWED, wrong_method.status());

        let response = client
            .post(format!("{base}shutdown?csrf={csrf}"))
            .send()
            .await
            .unwrap();
        assert_eq!(reqwest::StatusCode::OK, response.status());
        assert_eq!(StopReason::Shutdown, running.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_add_through_callback() {
        let (server, store) = server(&[]).await;
        let base = server.url();
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let cancel = cancel.clone();
            async move { server.run(Duration::from_secs(30), &cancel).await }
        });
        let client = http();

        let response = client
            .get(format!("{base}add?email=new@example.com"))
            .send()
            .await
            .unwrap();
        assert_eq!(reqwest::StatusCode::FOUND, response.status());
        assert!(location(&response).contains(FAKE_STATE));

        // A redirect for an attempt that was never started is rejected.
        let unknown = client
            .get(format!(
                "{base}oauth2/callback?state=unknown&code=new%40example.com"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(reqwest::StatusCode::BAD_REQUEST, unknown.status());

        let done = client
            .get(format!(
                "{base}oauth2/callback?state={FAKE_STATE}&code=new%40example.com"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(reqwest::StatusCode::FOUND, done.status());
        assert!(location(&done).starts_with("/?status="));
        let token = store.get_token("new@example.com").unwrap();
        assert_eq!(
            vec!["gmail"],
            token.services().iter().map(String::as_str).collect::<Vec<_>>()
        );

        cancel.cancel();
        assert!(running.await.unwrap().is_err());
    }

    fn attempt(state: &str) -> (AuthorizationRequest, PendingAuthorization) {
        let request =
            AuthorizationRequest::new(&[Service::Gmail], ScopeOptions::default()).unwrap();
        let pending = PendingAuthorization::new(
            format!("https://accounts.example.test/?state={state}"),
            state,
            "verifier",
            "http://127.0.0.1:1/oauth2/callback",
        );
        (request, pending)
    }

    #[test]
    fn test_attempts_are_capped() {
        let mut attempts = Attempts::new(Duration::from_secs(60));
        for i in 0..MAX_ATTEMPTS + 4 {
            let (request, pending) = attempt(&format!("state-{i}"));
            attempts.insert(request, pending);
        }
        assert_eq!(MAX_ATTEMPTS, attempts.len());
        // The oldest attempts were dropped, the newest survive.
        assert!(attempts.take("state-0").is_none());
        let last = format!("state-{}", MAX_ATTEMPTS + 3);
        assert!(attempts.take(&last).is_some());
        assert!(attempts.take(&last).is_none());
    }

    #[test]
    fn test_attempts_expire() {
        let mut attempts = Attempts::new(Duration::ZERO);
        let (request, pending) = attempt("stale");
        attempts.insert(request, pending);
        assert!(attempts.take("stale").is_none());
        assert_eq!(0, attempts.len());
    }

    #[tokio::test]
    async fn test_callback_for_unknown_state() {
        let (server, store) = server(&[]).await;
        let base = server.url();
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let cancel = cancel.clone();
            async move { server.run(Duration::from_secs(30), &cancel).await }
        });
        let client = http();

        // Without any /add, no state is known.
        let response = client
            .get(format!(
                "{base}oauth2/callback?state={FAKE_STATE}&code=me%40example.com"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(reqwest::StatusCode::BAD_REQUEST, response.status());
        let body = response.text().await.unwrap();
        assert!(body.contains(&escape_html(&AuthError::StateMismatch.to_string())));
        assert!(store.list_tokens().unwrap().is_empty());

        // A state is good for one callback only.
        client.get(format!("{base}add")).send().await.unwrap();
        let first = client
            .get(format!(
                "{base}oauth2/callback?state={FAKE_STATE}&code=me%40example.com"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(reqwest::StatusCode::FOUND, first.status());
        let replay = client
            .get(format!(
                "{base}oauth2/callback?state={FAKE_STATE}&code=me%40example.com"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(reqwest::StatusCode::BAD_REQUEST, replay.status());

        cancel.cancel();
        let _ = running.await;
    }

    #[tokio::test]
    async fn test_add_with_wrong_account_shows_error() {
        let (server, store) = server(&[]).await;
        let base = server.url();
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let cancel = cancel.clone();
            async move { server.run(Duration::from_secs(30), &cancel).await }
        });
        let client = http();

        client
            .get(format!("{base}add?email=expected@example.com"))
            .send()
            .await
            .unwrap();
        let done = client
            .get(format!(
                "{base}oauth2/callback?state={FAKE_STATE}&code=intruder%40example.com"
            ))
            .send()
            .await
            .unwrap();
        assert!(location(&done).starts_with("/?error="));
        assert!(store.list_tokens().unwrap().is_empty());

        cancel.cancel();
        let _ = running.await;
    }
}
