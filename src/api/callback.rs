//! The loopback listener that receives Google's redirect in the automatic flow.
//!
//! The listener runs as its own task and reports the first conclusive redirect over a oneshot
//! channel. The task, and every connection it accepted, is torn down when the wait ends, whether
//! it ended with a code, an error, a timeout or a cancellation, so the port is always released.

use crate::api::oauth::{code_from_query, CALLBACK_PATH};
use crate::error::AuthError;
use crate::Result;
use anyhow::{anyhow, Context};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How long in-flight responses get to reach the browser once the outcome is known.
pub(crate) const GRACE: Duration = Duration::from_millis(500);

const SUCCESS_PAGE: &str = "<!doctype html><html><body><h1>gog: authorization received</h1>\
    <p>You can close this window and return to the terminal.</p></body></html>";

/// Aborts the task it owns when dropped.
pub(crate) struct TaskGuard {
    handle: Option<JoinHandle<()>>,
}

impl TaskGuard {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Lets the task finish for up to `grace`, then aborts it and waits until it is gone.
    pub(crate) async fn stop(mut self, grace: Duration) {
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

type Outcome = Result<String>;
type Reporter = Arc<Mutex<Option<oneshot::Sender<Outcome>>>>;

/// A bound, not yet serving, redirect listener.
#[derive(Debug)]
pub struct CallbackServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl CallbackServer {
    /// Binds `127.0.0.1:<port>`; port `0` picks a free port.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("Unable to listen on 127.0.0.1:{port}"))?;
        let addr = listener
            .local_addr()
            .context("Unable to read the listener address")?;
        debug!("OAuth callback listener bound to {addr}");
        Ok(Self { listener, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The redirect URI to register with the authorization request.
    pub fn redirect_uri(&self) -> String {
        format!("http://{}{CALLBACK_PATH}", self.addr)
    }

    /// Serves until a redirect carrying `expected_state` arrives, and returns its code.
    ///
    /// # Errors
    /// - `AuthError::StateMismatch` if a redirect carries another state; the attempt is over.
    /// - `AuthError::Validation` if the redirect carries an `error` (e.g. consent was denied).
    /// - `AuthError::Timeout` after `timeout`, `AuthError::Cancelled` if `cancel` fires.
    pub async fn wait_for_code(
        self,
        expected_state: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        let reporter: Reporter = Arc::new(Mutex::new(Some(tx)));
        let done = CancellationToken::new();
        let guard = TaskGuard::new(tokio::spawn(serve(
            self.listener,
            expected_state.to_string(),
            reporter,
            done.clone(),
        )));

        let outcome = tokio::select! {
            received = rx => received
                .unwrap_or_else(|_| Err(anyhow!("The callback listener stopped unexpectedly"))),
            _ = tokio::time::sleep(timeout) => {
                Err(AuthError::timeout("waiting for the OAuth redirect", timeout).into())
            }
            _ = cancel.cancelled() => Err(AuthError::cancelled("authorization").into()),
        };
        done.cancel();
        guard.stop(GRACE).await;
        debug!("OAuth callback listener on {} stopped", self.addr);
        outcome
    }
}

async fn serve(
    listener: TcpListener,
    expected_state: String,
    reporter: Reporter,
    done: CancellationToken,
) {
    let expected_state = Arc::new(expected_state);
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        debug!("Accept failed: {e}");
                        continue;
                    }
                };
                trace!("Callback connection from {peer}");
                let expected_state = expected_state.clone();
                let reporter = reporter.clone();
                connections.spawn(async move {
                    let service = service_fn(move |req| {
                        let response = handle(req, &expected_state, &reporter);
                        async move { Ok::<_, Infallible>(response) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        trace!("Callback connection ended: {e}");
                    }
                });
            }
            _ = done.cancelled() => break,
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

fn handle(req: Request<Incoming>, expected_state: &str, reporter: &Reporter) -> Response<String> {
    if req.method() != Method::GET || req.uri().path() != CALLBACK_PATH {
        return respond(StatusCode::NOT_FOUND, "Not found".to_string());
    }
    let outcome = code_from_query(req.uri().query().unwrap_or_default(), expected_state);
    let response = match &outcome {
        Ok(_) => respond(StatusCode::OK, SUCCESS_PAGE.to_string()),
        Err(e) => respond(
            StatusCode::BAD_REQUEST,
            format!(
                "<!doctype html><html><body><h1>gog: authorization failed</h1><p>{}</p>\
                </body></html>",
                escape_html(&e.to_string())
            ),
        ),
    };
    let sender = reporter.lock().ok().and_then(|mut slot| slot.take());
    match sender {
        Some(tx) => {
            let _ = tx.send(outcome);
        }
        None => debug!("Ignoring a redirect that arrived after the attempt concluded"),
    }
    response
}

pub(crate) fn respond(status: StatusCode, body: String) -> Response<String> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

pub(crate) fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
