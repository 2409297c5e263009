//! One-shot loopback listener that captures the authorization code.

use crate::deadline::Deadline;
use crate::error::AuthError;
use crate::port::{self, CALLBACK_PATH, LOOPBACK};
use crate::redact;
use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::form_urlencoded;

/// Delay between answering the callback and closing the listener, so the
/// browser gets the success page before the socket goes away.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on how long a settled server may keep running.
const REAP_LIMIT: Duration = Duration::from_secs(3);

/// Terminal outcome of one callback attempt: the code, or why there is none.
pub type CallbackResult = Result<String, AuthError>;

const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Authentication Successful</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background-color: #f5f5f5; }
        .container { text-align: center; background: white; padding: 2rem; border-radius: 8px; box-shadow: 0 2px 10px rgba(0,0,0,0.1); }
        .success { color: #28a745; font-size: 1.5rem; margin-bottom: 1rem; }
        .message { color: #666; }
    </style>
</head>
<body>
    <div class="container">
        <div class="success">Authentication Successful</div>
        <div class="message">You can close this window and return to the terminal.</div>
    </div>
</body>
</html>"#;

#[derive(Debug, Default)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackParams {
    /// Parses the raw query string. The first occurrence of a key wins and
    /// unknown keys are ignored, so no query is ever rejected outright.
    fn from_query(query: Option<&str>) -> Self {
        let mut params = Self::default();
        let Some(query) = query else {
            return params;
        };

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let slot = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        params
    }

    fn into_result(self, expected_state: Option<&str>) -> CallbackResult {
        if let Some(error) = self.error.filter(|e| !e.is_empty()) {
            return Err(AuthError::Denied {
                error,
                description: self.error_description,
            });
        }

        if let (Some(expected), Some(received)) = (expected_state, self.state.as_deref()) {
            if expected != received {
                return Err(AuthError::StateMismatch);
            }
        }

        match self.code {
            Some(code) if !code.is_empty() => Ok(code),
            _ => Err(AuthError::MissingCode),
        }
    }
}

struct CallbackState {
    result_tx: Mutex<Option<oneshot::Sender<CallbackResult>>>,
    expected_state: Option<String>,
    shutdown: CancellationToken,
}

impl CallbackState {
    fn take_sender(&self) -> Option<oneshot::Sender<CallbackResult>> {
        match self.result_tx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn schedule_shutdown(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            sleep(SHUTDOWN_GRACE).await;
            shutdown.cancel();
        });
    }
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    RawQuery(query): RawQuery,
) -> Response {
    let Some(result_tx) = state.take_sender() else {
        debug!("Ignoring repeated callback request");
        return (StatusCode::CONFLICT, "Callback already processed").into_response();
    };

    let params = CallbackParams::from_query(query.as_deref());
    let result = params.into_result(state.expected_state.as_deref());
    let response = match &result {
        Ok(code) => {
            debug!("Received authorization code {}", redact(code));
            (StatusCode::OK, Html(SUCCESS_HTML)).into_response()
        }
        Err(e) => {
            warn!("Rejected OAuth callback: {}", e);
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    };

    if result_tx.send(result).is_err() {
        debug!("Callback waiter already gone");
    }
    state.schedule_shutdown();

    response
}

enum Waited {
    Callback(Result<CallbackResult, oneshot::error::RecvError>),
    Exited(Result<io::Result<()>, JoinError>),
    Expired,
}

/// A bound loopback listener serving `/callback` until it yields one result.
///
/// Dropping an unsettled server stops it and releases the port.
pub struct CallbackServer {
    port: u16,
    result_rx: oneshot::Receiver<CallbackResult>,
    shutdown: CancellationToken,
    server: JoinHandle<io::Result<()>>,
    settled: bool,
}

impl CallbackServer {
    /// Binds `127.0.0.1:port` and starts serving. An occupied port fails
    /// right away with [`AuthError::PortOccupied`]; there is no retry here.
    pub async fn bind(port: u16, expected_state: Option<String>) -> Result<Self, AuthError> {
        let listener = TcpListener::bind((LOOPBACK, port))
            .await
            .map_err(|source| match source.kind() {
                io::ErrorKind::AddrInUse => AuthError::PortOccupied { port },
                _ => AuthError::ServerStartup { port, source },
            })?;
        let port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(port);

        let (result_tx, result_rx) = oneshot::channel();
        let shutdown = CancellationToken::new();
        let state = Arc::new(CallbackState {
            result_tx: Mutex::new(Some(result_tx)),
            expected_state,
            shutdown: shutdown.clone(),
        });

        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(state);

        let signal = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });

        info!(
            "Callback server listening on http://localhost:{}{}",
            port, CALLBACK_PATH
        );

        Ok(Self {
            port,
            result_rx,
            shutdown,
            server,
            settled: false,
        })
    }

    /// Binds `port` and waits for its callback; no state check is applied.
    pub async fn start(deadline: &Deadline, port: u16) -> CallbackResult {
        if deadline.is_expired() {
            return Err(AuthError::Timeout);
        }
        Self::bind(port, None).await?.wait(deadline).await
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn redirect_uri(&self) -> String {
        port::redirect_uri(self.port)
    }

    /// Fails if the serve task exits within `grace` of binding, or if the
    /// deadline ends first.
    pub(crate) async fn ensure_serving(
        mut self,
        deadline: &Deadline,
        grace: Duration,
    ) -> Result<Self, AuthError> {
        let waited = tokio::select! {
            biased;
            _ = deadline.expired() => Some(Waited::Expired),
            joined = &mut self.server => Some(Waited::Exited(joined)),
            _ = sleep(grace) => None,
        };

        match waited {
            None => Ok(self),
            Some(Waited::Exited(joined)) => {
                self.settled = true;
                Err(server_failure(self.port, joined))
            }
            Some(_) => {
                self.close().await;
                Err(AuthError::Timeout)
            }
        }
    }

    /// Blocks until the callback arrives, the deadline ends, or the server dies.
    pub async fn wait(mut self, deadline: &Deadline) -> CallbackResult {
        let waited = tokio::select! {
            biased;
            received = &mut self.result_rx => Waited::Callback(received),
            joined = &mut self.server => Waited::Exited(joined),
            _ = deadline.expired() => Waited::Expired,
        };

        match waited {
            Waited::Callback(Ok(result)) => {
                self.reap_later();
                result
            }
            Waited::Callback(Err(_)) => {
                self.close().await;
                Err(AuthError::ServerStartup {
                    port: self.port,
                    source: io::Error::other("callback channel closed"),
                })
            }
            Waited::Exited(joined) => {
                self.settled = true;
                Err(server_failure(self.port, joined))
            }
            Waited::Expired => {
                warn!("No callback on port {} before the deadline", self.port);
                self.close().await;
                Err(AuthError::Timeout)
            }
        }
    }

    /// Stops accepting immediately and waits until the listener is gone.
    async fn close(&mut self) {
        self.settled = true;
        self.shutdown.cancel();
        self.server.abort();
        let _ = (&mut self.server).await;
        debug!("Callback server on port {} closed", self.port);
    }

    /// The handler already scheduled a graceful shutdown; this caps how long
    /// a lingering connection can keep the server task alive.
    fn reap_later(&mut self) {
        self.settled = true;
        let abort = self.server.abort_handle();
        tokio::spawn(async move {
            sleep(REAP_LIMIT).await;
            abort.abort();
        });
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if !self.settled {
            self.shutdown.cancel();
        }
    }
}

fn server_failure(port: u16, joined: Result<io::Result<()>, JoinError>) -> AuthError {
    let source = match joined {
        Ok(Ok(())) => io::Error::other("callback server stopped before receiving a callback"),
        Ok(Err(e)) => e,
        Err(e) => io::Error::other(e.to_string()),
    };
    AuthError::ServerStartup { port, source }
}
