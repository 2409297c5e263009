use crate::deadline::Deadline;
use crate::error::AuthError;
use crate::oauth::{generate_state, AuthorizationServer};
use crate::port::DEFAULT_CALLBACK_PORTS;
use crate::redact;
use crate::selector;
use crate::session::{CredentialStore, Credentials};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> std::io::Result<()>;
}

pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> std::io::Result<()> {
        open::that(url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginEvent {
    ServerListening { port: u16 },
    AuthorizationUrl { url: String },
    BrowserOpened,
    BrowserFailed { error: String },
    CallbackReceived,
    ExchangingCode,
    CredentialsSaved,
}

/// Problems after the user already authenticated with the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginWarning {
    Browser(String),
    TokenExchange(String),
    Persist(String),
}

#[derive(Debug, Clone)]
pub struct LoginReport {
    pub port: u16,
    pub redirect_uri: String,
    pub credentials: Option<Credentials>,
    pub saved: bool,
    pub warnings: Vec<LoginWarning>,
}

#[derive(Debug, Clone)]
pub enum LoginOutcome {
    AlreadyAuthenticated { expires_at: DateTime<Utc> },
    Authenticated(LoginReport),
}

#[derive(Debug, Clone)]
pub struct LoginSettings {
    pub callback_ports: Vec<u16>,
    pub timeout: Duration,
}

impl Default for LoginSettings {
    fn default() -> Self {
        Self {
            callback_ports: DEFAULT_CALLBACK_PORTS.to_vec(),
            timeout: DEFAULT_LOGIN_TIMEOUT,
        }
    }
}

/// Browser-based authorization code login over a loopback callback.
pub struct LoginFlow {
    server: Arc<dyn AuthorizationServer>,
    store: Arc<dyn CredentialStore>,
    browser: Arc<dyn BrowserLauncher>,
    settings: LoginSettings,
    event_tx: Option<mpsc::UnboundedSender<LoginEvent>>,
}

impl LoginFlow {
    pub fn new(
        server: Arc<dyn AuthorizationServer>,
        store: Arc<dyn CredentialStore>,
        settings: LoginSettings,
    ) -> Self {
        Self {
            server,
            store,
            browser: Arc::new(SystemBrowser),
            settings,
            event_tx: None,
        }
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserLauncher>) -> Self {
        self.browser = browser;
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<LoginEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.settings.timeout)
    }

    fn emit(&self, event: LoginEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    pub async fn run(&self, deadline: &Deadline) -> Result<LoginOutcome, AuthError> {
        match self.store.load() {
            Ok(Some(credentials)) if !credentials.is_expired() => {
                info!("Stored credentials still valid, skipping login");
                return Ok(LoginOutcome::AlreadyAuthenticated {
                    expires_at: credentials.expires_at,
                });
            }
            Ok(_) => {}
            Err(e) => warn!("Ignoring unreadable credentials: {}", e),
        }

        let state = generate_state();
        let callback =
            selector::acquire(deadline, &self.settings.callback_ports, Some(&state)).await?;
        let port = callback.port();
        let redirect_uri = callback.redirect_uri();
        self.emit(LoginEvent::ServerListening { port });

        let auth_url = self.server.authorization_url(&redirect_uri, &state);
        self.emit(LoginEvent::AuthorizationUrl {
            url: auth_url.clone(),
        });

        let mut warnings = Vec::new();
        match self.browser.open(&auth_url) {
            Ok(()) => self.emit(LoginEvent::BrowserOpened),
            Err(e) => {
                warn!("Failed to open browser: {}", e);
                self.emit(LoginEvent::BrowserFailed {
                    error: e.to_string(),
                });
                warnings.push(LoginWarning::Browser(e.to_string()));
            }
        }

        let code = callback.wait(deadline).await?;
        debug!("Callback delivered code {}", redact(&code));
        self.emit(LoginEvent::CallbackReceived);

        let mut report = LoginReport {
            port,
            redirect_uri,
            credentials: None,
            saved: false,
            warnings,
        };

        self.emit(LoginEvent::ExchangingCode);
        let exchanged = tokio::select! {
            result = self.server.exchange_code(&code, &report.redirect_uri) => result,
            _ = deadline.expired() => return Err(AuthError::Timeout),
        };

        let tokens = match exchanged {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("Token exchange failed: {}", e);
                report.warnings.push(LoginWarning::TokenExchange(e.to_string()));
                return Ok(LoginOutcome::Authenticated(report));
            }
        };

        let credentials = Credentials::from_token_response(&tokens, Utc::now());
        match self.store.save(&credentials) {
            Ok(()) => {
                report.saved = true;
                self.emit(LoginEvent::CredentialsSaved);
            }
            Err(e) => {
                warn!("Failed to save credentials: {}", e);
                report.warnings.push(LoginWarning::Persist(e.to_string()));
            }
        }
        report.credentials = Some(credentials);

        Ok(LoginOutcome::Authenticated(report))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{tokens, FakeProvider, MemoryStore};
    use super::*;
    use crate::port::is_occupied;
    use crate::port::test_support::{free_port, occupy};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use url::Url;

    /// Follows the authorization URL the way a consenting user's browser would.
    struct RedirectingBrowser {
        code: Option<&'static str>,
        opened: Mutex<Vec<String>>,
    }

    impl RedirectingBrowser {
        fn with_code(code: Option<&'static str>) -> Self {
            Self {
                code,
                opened: Mutex::new(Vec::new()),
            }
        }
    }

    impl BrowserLauncher for RedirectingBrowser {
        fn open(&self, url: &str) -> std::io::Result<()> {
            self.opened.lock().unwrap().push(url.to_string());

            let url = Url::parse(url).unwrap();
            let param = |name: &str| {
                url.query_pairs()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.into_owned())
                    .unwrap()
            };
            let mut callback = Url::parse(&param("redirect_uri")).unwrap();
            callback
                .query_pairs_mut()
                .append_pair("state", &param("state"));
            if let Some(code) = self.code {
                callback.query_pairs_mut().append_pair("code", code);
            }

            tokio::spawn(async move {
                let _ = reqwest::get(callback).await;
            });
            Ok(())
        }
    }

    struct BrokenBrowser;

    impl BrowserLauncher for BrokenBrowser {
        fn open(&self, _url: &str) -> std::io::Result<()> {
            Err(std::io::Error::other("no display"))
        }
    }

    fn settings(ports: Vec<u16>, timeout: Duration) -> LoginSettings {
        LoginSettings {
            callback_ports: ports,
            timeout,
        }
    }

    fn redirect_in(url: &str) -> String {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == "redirect_uri")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[tokio::test]
    async fn exchange_reuses_redirect_uri_from_authorization_url() {
        let held = occupy(0);
        let ports = vec![held.local_addr().unwrap().port(), free_port()];
        let provider = Arc::new(FakeProvider::default());
        let store = Arc::new(MemoryStore::default());
        let browser = Arc::new(RedirectingBrowser::with_code(Some("ABC")));

        let flow = LoginFlow::new(
            provider.clone(),
            store.clone(),
            settings(ports.clone(), Duration::from_secs(10)),
        )
        .with_browser(browser.clone());
        let outcome = flow.run(&flow.deadline()).await.unwrap();

        let report = match outcome {
            LoginOutcome::Authenticated(report) => report,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(report.port, ports[1]);
        assert!(report.saved);
        assert!(report.warnings.is_empty());

        let opened = browser.opened.lock().unwrap().clone();
        assert_eq!(opened.len(), 1);
        let exchanges = provider.exchanges.lock().unwrap().clone();
        assert_eq!(
            exchanges,
            vec![("ABC".to_string(), redirect_in(&opened[0]))]
        );
        assert_eq!(report.redirect_uri, redirect_in(&opened[0]));
        assert_eq!(store.current().unwrap().access_token, "at");
    }

    #[tokio::test]
    async fn valid_stored_credentials_skip_login() {
        let existing = Credentials::from_token_response(&tokens("old", None, 3600), Utc::now());
        let provider = Arc::new(FakeProvider::default());
        let store = Arc::new(MemoryStore::holding(existing));
        let browser = Arc::new(RedirectingBrowser::with_code(Some("ABC")));

        let flow = LoginFlow::new(provider.clone(), store, LoginSettings::default())
            .with_browser(browser.clone());
        let outcome = flow.run(&flow.deadline()).await.unwrap();

        assert!(matches!(outcome, LoginOutcome::AlreadyAuthenticated { .. }));
        assert!(browser.opened.lock().unwrap().is_empty());
        assert!(provider.exchanges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn browser_failure_is_a_warning_and_times_out_without_callback() {
        let port = free_port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let flow = LoginFlow::new(
            Arc::new(FakeProvider::default()),
            Arc::new(MemoryStore::default()),
            settings(vec![port], Duration::from_millis(400)),
        )
        .with_browser(Arc::new(BrokenBrowser))
        .with_events(tx);

        let err = flow.run(&flow.deadline()).await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout));
        assert!(!is_occupied(port));

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events[0], LoginEvent::ServerListening { port });
        assert!(matches!(events[1], LoginEvent::AuthorizationUrl { .. }));
        assert_eq!(
            events[2],
            LoginEvent::BrowserFailed {
                error: "no display".to_string()
            }
        );
    }

    #[tokio::test]
    async fn exchange_failure_is_reported_as_warning() {
        let provider = Arc::new(FakeProvider {
            fail_exchange: true,
            ..Default::default()
        });
        let store = Arc::new(MemoryStore::default());
        let flow = LoginFlow::new(
            provider,
            store.clone(),
            settings(vec![free_port()], Duration::from_secs(10)),
        )
        .with_browser(Arc::new(RedirectingBrowser::with_code(Some("ABC"))));

        match flow.run(&flow.deadline()).await.unwrap() {
            LoginOutcome::Authenticated(report) => {
                assert!(report.credentials.is_none());
                assert!(!report.saved);
                assert!(matches!(
                    report.warnings.as_slice(),
                    [LoginWarning::TokenExchange(_)]
                ));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(store.current().is_none());
    }

    #[tokio::test]
    async fn persist_failure_keeps_authentication() {
        let store = Arc::new(MemoryStore {
            fail_save: true,
            ..Default::default()
        });
        let flow = LoginFlow::new(
            Arc::new(FakeProvider::default()),
            store,
            settings(vec![free_port()], Duration::from_secs(10)),
        )
        .with_browser(Arc::new(RedirectingBrowser::with_code(Some("ABC"))));

        match flow.run(&flow.deadline()).await.unwrap() {
            LoginOutcome::Authenticated(report) => {
                assert!(report.credentials.is_some());
                assert!(!report.saved);
                assert_eq!(
                    report.warnings,
                    vec![LoginWarning::Persist("disk full".to_string())]
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_code_fails_the_attempt() {
        let port = free_port();
        let provider = Arc::new(FakeProvider::default());
        let flow = LoginFlow::new(
            provider.clone(),
            Arc::new(MemoryStore::default()),
            settings(vec![port], Duration::from_secs(10)),
        )
        .with_browser(Arc::new(RedirectingBrowser::with_code(None)));

        let err = flow.run(&flow.deadline()).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCode));
        assert!(provider.exchanges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_ports_occupied_is_surfaced() {
        let held = vec![occupy(0), occupy(0)];
        let ports: Vec<u16> = held
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect();
        let flow = LoginFlow::new(
            Arc::new(FakeProvider::default()),
            Arc::new(MemoryStore::default()),
            settings(ports.clone(), Duration::from_secs(10)),
        )
        .with_browser(Arc::new(BrokenBrowser));

        match flow.run(&flow.deadline()).await.unwrap_err() {
            AuthError::AllPortsOccupied { attempted } => assert_eq!(attempted, ports),
            other => panic!("unexpected error: {other}"),
        }
    }
}
