use crate::config::Config;
use anyhow::{anyhow, Result};
use bayctl_auth::{
    logout, refresh_if_needed, AuthError, CredentialStore, FileCredentialStore, LoginEvent,
    LoginFlow, LoginOutcome, LoginWarning, OAuthClient, RefreshOutcome,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub const USAGE: &str = "usage: bayctl <login|logout|status|refresh>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Login,
    Logout,
    Status,
    Refresh,
}

impl Command {
    pub fn parse(word: &str) -> Option<Self> {
        match word {
            "login" => Some(Command::Login),
            "logout" => Some(Command::Logout),
            "status" => Some(Command::Status),
            "refresh" => Some(Command::Refresh),
            _ => None,
        }
    }
}

pub async fn run(command: Command, config: &Config) -> Result<()> {
    let store = Arc::new(FileCredentialStore::default_location()?);
    debug!("Credentials at {}", store.path().display());

    match command {
        Command::Status => status(store.as_ref()),
        Command::Login => login(config, store).await,
        Command::Logout => {
            let client = oauth_client(config)?;
            let report = logout(&client, store.as_ref()).await?;
            for warning in &report.warnings {
                eprintln!("warning: {}", warning);
            }
            if report.was_logged_in {
                println!("Logged out.");
            } else {
                println!("Not logged in; local credentials cleared.");
            }
            Ok(())
        }
        Command::Refresh => {
            let client = oauth_client(config)?;
            match refresh_if_needed(&client, store.as_ref()).await {
                Ok(RefreshOutcome::StillValid(c)) => {
                    println!("Token still valid until {}.", c.expires_at);
                    Ok(())
                }
                Ok(RefreshOutcome::Refreshed(c)) => {
                    println!("Token refreshed, valid until {}.", c.expires_at);
                    Ok(())
                }
                Err(e) => Err(report_auth_error(e)),
            }
        }
    }
}

fn oauth_client(config: &Config) -> Result<OAuthClient> {
    Ok(OAuthClient::new(
        config.client_id(),
        config.oauth.scope.clone(),
        &config.endpoints(),
    )?)
}

fn status(store: &dyn CredentialStore) -> Result<()> {
    match store.load()? {
        Some(c) if !c.is_expired() => {
            let left = c.expires_at - Utc::now();
            println!(
                "Logged in. Token expires at {} ({} min left).",
                c.expires_at,
                left.num_minutes()
            );
        }
        Some(c) => println!("Token expired at {}. Run `bayctl login`.", c.expires_at),
        None => println!("Not logged in."),
    }
    Ok(())
}

async fn login(config: &Config, store: Arc<FileCredentialStore>) -> Result<()> {
    let client = Arc::new(oauth_client(config)?);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let flow = LoginFlow::new(client, store, config.login_settings()).with_events(event_tx);

    let deadline = flow.deadline();
    let interrupt = deadline.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    let result = flow.run(&deadline).await;
    drop(flow);
    let _ = printer.await;

    match result {
        Ok(LoginOutcome::AlreadyAuthenticated { expires_at }) => {
            println!("Already logged in (token valid until {}).", expires_at);
            Ok(())
        }
        Ok(LoginOutcome::Authenticated(report)) => {
            for warning in &report.warnings {
                print_warning(warning);
            }
            match report.credentials {
                Some(c) => println!("Login successful. Token valid until {}.", c.expires_at),
                None => println!("Browser authorization completed, but no token was issued."),
            }
            Ok(())
        }
        Err(e) => Err(report_auth_error(e)),
    }
}

fn print_event(event: &LoginEvent) {
    match event {
        LoginEvent::ServerListening { port } => {
            println!("Waiting for the browser callback on port {}...", port)
        }
        LoginEvent::AuthorizationUrl { url } => {
            println!("Open this URL to log in if the browser does not start:\n\n  {}\n", url)
        }
        LoginEvent::BrowserOpened => println!("Browser opened."),
        LoginEvent::BrowserFailed { .. } => {
            println!("Could not open a browser; copy the URL above manually.")
        }
        LoginEvent::CallbackReceived => println!("Authorization code received."),
        LoginEvent::ExchangingCode => println!("Exchanging code for tokens..."),
        LoginEvent::CredentialsSaved => println!("Credentials saved."),
    }
}

fn print_warning(warning: &LoginWarning) {
    match warning {
        LoginWarning::Browser(e) => eprintln!("warning: browser launch failed: {}", e),
        LoginWarning::TokenExchange(e) => eprintln!("warning: token exchange failed: {}", e),
        LoginWarning::Persist(e) => eprintln!("warning: could not save credentials: {}", e),
    }
}

fn report_auth_error(error: AuthError) -> anyhow::Error {
    eprintln!("{}", error.user_message());
    let steps = error.remediation();
    if !steps.is_empty() {
        eprintln!("Find the process holding the port with:");
        for step in steps {
            eprintln!("  {}", step);
        }
    }
    anyhow!(error)
}
