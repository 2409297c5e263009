use crate::error::AuthError;
use crate::oauth::{AuthorizationServer, TokenTypeHint};
use crate::session::{CredentialStore, Credentials};
use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

/// Tokens expiring within this window are refreshed ahead of use.
pub const REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    StillValid(Credentials),
    Refreshed(Credentials),
}

impl RefreshOutcome {
    pub fn credentials(&self) -> &Credentials {
        match self {
            RefreshOutcome::StillValid(c) | RefreshOutcome::Refreshed(c) => c,
        }
    }
}

pub async fn refresh_if_needed(
    server: &dyn AuthorizationServer,
    store: &dyn CredentialStore,
) -> Result<RefreshOutcome, AuthError> {
    let mut credentials = store.load()?.ok_or(AuthError::NotLoggedIn)?;
    if !credentials.expires_within(REFRESH_WINDOW) {
        return Ok(RefreshOutcome::StillValid(credentials));
    }

    let Some(refresh_token) = credentials.refresh_token.clone() else {
        warn!("Access token is expiring and no refresh token is stored");
        discard(store);
        return Err(AuthError::NotLoggedIn);
    };

    info!("Access token expires at {}, refreshing", credentials.expires_at);
    match server.refresh_token(&refresh_token).await {
        Ok(tokens) => {
            credentials.apply_refresh(&tokens, Utc::now());
            store.save(&credentials)?;
            Ok(RefreshOutcome::Refreshed(credentials))
        }
        Err(e) => {
            warn!("Token refresh failed, clearing stored credentials: {}", e);
            discard(store);
            Err(AuthError::RefreshFailed(e))
        }
    }
}

fn discard(store: &dyn CredentialStore) {
    if let Err(e) = store.clear() {
        warn!("Failed to clear stored credentials: {}", e);
    }
}

#[derive(Debug, Default)]
pub struct LogoutReport {
    pub was_logged_in: bool,
    pub revoked: Vec<TokenTypeHint>,
    pub warnings: Vec<String>,
}

/// Revokes stored tokens best-effort, then always removes them locally.
pub async fn logout(
    server: &dyn AuthorizationServer,
    store: &dyn CredentialStore,
) -> Result<LogoutReport, AuthError> {
    let mut report = LogoutReport::default();

    let credentials = match store.load() {
        Ok(credentials) => credentials,
        Err(e) => {
            report
                .warnings
                .push(format!("could not read stored credentials: {e}"));
            None
        }
    };

    if let Some(credentials) = credentials {
        report.was_logged_in = true;

        let mut targets = vec![(credentials.access_token.clone(), TokenTypeHint::AccessToken)];
        if let Some(refresh) = credentials.refresh_token {
            if refresh != credentials.access_token {
                targets.push((refresh, TokenTypeHint::RefreshToken));
            }
        }

        for (token, hint) in targets {
            match server.revoke_token(&token, Some(hint)).await {
                Ok(()) => report.revoked.push(hint),
                Err(e) => {
                    warn!("Failed to revoke {}: {}", hint.as_str(), e);
                    report
                        .warnings
                        .push(format!("failed to revoke {}: {e}", hint.as_str()));
                }
            }
        }
    }

    store.clear()?;
    Ok(report)
}
