//! Browser login for bayctl: loopback callback capture, authorization code
//! exchange and local credential storage.

pub mod callback;
pub mod deadline;
pub mod error;
pub mod lifecycle;
pub mod login;
pub mod oauth;
pub mod port;
pub mod selector;
pub mod session;

pub use callback::CallbackServer;
pub use deadline::Deadline;
pub use error::{AuthError, AuthResult, OAuthError};
pub use lifecycle::{logout, refresh_if_needed, LogoutReport, RefreshOutcome};
pub use login::{LoginEvent, LoginFlow, LoginOutcome, LoginReport, LoginSettings, LoginWarning};
pub use oauth::{AuthorizationServer, OAuthClient, OAuthEndpoints};
pub use session::{CredentialStore, Credentials, FileCredentialStore};

/// Short preview of a secret for logs.
pub(crate) fn redact(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    if prefix.len() == secret.len() {
        "****".to_string()
    } else {
        format!("{}…", prefix)
    }
}
