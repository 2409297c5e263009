use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("port {port} is occupied")]
    PortOccupied { port: u16 },

    #[error("all callback ports are occupied: {}", join_ports(.attempted))]
    AllPortsOccupied { attempted: Vec<u16> },

    #[error("no callback ports configured")]
    NoCandidatePorts,

    #[error("no authorization code in callback")]
    MissingCode,

    #[error("callback state does not match this login attempt")]
    StateMismatch,

    #[error("authorization denied by provider: {error}{}", describe(.description))]
    Denied {
        error: String,
        description: Option<String>,
    },

    #[error("authentication timeout: please try again")]
    Timeout,

    #[error("callback server on port {port} failed: {source}")]
    ServerStartup {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("not logged in")]
    NotLoggedIn,

    #[error("token refresh failed, run `bayctl login` to re-authenticate: {0}")]
    RefreshFailed(#[source] OAuthError),

    #[error("credential store error: {0}")]
    Store(String),
}

impl AuthError {
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthError::PortOccupied { .. } | AuthError::AllPortsOccupied { .. } => {
                "Callback port unavailable. Close the program using it and try again."
            }
            AuthError::NoCandidatePorts => "No callback ports configured. Check login.callback_ports.",
            AuthError::MissingCode | AuthError::StateMismatch => {
                "The browser redirect was malformed. Please log in again."
            }
            AuthError::Denied { .. } => "Authorization was denied in the browser.",
            AuthError::Timeout => "Authentication timed out. Please try again.",
            AuthError::ServerStartup { .. } => "Could not start the local callback server.",
            AuthError::NotLoggedIn => "Not logged in. Run `bayctl login` first.",
            AuthError::RefreshFailed(_) => "Session expired. Run `bayctl login` again.",
            AuthError::Store(_) => "Could not access stored credentials.",
        }
    }

    /// Ports the user has to free before retrying, if this error is about ports.
    pub fn blocked_ports(&self) -> &[u16] {
        match self {
            AuthError::PortOccupied { port } => std::slice::from_ref(port),
            AuthError::AllPortsOccupied { attempted } => attempted,
            _ => &[],
        }
    }

    /// Commands that locate the process holding each blocked port.
    pub fn remediation(&self) -> Vec<String> {
        self.blocked_ports()
            .iter()
            .flat_map(|port| {
                [
                    format!("macOS/Linux: lsof -i :{port}"),
                    format!("Windows: netstat -ano | findstr :{port}"),
                ]
            })
            .collect()
    }
}

impl From<anyhow::Error> for AuthError {
    fn from(error: anyhow::Error) -> Self {
        AuthError::Store(error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("invalid endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid token response: {0}")]
    Decode(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_ports_message_lists_every_port() {
        let err = AuthError::AllPortsOccupied {
            attempted: vec![3001, 51153],
        };
        assert_eq!(
            err.to_string(),
            "all callback ports are occupied: 3001, 51153"
        );
        assert_eq!(err.blocked_ports(), &[3001, 51153]);
    }

    #[test]
    fn remediation_names_port_for_each_platform() {
        let hints = AuthError::PortOccupied { port: 3001 }.remediation();
        assert_eq!(hints.len(), 2);
        assert!(hints[0].contains("lsof -i :3001"));
        assert!(hints[1].contains("findstr :3001"));
        assert!(AuthError::Timeout.remediation().is_empty());
    }

    #[test]
    fn denied_message_includes_description() {
        let err = AuthError::Denied {
            error: "access_denied".to_string(),
            description: Some("user cancelled".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "authorization denied by provider: access_denied (user cancelled)"
        );
    }
}
