use anyhow::Result;
use bayctl_auth::oauth::{
    OAuthEndpoints, DEFAULT_AUTHORIZE_ENDPOINT, DEFAULT_REVOKE_ENDPOINT, DEFAULT_SCOPE,
    DEFAULT_TOKEN_ENDPOINT,
};
use bayctl_auth::port::DEFAULT_CALLBACK_PORTS;
use bayctl_auth::session::CONFIG_DIR_ENV;
use bayctl_auth::LoginSettings;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const ENVIRONMENT_ENV: &str = "BAYCTL_ENV";
pub const CLIENT_ID_ENV: &str = "BAYCTL_CLIENT_ID";

const PRODUCTION_CLIENT_ID: &str = "4032653160518150541";
const PRERELEASE_CLIENT_ID: &str = "4019057658592127596";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Prerelease,
}

impl Environment {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "production" | "prod" => Environment::Production,
            "prerelease" | "pre" | "staging" => Environment::Prerelease,
            other => {
                warn!("Unknown environment {:?}, using production", other);
                Environment::Production
            }
        }
    }

    pub fn from_env() -> Self {
        Self::parse(&std::env::var(ENVIRONMENT_ENV).unwrap_or_default())
    }

    pub fn client_id(self) -> &'static str {
        match self {
            Environment::Production => PRODUCTION_CLIENT_ID,
            Environment::Prerelease => PRERELEASE_CLIENT_ID,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub oauth: OAuthConfig,
    pub login: LoginConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: Option<String>,
    pub authorize_endpoint: String,
    pub token_endpoint: String,
    pub revoke_endpoint: String,
    pub scope: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub callback_ports: Vec<u16>,
    pub timeout_seconds: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            authorize_endpoint: DEFAULT_AUTHORIZE_ENDPOINT.to_string(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            revoke_endpoint: DEFAULT_REVOKE_ENDPOINT.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
        }
    }
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            callback_ports: DEFAULT_CALLBACK_PORTS.to_vec(),
            timeout_seconds: 300,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            warn!("Ignoring invalid config {}: {}", path.display(), e);
            Self::default()
        })
    }

    /// `BAYCTL_CLIENT_ID`, then the config file, then the environment default.
    pub fn client_id(&self) -> String {
        self.client_id_with(
            std::env::var(CLIENT_ID_ENV).ok(),
            Environment::from_env(),
        )
    }

    fn client_id_with(&self, override_id: Option<String>, env: Environment) -> String {
        override_id
            .filter(|id| !id.trim().is_empty())
            .or_else(|| self.oauth.client_id.clone().filter(|id| !id.is_empty()))
            .unwrap_or_else(|| env.client_id().to_string())
    }

    pub fn endpoints(&self) -> OAuthEndpoints {
        OAuthEndpoints {
            authorize: self.oauth.authorize_endpoint.clone(),
            token: self.oauth.token_endpoint.clone(),
            revoke: self.oauth.revoke_endpoint.clone(),
        }
    }

    pub fn login_settings(&self) -> LoginSettings {
        LoginSettings {
            callback_ports: self.login.callback_ports.clone(),
            timeout: Duration::from_secs(self.login.timeout_seconds),
        }
    }
}

pub fn get_config_path() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("config.toml");
        }
    }
    if let Some(proj_dirs) = ProjectDirs::from("com", "bayctl", "bayctl") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("bayctl.toml")
    }
}
