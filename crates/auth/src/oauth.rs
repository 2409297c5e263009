use crate::error::OAuthError;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_AUTHORIZE_ENDPOINT: &str = "https://signin.aliyun.com/oauth2/v1/auth";
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth.aliyun.com/v1/token";
pub const DEFAULT_REVOKE_ENDPOINT: &str = "https://oauth.aliyun.com/v1/revoke";
pub const DEFAULT_SCOPE: &str = "/acs/xiaoying";

/// Lifetime assumed when the token endpoint omits or garbles `expires_in`.
pub const DEFAULT_EXPIRES_IN: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, deserialize_with = "lenient_seconds::deserialize")]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

impl TokenResponse {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN))
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// `expires_in` arrives as a number from some servers and as a string from others.
mod lenient_seconds {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(match value {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTypeHint {
    AccessToken,
    RefreshToken,
}

impl TokenTypeHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenTypeHint::AccessToken => "access_token",
            TokenTypeHint::RefreshToken => "refresh_token",
        }
    }
}

/// The identity provider as seen by the login flow.
#[async_trait]
pub trait AuthorizationServer: Send + Sync {
    /// URL the user's browser is sent to; `redirect_uri` is embedded verbatim.
    fn authorization_url(&self, redirect_uri: &str, state: &str) -> String;

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, OAuthError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, OAuthError>;

    async fn revoke_token(
        &self,
        token: &str,
        hint: Option<TokenTypeHint>,
    ) -> Result<(), OAuthError>;
}

#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorize: String,
    pub token: String,
    pub revoke: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            authorize: DEFAULT_AUTHORIZE_ENDPOINT.to_string(),
            token: DEFAULT_TOKEN_ENDPOINT.to_string(),
            revoke: DEFAULT_REVOKE_ENDPOINT.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    client_id: String,
    scope: String,
    authorize: Url,
    token: Url,
    revoke: Url,
}

impl OAuthClient {
    pub fn new(
        client_id: impl Into<String>,
        scope: impl Into<String>,
        endpoints: &OAuthEndpoints,
    ) -> Result<Self, OAuthError> {
        let http = Client::builder()
            .user_agent(concat!("bayctl/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self {
            http,
            client_id: client_id.into(),
            scope: scope.into(),
            authorize: parse_endpoint(&endpoints.authorize)?,
            token: parse_endpoint(&endpoints.token)?,
            revoke: parse_endpoint(&endpoints.revoke)?,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn post_token_form(&self, form: &[(&str, &str)]) -> Result<TokenResponse, OAuthError> {
        let response = self.http.post(self.token.clone()).form(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| OAuthError::Decode(e.to_string()))
    }
}

#[async_trait]
impl AuthorizationServer for OAuthClient {
    fn authorization_url(&self, redirect_uri: &str, state: &str) -> String {
        let mut url = self.authorize.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("state", state)
            .append_pair("scope", &self.scope);
        url.into()
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, OAuthError> {
        debug!("Exchanging authorization code at {}", self.token);
        let tokens = self
            .post_token_form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
            ])
            .await?;
        info!("Authorization code exchanged for tokens");
        Ok(tokens)
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, OAuthError> {
        debug!("Refreshing access token at {}", self.token);
        self.post_token_form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ])
        .await
    }

    async fn revoke_token(
        &self,
        token: &str,
        hint: Option<TokenTypeHint>,
    ) -> Result<(), OAuthError> {
        let mut form = vec![("token", token), ("client_id", self.client_id.as_str())];
        if let Some(hint) = hint {
            form.push(("token_type_hint", hint.as_str()));
        }

        let response = self
            .http
            .post(self.revoke.clone())
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, OAuthError> {
    Url::parse(raw).map_err(|e| OAuthError::InvalidEndpoint {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Fresh anti-forgery token for one login attempt.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
