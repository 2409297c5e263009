use crate::oauth::TokenResponse;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use directories::ProjectDirs;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR_ENV: &str = "BAYCTL_CONFIG_DIR";

const CREDENTIALS_FILE: &str = "credentials.json";
const SECRET_KEY_FILE: &str = ".secret_key";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const MAX_LIFETIME_SECS: i64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub token_type: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    pub fn from_token_response(tokens: &TokenResponse, now: DateTime<Utc>) -> Self {
        Self {
            access_token: tokens.access_token.clone(),
            token_type: tokens.token_type.clone(),
            refresh_token: tokens.refresh_token.clone(),
            id_token: tokens.id_token.clone(),
            expires_at: now + lifetime(tokens.lifetime()),
        }
    }

    /// Applies a refresh response; fields the server left out are kept.
    pub fn apply_refresh(&mut self, tokens: &TokenResponse, now: DateTime<Utc>) {
        self.access_token = tokens.access_token.clone();
        self.token_type = tokens.token_type.clone();
        self.expires_at = now + lifetime(tokens.lifetime());
        if let Some(ref refresh) = tokens.refresh_token {
            self.refresh_token = Some(refresh.clone());
        }
        if let Some(ref id_token) = tokens.id_token {
            self.id_token = Some(id_token.clone());
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_within(Duration::ZERO)
    }

    pub fn expires_within(&self, window: Duration) -> bool {
        Utc::now() + lifetime(window) >= self.expires_at
    }
}

fn lifetime(duration: Duration) -> ChronoDuration {
    let secs = i64::try_from(duration.as_secs()).unwrap_or(i64::MAX);
    ChronoDuration::seconds(secs.min(MAX_LIFETIME_SECS))
}

/// Where credentials live between runs.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<Credentials>>;
    fn save(&self, credentials: &Credentials) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Encrypted JSON file next to a per-install random key.
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$BAYCTL_CONFIG_DIR` if set, else the platform data directory.
    pub fn default_location() -> Result<Self> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            if !dir.is_empty() {
                return Ok(Self::new(dir));
            }
        }
        let proj_dirs = ProjectDirs::from("com", "bayctl", "bayctl")
            .ok_or_else(|| anyhow!("Could not determine project directories"))?;
        Ok(Self::new(proj_dirs.data_dir()))
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    fn secret_key_path(&self) -> PathBuf {
        self.dir.join(SECRET_KEY_FILE)
    }

    /// Per-install key, created on first use. A key file of the wrong size
    /// is replaced, which orphans anything sealed with it.
    fn load_or_create_key(&self) -> Result<[u8; KEY_LEN]> {
        let path = self.secret_key_path();
        if let Ok(bytes) = fs::read(&path) {
            if let Ok(key) = <[u8; KEY_LEN]>::try_from(bytes.as_slice()) {
                return Ok(key);
            }
        }

        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill(&mut key);
        write_secure_file(&path, &key)?;
        Ok(key)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        let key = self.load_or_create_key()?;
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)))
    }

    /// Output is `nonce || ciphertext`.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()?
            .encrypt(&nonce, plaintext)
            .map_err(|_| anyhow!("Failed to encrypt credentials"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(anyhow!("Credentials file is truncated"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("Failed to decrypt credentials"))
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credentials>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }

        let sealed = fs::read(&path)?;
        let credentials: Credentials = serde_json::from_slice(&self.open(&sealed)?)?;
        Ok(Some(credentials))
    }

    fn save(&self, credentials: &Credentials) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec(credentials)?;
        write_secure_file(&self.path(), &self.seal(&json)?)
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_secure_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}
