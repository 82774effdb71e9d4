//! Bearer credentials for the Drive API.
//!
//! A service-account key mints short-lived tokens through the OAuth JWT
//! bearer grant; the token is cached and re-minted shortly before it
//! expires or after the API rejects it. A static token is used as given.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use docsync_core::error::CapabilityError;

use crate::config::{read_secret, DriveSourceConfig};
use crate::retry::{classify_status, classify_transport};

pub const DRIVE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Lifetime requested for each signed assertion.
const ASSERTION_TTL_SECS: i64 = 3600;
/// Tokens this close to expiry are re-minted before use.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// The fields of a Google service-account key file that the grant needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    /// Parse a key given either as raw JSON or as base64-encoded JSON.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let json = if raw.starts_with('{') {
            raw.as_bytes().to_vec()
        } else {
            STANDARD
                .decode(raw)
                .context("service account key is neither JSON nor base64")?
        };
        serde_json::from_slice(&json).context("service account key is not valid key JSON")
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    ASSERTION_TTL_SECS as u64
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.expires_at > Instant::now() + REFRESH_MARGIN
    }
}

pub struct ServiceAccount {
    key: ServiceAccountKey,
    signing_key: EncodingKey,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccount {
    pub fn new(key: ServiceAccountKey) -> Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("service account private_key is not an RSA PEM key")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            key,
            signing_key,
            http,
            cached: Mutex::new(None),
        })
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    async fn token(&self) -> Result<String, CapabilityError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }
        let token = self.mint().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn mint(&self) -> Result<CachedToken, CapabilityError> {
        let iat = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: DRIVE_READONLY_SCOPE,
            aud: &self.key.token_uri,
            iat,
            exp: iat + ASSERTION_TTL_SECS,
        };
        let assertion =
            jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
                .map_err(|e| CapabilityError::permanent(format!("cannot sign token request: {}", e)))?;

        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CapabilityError::permanent(format!("invalid token response: {}", e)))?;
        tracing::debug!(
            client_email = %self.key.client_email,
            expires_in = token.expires_in,
            "minted Drive access token"
        );
        Ok(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }
}

pub enum DriveAuth {
    /// A pre-minted token; a rejection is final.
    Static(String),
    ServiceAccount(ServiceAccount),
}

impl DriveAuth {
    /// Credentials named by the config: the service-account key when its
    /// variable is set, otherwise the static token.
    pub fn from_config(config: &DriveSourceConfig) -> Result<Self> {
        if let Some(raw) = read_secret(&config.service_account_env) {
            let key = ServiceAccountKey::parse(&raw)
                .with_context(|| format!("Invalid {}", config.service_account_env))?;
            return Ok(Self::ServiceAccount(ServiceAccount::new(key)?));
        }
        if let Some(token) = read_secret(&config.access_token_env) {
            return Ok(Self::Static(token));
        }
        bail!(
            "Drive credentials missing: set {} or {}",
            config.service_account_env,
            config.access_token_env
        )
    }

    pub fn service_account(raw_key: &str) -> Result<Self> {
        let key = ServiceAccountKey::parse(raw_key)?;
        Ok(Self::ServiceAccount(ServiceAccount::new(key)?))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Static(_) => "static token".to_string(),
            Self::ServiceAccount(sa) => format!("service account {}", sa.client_email()),
        }
    }

    /// The bearer token for the next request, minting one if needed.
    pub async fn bearer(&self) -> Result<String, CapabilityError> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::ServiceAccount(sa) => sa.token().await,
        }
    }

    /// Drop a token the API refused. Returns whether a retry can succeed
    /// with a freshly minted one.
    pub async fn reject(&self) -> bool {
        match self {
            Self::Static(_) => false,
            Self::ServiceAccount(sa) => {
                sa.cached.lock().await.take();
                true
            }
        }
    }
}

impl std::fmt::Debug for DriveAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}
