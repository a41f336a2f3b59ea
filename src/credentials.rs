//! Google Cloud access tokens
//!
//! Cloud Monitoring calls carry an OAuth2 bearer token. Credentials are looked
//! up the way Application Default Credentials are, first match wins:
//!
//! 1. a pre-minted token in `GOOGLE_OAUTH_ACCESS_TOKEN` (e.g. from
//!    `gcloud auth print-access-token`)
//! 2. the credentials file named by `GOOGLE_APPLICATION_CREDENTIALS`
//! 3. gcloud's well-known `application_default_credentials.json`
//! 4. the GCE metadata server
//!
//! A credentials file holds either a service account key, exchanged for a token
//! with a signed JWT assertion, or a gcloud user refresh token.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Environment variable holding a pre-minted access token
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Environment variable naming a credentials file
pub const APPLICATION_CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Default GCE metadata server address
pub const METADATA_ENDPOINT: &str = "http://metadata.google.internal";

/// Google's OAuth2 token endpoint
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Scope requested for file-based credentials
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

const WELL_KNOWN_FILE: &str = "application_default_credentials.json";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime of a signed assertion, the maximum Google accepts
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Tokens are refreshed this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can hand out a bearer token
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a currently valid access token
    async fn access_token(&self) -> Result<String>;
}

/// Fixed token, used for tests and explicit overrides
#[derive(Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    /// Wrap a token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Read the token from [`ACCESS_TOKEN_ENV`]
    pub fn from_env() -> Option<Self> {
        std::env::var(ACCESS_TOKEN_ENV)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(Self::new)
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}

// =============================================================================
// Token exchange plumbing
// =============================================================================

/// Body returned by both the metadata server and the OAuth2 token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct OAuthError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Last token handed out, reused until it is close to expiry
#[derive(Default)]
struct TokenCache {
    cached: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TokenResponse>>,
    {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if Instant::now() + EXPIRY_MARGIN < token.expires_at {
                return Ok(token.token.clone());
            }
        }

        let fresh = refresh().await?;
        debug!(expires_in = fresh.expires_in, "Refreshed access token");
        let token = fresh.access_token.clone();
        *cached = Some(CachedToken {
            token: fresh.access_token,
            expires_at: Instant::now() + Duration::from_secs(fresh.expires_in),
        });

        Ok(token)
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::credentials(format!("failed to create HTTP client: {}", e)))
}

/// POST a form to an OAuth2 token endpoint
async fn exchange(
    http: &reqwest::Client,
    token_uri: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse> {
    let response = http
        .post(token_uri)
        .form(form)
        .send()
        .await
        .map_err(|e| Error::credentials(format!("token endpoint unreachable: {}", e)))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::credentials(format!("failed to read token response: {}", e)))?;

    if !status.is_success() {
        let reason = match serde_json::from_str::<OAuthError>(&body) {
            Ok(OAuthError {
                error,
                error_description: Some(description),
            }) => format!("{}: {}", error, description),
            Ok(OAuthError { error, .. }) => error,
            Err(_) => body.trim().to_string(),
        };
        return Err(Error::credentials(format!(
            "token endpoint returned status {}: {}",
            status.as_u16(),
            reason
        )));
    }

    serde_json::from_str(&body)
        .map_err(|e| Error::credentials(format!("invalid token response: {}", e)))
}

// =============================================================================
// Metadata server
// =============================================================================

/// Token from the GCE metadata server for the default service account
pub struct MetadataTokenSource {
    http: reqwest::Client,
    endpoint: String,
    cache: TokenCache,
}

impl MetadataTokenSource {
    /// Talk to the standard metadata server
    pub fn new() -> Result<Self> {
        Self::with_endpoint(METADATA_ENDPOINT)
    }

    /// Talk to a metadata server at `endpoint`
    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        Ok(Self {
            http: http_client()?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            cache: TokenCache::default(),
        })
    }

    async fn fetch(&self) -> Result<TokenResponse> {
        let response = self
            .http
            .get(format!("{}{}", self.endpoint, METADATA_TOKEN_PATH))
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| Error::credentials(format!("metadata server unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::credentials(format!(
                "metadata server returned status {}",
                status.as_u16()
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::credentials(format!("invalid metadata token response: {}", e)))
    }
}

#[async_trait]
impl TokenSource for MetadataTokenSource {
    async fn access_token(&self) -> Result<String> {
        self.cache.get_or_refresh(|| self.fetch()).await
    }
}

// =============================================================================
// Credentials files
// =============================================================================

/// Service account key as downloaded from the Cloud console
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Service account email, the assertion issuer
    pub client_email: String,
    /// PEM-encoded RSA private key
    pub private_key: String,
    /// Key id, sent as the assertion's `kid`
    #[serde(default)]
    pub private_key_id: Option<String>,
    /// Token endpoint, defaults to [`DEFAULT_TOKEN_URI`]
    #[serde(default)]
    pub token_uri: Option<String>,
}

/// gcloud user credentials (`gcloud auth application-default login`)
#[derive(Clone, Deserialize)]
pub struct AuthorizedUser {
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Long-lived refresh token
    pub refresh_token: String,
    /// Token endpoint, defaults to [`DEFAULT_TOKEN_URI`]
    #[serde(default)]
    pub token_uri: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Tokens minted from a service account key
pub struct ServiceAccountTokenSource {
    http: reqwest::Client,
    client_email: String,
    key_id: Option<String>,
    signing_key: EncodingKey,
    token_uri: String,
    cache: TokenCache,
}

impl ServiceAccountTokenSource {
    /// Parse the key and prepare to sign assertions with it
    pub fn new(key: ServiceAccountKey) -> Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| {
            Error::credentials(format!(
                "invalid private key for {}: {}",
                key.client_email, e
            ))
        })?;

        Ok(Self {
            http: http_client()?,
            client_email: key.client_email,
            key_id: key.private_key_id,
            signing_key,
            token_uri: key.token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            cache: TokenCache::default(),
        })
    }

    fn assertion(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();

        encode(&header, &claims, &self.signing_key)
            .map_err(|e| Error::credentials(format!("failed to sign token assertion: {}", e)))
    }

    async fn fetch(&self) -> Result<TokenResponse> {
        let assertion = self.assertion()?;
        exchange(
            &self.http,
            &self.token_uri,
            &[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())],
        )
        .await
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    async fn access_token(&self) -> Result<String> {
        self.cache.get_or_refresh(|| self.fetch()).await
    }
}

/// Tokens refreshed from gcloud user credentials
pub struct AuthorizedUserTokenSource {
    http: reqwest::Client,
    user: AuthorizedUser,
    token_uri: String,
    cache: TokenCache,
}

impl AuthorizedUserTokenSource {
    /// Refresh tokens for `user`
    pub fn new(user: AuthorizedUser) -> Result<Self> {
        let token_uri = user
            .token_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());

        Ok(Self {
            http: http_client()?,
            user,
            token_uri,
            cache: TokenCache::default(),
        })
    }

    async fn fetch(&self) -> Result<TokenResponse> {
        exchange(
            &self.http,
            &self.token_uri,
            &[
                ("grant_type", "refresh_token"),
                ("client_id", self.user.client_id.as_str()),
                ("client_secret", self.user.client_secret.as_str()),
                ("refresh_token", self.user.refresh_token.as_str()),
            ],
        )
        .await
    }
}

#[async_trait]
impl TokenSource for AuthorizedUserTokenSource {
    async fn access_token(&self) -> Result<String> {
        self.cache.get_or_refresh(|| self.fetch()).await
    }
}

/// Token source for the contents of a credentials file
pub fn token_source_from_json(json: &str) -> Result<Arc<dyn TokenSource>> {
    let file: CredentialsFile = serde_json::from_str(json).map_err(|e| {
        Error::credentials(format!("unsupported or malformed credentials file: {}", e))
    })?;

    Ok(match file {
        CredentialsFile::ServiceAccount(key) => Arc::new(ServiceAccountTokenSource::new(key)?),
        CredentialsFile::AuthorizedUser(user) => Arc::new(AuthorizedUserTokenSource::new(user)?),
    })
}

/// Token source for the credentials file at `path`
pub fn token_source_from_file(path: &Path) -> Result<Arc<dyn TokenSource>> {
    let json = std::fs::read_to_string(path).map_err(|e| {
        Error::credentials(format!(
            "failed to read credentials file {}: {}",
            path.display(),
            e
        ))
    })?;
    token_source_from_json(&json)
}

// =============================================================================
// Default lookup
// =============================================================================

/// Where the default credentials come from
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Pre-minted token from [`ACCESS_TOKEN_ENV`]
    AccessToken(String),
    /// Service account key or user credentials file
    CredentialsFile(PathBuf),
    /// GCE metadata server
    MetadataServer,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessToken(_) => write!(f, "{}", ACCESS_TOKEN_ENV),
            Self::CredentialsFile(path) => write!(f, "credentials file {}", path.display()),
            Self::MetadataServer => write!(f, "metadata server"),
        }
    }
}

impl CredentialSource {
    /// Build the token source
    pub fn token_source(self) -> Result<Arc<dyn TokenSource>> {
        match self {
            Self::AccessToken(token) => Ok(Arc::new(StaticTokenSource::new(token))),
            Self::CredentialsFile(path) => token_source_from_file(&path),
            Self::MetadataServer => Ok(Arc::new(MetadataTokenSource::new()?)),
        }
    }
}

/// Inputs to the default credentials lookup
#[derive(Clone, Default)]
pub struct AdcEnvironment {
    /// Value of [`ACCESS_TOKEN_ENV`]
    pub access_token: Option<String>,
    /// Value of [`APPLICATION_CREDENTIALS_ENV`]
    pub application_credentials: Option<PathBuf>,
    /// gcloud's well-known credentials file, if it exists
    pub well_known_file: Option<PathBuf>,
}

impl AdcEnvironment {
    /// Read the lookup inputs from the process environment
    pub fn from_env() -> Self {
        Self {
            access_token: StaticTokenSource::from_env().map(|s| s.token),
            application_credentials: std::env::var_os(APPLICATION_CREDENTIALS_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            well_known_file: well_known_file().filter(|p| p.is_file()),
        }
    }

    /// Pick the first available source
    ///
    /// A named credentials file is used even if it turns out to be unreadable;
    /// it never silently falls through to the metadata server.
    pub fn resolve(self) -> CredentialSource {
        if let Some(token) = self.access_token {
            return CredentialSource::AccessToken(token);
        }
        if let Some(path) = self.application_credentials {
            return CredentialSource::CredentialsFile(path);
        }
        if let Some(path) = self.well_known_file {
            return CredentialSource::CredentialsFile(path);
        }
        CredentialSource::MetadataServer
    }
}

/// `%APPDATA%\gcloud\...` on Windows, `~/.config/gcloud/...` elsewhere
fn well_known_file() -> Option<PathBuf> {
    let config_dir = if cfg!(windows) {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config"))
    }?;
    Some(config_dir.join("gcloud").join(WELL_KNOWN_FILE))
}

/// Token source found by the default credentials lookup
pub fn default_token_source() -> Result<Arc<dyn TokenSource>> {
    let source = AdcEnvironment::from_env().resolve();
    info!(source = %source, "Using Google Cloud credentials");
    source.token_source()
}
