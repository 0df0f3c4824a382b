use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::AuthorizationError;

pub const SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/spreadsheets.readonly",
    "https://www.googleapis.com/auth/gmail.send",
];

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// OAuth client identity from the downloaded client secret file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

impl ClientSecret {
    pub fn from_file(path: &Path) -> Result<Self, AuthorizationError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| AuthorizationError::ReadCredentials {
                path: path.to_path_buf(),
                source,
            })?;
        let file: CredentialsFile = serde_json::from_str(&content).map_err(|source| {
            AuthorizationError::ParseCredentials {
                path: path.to_path_buf(),
                source,
            }
        })?;
        file.installed
            .or(file.web)
            .ok_or(AuthorizationError::MissingClient)
    }

    fn redirect_uri(&self) -> &str {
        self.redirect_uris
            .first()
            .map(String::as_str)
            .unwrap_or("urn:ietf:wg:oauth:2.0:oob")
    }

    /// Consent URL printed to the operator during the first grant.
    pub fn authorization_url(&self) -> Result<Url, AuthorizationError> {
        Url::parse_with_params(
            &self.auth_uri,
            &[
                ("access_type", "offline"),
                ("scope", SCOPES.join(" ").as_str()),
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri()),
            ],
        )
        .map_err(|err| AuthorizationError::InvalidAuthUri(err.to_string()))
    }
}

/// Token as persisted in the token store; `expiry_date` is epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<u64>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl StoredToken {
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        match self.expiry_date {
            Some(expiry_ms) => {
                let expiry = UNIX_EPOCH + Duration::from_millis(expiry_ms);
                expiry <= now + REFRESH_MARGIN
            }
            None => false,
        }
    }

    /// A token without a recorded scope is trusted as granted for every scope.
    pub fn covers_scopes(&self) -> bool {
        match &self.scope {
            Some(scope) => {
                let granted: Vec<&str> = scope.split_whitespace().collect();
                SCOPES.iter().all(|required| granted.contains(required))
            }
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    scope: Option<String>,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: Option<u64>,
}

impl TokenResponse {
    fn into_stored(self, previous: Option<&StoredToken>) -> StoredToken {
        let expiry_date = self.expires_in.map(|secs| {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            now_ms + secs * 1000
        });
        StoredToken {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
            scope: self.scope.or_else(|| previous.and_then(|p| p.scope.clone())),
            token_type: self.token_type,
            expiry_date,
        }
    }
}

pub fn load_token(path: &Path) -> Result<Option<StoredToken>, AuthorizationError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(AuthorizationError::ReadToken {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| AuthorizationError::CorruptToken {
            path: path.to_path_buf(),
            source,
        })
}

pub fn store_token(path: &Path, token: &StoredToken) -> Result<(), AuthorizationError> {
    let json = serde_json::to_string(token).map_err(|source| AuthorizationError::SerializeToken {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, json).map_err(|source| AuthorizationError::WriteToken {
        path: path.to_path_buf(),
        source,
    })
}

fn usable_access_token(token: Option<&StoredToken>, now: SystemTime) -> Option<String> {
    token
        .filter(|token| !token.is_expired_at(now))
        .map(|token| token.access_token.clone())
}

/// Holds the granted token for the run and refreshes it when it nears expiry.
pub struct OAuthClient {
    secret: ClientSecret,
    token_path: PathBuf,
    client: Client,
    token: RwLock<Option<StoredToken>>,
}

impl OAuthClient {
    pub fn new(secret: ClientSecret, token_path: PathBuf) -> Self {
        Self {
            secret,
            token_path,
            client: Client::new(),
            token: RwLock::new(None),
        }
    }

    /// Loads the stored token, or runs the consent flow when none exists or the
    /// stored grant is missing one of `SCOPES`.
    /// `read_code` receives the consent URL and returns the pasted code.
    pub async fn authorize<F>(&self, read_code: F) -> Result<(), AuthorizationError>
    where
        F: FnOnce(&str) -> std::io::Result<String>,
    {
        let stored = match load_token(&self.token_path)? {
            Some(token) if token.covers_scopes() => Some(token),
            Some(_) => {
                info!(
                    "Token at {} lacks a required scope, requesting consent again",
                    self.token_path.display()
                );
                None
            }
            None => None,
        };
        let token = match stored {
            Some(token) => token,
            None => {
                let url = self.secret.authorization_url()?;
                let code = read_code(url.as_str()).map_err(AuthorizationError::Prompt)?;
                let token = self.exchange_code(code.trim()).await?;
                store_token(&self.token_path, &token)?;
                info!("Token stored to {}", self.token_path.display());
                token
            }
        };
        *self.token.write().await = Some(token);
        Ok(())
    }

    pub async fn access_token(&self) -> Result<String, AuthorizationError> {
        let fresh = usable_access_token(self.token.read().await.as_ref(), SystemTime::now());
        if let Some(access) = fresh {
            return Ok(access);
        }

        // Another sender may have refreshed while this one waited for the lock.
        let mut cached = self.token.write().await;
        if let Some(access) = usable_access_token(cached.as_ref(), SystemTime::now()) {
            return Ok(access);
        }
        let previous = cached.clone().ok_or(AuthorizationError::NoRefreshToken)?;
        let refreshed = self.refresh(&previous).await?;
        store_token(&self.token_path, &refreshed)?;
        info!("Access token refreshed");
        let access = refreshed.access_token.clone();
        *cached = Some(refreshed);
        Ok(access)
    }

    async fn exchange_code(&self, code: &str) -> Result<StoredToken, AuthorizationError> {
        let response = self
            .post_token(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.secret.client_id),
                ("client_secret", &self.secret.client_secret),
                ("redirect_uri", self.secret.redirect_uri()),
            ])
            .await?;
        Ok(response.into_stored(None))
    }

    async fn refresh(&self, previous: &StoredToken) -> Result<StoredToken, AuthorizationError> {
        let refresh_token = previous
            .refresh_token
            .as_deref()
            .ok_or(AuthorizationError::NoRefreshToken)?;
        let response = self
            .post_token(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.secret.client_id),
                ("client_secret", &self.secret.client_secret),
            ])
            .await?;
        Ok(response.into_stored(Some(previous)))
    }

    async fn post_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse, AuthorizationError> {
        let response = self
            .client
            .post(&self.secret.token_uri)
            .form(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await?;
            return Err(AuthorizationError::TokenExchange { status, message });
        }

        Ok(response.json().await?)
    }
}
