use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, Validation, decode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::{ApiError, Classification, Endpoint, ErrorClassifier, ResponseBody};

/// Access and refresh tokens for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Bearer token sent with every authenticated request.
    pub access_token: String,
    /// Token exchanged for a new pair once the access token expires.
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct ExpiryClaims {
    exp: i64,
}

impl Credentials {
    /// Expiry of the access token, read from its `exp` claim.
    ///
    /// The signature is not verified; the server does that.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;

        let data = decode::<ExpiryClaims>(
            &self.access_token,
            &DecodingKey::from_secret(&[]),
            &validation,
        )
        .ok()?;
        DateTime::from_timestamp(data.claims.exp, 0)
    }

    /// Whether the access token has expired or cannot be read.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_none_or(|expires_at| expires_at <= now)
    }
}

/// Source of the current credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Credentials to send right now.
    fn current(&self) -> Credentials;

    /// Whether the held access token is expired.
    fn needs_refresh(&self) -> bool;

    /// Exchanges the refresh token for a new pair and stores it.
    async fn refresh(&self) -> Result<Credentials, ApiError>;

    /// Refreshes only while the held access token is expired.
    async fn ensure_fresh(&self) -> Result<Credentials, ApiError> {
        if self.needs_refresh() {
            self.refresh().await
        } else {
            Ok(self.current())
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
}

/// Holds credentials in memory and refreshes them against the token endpoint.
#[derive(Debug)]
pub struct TokenRefresher {
    client: Client,
    base_url: String,
    credentials: RwLock<Credentials>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl TokenRefresher {
    /// Creates a refresher for the API at `base_url`.
    pub fn new(client: Client, base_url: &str, credentials: Credentials) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            credentials: RwLock::new(credentials),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn store(&self, credentials: Credentials) {
        if let Ok(mut held) = self.credentials.write() {
            *held = credentials;
        }
    }
}

#[async_trait]
impl CredentialProvider for TokenRefresher {
    fn current(&self) -> Credentials {
        match self.credentials.read() {
            Ok(credentials) => credentials.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn needs_refresh(&self) -> bool {
        self.current().is_expired(Utc::now())
    }

    async fn refresh(&self) -> Result<Credentials, ApiError> {
        let _guard = self.refresh_lock.lock().await;
        self.exchange_refresh_token().await
    }

    async fn ensure_fresh(&self) -> Result<Credentials, ApiError> {
        if !self.needs_refresh() {
            return Ok(self.current());
        }
        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited
        if !self.needs_refresh() {
            return Ok(self.current());
        }
        self.exchange_refresh_token().await
    }
}

impl TokenRefresher {
    /// Posts the refresh token. Callers hold `refresh_lock`.
    async fn exchange_refresh_token(&self) -> Result<Credentials, ApiError> {
        let held = self.current();

        let url = format!("{}{}", self.base_url, Endpoint::TokenRefresh.path(&[]));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&held.access_token)
            .json(&json!({ "refresh_token": held.refresh_token }))
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = ResponseBody::from_bytes(&response.bytes().await?);

        match ErrorClassifier.classify(Endpoint::TokenRefresh, status, false, body) {
            Classification::Success(value) => {
                let refreshed: RefreshResponse = serde_json::from_value(value)
                    .map_err(|e| ApiError::Decode(e.to_string()))?;
                let credentials = Credentials {
                    access_token: refreshed.access_token,
                    refresh_token: refreshed.refresh_token,
                };
                debug!("Access token expires at {:?}", credentials.expires_at());
                info!("Refreshed credentials");
                self.store(credentials.clone());
                Ok(credentials)
            }
            Classification::Failure(error) => Err(error),
            Classification::Captcha => Err(ApiError::Captcha),
            Classification::RefreshCredentials => Err(ApiError::InvalidCredentials(
                "token refresh was rejected".to_string(),
            )),
        }
    }
}
