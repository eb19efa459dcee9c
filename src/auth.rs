use colored::*;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use crate::types::AuthSettings;

/// A cached credential is never handed out with less than this much validity
/// remaining.
pub const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(30);

/// Assumed lifetime when the token response carries no `expiresAt` field.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub expires_at_ms: u64,
    pub issued_at_ms: u64,
}

impl Credential {
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(now_ms()))
    }

    fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms + (EXPIRY_SAFETY_MARGIN.as_millis() as u64) < self.expires_at_ms
    }
}

/// Credential acquisition failures are fatal to the run: every subsequent
/// call would go out unauthenticated, so callers abort instead of retrying.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token endpoint rejected the request with status {status}")]
    Rejected { status: u16, body: String },
    #[error("token response did not contain an access token")]
    MissingToken,
    #[error("token response body was not valid JSON: {0}")]
    MalformedBody(String),
    #[error("token request failed: {0}")]
    Transport(String),
}

#[derive(Deserialize)]
struct GatewayTokenResponse {
    // field names as the gateway's response model spells them
    #[serde(rename = "accesToken")]
    acces_token: Option<String>,
    #[serde(rename = "expiresAt")]
    expires_at: Option<u64>,
}

#[derive(Deserialize)]
struct ProviderTokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// Obtains bearer credentials from the gateway's client-credentials endpoint
/// and caches them for reuse across all virtual users.
pub struct GatewayAuthClient {
    http: reqwest::Client,
    settings: AuthSettings,
    cache: Mutex<Option<Credential>>,
}

impl GatewayAuthClient {
    pub fn new(http: reqwest::Client, settings: AuthSettings) -> Self {
        Self {
            http,
            settings,
            cache: Mutex::new(None),
        }
    }

    /// Returns the cached credential while it has at least
    /// [`EXPIRY_SAFETY_MARGIN`] of validity left, refreshing otherwise.
    ///
    /// The cache lock is held across the refresh await, so callers arriving
    /// while a refresh is in flight block on that single request and pick up
    /// its result instead of issuing their own.
    pub async fn acquire(&self) -> Result<Credential, AuthError> {
        let mut cache = self.cache.lock().await;
        if let Some(credential) = cache.as_ref() {
            if credential.is_fresh(now_ms()) {
                return Ok(credential.clone());
            }
        }

        println!("{}", "🔐 Requesting new token from gateway...".blue());
        let credential = self.refresh_from_gateway().await?;
        *cache = Some(credential.clone());
        Ok(credential)
    }

    async fn refresh_from_gateway(&self) -> Result<Credential, AuthError> {
        let payload = serde_json::json!({
            "clientId": self.settings.client_id,
            "clientSecret": self.settings.client_secret,
            "audience": self.settings.audience,
            "grantType": "client_credentials",
        });

        let response = self
            .http
            .post(&self.settings.token_url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;

        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GatewayTokenResponse =
            serde_json::from_str(&body).map_err(|err| AuthError::MalformedBody(err.to_string()))?;
        let token = parsed.acces_token.ok_or(AuthError::MissingToken)?;

        let issued_at_ms = now_ms();
        let expires_at_ms = parsed
            .expires_at
            .unwrap_or(issued_at_ms + DEFAULT_TOKEN_LIFETIME.as_millis() as u64);

        Ok(Credential {
            token,
            expires_at_ms,
            issued_at_ms,
        })
    }

    /// Requests a token directly from the identity provider, bypassing the
    /// gateway. No caching: every call is a fresh request, used to validate
    /// the provider itself.
    pub async fn acquire_from_provider(&self) -> Result<Credential, AuthError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.settings.client_id.as_str()),
            ("client_secret", self.settings.client_secret.as_str()),
            ("audience", self.settings.audience.as_str()),
            ("scope", self.settings.scope.as_str()),
        ];

        let response = self
            .http
            .post(&self.settings.provider_token_url)
            .form(&form)
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;

        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ProviderTokenResponse =
            serde_json::from_str(&body).map_err(|err| AuthError::MalformedBody(err.to_string()))?;
        let token = parsed.access_token.ok_or(AuthError::MissingToken)?;

        let issued_at_ms = now_ms();
        let lifetime_ms = parsed
            .expires_in
            .map(|secs| secs * 1000)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME.as_millis() as u64);

        Ok(Credential {
            token,
            expires_at_ms: issued_at_ms + lifetime_ms,
            issued_at_ms,
        })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
