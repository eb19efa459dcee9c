use colored::*;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::auth::{AuthError, GatewayAuthClient};

#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub status: u16,
    pub body: String,
    pub duration: Duration,
}

impl ServiceResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("{detail}")]
    Transport { detail: String, duration: Duration },
}

/// Authenticated request wrapper: every call goes out with a bearer token
/// from the shared credential cache.
pub struct GatewayClient {
    http: reqwest::Client,
    auth: Arc<GatewayAuthClient>,
    base_url: String,
    verbose: bool,
}

impl GatewayClient {
    pub fn new(
        http: reqwest::Client,
        auth: Arc<GatewayAuthClient>,
        base_url: impl Into<String>,
        verbose: bool,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            auth,
            base_url,
            verbose,
        }
    }

    pub fn auth(&self) -> &GatewayAuthClient {
        &self.auth
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ServiceResponse, CallError> {
        let credential = self.auth.acquire().await?;
        let url = format!("{}/{}", self.base_url, path);

        let start = Instant::now();
        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&credential.token);
        if let Some(payload) = body {
            request = request.json(payload);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.map_err(|err| CallError::Transport {
                    detail: err.to_string(),
                    duration: start.elapsed(),
                })?;
                let result = ServiceResponse {
                    status,
                    body: text,
                    duration: start.elapsed(),
                };
                if self.verbose {
                    let line = format!(
                        "[{} {}] {} ({}ms)",
                        method,
                        url,
                        result.status,
                        result.duration.as_millis()
                    );
                    if result.is_success() {
                        println!("{}", line.green());
                    } else {
                        println!("{}", line.yellow());
                    }
                }
                Ok(result)
            }
            Err(err) => {
                let detail = if err.is_timeout() {
                    "request timed out".to_string()
                } else {
                    err.to_string()
                };
                if self.verbose {
                    println!("{}", format!("[{} {}] FAILED: {}", method, url, detail).red());
                }
                Err(CallError::Transport {
                    detail,
                    duration: start.elapsed(),
                })
            }
        }
    }
}
