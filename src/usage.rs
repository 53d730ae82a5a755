use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::credentials::{Credential, FileSecretStore, SecretStore};
use crate::profile::{Profile, UsageSnapshot};

const DEFAULT_USAGE_URL: &str = "https://api.anthropic.com/api/usage";

/// Fresh usage percentages for one profile
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UsageReading {
    pub session_percent: Option<f64>,
    pub weekly_percent: Option<f64>,
}

impl UsageReading {
    pub fn into_snapshot(self) -> UsageSnapshot {
        UsageSnapshot {
            session_percent: self.session_percent,
            weekly_percent: self.weekly_percent,
            updated_at: Utc::now(),
        }
    }
}

/// A failed check is reported distinctly from "0% used"
#[derive(Debug, thiserror::Error)]
pub enum UsageCheckError {
    #[error("usage check unauthorized: {0}")]
    Auth(String),
    #[error("usage check failed: {0}")]
    Transport(String),
}

pub type UsageFuture<'a> =
    Pin<Box<dyn Future<Output = Result<UsageReading, UsageCheckError>> + Send + 'a>>;

/// External usage-check collaborator consumed by the monitor
pub trait UsageChecker: Send + Sync {
    fn check_usage<'a>(&'a self, profile: &'a Profile) -> UsageFuture<'a>;
}

/// HTTP-backed usage checker hitting the provider's usage endpoint
pub struct HttpUsageChecker {
    client: Client,
    base_url: String,
}

impl HttpUsageChecker {
    pub fn new() -> Result<Self, UsageCheckError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| UsageCheckError::Transport(err.to_string()))?;
        let base_url = std::env::var("AGENT_ROUTER_USAGE_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_USAGE_URL.to_string());
        Ok(Self { client, base_url })
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, UsageCheckError> {
        let mut checker = Self::new()?;
        checker.base_url = base_url.into();
        Ok(checker)
    }

    async fn fetch(&self, profile: &Profile) -> Result<UsageReading, UsageCheckError> {
        let credential = FileSecretStore
            .read_credential(profile)
            .map_err(|err| UsageCheckError::Auth(err.to_string()))?
            .ok_or_else(|| {
                UsageCheckError::Auth(format!("profile '{}' has no credentials", profile.name))
            })?;

        let request = self.client.get(&self.base_url);
        let request = match &credential {
            Credential::ApiKey(key) => request.header("x-api-key", key),
            Credential::OauthToken(token) => {
                request.header("Authorization", format!("Bearer {}", token))
            }
        };

        let response = request
            .send()
            .await
            .map_err(|err| UsageCheckError::Transport(err.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let body: UsageResponse = response
                    .json()
                    .await
                    .map_err(|err| UsageCheckError::Transport(err.to_string()))?;
                Ok(body.into_reading())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(UsageCheckError::Auth(format!("status {}", response.status())))
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(UsageCheckError::Transport(format!("status {}: {}", status, text)))
            }
        }
    }
}

impl UsageChecker for HttpUsageChecker {
    fn check_usage<'a>(&'a self, profile: &'a Profile) -> UsageFuture<'a> {
        Box::pin(self.fetch(profile))
    }
}

/// Provider usage payload: a short session window and a longer rolling window
#[derive(Debug, Deserialize)]
struct UsageResponse {
    #[serde(default)]
    rate_limit: Option<RateLimitWindows>,
}

#[derive(Debug, Deserialize)]
struct RateLimitWindows {
    #[serde(default)]
    primary_window: Option<WindowUsage>,
    #[serde(default)]
    secondary_window: Option<WindowUsage>,
}

#[derive(Debug, Deserialize)]
struct WindowUsage {
    used_percent: Option<f64>,
}

impl UsageResponse {
    fn into_reading(self) -> UsageReading {
        let windows = self.rate_limit.unwrap_or(RateLimitWindows {
            primary_window: None,
            secondary_window: None,
        });
        UsageReading {
            session_percent: windows.primary_window.and_then(|w| w.used_percent),
            weekly_percent: windows.secondary_window.and_then(|w| w.used_percent),
        }
    }
}
