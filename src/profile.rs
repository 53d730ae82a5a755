use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which kind of credential a profile holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    Oauth,
    ApiKey,
}

impl ProfileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::Oauth => "oauth",
            ProfileKind::ApiKey => "api_key",
        }
    }
}

/// Which limit window a rate-limit event applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Session,
    Weekly,
}

/// One detected rate-limit hit. Appended only, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitEvent {
    pub kind: LimitKind,
    pub hit_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<DateTime<Utc>>,
}

impl RateLimitEvent {
    /// Whether this event still excludes its profile at `now`.
    /// An event without a known reset never blocks by itself; the recording
    /// policy supplies a bounded fallback window instead.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.resets_at.map_or(false, |resets_at| resets_at > now)
    }
}

/// Cached usage percentages for one profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly_percent: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Whether a swap is performed silently or only suggested to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchMode {
    Prompt,
    Auto,
}

/// Auto-switch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoSwitchSettings {
    pub enabled: bool,
    pub proactive_monitoring: bool,
    pub session_threshold_percent: f64,
    pub weekly_threshold_percent: f64,
    pub on_rate_limit: SwitchMode,
    pub on_auth_failure: SwitchMode,
    /// Seconds between usage checks; 0 disables polling
    pub usage_check_interval_secs: u64,
}

impl Default for AutoSwitchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            proactive_monitoring: false,
            session_threshold_percent: 80.0,
            weekly_threshold_percent: 90.0,
            on_rate_limit: SwitchMode::Prompt,
            on_auth_failure: SwitchMode::Prompt,
            usage_check_interval_secs: 600,
        }
    }
}

/// One stored credential identity with its isolated credential directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub kind: ProfileKind,
    pub config_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitEvent>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Short-lived token cached by older versions. Tokens expire within hours,
    /// so the load pipeline always drops this; credentials are re-read fresh
    /// from the profile's config dir at use time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_token: Option<String>,
}

impl Profile {
    pub fn new(name: impl Into<String>, kind: ProfileKind, config_dir: PathBuf) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
            config_dir,
            usage: None,
            rate_limits: Vec::new(),
            created_at: Utc::now(),
            last_used_at: None,
            cached_token: None,
        }
    }

    /// Whether any recorded rate-limit window is still unexpired at `now`
    pub fn is_rate_limited_at(&self, now: DateTime<Utc>) -> bool {
        self.rate_limits.iter().any(|event| event.is_active_at(now))
    }

    /// Earliest upcoming reset among active limit windows
    pub fn next_reset_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.rate_limits
            .iter()
            .filter(|event| event.is_active_at(now))
            .filter_map(|event| event.resets_at)
            .min()
    }

    /// Whether this profile was rate-limited in the past but has since recovered
    pub fn has_recovered_limit(&self, now: DateTime<Utc>) -> bool {
        !self.is_rate_limited_at(now)
            && self
                .rate_limits
                .iter()
                .any(|event| event.resets_at.map_or(false, |resets_at| resets_at <= now))
    }
}

/// Lightweight view of a profile for listing surfaces
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSummary {
    pub id: String,
    pub name: String,
    pub kind: ProfileKind,
    pub email: Option<String>,
    pub plan: Option<String>,
    pub is_active: bool,
    pub usage: Option<UsageSnapshot>,
    pub limited_until: Option<DateTime<Utc>>,
}
