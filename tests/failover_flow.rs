use std::fs;
use std::sync::Mutex;

use agent_router::credentials::{save_credentials, CredentialsFile, OauthTokens};
use agent_router::detector::RateLimitDetection;
use agent_router::profile::{LimitKind, ProfileKind, SwitchMode};
use agent_router::selector::{ENV_API_KEY, ENV_CONFIG_DIR, ENV_OAUTH_TOKEN};
use agent_router::service::FailoverService;
use agent_router::SwapReason;
use chrono::{Duration, Utc};
use tempfile::TempDir;

static ENV_LOCK: Mutex<()> = Mutex::new(());

struct EnvVarGuard {
    key: &'static str,
    original: Option<std::ffi::OsString>,
}

impl EnvVarGuard {
    fn set(key: &'static str, value: impl AsRef<std::ffi::OsStr>) -> Self {
        let original = std::env::var_os(key);
        std::env::set_var(key, value);
        Self { key, original }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        if let Some(original) = &self.original {
            std::env::set_var(self.key, original);
        } else {
            std::env::remove_var(self.key);
        }
    }
}

fn isolated_home() -> (TempDir, EnvVarGuard, EnvVarGuard) {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir_all(temp_dir.path().join("legacy")).unwrap();
    let home = EnvVarGuard::set("AGENT_ROUTER_HOME", temp_dir.path().join("home"));
    let legacy = EnvVarGuard::set("AGENT_ROUTER_LEGACY_DIR", temp_dir.path().join("legacy"));
    (temp_dir, home, legacy)
}

fn session_limit(resets_in_minutes: i64) -> RateLimitDetection {
    RateLimitDetection {
        is_rate_limited: true,
        kind: Some(LimitKind::Session),
        resets_at: Some(Utc::now() + Duration::minutes(resets_in_minutes)),
        suggested_profile: None,
    }
}

#[test]
fn rate_limited_active_profile_fails_over_to_next_in_priority() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let (_tmp, _home, _legacy) = isolated_home();

    let service = FailoverService::init_blocking().unwrap();
    let a = service.snapshot().active_profile.unwrap();
    let b = service.add_profile("backup", ProfileKind::ApiKey).unwrap();

    // A hits a session-window limit resetting in 30 minutes.
    service.record_rate_limit(&a, &session_limit(30)).unwrap();

    let outcome = service.best_available_profile_env().unwrap();
    assert_eq!(outcome.selected_profile, b.id);
    assert_eq!(outcome.original_profile, Some(a.clone()));
    assert!(outcome.was_swapped);
    assert_eq!(outcome.swap_reason, Some(SwapReason::RateLimit));
    assert!(!outcome.all_limited);

    // Default settings suggest rather than act: the active id is unchanged,
    // but the returned environment routes around the limited profile.
    assert_eq!(service.snapshot().active_profile, Some(a));
}

#[test]
fn expired_limit_recovers_to_the_higher_priority_profile() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let (_tmp, _home, _legacy) = isolated_home();

    let service = FailoverService::init_blocking().unwrap();
    let a = service.snapshot().active_profile.unwrap();
    let b = service.add_profile("backup", ProfileKind::ApiKey).unwrap();

    // A was limited, the window has since passed, and B took over meanwhile.
    service.record_rate_limit(&a, &session_limit(-1)).unwrap();
    service.set_active_profile(Some(&b.id)).unwrap();

    let outcome = service.best_available_profile_env().unwrap();
    assert_eq!(outcome.selected_profile, a);
    assert!(outcome.was_swapped);
    assert_eq!(outcome.swap_reason, Some(SwapReason::Recovery));

    // Recovery swaps are applied, no restart required.
    assert_eq!(service.snapshot().active_profile, Some(a));
}

#[test]
fn auto_mode_persists_the_reactive_swap() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let (_tmp, _home, _legacy) = isolated_home();

    let service = FailoverService::init_blocking().unwrap();
    let a = service.snapshot().active_profile.unwrap();
    let b = service.add_profile("backup", ProfileKind::ApiKey).unwrap();

    let mut settings = service.auto_switch_settings();
    settings.on_rate_limit = SwitchMode::Auto;
    service.update_auto_switch_settings(settings);

    service.record_rate_limit(&a, &session_limit(30)).unwrap();

    assert_eq!(service.snapshot().active_profile, Some(b.id.clone()));

    let outcome = service.best_available_profile_env().unwrap();
    assert_eq!(outcome.selected_profile, b.id);
    assert!(!outcome.was_swapped);
}

#[test]
fn all_profiles_limited_still_yields_a_usable_environment() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let (_tmp, _home, _legacy) = isolated_home();

    let service = FailoverService::init_blocking().unwrap();
    let a = service.snapshot().active_profile.unwrap();
    let b = service.add_profile("backup", ProfileKind::ApiKey).unwrap();

    service.record_rate_limit(&a, &session_limit(45)).unwrap();
    service.record_rate_limit(&b.id, &session_limit(10)).unwrap();

    let outcome = service.best_available_profile_env().unwrap();
    assert_eq!(outcome.selected_profile, a);
    assert!(outcome.was_swapped);
    assert!(outcome.all_limited);
    assert!(!outcome.env.is_empty());
    // Earliest reset is surfaced for "retry after" messaging.
    let retry_at = outcome.retry_at.unwrap();
    assert!(retry_at <= Utc::now() + Duration::minutes(10));
}

#[test]
fn api_key_selection_clears_oauth_variables_from_prior_selection() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let (_tmp, _home, _legacy) = isolated_home();

    let service = FailoverService::init_blocking().unwrap();
    let a = service.snapshot().active_profile.unwrap();
    let b = service.add_profile("backup", ProfileKind::ApiKey).unwrap();

    // Give both profiles real credential material.
    let data = service.snapshot();
    let oauth_dir = &data.profile(&a).unwrap().config_dir;
    save_credentials(
        oauth_dir,
        &CredentialsFile {
            api_key: None,
            oauth: Some(OauthTokens {
                access_token: "tok-oauth".to_string(),
                refresh_token: "refresh".to_string(),
                id_token: None,
                account_id: None,
            }),
            last_refresh: None,
        },
    )
    .unwrap();
    save_credentials(
        &b.config_dir,
        &CredentialsFile {
            api_key: Some("sk-live".to_string()),
            oauth: None,
            last_refresh: None,
        },
    )
    .unwrap();

    // First selection: the OAuth profile.
    let first = service.best_available_profile_env().unwrap();
    assert_eq!(first.env.get(ENV_OAUTH_TOKEN).map(String::as_str), Some("tok-oauth"));
    assert_eq!(first.env.get(ENV_API_KEY).map(String::as_str), Some(""));

    // A rate limit pushes selection onto the API-key profile; the OAuth
    // variables are explicitly emptied, not merely absent.
    service.record_rate_limit(&a, &session_limit(30)).unwrap();
    let second = service.best_available_profile_env().unwrap();
    assert_eq!(second.selected_profile, b.id);
    assert_eq!(second.env.get(ENV_API_KEY).map(String::as_str), Some("sk-live"));
    assert_eq!(second.env.get(ENV_OAUTH_TOKEN).map(String::as_str), Some(""));
    assert_eq!(second.env.get(ENV_CONFIG_DIR).map(String::as_str), Some(""));
}

#[test]
fn state_survives_a_process_restart() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let (_tmp, _home, _legacy) = isolated_home();

    let first = FailoverService::init_blocking().unwrap();
    let a = first.snapshot().active_profile.unwrap();
    let b = first.add_profile("backup", ProfileKind::ApiKey).unwrap();
    first.record_rate_limit(&a, &session_limit(30)).unwrap();
    let mut settings = first.auto_switch_settings();
    settings.proactive_monitoring = true;
    first.update_auto_switch_settings(settings.clone());
    let before = first.snapshot();
    drop(first);

    // A new process loads the same aggregate; the recorded limit still
    // excludes A without any in-memory carryover.
    let second = FailoverService::init_blocking().unwrap();
    assert_eq!(second.snapshot(), before);
    assert_eq!(second.auto_switch_settings(), settings);

    let outcome = second.best_available_profile_env().unwrap();
    assert_eq!(outcome.selected_profile, b.id);
    assert_eq!(outcome.swap_reason, Some(SwapReason::RateLimit));
}

#[test]
fn detector_output_feeds_the_exclusion_window_end_to_end() {
    let _lock = ENV_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let (_tmp, _home, _legacy) = isolated_home();

    let service = FailoverService::init_blocking().unwrap();
    let a = service.snapshot().active_profile.unwrap();
    let b = service.add_profile("backup", ProfileKind::ApiKey).unwrap();

    let reset = Utc::now() + Duration::minutes(20);
    let transcript = format!(
        "error: Rate limit reached\nLimit resets at {}\n",
        reset.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
    let detection = agent_router::classify(&transcript);
    assert!(detection.is_rate_limited);

    service.record_rate_limit(&a, &detection).unwrap();

    let outcome = service.best_available_profile_env().unwrap();
    assert_eq!(outcome.selected_profile, b.id);
    assert_eq!(outcome.swap_reason, Some(SwapReason::RateLimit));
}
