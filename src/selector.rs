use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::credentials::Credential;
use crate::profile::{Profile, ProfileKind};
use crate::store::StoreData;

/// OAuth-style variable set
pub const ENV_CONFIG_DIR: &str = "CLAUDE_CONFIG_DIR";
pub const ENV_OAUTH_TOKEN: &str = "CLAUDE_CODE_OAUTH_TOKEN";
/// API-key-style variable set
pub const ENV_API_KEY: &str = "ANTHROPIC_API_KEY";

/// Why the active profile changed (or would change)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapReason {
    Capacity,
    RateLimit,
    Manual,
    Recovery,
}

impl SwapReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapReason::Capacity => "capacity",
            SwapReason::RateLimit => "rate_limit",
            SwapReason::Manual => "manual",
            SwapReason::Recovery => "recovery",
        }
    }
}

/// Outcome of one selection pass over the store
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub selected: String,
    pub original: Option<String>,
    pub was_swapped: bool,
    pub reason: Option<SwapReason>,
    /// Every profile was rate-limited; `selected` is the active profile used
    /// as a last resort so callers still get a launchable environment.
    pub all_limited: bool,
    /// Earliest known reset when degraded, for "retry after" messaging
    pub retry_at: Option<DateTime<Utc>>,
}

/// Pick the best profile at `now`.
///
/// Walks the unified priority order, skipping profiles with an unexpired
/// rate-limit window. The active profile is sticky while it stays eligible,
/// except that a previously-limited profile that outranks it reclaims the
/// slot once its window resets (`recovery`). When nothing is eligible the
/// active profile is returned anyway with `all_limited` set.
///
/// Returns `None` only for an empty store.
pub fn select(data: &StoreData, now: DateTime<Utc>) -> Option<Selection> {
    let order = data.normalized_priority();
    if order.is_empty() {
        return None;
    }

    let active = data
        .active_profile
        .as_ref()
        .filter(|id| data.profile(id).is_some())
        .cloned();

    let first_eligible = order
        .iter()
        .find(|id| {
            data.profile(id)
                .map(|profile| !profile.is_rate_limited_at(now))
                .unwrap_or(false)
        })
        .cloned();

    let Some(candidate) = first_eligible else {
        // Selection exhaustion is a normal result, not an error.
        let selected = active.clone().unwrap_or_else(|| order[0].clone());
        let retry_at = data
            .profiles
            .iter()
            .filter_map(|profile| profile.next_reset_after(now))
            .min();
        return Some(Selection {
            selected,
            original: active,
            was_swapped: true,
            reason: Some(SwapReason::RateLimit),
            all_limited: true,
            retry_at,
        });
    };

    match active {
        None => Some(Selection {
            selected: candidate,
            original: None,
            was_swapped: false,
            reason: None,
            all_limited: false,
            retry_at: None,
        }),
        Some(active_id) => {
            let active_profile = data.profile(&active_id)?;
            if active_profile.is_rate_limited_at(now) {
                return Some(Selection {
                    selected: candidate,
                    original: Some(active_id),
                    was_swapped: true,
                    reason: Some(SwapReason::RateLimit),
                    all_limited: false,
                    retry_at: None,
                });
            }
            if candidate == active_id {
                return Some(Selection {
                    selected: active_id.clone(),
                    original: Some(active_id),
                    was_swapped: false,
                    reason: None,
                    all_limited: false,
                    retry_at: None,
                });
            }
            // A higher-priority profile is eligible again. Only return to it
            // when it actually recovered from a limit; a profile the user
            // deliberately switched away from stays passed over.
            let candidate_profile = data.profile(&candidate)?;
            if candidate_profile.has_recovered_limit(now) {
                Some(Selection {
                    selected: candidate,
                    original: Some(active_id),
                    was_swapped: true,
                    reason: Some(SwapReason::Recovery),
                    all_limited: false,
                    retry_at: None,
                })
            } else {
                Some(Selection {
                    selected: active_id.clone(),
                    original: Some(active_id),
                    was_swapped: false,
                    reason: None,
                    all_limited: false,
                    retry_at: None,
                })
            }
        }
    }
}

/// Compose the environment for launching a subprocess under `profile`.
///
/// Exactly one credential variable set is active. The losing set is present
/// with an empty value, not merely absent, so a variable inherited from the
/// parent process cannot leak through and override the intended profile.
pub fn compose_env(profile: &Profile, credential: Option<&Credential>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    match profile.kind {
        ProfileKind::Oauth => {
            env.insert(
                ENV_CONFIG_DIR.to_string(),
                profile.config_dir.to_string_lossy().to_string(),
            );
            let token = match credential {
                Some(Credential::OauthToken(token)) => token.clone(),
                _ => String::new(),
            };
            env.insert(ENV_OAUTH_TOKEN.to_string(), token);
            env.insert(ENV_API_KEY.to_string(), String::new());
        }
        ProfileKind::ApiKey => {
            let key = match credential {
                Some(Credential::ApiKey(key)) => key.clone(),
                _ => String::new(),
            };
            env.insert(ENV_API_KEY.to_string(), key);
            env.insert(ENV_CONFIG_DIR.to_string(), String::new());
            env.insert(ENV_OAUTH_TOKEN.to_string(), String::new());
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{AutoSwitchSettings, LimitKind, RateLimitEvent};
    use crate::store::{StoreData, CURRENT_VERSION};
    use chrono::Duration;
    use std::path::PathBuf;

    fn store_with(profiles: Vec<Profile>, active: Option<&str>) -> StoreData {
        let priority = profiles.iter().map(|p| p.id.clone()).collect();
        StoreData {
            version: CURRENT_VERSION,
            profiles,
            active_profile: active.map(|id| id.to_string()),
            priority,
            auto_switch: AutoSwitchSettings::default(),
            needs_reauth: Vec::new(),
        }
    }

    fn named_profile(id: &str, kind: ProfileKind) -> Profile {
        let mut profile = Profile::new(id, kind, PathBuf::from(format!("/tmp/{id}")));
        profile.id = id.to_string();
        profile
    }

    fn limit(resets_at: DateTime<Utc>) -> RateLimitEvent {
        RateLimitEvent {
            kind: LimitKind::Session,
            hit_at: resets_at - Duration::minutes(30),
            resets_at: Some(resets_at),
        }
    }

    #[test]
    fn sticky_while_active_stays_eligible() {
        let data = store_with(
            vec![
                named_profile("a", ProfileKind::Oauth),
                named_profile("b", ProfileKind::Oauth),
            ],
            Some("a"),
        );
        let now = Utc::now();

        for _ in 0..3 {
            let selection = select(&data, now).unwrap();
            assert_eq!(selection.selected, "a");
            assert!(!selection.was_swapped);
            assert_eq!(selection.reason, None);
        }
    }

    #[test]
    fn limited_active_profile_is_skipped() {
        let mut a = named_profile("a", ProfileKind::Oauth);
        let now = Utc::now();
        a.rate_limits.push(limit(now + Duration::minutes(30)));
        let data = store_with(vec![a, named_profile("b", ProfileKind::Oauth)], Some("a"));

        let selection = select(&data, now).unwrap();
        assert_eq!(selection.selected, "b");
        assert!(selection.was_swapped);
        assert_eq!(selection.reason, Some(SwapReason::RateLimit));
        assert!(!selection.all_limited);
    }

    #[test]
    fn expired_limit_recovers_to_priority_order() {
        let mut a = named_profile("a", ProfileKind::Oauth);
        let now = Utc::now();
        a.rate_limits.push(limit(now - Duration::minutes(1)));
        let data = store_with(vec![a, named_profile("b", ProfileKind::Oauth)], Some("b"));

        let selection = select(&data, now).unwrap();
        assert_eq!(selection.selected, "a");
        assert!(selection.was_swapped);
        assert_eq!(selection.reason, Some(SwapReason::Recovery));
    }

    #[test]
    fn manual_lower_priority_choice_is_not_overridden() {
        // "a" outranks but was never limited; the user picked "b" on purpose.
        let data = store_with(
            vec![
                named_profile("a", ProfileKind::Oauth),
                named_profile("b", ProfileKind::Oauth),
            ],
            Some("b"),
        );

        let selection = select(&data, Utc::now()).unwrap();
        assert_eq!(selection.selected, "b");
        assert!(!selection.was_swapped);
    }

    #[test]
    fn exhaustion_falls_back_to_active_with_retry_hint() {
        let now = Utc::now();
        let mut a = named_profile("a", ProfileKind::Oauth);
        a.rate_limits.push(limit(now + Duration::minutes(45)));
        let mut b = named_profile("b", ProfileKind::Oauth);
        b.rate_limits.push(limit(now + Duration::minutes(10)));
        let data = store_with(vec![a, b], Some("a"));

        let selection = select(&data, now).unwrap();
        assert_eq!(selection.selected, "a");
        assert!(selection.was_swapped);
        assert!(selection.all_limited);
        assert_eq!(selection.retry_at, Some(now + Duration::minutes(10)));
    }

    #[test]
    fn empty_store_selects_nothing() {
        let data = store_with(Vec::new(), None);
        assert!(select(&data, Utc::now()).is_none());
    }

    #[test]
    fn oauth_env_clears_api_key_variable() {
        let profile = named_profile("a", ProfileKind::Oauth);
        let env = compose_env(
            &profile,
            Some(&Credential::OauthToken("tok-123".to_string())),
        );

        assert_eq!(env.get(ENV_CONFIG_DIR).map(String::as_str), Some("/tmp/a"));
        assert_eq!(env.get(ENV_OAUTH_TOKEN).map(String::as_str), Some("tok-123"));
        assert_eq!(env.get(ENV_API_KEY).map(String::as_str), Some(""));
    }

    #[test]
    fn api_key_env_clears_oauth_variables() {
        let profile = named_profile("b", ProfileKind::ApiKey);
        let env = compose_env(&profile, Some(&Credential::ApiKey("sk-test".to_string())));

        assert_eq!(env.get(ENV_API_KEY).map(String::as_str), Some("sk-test"));
        assert_eq!(env.get(ENV_OAUTH_TOKEN).map(String::as_str), Some(""));
        assert_eq!(env.get(ENV_CONFIG_DIR).map(String::as_str), Some(""));
    }
}
