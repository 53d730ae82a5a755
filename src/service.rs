use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::config;
use crate::credential_dir;
use crate::credentials::{self, FileSecretStore, SecretStore};
use crate::detector::RateLimitDetection;
use crate::profile::{
    AutoSwitchSettings, LimitKind, Profile, ProfileKind, ProfileSummary, RateLimitEvent,
    SwitchMode, UsageSnapshot,
};
use crate::selector::{self, Selection, SwapReason};
use crate::store::{self, StoreData};

/// Exclusion window recorded when the detector could not extract a reset time.
/// The event itself keeps `resets_at = None`; only the recorded exclusion is
/// bounded so a profile is never benched forever on a vague error message.
const FALLBACK_SESSION_RESET: i64 = 30; // minutes
const FALLBACK_WEEKLY_RESET: i64 = 24; // hours

/// Environment handed to a subprocess launch, plus how it was chosen
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEnv {
    pub env: HashMap<String, String>,
    pub was_swapped: bool,
    pub original_profile: Option<String>,
    pub selected_profile: String,
    pub swap_reason: Option<SwapReason>,
    pub all_limited: bool,
    pub retry_at: Option<DateTime<Utc>>,
}

/// The single coordinating owner of profile state.
///
/// All readers and writers go through an instance of this service; there is no
/// process-global current profile. Reads take the shared lock; swap decisions
/// and other mutations are serialized through the exclusive lock. Save
/// failures are logged and swallowed — in-memory state stays authoritative for
/// the session.
pub struct FailoverService {
    store_path: PathBuf,
    data: RwLock<StoreData>,
    secrets: Box<dyn SecretStore>,
}

impl FailoverService {
    /// Non-blocking startup load; use this from async contexts so application
    /// startup never stalls on disk I/O.
    pub async fn init() -> Result<Self> {
        let store_path = config::get_store_file()?;
        let loaded = store::load_async(store_path.clone()).await?;
        Self::from_loaded(store_path, loaded)
    }

    /// Blocking form for rare synchronous call sites (CLI, tests)
    pub fn init_blocking() -> Result<Self> {
        let store_path = config::get_store_file()?;
        let loaded = store::load(&store_path)?;
        Self::from_loaded(store_path, loaded)
    }

    fn from_loaded(store_path: PathBuf, loaded: Option<StoreData>) -> Result<Self> {
        let data = match loaded {
            Some(data) => data,
            None => {
                let mut data = StoreData::first_run(config::get_legacy_config_dir()?);
                store::run_migrations(&mut data)?;
                tracing::info!("Created profile store with one default profile");
                data
            }
        };

        let service = Self {
            store_path,
            data: RwLock::new(data),
            secrets: Box::new(FileSecretStore),
        };
        // Persist so disk reflects any one-time migration performed by load.
        service.persist(&service.data.read().expect("store lock poisoned"));
        Ok(service)
    }

    /// Swap the secret-store seam, mainly for tests
    pub fn with_secrets(mut self, secrets: Box<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    fn persist(&self, data: &StoreData) {
        if let Err(err) = store::save(&self.store_path, data) {
            tracing::warn!(
                error = %err,
                "Failed to persist profile store; in-memory state remains authoritative"
            );
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreData> {
        self.data.read().expect("store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreData> {
        self.data.write().expect("store lock poisoned")
    }

    /// List all profiles with display metadata
    pub fn list_profiles(&self) -> Vec<ProfileSummary> {
        let data = self.read();
        let now = Utc::now();
        data.profiles
            .iter()
            .map(|profile| {
                let creds = credentials::load_credentials(&profile.config_dir)
                    .ok()
                    .flatten();
                ProfileSummary {
                    id: profile.id.clone(),
                    name: profile.name.clone(),
                    kind: profile.kind,
                    email: creds.as_ref().and_then(credentials::get_email),
                    plan: creds.as_ref().and_then(credentials::get_plan_type),
                    is_active: data.active_profile.as_deref() == Some(profile.id.as_str()),
                    usage: profile.usage.clone(),
                    limited_until: profile.next_reset_after(now),
                }
            })
            .collect()
    }

    /// Add a profile with a freshly claimed isolated credential directory
    pub fn add_profile(&self, name: &str, kind: ProfileKind) -> Result<Profile> {
        let profiles_root = config::get_profiles_root()?;
        let mut data = self.write();

        if data.profiles.iter().any(|p| p.name == name) {
            anyhow::bail!("Profile '{}' already exists", name);
        }

        let mut profile = Profile::new(name, kind, PathBuf::new());
        profile.config_dir =
            credential_dir::migrate_profile_dir(&profiles_root, &profile.id, name)?;

        data.profiles.push(profile.clone());
        data.priority.push(profile.id.clone());
        if data.active_profile.is_none() {
            data.active_profile = Some(profile.id.clone());
        }

        tracing::info!(profile = %name, id = %profile.id, "Added profile");
        self.persist(&data);
        Ok(profile)
    }

    /// Remove a profile. The active profile cannot be removed; switch first.
    pub fn remove_profile(&self, id: &str) -> Result<()> {
        let mut data = self.write();

        if data.profile(id).is_none() {
            anyhow::bail!("Profile '{}' not found", id);
        }
        if data.active_profile.as_deref() == Some(id) {
            anyhow::bail!("Cannot remove the active profile. Switch to another profile first.");
        }

        data.profiles.retain(|p| p.id != id);
        data.priority.retain(|p| p != id);
        data.needs_reauth.retain(|p| p != id);

        tracing::info!(id, "Removed profile");
        self.persist(&data);
        Ok(())
    }

    /// Explicit user-driven switch (`manual` swap)
    pub fn set_active_profile(&self, id: Option<&str>) -> Result<()> {
        let mut data = self.write();

        if let Some(id) = id {
            if data.profile(id).is_none() {
                anyhow::bail!("Profile '{}' not found", id);
            }
        }

        data.active_profile = id.map(str::to_string);
        if let Some(id) = id {
            if let Some(profile) = data.profile_mut(id) {
                profile.last_used_at = Some(Utc::now());
            }
            tracing::info!(id, reason = SwapReason::Manual.as_str(), "Switched active profile");
        }
        self.persist(&data);
        Ok(())
    }

    /// Replace the unified priority order; must mention every profile exactly once
    pub fn set_priority(&self, order: Vec<String>) -> Result<()> {
        let mut data = self.write();

        let mut expected: Vec<&str> = data.profiles.iter().map(|p| p.id.as_str()).collect();
        expected.sort_unstable();
        let mut given: Vec<&str> = order.iter().map(String::as_str).collect();
        given.sort_unstable();
        if expected != given {
            anyhow::bail!("Priority order must contain every profile id exactly once");
        }

        data.priority = order;
        self.persist(&data);
        Ok(())
    }

    pub fn auto_switch_settings(&self) -> AutoSwitchSettings {
        self.read().auto_switch.clone()
    }

    pub fn update_auto_switch_settings(&self, settings: AutoSwitchSettings) {
        let mut data = self.write();
        data.auto_switch = settings;
        self.persist(&data);
    }

    /// Profile ids migrated to isolated directories that still need a fresh login
    pub fn migrated_profile_ids(&self) -> Vec<String> {
        self.read().needs_reauth.clone()
    }

    /// Clear the re-auth flag once the UI has confirmed valid credentials
    pub fn clear_migrated_profile(&self, id: &str) {
        let mut data = self.write();
        data.needs_reauth.retain(|p| p != id);
        self.persist(&data);
    }

    /// Record a detected rate-limit against a profile.
    ///
    /// When the detection carries no reset time a bounded exclusion window is
    /// recorded instead of benching the profile indefinitely. If the limited
    /// profile is active and the settings allow acting (rather than
    /// prompting), the swap is applied immediately; otherwise the next
    /// `best_available_profile_env` call routes around it.
    pub fn record_rate_limit(&self, profile_id: &str, detection: &RateLimitDetection) -> Result<()> {
        if !detection.is_rate_limited {
            return Ok(());
        }

        let now = Utc::now();
        let kind = detection.kind.unwrap_or(LimitKind::Session);
        let resets_at = detection.resets_at.unwrap_or(match kind {
            LimitKind::Session => now + Duration::minutes(FALLBACK_SESSION_RESET),
            LimitKind::Weekly => now + Duration::hours(FALLBACK_WEEKLY_RESET),
        });

        let mut data = self.write();
        {
            let profile = data
                .profile_mut(profile_id)
                .with_context(|| format!("Profile '{}' not found", profile_id))?;
            profile.rate_limits.push(RateLimitEvent {
                kind,
                hit_at: now,
                resets_at: Some(resets_at),
            });
            tracing::warn!(
                profile = %profile.name,
                kind = ?kind,
                resets_at = %resets_at,
                "Recorded rate-limit event"
            );
        }

        let auto = data.auto_switch.enabled && data.auto_switch.on_rate_limit == SwitchMode::Auto;
        if auto && data.active_profile.as_deref() == Some(profile_id) {
            if let Some(selection) = selector::select(&data, now) {
                if selection.was_swapped && selection.selected != profile_id {
                    self.apply_swap(&mut data, &selection, now);
                }
            }
        }

        self.persist(&data);
        Ok(())
    }

    /// An auth failure is not a rate limit; depending on settings it either
    /// swaps away from the failing profile or leaves the user to decide.
    pub fn record_auth_failure(&self, profile_id: &str) -> Result<Option<String>> {
        let mut data = self.write();
        if data.profile(profile_id).is_none() {
            anyhow::bail!("Profile '{}' not found", profile_id);
        }
        tracing::warn!(id = profile_id, "Auth failure reported for profile");

        let auto = data.auto_switch.enabled && data.auto_switch.on_auth_failure == SwitchMode::Auto;
        if !auto || data.active_profile.as_deref() != Some(profile_id) {
            return Ok(None);
        }

        let now = Utc::now();
        let next = data
            .normalized_priority()
            .into_iter()
            .filter(|id| id != profile_id)
            .find(|id| {
                data.profile(id)
                    .map(|p| !p.is_rate_limited_at(now))
                    .unwrap_or(false)
            });

        if let Some(next_id) = next {
            data.active_profile = Some(next_id.clone());
            if let Some(profile) = data.profile_mut(&next_id) {
                profile.last_used_at = Some(now);
            }
            tracing::info!(from = profile_id, to = %next_id, "Swapped away from failing profile");
            self.persist(&data);
            return Ok(Some(next_id));
        }
        Ok(None)
    }

    /// Proactive swap after a usage threshold crossing reported by the monitor.
    /// Returns the new active profile id when a swap was applied.
    pub fn apply_proactive_swap(&self, profile_id: &str) -> Result<Option<String>> {
        let mut data = self.write();
        if !data.auto_switch.enabled || !data.auto_switch.proactive_monitoring {
            return Ok(None);
        }
        if data.active_profile.as_deref() != Some(profile_id) {
            return Ok(None);
        }

        let now = Utc::now();
        let next = data
            .normalized_priority()
            .into_iter()
            .filter(|id| id != profile_id)
            .find(|id| {
                data.profile(id)
                    .map(|p| !p.is_rate_limited_at(now))
                    .unwrap_or(false)
            });

        let Some(next_id) = next else {
            tracing::warn!(id = profile_id, "No capacity swap target available");
            return Ok(None);
        };

        data.active_profile = Some(next_id.clone());
        if let Some(profile) = data.profile_mut(&next_id) {
            profile.last_used_at = Some(now);
        }
        tracing::info!(
            from = profile_id,
            to = %next_id,
            reason = SwapReason::Capacity.as_str(),
            "Proactively swapped active profile"
        );
        self.persist(&data);
        Ok(Some(next_id))
    }

    /// Stamp a profile as used now, after a successful subprocess launch
    pub fn mark_last_used(&self, profile_id: &str) -> Result<()> {
        let mut data = self.write();
        let profile = data
            .profile_mut(profile_id)
            .with_context(|| format!("Profile '{}' not found", profile_id))?;
        profile.last_used_at = Some(Utc::now());
        self.persist(&data);
        Ok(())
    }

    /// Monitor write-back of a fresh usage snapshot
    pub fn refresh_usage(&self, profile_id: &str, snapshot: UsageSnapshot) -> Result<()> {
        let mut data = self.write();
        let profile = data
            .profile_mut(profile_id)
            .with_context(|| format!("Profile '{}' not found", profile_id))?;
        profile.usage = Some(snapshot);
        self.persist(&data);
        Ok(())
    }

    /// The primary integration point: environment variables for the best
    /// currently-usable profile, called before every subprocess launch.
    ///
    /// Whether a computed swap is also persisted as the new active profile
    /// depends on the auto-switch settings; in prompt mode the returned
    /// environment still routes around the limited profile but the active id
    /// is left for the user to change.
    pub fn best_available_profile_env(&self) -> Result<ProfileEnv> {
        let now = Utc::now();

        // Selection itself only needs the shared lock.
        let (selection, profile, settings) = {
            let data = self.read();
            let selection = selector::select(&data, now)
                .context("No profiles configured")?;
            let profile = data
                .profile(&selection.selected)
                .context("Selected profile disappeared")?
                .clone();
            (selection, profile, data.auto_switch.clone())
        };

        let credential = self.secrets.read_credential(&profile).unwrap_or_else(|err| {
            tracing::warn!(profile = %profile.name, error = %err, "Failed to read credential");
            None
        });
        let env = selector::compose_env(&profile, credential.as_ref());

        if selection.was_swapped && !selection.all_limited {
            if let Some(reason) = selection.reason {
                if should_apply(reason, &settings) {
                    // Re-validate under the exclusive lock so two concurrent
                    // swap decisions cannot clobber each other.
                    let mut data = self.write();
                    if let Some(current) = selector::select(&data, now) {
                        if current.was_swapped && current.selected == selection.selected {
                            self.apply_swap(&mut data, &current, now);
                            self.persist(&data);
                        }
                    }
                } else {
                    tracing::info!(
                        from = ?selection.original,
                        to = %selection.selected,
                        reason = reason.as_str(),
                        "Swap suggested; auto-switch is set to prompt"
                    );
                }
            }
        }

        if selection.all_limited {
            tracing::warn!(
                retry_at = ?selection.retry_at,
                "All profiles are currently rate-limited; using active profile as last resort"
            );
        }

        Ok(ProfileEnv {
            env,
            was_swapped: selection.was_swapped,
            original_profile: selection.original,
            selected_profile: selection.selected,
            swap_reason: selection.reason,
            all_limited: selection.all_limited,
            retry_at: selection.retry_at,
        })
    }

    fn apply_swap(&self, data: &mut StoreData, selection: &Selection, now: DateTime<Utc>) {
        data.active_profile = Some(selection.selected.clone());
        if let Some(profile) = data.profile_mut(&selection.selected) {
            profile.last_used_at = Some(now);
        }
        tracing::info!(
            from = ?selection.original,
            to = %selection.selected,
            reason = selection.reason.map(|r| r.as_str()).unwrap_or("unknown"),
            "Swapped active profile"
        );
    }

    /// Snapshot of the aggregate, for inspection and tests
    pub fn snapshot(&self) -> StoreData {
        self.read().clone()
    }
}

fn should_apply(reason: SwapReason, settings: &AutoSwitchSettings) -> bool {
    if !settings.enabled {
        return false;
    }
    match reason {
        SwapReason::Manual => true,
        SwapReason::Recovery => true,
        SwapReason::RateLimit => settings.on_rate_limit == SwitchMode::Auto,
        SwapReason::Capacity => settings.proactive_monitoring,
    }
}
