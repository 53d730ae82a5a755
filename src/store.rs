use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config;
use crate::credential_dir;
use crate::profile::{AutoSwitchSettings, Profile, ProfileKind};

/// Current persisted schema version
pub const CURRENT_VERSION: u32 = 2;

/// The versioned aggregate root: all profiles, the active id, the unified
/// priority order, auto-switch settings, and migration bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreData {
    pub version: u32,
    pub profiles: Vec<Profile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub priority: Vec<String>,
    #[serde(default)]
    pub auto_switch: AutoSwitchSettings,
    /// Profile ids migrated to an isolated directory whose old tokens stayed
    /// behind at the legacy location; the UI must prompt for re-authentication.
    #[serde(default)]
    pub needs_reauth: Vec<String>,
}

impl StoreData {
    /// Fresh aggregate for first run: one default profile pointing at the
    /// legacy shared directory, migrated like any other on the first load.
    pub fn first_run(legacy_dir: PathBuf) -> Self {
        let profile = Profile::new("default", ProfileKind::Oauth, legacy_dir);
        let id = profile.id.clone();
        Self {
            version: CURRENT_VERSION,
            profiles: vec![profile],
            active_profile: Some(id.clone()),
            priority: vec![id],
            auto_switch: AutoSwitchSettings::default(),
            needs_reauth: Vec::new(),
        }
    }

    pub fn profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.id == id)
    }

    pub fn profile_mut(&mut self, id: &str) -> Option<&mut Profile> {
        self.profiles.iter_mut().find(|profile| profile.id == id)
    }

    /// Priority order restricted to existing profiles, with any profile
    /// missing from the list appended at the end.
    pub fn normalized_priority(&self) -> Vec<String> {
        let mut order: Vec<String> = self
            .priority
            .iter()
            .filter(|id| self.profile(id).is_some())
            .cloned()
            .collect();
        for profile in &self.profiles {
            if !order.contains(&profile.id) {
                order.push(profile.id.clone());
            }
        }
        order
    }
}

/// Oldest supported schema: no usage, rate-limit, or auto-switch fields.
#[derive(Debug, Deserialize)]
struct StoreV1 {
    profiles: Vec<ProfileV1>,
    #[serde(default)]
    active_profile: Option<String>,
    #[serde(default)]
    priority: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProfileV1 {
    id: String,
    name: String,
    kind: ProfileKind,
    config_dir: PathBuf,
    created_at: DateTime<Utc>,
    #[serde(default)]
    last_used_at: Option<DateTime<Utc>>,
}

fn upgrade_v1(old: StoreV1) -> StoreData {
    let profiles = old
        .profiles
        .into_iter()
        .map(|p| Profile {
            id: p.id,
            name: p.name,
            kind: p.kind,
            config_dir: p.config_dir,
            usage: None,
            rate_limits: Vec::new(),
            created_at: p.created_at,
            last_used_at: p.last_used_at,
            cached_token: None,
        })
        .collect();
    StoreData {
        version: CURRENT_VERSION,
        profiles,
        active_profile: old.active_profile,
        priority: old.priority,
        auto_switch: AutoSwitchSettings::default(),
        needs_reauth: Vec::new(),
    }
}

#[derive(Debug, Deserialize)]
struct VersionProbe {
    // Documents written before the version field existed are treated as v1
    #[serde(default = "default_version")]
    version: u32,
}

fn default_version() -> u32 {
    1
}

fn parse_document(contents: &str) -> Result<StoreData> {
    let probe: VersionProbe =
        serde_json::from_str(contents).context("Failed to probe store version")?;
    match probe.version {
        1 => {
            let old: StoreV1 =
                serde_json::from_str(contents).context("Failed to parse v1 store")?;
            Ok(upgrade_v1(old))
        }
        2 => serde_json::from_str(contents).context("Failed to parse store"),
        other => anyhow::bail!("Unrecognized store version {}", other),
    }
}

/// Load the store from `path`, applying version upgrades and the one-time
/// directory-isolation migration.
///
/// Returns `Ok(None)` when no store exists yet (first run). A corrupt document
/// is logged and also treated as absent so the application stays usable. Load
/// never writes; callers persist the returned aggregate so disk reflects the
/// migration.
pub fn load(path: &Path) -> Result<Option<StoreData>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read store file: {:?}", path))?;

    let mut data = match parse_document(&contents) {
        Ok(data) => data,
        Err(err) => {
            tracing::warn!(path = ?path, error = %err, "Store file unreadable, starting fresh");
            return Ok(None);
        }
    };

    run_migrations(&mut data)?;
    Ok(Some(data))
}

/// Apply the in-memory part of the load pipeline: drop cached short-lived
/// secrets, migrate legacy config dirs, and union newly-migrated ids into the
/// needs-reauth set. Also used when constructing a first-run aggregate.
pub fn run_migrations(data: &mut StoreData) -> Result<Vec<String>> {
    let legacy_dir = config::get_legacy_config_dir()?;
    let profiles_root = config::get_profiles_root()?;

    let mut migrated = Vec::new();
    for profile in &mut data.profiles {
        // Expiring tokens must not be cached across runs.
        profile.cached_token = None;

        if profile.config_dir == legacy_dir {
            match credential_dir::migrate_profile_dir(&profiles_root, &profile.id, &profile.name) {
                Ok(isolated) => {
                    tracing::info!(
                        profile = %profile.name,
                        dir = ?isolated,
                        "Migrated profile to isolated credential directory"
                    );
                    profile.config_dir = isolated;
                    migrated.push(profile.id.clone());
                }
                Err(err) => {
                    // The profile stays at the legacy dir and cannot be
                    // activated until a later load succeeds.
                    tracing::warn!(
                        profile = %profile.name,
                        error = %err,
                        "Failed to migrate profile directory"
                    );
                }
            }
        }
    }

    for id in &migrated {
        if !data.needs_reauth.contains(id) {
            data.needs_reauth.push(id.clone());
        }
    }
    data.priority = data.normalized_priority();

    Ok(migrated)
}

/// Atomically replace the store file with the serialized aggregate.
/// A crash mid-save never leaves a half-written document behind.
pub fn save(path: &Path, data: &StoreData) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let contents = serde_json::to_string_pretty(data)?;
    let tmp = tmp_path(path);
    fs::write(&tmp, contents)
        .with_context(|| format!("Failed to write store file: {:?}", tmp))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace store file: {:?}", path))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Non-blocking load for application startup
pub async fn load_async(path: PathBuf) -> Result<Option<StoreData>> {
    tokio::task::spawn_blocking(move || load(&path))
        .await
        .context("Store load task failed")?
}

/// Non-blocking save counterpart
pub async fn save_async(path: PathBuf, data: StoreData) -> Result<()> {
    tokio::task::spawn_blocking(move || save(&path, &data))
        .await
        .context("Store save task failed")?
}
