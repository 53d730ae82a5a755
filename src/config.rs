use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Get the agent_router home directory (isolated from the agent CLI's own config)
pub fn get_router_home() -> Result<PathBuf> {
    if let Ok(val) = env::var("AGENT_ROUTER_HOME") {
        if !val.is_empty() {
            return Ok(PathBuf::from(val));
        }
    }

    let home = env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .context("Cannot determine home directory")?;

    Ok(PathBuf::from(home).join(".agent_router"))
}

/// Get the legacy shared credential directory used by the agent CLI itself.
///
/// Profiles created before directory isolation all point here; the store's
/// load pipeline migrates them to isolated directories.
pub fn get_legacy_config_dir() -> Result<PathBuf> {
    if let Ok(val) = env::var("AGENT_ROUTER_LEGACY_DIR") {
        if !val.is_empty() {
            return Ok(PathBuf::from(val));
        }
    }

    let home = env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .context("Cannot determine home directory")?;

    Ok(PathBuf::from(home).join(".claude"))
}

/// Get the root under which isolated per-profile credential directories live
pub fn get_profiles_root() -> Result<PathBuf> {
    let router_home = get_router_home()?;
    Ok(router_home.join("profiles"))
}

/// Get the persisted profile store file path
pub fn get_store_file() -> Result<PathBuf> {
    let router_home = get_router_home()?;
    Ok(router_home.join("store.json"))
}

/// File name of the credential material inside a profile's config dir
pub const CREDENTIALS_FILE: &str = "credentials.json";

/// File name of the ownership marker inside an isolated profile directory
pub const MARKER_FILE: &str = ".profile-id";
