use anyhow::{Context, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::config::MARKER_FILE;

/// Resolve (and if needed create) the isolated credential directory for a
/// profile under `profiles_root`.
///
/// The directory name is derived from the display name; collisions advance a
/// numeric suffix (`work`, `work-2`, ...). Ownership is recorded in a marker
/// file containing the profile id, claimed with create-exclusive semantics so
/// two processes racing for the same name cannot both win. Re-running for an
/// already-migrated profile returns the same directory without creating a new
/// one.
///
/// Never deletes or moves credential material at the legacy location; old
/// tokens stay behind, which is why migrated profiles are flagged as needing
/// re-authentication.
pub fn migrate_profile_dir(
    profiles_root: &Path,
    profile_id: &str,
    display_name: &str,
) -> Result<PathBuf> {
    fs::create_dir_all(profiles_root)
        .with_context(|| format!("Failed to create profiles root: {:?}", profiles_root))?;

    let base = sanitize_name(display_name);

    for attempt in 1..u32::MAX {
        let candidate_name = if attempt == 1 {
            base.clone()
        } else {
            format!("{}-{}", base, attempt)
        };
        let candidate = profiles_root.join(&candidate_name);

        if candidate.is_dir() {
            // Check-then-read race here is tolerated: worst case is an extra
            // suffix increment, never a lost profile.
            match read_marker(&candidate) {
                Some(owner) if owner == profile_id => return Ok(candidate),
                _ => continue,
            }
        }

        fs::create_dir_all(&candidate)
            .with_context(|| format!("Failed to create profile directory: {:?}", candidate))?;

        match try_claim(&candidate, profile_id) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                // Lost the claim race; ownership is decided by marker content,
                // not by the write outcome.
                if read_marker(&candidate).as_deref() == Some(profile_id) {
                    return Ok(candidate);
                }
                continue;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to claim profile directory: {:?}", candidate))
            }
        }
    }

    anyhow::bail!("Exhausted candidate directory names for profile '{}'", display_name)
}

/// Write the ownership marker with create-exclusive semantics
fn try_claim(dir: &Path, profile_id: &str) -> std::io::Result<()> {
    let mut marker = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dir.join(MARKER_FILE))?;
    marker.write_all(profile_id.as_bytes())
}

fn read_marker(dir: &Path) -> Option<String> {
    fs::read_to_string(dir.join(MARKER_FILE))
        .ok()
        .map(|contents| contents.trim().to_string())
}

/// Derive a filesystem-safe directory base name from a display name
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('-');
            last_was_sep = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "profile".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_display_names() {
        assert_eq!(sanitize_name("Work Account"), "work-account");
        assert_eq!(sanitize_name("  Team @ ACME!  "), "team-acme");
        assert_eq!(sanitize_name("日本語"), "profile");
        assert_eq!(sanitize_name(""), "profile");
    }

    #[test]
    fn migration_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();

        let first = migrate_profile_dir(root, "id-1", "Work").unwrap();
        let second = migrate_profile_dir(root, "id-1", "Work").unwrap();

        assert_eq!(first, second);
        assert_eq!(first, root.join("work"));
        assert_eq!(fs::read_dir(root).unwrap().count(), 1);
    }

    #[test]
    fn colliding_names_get_distinct_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();

        let first = migrate_profile_dir(root, "id-1", "Work").unwrap();
        let second = migrate_profile_dir(root, "id-2", "work!").unwrap();

        assert_eq!(first, root.join("work"));
        assert_eq!(second, root.join("work-2"));
        assert_ne!(first, second);
    }

    #[test]
    fn foreign_directory_without_marker_is_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("work")).unwrap();

        let dir = migrate_profile_dir(root, "id-1", "Work").unwrap();

        assert_eq!(dir, root.join("work-2"));
    }

    #[test]
    fn marker_decides_ownership_after_lost_race() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();

        // Simulate another process having claimed "work" already.
        fs::create_dir_all(root.join("work")).unwrap();
        fs::write(root.join("work").join(MARKER_FILE), "id-other").unwrap();

        let dir = migrate_profile_dir(root, "id-1", "Work").unwrap();
        assert_eq!(dir, root.join("work-2"));

        // The original claim is untouched.
        assert_eq!(
            fs::read_to_string(root.join("work").join(MARKER_FILE)).unwrap(),
            "id-other"
        );
    }
}
