use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::CREDENTIALS_FILE;
use crate::profile::Profile;

/// Credential material stored inside a profile's config dir
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OauthTokens>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<DateTime<Utc>>,
}

/// OAuth token material
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OauthTokens {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

/// The secret handed to a subprocess environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    ApiKey(String),
    OauthToken(String),
}

/// Narrow seam over wherever credential material actually lives. The core
/// never caches decrypted long-lived secrets; it reads fresh at use time.
pub trait SecretStore: Send + Sync {
    fn read_credential(&self, profile: &Profile) -> Result<Option<Credential>>;
}

/// Default secret store: the credentials file inside the profile's config dir
#[derive(Debug, Default)]
pub struct FileSecretStore;

impl SecretStore for FileSecretStore {
    fn read_credential(&self, profile: &Profile) -> Result<Option<Credential>> {
        let Some(creds) = load_credentials(&profile.config_dir)? else {
            return Ok(None);
        };
        if let Some(key) = creds.api_key {
            return Ok(Some(Credential::ApiKey(key)));
        }
        if let Some(oauth) = creds.oauth {
            return Ok(Some(Credential::OauthToken(oauth.access_token)));
        }
        Ok(None)
    }
}

/// Load the credentials file from a profile config dir. Missing file is not an
/// error; the profile simply needs (re-)authentication.
pub fn load_credentials(config_dir: &Path) -> Result<Option<CredentialsFile>> {
    let path = config_dir.join(CREDENTIALS_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read credentials file: {:?}", path))?;
    let creds: CredentialsFile =
        serde_json::from_str(&content).with_context(|| "Failed to parse credentials file")?;
    Ok(Some(creds))
}

/// Save credentials into a profile config dir
pub fn save_credentials(config_dir: &Path, creds: &CredentialsFile) -> Result<()> {
    fs::create_dir_all(config_dir)?;
    let json = serde_json::to_string_pretty(creds)?;
    fs::write(config_dir.join(CREDENTIALS_FILE), json)?;
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
struct JwtClaims {
    pub email: Option<String>,
    pub plan_type: Option<String>,
}

fn decode_jwt_claims(raw_jwt: &str) -> Option<JwtClaims> {
    let payload = raw_jwt.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&decoded).ok()
}

/// Get the account email from credential material, if present
pub fn get_email(creds: &CredentialsFile) -> Option<String> {
    let oauth = creds.oauth.as_ref()?;
    let id_token = oauth.id_token.as_ref()?;
    decode_jwt_claims(id_token)?.email
}

/// Get the subscription plan from credential material, if present
pub fn get_plan_type(creds: &CredentialsFile) -> Option<String> {
    let oauth = creds.oauth.as_ref()?;
    let id_token = oauth.id_token.as_ref()?;
    decode_jwt_claims(id_token)?.plan_type
}
