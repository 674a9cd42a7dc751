use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const MIB: u64 = 1024 * 1024;
pub const DEFAULT_CHUNK_BYTES: u64 = 3 * MIB;
pub const DEFAULT_MAX_FILE_BYTES: u64 = 500 * MIB;
/// Non-final chunks of a resumable upload must be a multiple of this.
pub const RESUMABLE_CHUNK_GRANULARITY: u64 = 256 * 1024;

pub const ENV_CONFIG_PATH: &str = "DRIVEDECK_CONFIG";
pub const ENV_CLIENT_ID: &str = "GOOGLE_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "GOOGLE_CLIENT_SECRET";
pub const ENV_REFRESH_TOKEN: &str = "GOOGLE_REFRESH_TOKEN";
pub const ENV_FOLDER_ID: &str = "GOOGLE_DRIVE_FOLDER_ID";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub drive: DriveSettings,
    #[serde(default)]
    pub upload: UploadLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub max_small_upload_bytes: u64,
    pub max_chunk_request_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveSettings {
    pub api_base: String,
    pub upload_base: String,
    pub token_url: String,
    pub folder_id: Option<String>,
    pub page_size: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UploadLimits {
    pub chunk_bytes: u64,
    pub max_file_bytes: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            max_small_upload_bytes: 100 * MIB,
            max_chunk_request_bytes: 16 * MIB,
        }
    }
}

impl Default for DriveSettings {
    fn default() -> Self {
        Self {
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            folder_id: None,
            page_size: 100,
        }
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

impl UploadLimits {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_bytes == 0 {
            return Err(Error::configuration("upload.chunk_bytes must be > 0"));
        }
        if self.chunk_bytes % RESUMABLE_CHUNK_GRANULARITY != 0 {
            return Err(Error::configuration(format!(
                "upload.chunk_bytes must be a multiple of {RESUMABLE_CHUNK_GRANULARITY} (got {})",
                self.chunk_bytes
            )));
        }
        if self.max_file_bytes < self.chunk_bytes {
            return Err(Error::configuration(
                "upload.max_file_bytes must be >= upload.chunk_bytes",
            ));
        }
        Ok(())
    }
}

/// OAuth client material. Always sourced from the environment, never the file.
#[derive(Debug, Clone, Default)]
pub struct DriveCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
}

impl DriveCredentials {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            client_id: get(ENV_CLIENT_ID),
            client_secret: get(ENV_CLIENT_SECRET),
            refresh_token: get(ENV_REFRESH_TOKEN),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some() && self.refresh_token.is_some()
    }
}

pub fn default_config_path() -> PathBuf {
    std::env::var(ENV_CONFIG_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("drivedeckd.toml"))
}

/// Missing file means defaults; a present but broken file is an error.
pub fn load_relay_settings(path: &Path) -> Result<RelaySettings> {
    let mut settings = if path.exists() {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(format!("config read failed: {e}")))?;
        parse_relay_settings(&text)?
    } else {
        RelaySettings::default()
    };

    if let Ok(folder_id) = std::env::var(ENV_FOLDER_ID)
        && !folder_id.trim().is_empty()
    {
        settings.drive.folder_id = Some(folder_id);
    }

    validate_relay_settings(&settings)?;
    Ok(settings)
}

pub fn parse_relay_settings(text: &str) -> Result<RelaySettings> {
    toml::from_str(text).map_err(|e| Error::configuration(format!("config invalid: {e}")))
}

pub fn validate_relay_settings(settings: &RelaySettings) -> Result<()> {
    settings.upload.validate()?;

    if settings.server.bind.trim().is_empty() {
        return Err(Error::configuration("server.bind must not be empty"));
    }
    if settings.server.max_chunk_request_bytes < settings.upload.chunk_bytes {
        return Err(Error::configuration(
            "server.max_chunk_request_bytes must be >= upload.chunk_bytes",
        ));
    }
    if !(1..=1000).contains(&settings.drive.page_size) {
        return Err(Error::configuration("drive.page_size must be in 1..=1000"));
    }
    for (name, url) in [
        ("drive.api_base", &settings.drive.api_base),
        ("drive.upload_base", &settings.drive.upload_base),
        ("drive.token_url", &settings.drive.token_url),
    ] {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::configuration(format!("{name} must be an http(s) url")));
        }
    }
    Ok(())
}
