//! Optional YAML settings file with an embedded fallback.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use config::{File, FileFormat};
use serde::{Deserialize, Deserializer};

const EMBEDDED_SETTINGS_YAML: &str = r#"
user_credentials_map:
  XW7136: "USR1_"
exchanges:
  - NSE
  - BSE
  - MCX
  - NFO
  - BFO
chrome_driver_path: ""
chrome_user_data_dir: ""
"#;

const DEFAULT_CANDIDATES: [&str; 2] = ["config/app_config.yaml", "app_config.yaml"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// Logical user key to environment-variable prefix, e.g. `XW7136 -> USR1_`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub user_credentials_map: HashMap<String, String>,
    /// Market segments the account trades; informational only.
    #[serde(default, deserialize_with = "null_as_default")]
    pub exchanges: Vec<String>,
    /// Browser executable to drive; empty means auto-detect.
    #[serde(default, deserialize_with = "null_as_default")]
    pub chrome_driver_path: String,
    /// Persistent browser profile directory; empty means a throwaway profile.
    #[serde(default, deserialize_with = "null_as_default")]
    pub chrome_user_data_dir: String,
}

/// Where the loaded settings came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsSource {
    File(PathBuf),
    Embedded,
}

impl Settings {
    /// Loads the first existing candidate file, or the embedded document when none exists.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<(Self, SettingsSource)> {
        let mut candidates: Vec<PathBuf> = explicit.map(Path::to_path_buf).into_iter().collect();
        candidates.extend(DEFAULT_CANDIDATES.iter().map(PathBuf::from));

        for path in candidates {
            if path.is_file() {
                let settings = Self::from_file(&path)?;
                tracing::info!(path = %path.display(), "Loaded settings file");
                return Ok((settings, SettingsSource::File(path)));
            }
        }

        tracing::info!("Using embedded settings fallback");
        Ok((Self::embedded()?, SettingsSource::Embedded))
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let name = path.to_string_lossy();
        config::Config::builder()
            .add_source(File::new(name.as_ref(), FileFormat::Yaml))
            .build()
            .and_then(|built| built.try_deserialize::<Settings>())
            .with_context(|| format!("Failed to read settings file {}", path.display()))
    }

    pub fn from_yaml_str(document: &str) -> anyhow::Result<Self> {
        config::Config::builder()
            .add_source(File::from_str(document, FileFormat::Yaml))
            .build()
            .and_then(|built| built.try_deserialize::<Settings>())
            .context("Failed to parse settings document")
    }

    pub fn embedded() -> anyhow::Result<Self> {
        Self::from_yaml_str(EMBEDDED_SETTINGS_YAML)
    }

    /// Credential prefix for `user_key`. Keys compare case-insensitively.
    pub fn credential_prefix(&self, user_key: &str) -> Option<&str> {
        self.user_credentials_map
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(user_key))
            .map(|(_, prefix)| prefix.as_str())
            .filter(|prefix| !prefix.is_empty())
    }

    pub fn chrome_executable(&self) -> Option<PathBuf> {
        non_empty_path(&self.chrome_driver_path)
    }

    pub fn chrome_user_data_dir(&self) -> Option<PathBuf> {
        non_empty_path(&self.chrome_user_data_dir)
    }
}

/// A key written without a value (`chrome_driver_path:`) reads as empty.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}
