use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classifier::GeminiSettings;
use crate::error::CurateError;
use crate::request::RequestPolicy;

pub const CONFIG_FILE_NAME: &str = "curate.json";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_DATABASE: &str = "photo_series.db";
pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const API_KEY_VARS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"];

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub min_images_for_series: Option<usize>,
    #[serde(default)]
    pub max_images_for_series: Option<usize>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub model: String,
    pub database_path: Utf8PathBuf,
    pub min_images_for_series: usize,
    pub max_images_for_series: usize,
    pub endpoint: String,
    pub request_timeout: Duration,
    pub max_retries: usize,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            model: DEFAULT_MODEL.to_string(),
            database_path: Utf8PathBuf::from(DEFAULT_DATABASE),
            min_images_for_series: 2,
            max_images_for_series: 14,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout: Duration::from_secs(120),
            max_retries: 2,
        }
    }
}

impl ResolvedConfig {
    pub fn request_policy(&self) -> RequestPolicy {
        RequestPolicy {
            min_subset: self.min_images_for_series,
        }
    }

    pub fn gemini_settings(&self, api_key: String) -> GeminiSettings {
        GeminiSettings {
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            api_key,
            timeout: self.request_timeout,
            max_retries: self.max_retries,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// An explicit path must exist. Without one, `curate.json` in the working
    /// directory is used, then the user config directory, then defaults.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, CurateError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };

        let Some(config_path) = config_path else {
            debug!("no {CONFIG_FILE_NAME} found, using defaults");
            return Self::resolve_config(Config::default());
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| CurateError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| CurateError::ConfigParse(err.to_string()))?;
        debug!("loaded config from {}", config_path.display());

        Self::resolve_config(config)
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("", "", "series-curator")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, CurateError> {
        let defaults = ResolvedConfig::default();

        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(CurateError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let min_images_for_series = config
            .min_images_for_series
            .unwrap_or(defaults.min_images_for_series);
        let max_images_for_series = config
            .max_images_for_series
            .unwrap_or(defaults.max_images_for_series);
        if min_images_for_series < 2 {
            return Err(CurateError::InvalidConfig(
                "min_images_for_series must be at least 2".to_string(),
            ));
        }
        if max_images_for_series < min_images_for_series {
            return Err(CurateError::InvalidConfig(format!(
                "max_images_for_series ({max_images_for_series}) is below min_images_for_series ({min_images_for_series})"
            )));
        }

        let timeout_secs = config
            .request_timeout_secs
            .unwrap_or(defaults.request_timeout.as_secs());
        if timeout_secs == 0 {
            return Err(CurateError::InvalidConfig(
                "request_timeout_secs must be positive".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            schema_version,
            model: config.model.unwrap_or(defaults.model),
            database_path: config
                .database_path
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.database_path),
            min_images_for_series,
            max_images_for_series,
            endpoint: config.endpoint.unwrap_or(defaults.endpoint),
            request_timeout: Duration::from_secs(timeout_secs),
            max_retries: config.max_retries.unwrap_or(defaults.max_retries),
        })
    }
}

/// `--api-key` wins, then the environment variables in [`API_KEY_VARS`] order.
pub fn resolve_api_key(flag: Option<&str>) -> Result<String, CurateError> {
    api_key_from(flag, |name| std::env::var(name).ok())
}

pub fn api_key_from<F>(flag: Option<&str>, lookup: F) -> Result<String, CurateError>
where
    F: Fn(&str) -> Option<String>,
{
    flag.map(str::to_string)
        .into_iter()
        .chain(API_KEY_VARS.iter().filter_map(|name| lookup(name)))
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
        .ok_or(CurateError::MissingApiKey)
}
