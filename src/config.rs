use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{BoundingBox, ConceptId, Timestamp};
use crate::error::SyncError;

pub const DEFAULT_CONFIG_FILE: &str = "earthdata-sync.json";
pub const DEFAULT_CMR_HOST: &str = "cmr.earthdata.nasa.gov";
pub const DEFAULT_EDL_HOST: &str = "urs.earthdata.nasa.gov";
pub const MAX_PAGE_SIZE: u32 = 2000;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub collection: CollectionEntry,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub lookback_minutes: Option<u32>,
    #[serde(default)]
    pub data_since: Option<String>,
    #[serde(default)]
    pub bounding_box: Option<String>,
    #[serde(default)]
    pub extensions: Option<Vec<String>>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub sort_key: Option<String>,
    #[serde(default)]
    pub paginate: Option<bool>,
    #[serde(default)]
    pub endpoints: EndpointsEntry,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub download_retries: Option<u32>,
    #[serde(default)]
    pub netrc: Option<String>,
    #[serde(default)]
    pub prompt_for_credentials: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CollectionEntry {
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub concept_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EndpointsEntry {
    #[serde(default)]
    pub cmr: Option<String>,
    #[serde(default)]
    pub edl: Option<String>,
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<String>,
    pub short_name: Option<String>,
    pub concept_id: Option<String>,
    pub data_since: Option<String>,
    pub lookback_minutes: Option<u32>,
    pub bounding_box: Option<String>,
    pub extensions: Vec<String>,
    pub no_paginate: bool,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchFilter {
    pub short_name: Option<String>,
    pub concept_id: Option<ConceptId>,
    pub bounding_box: Option<BoundingBox>,
    pub data_since: Option<Timestamp>,
    pub page_size: u32,
    pub sort_key: String,
}

impl SearchFilter {
    pub fn collection_label(&self) -> String {
        match (&self.short_name, &self.concept_id) {
            (Some(name), _) => name.clone(),
            (None, Some(id)) => id.to_string(),
            (None, None) => "<unknown collection>".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub cmr: String,
    pub edl: String,
}

impl Endpoints {
    pub fn search_url(&self) -> String {
        format!("https://{}/search/granules.umm_json", self.cmr)
    }

    pub fn clear_scroll_url(&self) -> String {
        format!("https://{}/search/clear-scroll", self.cmr)
    }

    pub fn token_url(&self) -> String {
        format!("https://{}/legacy-services/rest/tokens", self.cmr)
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            cmr: DEFAULT_CMR_HOST.to_string(),
            edl: DEFAULT_EDL_HOST.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    pub client_id: String,
    pub client_ip: Option<String>,
    pub netrc: Option<PathBuf>,
    pub prompt: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub filter: SearchFilter,
    pub data_dir: Utf8PathBuf,
    pub lookback_minutes: u32,
    pub extensions: Vec<String>,
    pub paginate: bool,
    pub endpoints: Endpoints,
    pub auth: AuthSettings,
    pub timeout: Duration,
    pub download_retries: u32,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(
        path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, SyncError> {
        let config = Self::load(path, &overrides)?;
        Self::resolve_config(config, overrides)
    }

    /// Like [`ConfigLoader::resolve`] but without requiring a collection,
    /// which only searches need.
    pub fn resolve_for_status(
        path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, SyncError> {
        let config = Self::load(path, &overrides)?;
        Self::resolve_status_config(config, overrides)
    }

    fn load(path: Option<&str>, overrides: &ConfigOverrides) -> Result<Config, SyncError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            if overrides.data_dir.is_none() {
                return Err(SyncError::MissingConfig);
            }
            return Ok(Config::default());
        }
        let content = fs::read_to_string(&config_path)
            .map_err(|_| SyncError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| SyncError::ConfigParse(err.to_string()))
    }

    pub fn resolve_config(
        config: Config,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, SyncError> {
        let resolved = Self::resolve_status_config(config, overrides)?;
        if resolved.filter.short_name.is_none() && resolved.filter.concept_id.is_none() {
            return Err(SyncError::MissingCollection(
                "set collection.short_name or collection.concept_id".to_string(),
            ));
        }
        Ok(resolved)
    }

    pub fn resolve_status_config(
        config: Config,
        overrides: ConfigOverrides,
    ) -> Result<ResolvedConfig, SyncError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(SyncError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let data_dir = overrides
            .data_dir
            .or(config.data_dir)
            .filter(|value| !value.trim().is_empty())
            .map(Utf8PathBuf::from)
            .ok_or_else(|| SyncError::InvalidConfig("data_dir is required".to_string()))?;

        let short_name = non_empty(overrides.short_name.or(config.collection.short_name));
        let concept_id = non_empty(overrides.concept_id.or(config.collection.concept_id))
            .map(|value| value.parse::<ConceptId>())
            .transpose()?;

        let bounding_box = non_empty(overrides.bounding_box.or(config.bounding_box))
            .map(|value| value.parse::<BoundingBox>())
            .transpose()?;
        let data_since = non_empty(overrides.data_since.or(config.data_since))
            .map(|value| value.parse::<Timestamp>())
            .transpose()?;

        let page_size = config.page_size.unwrap_or(MAX_PAGE_SIZE);
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(SyncError::InvalidConfig(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}, got {page_size}"
            )));
        }

        let extensions = if overrides.extensions.is_empty() {
            config.extensions.unwrap_or_else(default_extensions)
        } else {
            overrides.extensions
        };
        let extensions = normalize_extensions(extensions)?;

        let timeout_secs = overrides.timeout_secs.or(config.timeout_secs).unwrap_or(60);
        if timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "timeout_secs must be positive".to_string(),
            ));
        }

        let defaults = Endpoints::default();
        let endpoints = Endpoints {
            cmr: non_empty(config.endpoints.cmr).unwrap_or(defaults.cmr),
            edl: non_empty(config.endpoints.edl).unwrap_or(defaults.edl),
        };

        Ok(ResolvedConfig {
            schema_version,
            filter: SearchFilter {
                short_name,
                concept_id,
                bounding_box,
                data_since,
                page_size,
                sort_key: non_empty(config.sort_key).unwrap_or_else(|| "-start_date".to_string()),
            },
            data_dir,
            lookback_minutes: overrides
                .lookback_minutes
                .or(config.lookback_minutes)
                .unwrap_or(60),
            extensions,
            paginate: !overrides.no_paginate && config.paginate.unwrap_or(true),
            endpoints,
            auth: AuthSettings {
                client_id: non_empty(config.client_id)
                    .unwrap_or_else(|| format!("earthdata-sync-{}", env!("CARGO_PKG_VERSION"))),
                client_ip: non_empty(config.client_ip),
                netrc: non_empty(config.netrc).map(PathBuf::from),
                prompt: config.prompt_for_credentials.unwrap_or(true),
            },
            timeout: Duration::from_secs(timeout_secs),
            download_retries: config.download_retries.unwrap_or(0),
        })
    }
}

pub fn default_extensions() -> Vec<String> {
    vec![".nc".to_string(), ".bin".to_string()]
}

/// Lower-cases extensions and adds the leading dot when it is missing.
fn normalize_extensions(extensions: Vec<String>) -> Result<Vec<String>, SyncError> {
    if extensions.is_empty() {
        return Err(SyncError::InvalidConfig(
            "at least one file extension is required".to_string(),
        ));
    }
    extensions
        .into_iter()
        .map(|ext| {
            let trimmed = ext.trim().to_lowercase();
            let bare = trimmed.trim_start_matches('.');
            if bare.is_empty() {
                return Err(SyncError::InvalidConfig(format!("invalid extension: {ext:?}")));
            }
            Ok(format!(".{bare}"))
        })
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
