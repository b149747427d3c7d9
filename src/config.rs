use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::cache::InflightPolicy;
use crate::error::MbtError;
use crate::gate::RetryPolicy;
use crate::locator::AttributeSelector;

pub const CONFIG_FILE: &str = "mbt.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub base_url: String,
    #[serde(default)]
    pub graphql_path: Option<String>,
    #[serde(default)]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub csrf_token: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub card_selector: Option<AttributeSelector>,
    #[serde(default)]
    pub anchor_class: Option<String>,
    #[serde(default)]
    pub container_selector: Option<AttributeSelector>,
    #[serde(default)]
    pub startup: Option<RetryPolicy>,
    #[serde(default)]
    pub collapse_inflight: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub endpoint: String,
    pub operation_name: String,
    pub operation_id: Option<String>,
    pub csrf_token: Option<String>,
    pub timeout: Duration,
    pub card_selector: AttributeSelector,
    pub anchor_class: String,
    pub container_selector: Option<AttributeSelector>,
    pub startup: RetryPolicy,
    pub inflight: InflightPolicy,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Explicit path, else `./mbt.json`, else `mbt.json` in the user config directory.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, MbtError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Self::default_path().ok_or(MbtError::MissingConfig)?,
        };

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| MbtError::ConfigRead(config_path.clone().into_std_path_buf()))?;
        Self::resolve_str(&content)
    }

    pub fn resolve_str(content: &str) -> Result<ResolvedConfig, MbtError> {
        let config: Config =
            serde_json::from_str(content).map_err(|err| MbtError::ConfigParse(err.to_string()))?;
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, MbtError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let base_url = config.base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(MbtError::InvalidConfig("base_url must not be empty".to_string()));
        }
        let graphql_path = config.graphql_path.unwrap_or_else(|| "/graphql".to_string());
        let endpoint = if graphql_path.starts_with('/') {
            format!("{base_url}{graphql_path}")
        } else {
            format!("{base_url}/{graphql_path}")
        };

        let startup = config.startup.unwrap_or_default();
        if startup.max_attempts == 0 {
            return Err(MbtError::InvalidConfig(
                "startup.max_attempts must be at least 1".to_string(),
            ));
        }
        if startup.backoff.is_nan() || startup.backoff < 1.0 {
            return Err(MbtError::InvalidConfig(
                "startup.backoff must be 1.0 or greater".to_string(),
            ));
        }

        let inflight = if config.collapse_inflight.unwrap_or(true) {
            InflightPolicy::Collapse
        } else {
            InflightPolicy::Independent
        };

        Ok(ResolvedConfig {
            schema_version,
            endpoint,
            operation_name: config
                .operation_name
                .unwrap_or_else(|| "menusDishModTags".to_string()),
            operation_id: config.operation_id.filter(|value| !value.trim().is_empty()),
            csrf_token: config.csrf_token.filter(|value| !value.trim().is_empty()),
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(30)),
            card_selector: config
                .card_selector
                .unwrap_or_else(AttributeSelector::menu_item_card),
            anchor_class: config
                .anchor_class
                .unwrap_or_else(|| "MuiCardHeader-content".to_string()),
            container_selector: config.container_selector,
            startup,
            inflight,
        })
    }

    fn default_path() -> Option<Utf8PathBuf> {
        let local = Utf8PathBuf::from(CONFIG_FILE);
        if local.as_std_path().exists() {
            return Some(local);
        }
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.config_dir().join("mbt").join(CONFIG_FILE)).ok()
            })
            .filter(|path| path.as_std_path().exists())
    }
}
