use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::retry::RetryPolicy;

pub const DEFAULT_TASKS_LOCATION: &str = "us-central1";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid value for {name}: {value}")]
    InvalidVar { name: &'static str, value: String },

    #[error("Failed to read export configs from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse export configs: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid export config {id}: {reason}")]
    InvalidExport { id: String, reason: String },

    #[error("TASKS_SERVICE_ACCOUNT requires PUBLIC_BASE_URL to be set")]
    MissingPublicBaseUrl,
}

/// Which entity kinds to load, and where to load them from and to.
#[derive(Builder, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ExportConfig {
    #[builder(into)]
    pub queue_name: String,

    #[builder(into)]
    pub backup_name_prefix: String,

    #[builder(into)]
    pub bigquery_project_id: String,

    #[builder(into)]
    pub bigquery_dataset_id: String,

    pub entity_kinds: Vec<String>,

    #[builder(into)]
    pub bucket_name: String,

    #[builder(default)]
    #[serde(default)]
    pub append_timestamp_to_tables: bool,
}

impl ExportConfig {
    /// Destination table for `kind`: `<kind><timestamp>` when suffixing, else `<kind>`.
    pub fn table_id(&self, kind: &str, timestamp: i64) -> String {
        if self.append_timestamp_to_tables {
            format!("{}{}", kind, timestamp)
        } else {
            kind.to_string()
        }
    }

    fn validate(&self, id: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidExport {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let required = [
            ("queue_name", &self.queue_name),
            ("backup_name_prefix", &self.backup_name_prefix),
            ("bigquery_project_id", &self.bigquery_project_id),
            ("bigquery_dataset_id", &self.bigquery_dataset_id),
            ("bucket_name", &self.bucket_name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(invalid(&format!("{} must not be empty", field)));
            }
        }

        if self.entity_kinds.is_empty() {
            return Err(invalid("entity_kinds must list at least one kind"));
        }

        let mut seen = HashSet::new();
        for kind in &self.entity_kinds {
            if kind.trim().is_empty() {
                return Err(invalid("entity_kinds must not contain empty names"));
            }
            if !seen.insert(kind.as_str()) {
                return Err(invalid(&format!("duplicate entity kind {}", kind)));
            }
        }

        Ok(())
    }
}

/// Export configurations keyed by the identifier carried in triggers.
#[derive(Debug, Clone, Default)]
pub struct ExportRegistry {
    configs: HashMap<String, ExportConfig>,
}

impl ExportRegistry {
    pub fn from_configs<I, S>(configs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (S, ExportConfig)>,
        S: Into<String>,
    {
        let mut registry = Self::default();
        for (id, config) in configs {
            let id = id.into();
            if id.trim().is_empty() {
                return Err(ConfigError::InvalidExport {
                    id,
                    reason: "identifier must not be empty".to_string(),
                });
            }
            config.validate(&id)?;
            registry.configs.insert(id, config);
        }
        Ok(registry)
    }

    /// Parse a JSON object mapping identifiers to configurations.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let configs: HashMap<String, ExportConfig> = serde_json::from_str(json)?;
        Self::from_configs(configs)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn get(&self, id: &str) -> Option<&ExportConfig> {
        self.configs.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExportSource {
    Inline(String),
    File(PathBuf),
}

/// Process-wide settings read from the environment at start-up.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_id: String,
    pub datastore_namespace: Option<String>,
    /// Application id used in legacy encoded keys, `s~<project>` by default.
    pub legacy_app_id: String,
    pub tasks_location: String,
    pub tasks_service_account: Option<String>,
    pub public_base_url: Option<String>,
    pub port: u16,
    pub retry: RetryPolicy,
    pub static_token: Option<String>,
    pub export_source: ExportSource,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let project_id =
            var("GOOGLE_CLOUD_PROJECT").ok_or(ConfigError::MissingVar("GOOGLE_CLOUD_PROJECT"))?;
        let legacy_app_id = var("DATASTORE_APP_ID").unwrap_or_else(|| format!("s~{}", project_id));

        let export_source = match var("EXPORT_CONFIGS") {
            Some(json) => ExportSource::Inline(json),
            None => ExportSource::File(PathBuf::from(
                var("EXPORT_CONFIG_PATH").unwrap_or_else(|| "export-configs.json".to_string()),
            )),
        };

        let defaults = RetryPolicy::default();
        let initial_secs: u64 = parse_var(&var, "RETRY_INITIAL_DELAY_SECS", 60)?;
        if initial_secs == 0 {
            return Err(ConfigError::InvalidVar {
                name: "RETRY_INITIAL_DELAY_SECS",
                value: "0".to_string(),
            });
        }
        let multiplier = parse_var(&var, "RETRY_MULTIPLIER", defaults.multiplier)?;
        let max_delay_secs = parse_var(&var, "RETRY_MAX_DELAY_SECS", defaults.max_delay.as_secs())?;
        let max_attempts: u32 = parse_var(&var, "RETRY_MAX_ATTEMPTS", 48)?;

        // Without a fixed base URL the task target would come from request headers.
        let tasks_service_account = var("TASKS_SERVICE_ACCOUNT");
        let public_base_url = var("PUBLIC_BASE_URL");
        if tasks_service_account.is_some() && public_base_url.is_none() {
            return Err(ConfigError::MissingPublicBaseUrl);
        }

        let retry = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(initial_secs))
            .multiplier(multiplier.max(1))
            .max_delay(Duration::from_secs(max_delay_secs.max(initial_secs)))
            .maybe_max_attempts((max_attempts > 0).then_some(max_attempts))
            .build();

        Ok(Self {
            project_id,
            datastore_namespace: var("DATASTORE_NAMESPACE"),
            legacy_app_id,
            tasks_location: var("CLOUD_TASKS_LOCATION")
                .unwrap_or_else(|| DEFAULT_TASKS_LOCATION.to_string()),
            tasks_service_account,
            public_base_url,
            port: parse_var(&var, "PORT", 8080)?,
            retry,
            static_token: var("GOOGLE_OAUTH_ACCESS_TOKEN"),
            export_source,
        })
    }

    pub fn load_registry(&self) -> Result<ExportRegistry, ConfigError> {
        let registry = match &self.export_source {
            ExportSource::Inline(json) => ExportRegistry::from_json(json)?,
            ExportSource::File(path) => ExportRegistry::from_path(path)?,
        };
        info!(
            configs = registry.len(),
            ids = ?registry.ids().collect::<Vec<_>>(),
            "Loaded export configurations"
        );
        Ok(registry)
    }
}

fn parse_var<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = var(name) else {
        return Ok(default);
    };
    match value.trim().parse() {
        Ok(parsed) => Ok(parsed),
        Err(_) => Err(ConfigError::InvalidVar { name, value }),
    }
}
