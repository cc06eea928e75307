pub mod auth;
pub mod backup;
pub mod client;
pub mod config;
pub mod keys;
pub mod queue;
pub mod retry;
pub mod server;
pub mod warehouse;

use anyhow::Result;
use chrono::Utc;
use hyper::StatusCode;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::backup::{
    expected_backup_name, find_completed_backup, BackupCatalog, BackupKey, DatastoreBackupCatalog,
};
use crate::client::GoogleApiClient;
use crate::config::{ExportConfig, ExportRegistry, Settings};
use crate::queue::{
    CloudTasksQueue, TaskQueue, Trigger, ATTEMPT_PARAM, EXPORT_CONFIG_PARAM, TIMESTAMP_PARAM,
};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::warehouse::{
    backup_info_uri, delete_table_if_exists, BigQueryWarehouse, LoadJob, TableRef, Warehouse,
};

/// Raw trigger parameters as they arrive on the query string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub timestamp: Option<String>,
    pub export_config: Option<String>,
    pub attempt: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TriggerError {
    #[error("Missing required param: {0}")]
    MissingParam(&'static str),

    #[error("Invalid param: {0}")]
    InvalidParam(&'static str),

    #[error("Unknown export config: {0}")]
    UnknownExportConfig(String),
}

impl Request {
    pub fn from_query(query: &str) -> Self {
        let mut request = Self::default();
        let Ok(url) = Url::parse(&format!("http://localhost/?{}", query)) else {
            return request;
        };

        for (key, value) in url.query_pairs() {
            let value = Some(value.into_owned());
            match key.as_ref() {
                TIMESTAMP_PARAM => request.timestamp = value,
                EXPORT_CONFIG_PARAM => request.export_config = value,
                ATTEMPT_PARAM => request.attempt = value,
                _ => {}
            }
        }
        request
    }

    /// Checks the timestamp first, then the export config, then the attempt.
    pub fn validate(&self) -> Result<Trigger, TriggerError> {
        let timestamp = self
            .timestamp
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|timestamp| *timestamp != 0)
            .ok_or(TriggerError::MissingParam(TIMESTAMP_PARAM))?;

        let export_config = self
            .export_config
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(TriggerError::MissingParam(EXPORT_CONFIG_PARAM))?;

        let attempt = match self.attempt.as_deref().map(str::trim) {
            None | Some("") => 0,
            Some(value) => value
                .parse()
                .map_err(|_| TriggerError::InvalidParam(ATTEMPT_PARAM))?,
        };

        Ok(Trigger {
            timestamp,
            export_config: export_config.to_string(),
            attempt,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Retrying,
    Failed,
}

/// A load job handed to the warehouse for one entity kind.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SubmittedJob {
    pub kind: String,
    pub source_uri: String,
    pub table_id: String,
    pub job_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    pub message: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<SubmittedJob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_in_secs: Option<u64>,
}

impl Response {
    pub fn success(message: impl Into<String>, jobs: Vec<SubmittedJob>) -> Self {
        Self {
            status: Status::Success,
            message: message.into(),
            timestamp: Utc::now().to_rfc3339(),
            jobs,
            attempt: None,
            retry_in_secs: None,
        }
    }

    pub fn retrying(message: impl Into<String>, attempt: u32, delay: Duration) -> Self {
        Self {
            status: Status::Retrying,
            attempt: Some(attempt),
            retry_in_secs: Some(delay.as_secs()),
            ..Self::success(message, Vec::new())
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            ..Self::success(message, Vec::new())
        }
    }
}

/// HTTP status and JSON body produced for one trigger request.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerOutcome {
    pub status: StatusCode,
    pub response: Response,
}

impl TriggerOutcome {
    fn ok(response: Response) -> Self {
        Self {
            status: StatusCode::OK,
            response,
        }
    }
}

pub struct IngestionService {
    registry: ExportRegistry,
    catalog: Arc<dyn BackupCatalog>,
    queue: Arc<dyn TaskQueue>,
    warehouse: Arc<dyn Warehouse>,
    retry: RetryPolicy,
}

impl IngestionService {
    pub fn new(
        registry: ExportRegistry,
        catalog: Arc<dyn BackupCatalog>,
        queue: Arc<dyn TaskQueue>,
        warehouse: Arc<dyn Warehouse>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            catalog,
            queue,
            warehouse,
            retry,
        }
    }

    /// Wire the service to Datastore, Cloud Tasks and BigQuery.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let client = GoogleApiClient::from_settings(settings)?;

        let catalog = DatastoreBackupCatalog::new(
            client.clone(),
            settings.project_id.clone(),
            settings.datastore_namespace.clone(),
            settings.legacy_app_id.clone(),
        );
        let queue = CloudTasksQueue::new(
            client.clone(),
            settings.project_id.clone(),
            settings.tasks_location.clone(),
            settings.tasks_service_account.clone(),
        );
        let warehouse = BigQueryWarehouse::new(client);

        Ok(Self::new(
            settings.load_registry()?,
            Arc::new(catalog),
            Arc::new(queue),
            Arc::new(warehouse),
            settings.retry.clone(),
        ))
    }

    /// Start a polling chain for the backup taken at `timestamp`.
    pub async fn start_polling(
        &self,
        export_config: &str,
        timestamp: i64,
        base_url: &str,
    ) -> Result<()> {
        let config = self
            .registry
            .get(export_config)
            .ok_or_else(|| TriggerError::UnknownExportConfig(export_config.to_string()))?;

        self.queue
            .enqueue(
                &config.queue_name,
                base_url,
                &Trigger::new(timestamp, export_config),
                Duration::ZERO,
            )
            .await
    }

    /// Handle one trigger request; never fails, errors become 4xx/5xx outcomes.
    pub async fn handle_request(&self, request: &Request, base_url: &str) -> TriggerOutcome {
        let trigger = match request.validate() {
            Ok(trigger) => trigger,
            Err(e) => {
                warn!(error = %e, "Rejected trigger");
                return TriggerOutcome {
                    status: StatusCode::BAD_REQUEST,
                    response: Response::failed(e.to_string()),
                };
            }
        };

        let Some(config) = self.registry.get(&trigger.export_config) else {
            let e = TriggerError::UnknownExportConfig(trigger.export_config.clone());
            warn!(error = %e, "Rejected trigger");
            return TriggerOutcome {
                status: StatusCode::BAD_REQUEST,
                response: Response::failed(e.to_string()),
            };
        };

        match self.handle_trigger(config, &trigger, base_url).await {
            Ok(response) => TriggerOutcome::ok(response),
            Err(e) => {
                error!(
                    export_config = %trigger.export_config,
                    timestamp = trigger.timestamp,
                    error = ?e,
                    "Trigger failed"
                );
                TriggerOutcome {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    response: Response::failed(format!("{:#}", e)),
                }
            }
        }
    }

    async fn handle_trigger(
        &self,
        config: &ExportConfig,
        trigger: &Trigger,
        base_url: &str,
    ) -> Result<Response> {
        let backup_name = expected_backup_name(&config.backup_name_prefix, trigger.timestamp);
        info!(
            export_config = %trigger.export_config,
            timestamp = trigger.timestamp,
            attempt = trigger.attempt,
            backup_name = %backup_name,
            "Checking backup completion"
        );

        let Some(key) = find_completed_backup(self.catalog.as_ref(), &backup_name).await? else {
            return self.schedule_retry(config, trigger, base_url, &backup_name).await;
        };

        info!(key = %key, "Backup complete, starting BigQuery ingestion");
        let jobs = self.run_ingestion(config, trigger.timestamp, &key).await?;

        Ok(Response::success(
            format!("backup complete, submitted {} load jobs", jobs.len()),
            jobs,
        ))
    }

    async fn schedule_retry(
        &self,
        config: &ExportConfig,
        trigger: &Trigger,
        base_url: &str,
        backup_name: &str,
    ) -> Result<Response> {
        match self.retry.next(trigger.attempt) {
            RetryDecision::RetryAfter(delay) => {
                let next = trigger.next_attempt();
                self.queue
                    .enqueue(&config.queue_name, base_url, &next, delay)
                    .await?;
                Ok(Response::retrying(
                    format!("backup incomplete, retrying in {} seconds", delay.as_secs()),
                    next.attempt,
                    delay,
                ))
            }
            RetryDecision::GiveUp => {
                error!(
                    backup_name,
                    attempts = trigger.attempt.saturating_add(1),
                    "Backup never completed, giving up"
                );
                Ok(Response::failed(format!(
                    "backup {} incomplete after {} attempts, giving up",
                    backup_name,
                    trigger.attempt.saturating_add(1)
                )))
            }
        }
    }

    /// Replace or create one table per entity kind from the backup `key`.
    ///
    /// Kinds are processed in order; the first failing submission aborts the rest.
    pub async fn run_ingestion(
        &self,
        config: &ExportConfig,
        timestamp: i64,
        key: &BackupKey,
    ) -> Result<Vec<SubmittedJob>> {
        let table = |kind: &str| {
            TableRef::new(
                config.bigquery_project_id.as_str(),
                config.bigquery_dataset_id.as_str(),
                config.table_id(kind, timestamp),
            )
        };

        if !config.append_timestamp_to_tables {
            for kind in &config.entity_kinds {
                delete_table_if_exists(self.warehouse.as_ref(), &table(kind)).await?;
            }
        }

        let mut jobs = Vec::with_capacity(config.entity_kinds.len());
        for kind in &config.entity_kinds {
            let source_uri = backup_info_uri(&config.bucket_name, key, kind);
            let job = LoadJob::datastore_backup(source_uri.clone(), table(kind));

            let job_id = self.warehouse.insert_load_job(&job).await.map_err(|e| {
                e.context(format!("Failed to submit load job for kind {}", kind))
            })?;
            info!(kind = %kind, uri = %source_uri, job_id = %job_id, "Submitted load job");

            jobs.push(SubmittedJob {
                kind: kind.clone(),
                source_uri,
                table_id: job.destination_table.table_id,
                job_id,
            });
        }

        Ok(jobs)
    }
}
