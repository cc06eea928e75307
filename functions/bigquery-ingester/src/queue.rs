use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

use crate::client::GoogleApiClient;

pub const TRIGGER_PATH: &str = "/datastoreToBigqueryIngestorTask";
pub const TIMESTAMP_PARAM: &str = "timestamp";
pub const EXPORT_CONFIG_PARAM: &str = "exportConfig";
pub const ATTEMPT_PARAM: &str = "attempt";
pub const CLOUD_TASKS_ENDPOINT: &str = "https://cloudtasks.googleapis.com/v2";

/// One poll of a backup, re-sent until the backup completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub timestamp: i64,
    pub export_config: String,
    pub attempt: u32,
}

impl Trigger {
    pub fn new(timestamp: i64, export_config: impl Into<String>) -> Self {
        Self {
            timestamp,
            export_config: export_config.into(),
            attempt: 0,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// Absolute GET url of the trigger endpoint under `base_url`.
    pub fn url(&self, base_url: &str) -> Result<Url> {
        let endpoint = format!("{}{}", base_url.trim_end_matches('/'), TRIGGER_PATH);
        let timestamp = self.timestamp.to_string();
        let attempt = self.attempt.to_string();
        Url::parse_with_params(
            &endpoint,
            [
                (TIMESTAMP_PARAM, timestamp.as_str()),
                (EXPORT_CONFIG_PARAM, self.export_config.as_str()),
                (ATTEMPT_PARAM, attempt.as_str()),
            ],
        )
        .with_context(|| format!("Invalid base url {}", base_url))
    }
}

/// Delayed delivery of triggers back to the trigger endpoint.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(
        &self,
        queue_name: &str,
        base_url: &str,
        trigger: &Trigger,
        delay: Duration,
    ) -> Result<()>;
}

/// [`TaskQueue`] creating Cloud Tasks HTTP tasks.
pub struct CloudTasksQueue {
    client: GoogleApiClient,
    project_id: String,
    location: String,
    service_account: Option<String>,
    endpoint: String,
}

impl CloudTasksQueue {
    pub fn new(
        client: GoogleApiClient,
        project_id: impl Into<String>,
        location: impl Into<String>,
        service_account: Option<String>,
    ) -> Self {
        Self {
            client,
            project_id: project_id.into(),
            location: location.into(),
            service_account,
            endpoint: CLOUD_TASKS_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Full resource name; names already starting with `projects/` are used as given.
    pub fn queue_path(&self, queue_name: &str) -> String {
        if queue_name.starts_with("projects/") {
            queue_name.to_string()
        } else {
            format!(
                "projects/{}/locations/{}/queues/{}",
                self.project_id, self.location, queue_name
            )
        }
    }

    fn task_body(&self, url: &Url, delay: Duration) -> Result<Value> {
        let mut http_request = json!({
            "url": url.as_str(),
            "httpMethod": "GET",
        });
        if let Some(email) = &self.service_account {
            http_request["oidcToken"] = json!({ "serviceAccountEmail": email });
        }

        let mut task = json!({ "httpRequest": http_request });
        if !delay.is_zero() {
            let schedule_time = Utc::now() + chrono::Duration::from_std(delay)?;
            task["scheduleTime"] =
                Value::String(schedule_time.to_rfc3339_opts(SecondsFormat::Millis, true));
        }

        Ok(json!({ "task": task }))
    }
}

#[async_trait]
impl TaskQueue for CloudTasksQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        base_url: &str,
        trigger: &Trigger,
        delay: Duration,
    ) -> Result<()> {
        let url = trigger.url(base_url)?;
        let queue = self.queue_path(queue_name);
        let body = self.task_body(&url, delay)?;

        let created: Value = self
            .client
            .post_json(&format!("{}/{}/tasks", self.endpoint, queue), &body)
            .await
            .with_context(|| format!("Failed to enqueue trigger on {}", queue))?;
        let task = created
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();

        info!(
            queue = %queue,
            task,
            export_config = %trigger.export_config,
            timestamp = trigger.timestamp,
            attempt = trigger.attempt,
            delay_secs = delay.as_secs(),
            "Enqueued trigger"
        );
        Ok(())
    }
}
