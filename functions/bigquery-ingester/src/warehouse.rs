use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::backup::BackupKey;
use crate::client::{is_not_found, GoogleApiClient};

pub const BIGQUERY_ENDPOINT: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const DATASTORE_BACKUP_FORMAT: &str = "DATASTORE_BACKUP";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }
}

/// Load-job configuration as sent in `configuration.load`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadJob {
    pub source_uris: Vec<String>,
    pub source_format: String,
    pub allow_quoted_newlines: bool,
    pub destination_table: TableRef,
}

impl LoadJob {
    pub fn datastore_backup(source_uri: impl Into<String>, destination_table: TableRef) -> Self {
        Self {
            source_uris: vec![source_uri.into()],
            source_format: DATASTORE_BACKUP_FORMAT.to_string(),
            allow_quoted_newlines: true,
            destination_table,
        }
    }
}

/// Manifest object written by the backup for one entity kind.
pub fn backup_info_uri(bucket: &str, key: &BackupKey, kind: &str) -> String {
    format!("gs://{}/{}.{}.backup_info", bucket, key, kind)
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn table_exists(&self, table: &TableRef) -> Result<bool>;

    async fn delete_table(&self, table: &TableRef) -> Result<()>;

    /// Submit a load job and return its job id.
    async fn insert_load_job(&self, job: &LoadJob) -> Result<String>;
}

/// Delete `table` if present. A failed lookup counts as absent; a failed delete does not.
pub async fn delete_table_if_exists(warehouse: &dyn Warehouse, table: &TableRef) -> Result<bool> {
    let found = match warehouse.table_exists(table).await {
        Ok(found) => found,
        Err(e) => {
            warn!(
                table = %table.table_id,
                error = %e,
                "Table lookup failed, treating as absent"
            );
            false
        }
    };

    if found {
        warehouse
            .delete_table(table)
            .await
            .with_context(|| format!("Failed to delete table {}", table.table_id))?;
        info!(
            project = %table.project_id,
            dataset = %table.dataset_id,
            table = %table.table_id,
            "Deleted existing table"
        );
    }

    Ok(found)
}

/// [`Warehouse`] backed by the BigQuery v2 REST API.
pub struct BigQueryWarehouse {
    client: GoogleApiClient,
    endpoint: String,
}

impl BigQueryWarehouse {
    pub fn new(client: GoogleApiClient) -> Self {
        Self {
            client,
            endpoint: BIGQUERY_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn table_url(&self, table: &TableRef) -> String {
        format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            self.endpoint, table.project_id, table.dataset_id, table.table_id
        )
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct JobResponse {
    job_reference: Option<JobReference>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn table_exists(&self, table: &TableRef) -> Result<bool> {
        match self
            .client
            .get_json::<serde_json::Value>(&self.table_url(table))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete_table(&self, table: &TableRef) -> Result<()> {
        self.client.delete(&self.table_url(table)).await
    }

    async fn insert_load_job(&self, job: &LoadJob) -> Result<String> {
        let url = format!(
            "{}/projects/{}/jobs",
            self.endpoint, job.destination_table.project_id
        );
        let body = json!({ "configuration": { "load": job } });

        let response: JobResponse = self.client.post_json(&url, &body).await?;
        response
            .job_reference
            .map(|reference| reference.job_id)
            .ok_or_else(|| anyhow!("BigQuery response has no job reference"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_info_uri() {
        assert_eq!(
            backup_info_uri("b", &BackupKey::new("k"), "Order"),
            "gs://b/k.Order.backup_info"
        );
    }

    #[test]
    fn test_load_job_serialization() {
        let job = LoadJob::datastore_backup(
            "gs://b/k.Order.backup_info",
            TableRef::new("analytics", "datastore", "Order"),
        );

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["sourceUris"][0], "gs://b/k.Order.backup_info");
        assert_eq!(json["sourceFormat"], "DATASTORE_BACKUP");
        assert_eq!(json["allowQuotedNewlines"], true);
        assert_eq!(json["destinationTable"]["projectId"], "analytics");
        assert_eq!(json["destinationTable"]["datasetId"], "datastore");
        assert_eq!(json["destinationTable"]["tableId"], "Order");
    }

    #[test]
    fn test_job_response_parsing() {
        let response: JobResponse = serde_json::from_str(
            r#"{"kind":"bigquery#job","jobReference":{"projectId":"analytics","jobId":"job_abc123","location":"US"}}"#,
        )
        .unwrap();
        assert_eq!(response.job_reference.unwrap().job_id, "job_abc123");
    }

    #[test]
    fn test_table_url() {
        let client = GoogleApiClient::new(
            reqwest::Client::new(),
            std::sync::Arc::new(crate::auth::StaticToken::new("t")),
        );
        let warehouse = BigQueryWarehouse::new(client);
        assert_eq!(
            warehouse.table_url(&TableRef::new("p", "d", "User")),
            "https://bigquery.googleapis.com/bigquery/v2/projects/p/datasets/d/tables/User"
        );
    }
}
