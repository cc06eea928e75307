use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::client::GoogleApiClient;
use crate::keys::{encode_legacy_key, KeyId, PathElement};

pub const BACKUP_INFO_KIND: &str = "_AE_Backup_Information";
pub const DATASTORE_ENDPOINT: &str = "https://datastore.googleapis.com/v1";

/// Opaque identifier of a completed backup; the prefix of its manifest objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupKey(String);

impl BackupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupRecord {
    pub name: String,
    pub complete_time: Option<String>,
    pub key: BackupKey,
}

impl BackupRecord {
    pub fn is_complete(&self) -> bool {
        self.complete_time.is_some()
    }
}

/// Read access to the backup-admin records.
#[async_trait]
pub trait BackupCatalog: Send + Sync {
    /// The record with the smallest name in `lower..=upper`, if any.
    async fn first_in_name_range(&self, lower: &str, upper: &str)
        -> Result<Option<BackupRecord>>;
}

/// Name the admin tool gives a backup started at `timestamp`, before its own suffix.
pub fn expected_backup_name(prefix: &str, timestamp: i64) -> String {
    format!("{}{}_", prefix, timestamp)
}

/// Inclusive bounds used to find `expected` despite the suffix the admin tool appends.
pub fn name_range(expected: &str) -> (String, String) {
    (expected.to_string(), format!("{}Z", expected))
}

/// Key of the completed backup named `expected`, or `None` while it is still running.
pub async fn find_completed_backup(
    catalog: &dyn BackupCatalog,
    expected: &str,
) -> Result<Option<BackupKey>> {
    let (lower, upper) = name_range(expected);
    debug!(backup_name = expected, "Looking up backup record");

    let Some(record) = catalog
        .first_in_name_range(&lower, &upper)
        .await
        .with_context(|| format!("Failed to look up backup {}", expected))?
    else {
        warn!(backup_name = expected, "No backup record found");
        return Ok(None);
    };

    // The range also admits names that merely sort between the bounds.
    if !record.name.starts_with(expected) {
        warn!(
            backup_name = expected,
            found = %record.name,
            "Closest backup record does not match expected name"
        );
        return Ok(None);
    }

    info!(
        backup_name = %record.name,
        complete_time = ?record.complete_time,
        key = %record.key,
        "Found backup record"
    );

    Ok(record.is_complete().then_some(record.key))
}

/// [`BackupCatalog`] backed by the Datastore v1 REST API.
pub struct DatastoreBackupCatalog {
    client: GoogleApiClient,
    project_id: String,
    namespace: Option<String>,
    legacy_app_id: String,
    endpoint: String,
}

impl DatastoreBackupCatalog {
    pub fn new(
        client: GoogleApiClient,
        project_id: impl Into<String>,
        namespace: Option<String>,
        legacy_app_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            project_id: project_id.into(),
            namespace,
            legacy_app_id: legacy_app_id.into(),
            endpoint: DATASTORE_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn run_query_body(&self, lower: &str, upper: &str) -> Value {
        let mut body = json!({
            "query": {
                "kind": [{ "name": BACKUP_INFO_KIND }],
                "filter": {
                    "compositeFilter": {
                        "op": "AND",
                        "filters": [
                            property_filter("GREATER_THAN_OR_EQUAL", lower),
                            property_filter("LESS_THAN_OR_EQUAL", upper),
                        ]
                    }
                },
                "order": [{ "property": { "name": "name" }, "direction": "ASCENDING" }],
                "limit": 1
            }
        });
        if let Some(namespace) = &self.namespace {
            body["partitionId"] = json!({
                "projectId": self.project_id,
                "namespaceId": namespace,
            });
        }
        body
    }
}

fn property_filter(op: &str, value: &str) -> Value {
    json!({
        "propertyFilter": {
            "property": { "name": "name" },
            "op": op,
            "value": { "stringValue": value }
        }
    })
}

#[async_trait]
impl BackupCatalog for DatastoreBackupCatalog {
    async fn first_in_name_range(
        &self,
        lower: &str,
        upper: &str,
    ) -> Result<Option<BackupRecord>> {
        let url = format!("{}/projects/{}:runQuery", self.endpoint, self.project_id);
        let response: RunQueryResponse = self
            .client
            .post_json(&url, &self.run_query_body(lower, upper))
            .await?;

        response
            .batch
            .entity_results
            .into_iter()
            .next()
            .map(|result| record_from_entity(result.entity, &self.legacy_app_id))
            .transpose()
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RunQueryResponse {
    batch: QueryResultBatch,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct QueryResultBatch {
    #[serde(default)]
    entity_results: Vec<EntityResult>,
}

#[derive(Deserialize, Debug)]
struct EntityResult {
    entity: Entity,
}

#[derive(Deserialize, Debug)]
struct Entity {
    key: EntityKey,
    #[serde(default)]
    properties: HashMap<String, Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EntityKey {
    #[serde(default)]
    partition_id: Option<PartitionId>,
    path: Vec<KeyPathElement>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PartitionId {
    namespace_id: Option<String>,
}

#[derive(Deserialize, Debug)]
struct KeyPathElement {
    kind: String,
    // int64 values arrive as JSON strings
    id: Option<String>,
    name: Option<String>,
}

fn record_from_entity(entity: Entity, legacy_app_id: &str) -> Result<BackupRecord> {
    let name = entity
        .properties
        .get("name")
        .and_then(|value| value.get("stringValue"))
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Backup record has no name"))?
        .to_string();

    let complete_time = entity
        .properties
        .get("complete_time")
        .filter(|value| is_set(value))
        .map(|value| {
            value
                .get("timestampValue")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string())
        });

    let path = entity
        .key
        .path
        .into_iter()
        .map(|element| -> Result<PathElement> {
            let id = match (element.id, element.name) {
                (Some(id), _) => Some(KeyId::Id(
                    id.parse()
                        .with_context(|| format!("Invalid key id {}", id))?,
                )),
                (None, Some(name)) => Some(KeyId::Name(name)),
                (None, None) => None,
            };
            Ok(PathElement {
                kind: element.kind,
                id,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let namespace = entity
        .key
        .partition_id
        .and_then(|partition| partition.namespace_id);

    Ok(BackupRecord {
        name,
        complete_time,
        key: BackupKey::new(encode_legacy_key(
            legacy_app_id,
            namespace.as_deref(),
            &path,
        )),
    })
}

// A property holds a value unless it is absent, empty or an explicit null.
fn is_set(value: &Value) -> bool {
    match value.as_object() {
        Some(fields) => {
            !fields.contains_key("nullValue") && fields.keys().any(|k| k.ends_with("Value"))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(properties: Value) -> Entity {
        serde_json::from_value(json!({
            "key": {
                "partitionId": { "projectId": "my-project" },
                "path": [{ "kind": BACKUP_INFO_KIND, "id": "5629499534213120" }]
            },
            "properties": properties
        }))
        .unwrap()
    }

    #[test]
    fn test_expected_backup_name() {
        assert_eq!(
            expected_backup_name("nightly_", 1704556800),
            "nightly_1704556800_"
        );
    }

    #[test]
    fn test_name_range() {
        let (lower, upper) = name_range("nightly_1704556800_");
        assert_eq!(lower, "nightly_1704556800_");
        assert_eq!(upper, "nightly_1704556800_Z");
    }

    #[test]
    fn test_completed_record() {
        let record = record_from_entity(
            entity(json!({
                "name": { "stringValue": "nightly_1704556800_2024_01_06_16_00_00" },
                "complete_time": { "timestampValue": "2024-01-06T16:20:00Z" }
            })),
            "s~my-project",
        )
        .unwrap();

        assert!(record.is_complete());
        assert_eq!(record.name, "nightly_1704556800_2024_01_06_16_00_00");
        assert_eq!(record.complete_time.as_deref(), Some("2024-01-06T16:20:00Z"));
        assert_eq!(
            record.key.as_str(),
            "agxzfm15LXByb2plY3RyIwsSFl9BRV9CYWNrdXBfSW5mb3JtYXRpb24YgICAgICAgAoM"
        );
    }

    #[test]
    fn test_null_completion_is_incomplete() {
        let record = record_from_entity(
            entity(json!({
                "name": { "stringValue": "nightly_1704556800_" },
                "complete_time": { "nullValue": null, "excludeFromIndexes": true }
            })),
            "s~my-project",
        )
        .unwrap();
        assert!(!record.is_complete());
    }

    #[test]
    fn test_missing_completion_is_incomplete() {
        let record = record_from_entity(
            entity(json!({ "name": { "stringValue": "nightly_1704556800_" } })),
            "s~my-project",
        )
        .unwrap();
        assert!(!record.is_complete());
    }

    #[test]
    fn test_record_without_name_is_rejected() {
        assert!(record_from_entity(entity(json!({})), "s~my-project").is_err());
    }

    #[test]
    fn test_run_query_response_without_results() {
        let response: RunQueryResponse = serde_json::from_value(json!({
            "batch": { "entityResultType": "FULL", "moreResults": "NO_MORE_RESULTS" }
        }))
        .unwrap();
        assert!(response.batch.entity_results.is_empty());
    }
}
