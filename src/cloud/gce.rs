// hanadiskbackup/src/cloud/gce.rs
//! REST implementation of the cloud service interfaces against the
//! Compute Engine, Secret Manager and Cloud Monitoring APIs.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::metadata::MetadataClient;
use super::{
    AttachedDisk, DiskDescriptor, DiskService, EncryptionKey, GroupMember, GroupService, GroupSnapshotRequest,
    InstanceContext, InstanceService, OperationRef, OperationScope, OperationStatus, SnapshotMetadata,
    SnapshotRequest, SnapshotState,
};
use crate::errors::{BackupError, Result, Service};
use crate::utils::resource_name;

const COMPUTE_BASE: &str = "https://compute.googleapis.com/compute/v1";
const SECRET_MANAGER_BASE: &str = "https://secretmanager.googleapis.com/v1";
const MONITORING_BASE: &str = "https://monitoring.googleapis.com/v3";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiOperation {
    name: String,
    status: String,
    #[serde(default)]
    error: Option<ApiOperationError>,
}

#[derive(Debug, Deserialize)]
struct ApiOperationError {
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorItem {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiDisk {
    name: String,
    zone: String,
    self_link: String,
    #[serde(rename = "type", default)]
    disk_type: String,
    #[serde(default)]
    disk_encryption_key: Option<ApiEncryptionKey>,
    // int64 fields arrive as JSON strings
    #[serde(default)]
    provisioned_iops: Option<String>,
    #[serde(default)]
    provisioned_throughput: Option<String>,
    #[serde(default)]
    resource_policies: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEncryptionKey {
    #[serde(default)]
    kms_key_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiInstance {
    #[serde(default)]
    disks: Vec<ApiAttachedDisk>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiAttachedDisk {
    #[serde(default)]
    device_name: String,
    #[serde(default)]
    source: String,
}

#[derive(Debug, Deserialize)]
struct ApiSnapshot {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiInstantSnapshotList {
    #[serde(default)]
    items: Vec<ApiInstantSnapshot>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiInstantSnapshot {
    name: String,
    #[serde(default)]
    source_disk: String,
    #[serde(default)]
    source_instant_snapshot_group: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ApiSecretVersion {
    payload: ApiSecretPayload,
}

#[derive(Debug, Deserialize)]
struct ApiSecretPayload {
    data: String,
}

/// Authenticated client for Google Cloud REST APIs.
pub struct GceClient {
    http: reqwest::Client,
    metadata: Arc<MetadataClient>,
    compute_base: String,
}

impl GceClient {
    pub fn new(metadata: Arc<MetadataClient>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| BackupError::external(Service::DiskSnapshot, format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            metadata,
            compute_base: COMPUTE_BASE.to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        service: Service,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<T> {
        let token = self.metadata.access_token().await?;
        debug!(%method, %url, "Cloud API request");
        let mut request = self.http.request(method.clone(), url.clone()).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BackupError::transient(service, format!("{method} {url}: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BackupError::transient(service, format!("{method} {url}: {e}")))?;
        if !status.is_success() {
            let message = format!("{method} {url} returned {status}: {text}");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                BackupError::transient(service, message)
            } else {
                BackupError::external(service, message)
            });
        }
        serde_json::from_str(&text).map_err(|e| {
            BackupError::external(service, format!("Unexpected response from {method} {url}: {e}"))
        })
    }

    fn compute_url(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}/{}", self.compute_base, path)).map_err(|e| {
            BackupError::external(Service::DiskSnapshot, format!("Invalid compute URL for {path}: {e}"))
        })
    }

    /// Reads the latest version of a secret, e.g. the database password.
    pub async fn access_secret(&self, project: &str, secret: &str) -> Result<String> {
        let url = Url::parse(&format!(
            "{SECRET_MANAGER_BASE}/projects/{project}/secrets/{secret}/versions/latest:access"
        ))
        .map_err(|e| BackupError::external(Service::SecretManager, format!("Invalid secret URL: {e}")))?;
        let version: ApiSecretVersion = self.call(Service::SecretManager, Method::GET, url, None).await?;
        let bytes = STANDARD.decode(version.payload.data.as_bytes()).map_err(|e| {
            BackupError::external(Service::SecretManager, format!("Secret {secret} is not valid base64: {e}"))
        })?;
        let value = String::from_utf8(bytes).map_err(|e| {
            BackupError::external(Service::SecretManager, format!("Secret {secret} is not UTF-8: {e}"))
        })?;
        Ok(value.trim_end_matches('\n').to_string())
    }

    /// Writes a batch of time series to Cloud Monitoring.
    pub async fn create_time_series(&self, project: &str, series: Vec<Value>) -> Result<()> {
        let url = Url::parse(&format!("{MONITORING_BASE}/projects/{project}/timeSeries"))
            .map_err(|e| BackupError::external(Service::Monitoring, format!("Invalid monitoring URL: {e}")))?;
        let body = json!({ "timeSeries": series });
        let _: Value = self.call(Service::Monitoring, Method::POST, url, Some(&body)).await?;
        Ok(())
    }

    fn operation_path(operation: &OperationRef) -> String {
        match &operation.scope {
            OperationScope::Global => format!("projects/{}/global/operations/{}", operation.project, operation.name),
            OperationScope::Zone(zone) => format!(
                "projects/{}/zones/{}/operations/{}",
                operation.project, zone, operation.name
            ),
        }
    }

    async fn operation(&self, service: Service, operation: &OperationRef) -> Result<OperationStatus> {
        let url = self.compute_url(&Self::operation_path(operation))?;
        let op: ApiOperation = self.call(service, Method::GET, url, None).await?;
        Ok(operation_status(&op))
    }
}

fn operation_status(op: &ApiOperation) -> OperationStatus {
    match op.status.as_str() {
        "DONE" => match op.error.as_ref().filter(|e| !e.errors.is_empty()) {
            Some(error) => OperationStatus::Failed(
                error
                    .errors
                    .iter()
                    .map(|e| {
                        format!(
                            "{}: {}",
                            e.code.as_deref().unwrap_or("UNKNOWN"),
                            e.message.as_deref().unwrap_or("")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            None => OperationStatus::Done,
        },
        "RUNNING" => OperationStatus::Running,
        _ => OperationStatus::Pending,
    }
}

fn encryption_key_json(key: &EncryptionKey) -> Value {
    match key {
        EncryptionKey::Kms(name) => json!({ "kmsKeyName": name }),
        EncryptionKey::Raw(raw) => json!({ "rawKey": raw }),
        EncryptionKey::RsaWrapped(wrapped) => json!({ "rsaEncryptedKey": wrapped }),
    }
}

fn metadata_json(body: &mut Value, metadata: &SnapshotMetadata) {
    body["description"] = json!(metadata.description);
    if !metadata.labels.is_empty() {
        body["labels"] = json!(metadata.labels);
    }
    if let Some(location) = &metadata.storage_location {
        body["storageLocations"] = json!([location]);
    }
}

/// Insert body for a single-disk snapshot. The source and destination keys
/// are the same key material.
fn snapshot_body(request: &SnapshotRequest) -> Value {
    let mut body = json!({
        "name": request.name,
        "sourceDisk": request.source_disk.self_link,
        "snapshotType": request.metadata.snapshot_type.as_api_str(),
    });
    metadata_json(&mut body, &request.metadata);
    if let Some(key) = &request.encryption_key {
        body["sourceDiskEncryptionKey"] = encryption_key_json(key);
        body["snapshotEncryptionKey"] = encryption_key_json(key);
    }
    body
}

fn group_body(request: &GroupSnapshotRequest) -> Value {
    json!({
        "name": request.name,
        "description": request.metadata.description,
        "sourceConsistencyGroup": request.consistency_group,
    })
}

fn into_descriptor(project: &str, disk: ApiDisk) -> DiskDescriptor {
    DiskDescriptor {
        zone: resource_name(&disk.zone).to_string(),
        project: project.to_string(),
        disk_type: resource_name(&disk.disk_type).to_string(),
        encryption_key: disk
            .disk_encryption_key
            .and_then(|k| k.kms_key_name)
            .map(EncryptionKey::Kms),
        provisioned_iops: disk.provisioned_iops.and_then(|v| v.parse().ok()),
        provisioned_throughput: disk.provisioned_throughput.and_then(|v| v.parse().ok()),
        resource_policies: disk.resource_policies,
        self_link: disk.self_link,
        name: disk.name,
    }
}

#[async_trait]
impl InstanceService for GceClient {
    async fn attached_disks(&self, instance: &InstanceContext) -> Result<Vec<AttachedDisk>> {
        let url = self.compute_url(&format!(
            "projects/{}/zones/{}/instances/{}",
            instance.project, instance.zone, instance.instance_name
        ))?;
        let api: ApiInstance = self.call(Service::Metadata, Method::GET, url, None).await?;
        Ok(api
            .disks
            .into_iter()
            .map(|d| AttachedDisk {
                disk_name: resource_name(&d.source).to_string(),
                device_name: d.device_name,
            })
            .collect())
    }
}

#[async_trait]
impl DiskService for GceClient {
    async fn get_disk(&self, project: &str, zone: &str, name: &str) -> Result<DiskDescriptor> {
        let url = self.compute_url(&format!("projects/{project}/zones/{zone}/disks/{name}"))?;
        let disk: ApiDisk = self.call(Service::DiskSnapshot, Method::GET, url, None).await?;
        Ok(into_descriptor(project, disk))
    }

    async fn insert_snapshot(&self, project: &str, request: &SnapshotRequest) -> Result<OperationRef> {
        let url = self.compute_url(&format!("projects/{project}/global/snapshots"))?;
        let body = snapshot_body(request);
        let op: ApiOperation = self.call(Service::DiskSnapshot, Method::POST, url, Some(&body)).await?;
        if let OperationStatus::Failed(reason) = operation_status(&op) {
            return Err(BackupError::external(Service::DiskSnapshot, reason));
        }
        Ok(OperationRef {
            project: project.to_string(),
            name: op.name,
            scope: OperationScope::Global,
        })
    }

    async fn operation_status(&self, operation: &OperationRef) -> Result<OperationStatus> {
        self.operation(Service::DiskSnapshot, operation).await
    }

    async fn snapshot_state(&self, project: &str, name: &str) -> Result<SnapshotState> {
        let url = self.compute_url(&format!("projects/{project}/global/snapshots/{name}"))?;
        let snapshot: ApiSnapshot = self.call(Service::DiskSnapshot, Method::GET, url, None).await?;
        Ok(SnapshotState::from_api(&snapshot.status))
    }
}

#[async_trait]
impl GroupService for GceClient {
    async fn insert_group(&self, project: &str, request: &GroupSnapshotRequest) -> Result<OperationRef> {
        let url = self.compute_url(&format!(
            "projects/{project}/zones/{}/instantSnapshotGroups",
            request.zone
        ))?;
        let body = group_body(request);
        let op: ApiOperation = self.call(Service::GroupSnapshot, Method::POST, url, Some(&body)).await?;
        if let OperationStatus::Failed(reason) = operation_status(&op) {
            return Err(BackupError::external(Service::GroupSnapshot, reason));
        }
        Ok(OperationRef {
            project: project.to_string(),
            name: op.name,
            scope: OperationScope::Zone(request.zone.clone()),
        })
    }

    async fn operation_status(&self, operation: &OperationRef) -> Result<OperationStatus> {
        self.operation(Service::GroupSnapshot, operation).await
    }

    async fn group_members(&self, project: &str, zone: &str, group: &str) -> Result<Vec<GroupMember>> {
        let mut members = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.compute_url(&format!("projects/{project}/zones/{zone}/instantSnapshots"))?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("filter", &format!("sourceInstantSnapshotGroup eq .*/{group}"));
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let page: ApiInstantSnapshotList = self.call(Service::GroupSnapshot, Method::GET, url, None).await?;
            members.extend(
                page.items
                    .into_iter()
                    .filter(|s| resource_name(&s.source_instant_snapshot_group) == group)
                    .map(|s| GroupMember {
                        source_disk: resource_name(&s.source_disk).to_string(),
                        state: SnapshotState::from_api(&s.status),
                        name: s.name,
                    }),
            );
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnapshotType;
    use std::collections::BTreeMap;

    fn descriptor() -> DiskDescriptor {
        DiskDescriptor {
            name: "hana-data".into(),
            zone: "zone-a".into(),
            project: "proj".into(),
            self_link: "https://www.googleapis.com/compute/v1/projects/proj/zones/zone-a/disks/hana-data".into(),
            disk_type: "hyperdisk-extreme".into(),
            encryption_key: None,
            provisioned_iops: None,
            provisioned_throughput: None,
            resource_policies: vec![],
        }
    }

    #[test]
    fn test_snapshot_body_carries_metadata_and_matching_keys() {
        let request = SnapshotRequest {
            name: "snapshot-hana-data-20240101-000000".into(),
            source_disk: descriptor(),
            metadata: SnapshotMetadata {
                description: "nightly".into(),
                storage_location: Some("us".into()),
                labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
                snapshot_type: SnapshotType::Archive,
            },
            encryption_key: Some(EncryptionKey::Kms("projects/p/locations/l/keyRings/r/cryptoKeys/k".into())),
        };
        let body = snapshot_body(&request);
        assert_eq!(body["snapshotType"], "ARCHIVE");
        assert_eq!(body["storageLocations"], json!(["us"]));
        assert_eq!(body["labels"]["env"], "prod");
        assert_eq!(body["sourceDisk"], json!(request.source_disk.self_link));
        assert_eq!(body["sourceDiskEncryptionKey"], body["snapshotEncryptionKey"]);
        assert_eq!(
            body["snapshotEncryptionKey"]["kmsKeyName"],
            "projects/p/locations/l/keyRings/r/cryptoKeys/k"
        );
    }

    #[test]
    fn test_unencrypted_snapshot_body_has_no_key_fields() {
        let request = SnapshotRequest {
            name: "s".into(),
            source_disk: descriptor(),
            metadata: SnapshotMetadata {
                description: "d".into(),
                storage_location: None,
                labels: BTreeMap::new(),
                snapshot_type: SnapshotType::Standard,
            },
            encryption_key: None,
        };
        let body = snapshot_body(&request);
        assert!(body.get("sourceDiskEncryptionKey").is_none());
        assert!(body.get("storageLocations").is_none());
        assert!(body.get("labels").is_none());
    }

    #[test]
    fn test_operation_status_mapping() -> anyhow::Result<()> {
        let done: ApiOperation = serde_json::from_value(json!({"name": "op", "status": "DONE"}))?;
        assert_eq!(operation_status(&done), OperationStatus::Done);

        let failed: ApiOperation = serde_json::from_value(json!({
            "name": "op", "status": "DONE",
            "error": {"errors": [{"code": "QUOTA_EXCEEDED", "message": "too many snapshots"}]}
        }))?;
        assert_eq!(
            operation_status(&failed),
            OperationStatus::Failed("QUOTA_EXCEEDED: too many snapshots".into())
        );

        let running: ApiOperation = serde_json::from_value(json!({"name": "op", "status": "RUNNING"}))?;
        assert_eq!(operation_status(&running), OperationStatus::Running);
        Ok(())
    }

    #[test]
    fn test_disk_descriptor_from_api() -> anyhow::Result<()> {
        let api: ApiDisk = serde_json::from_value(json!({
            "name": "hana-data",
            "zone": "https://www.googleapis.com/compute/v1/projects/proj/zones/zone-a",
            "selfLink": "https://www.googleapis.com/compute/v1/projects/proj/zones/zone-a/disks/hana-data",
            "type": "https://www.googleapis.com/compute/v1/projects/proj/zones/zone-a/diskTypes/hyperdisk-extreme",
            "diskEncryptionKey": {"kmsKeyName": "k1"},
            "provisionedIops": "100000",
            "resourcePolicies": ["https://www.googleapis.com/compute/v1/projects/proj/regions/r/resourcePolicies/cg"]
        }))?;
        let disk = into_descriptor("proj", api);
        assert_eq!(disk.zone, "zone-a");
        assert_eq!(disk.disk_type, "hyperdisk-extreme");
        assert_eq!(disk.encryption_key, Some(EncryptionKey::Kms("k1".into())));
        assert_eq!(disk.provisioned_iops, Some(100_000));
        assert_eq!(disk.provisioned_throughput, None);
        assert_eq!(disk.resource_policies.len(), 1);
        Ok(())
    }

    #[test]
    fn test_operation_paths() {
        let global = OperationRef { project: "p".into(), name: "op1".into(), scope: OperationScope::Global };
        assert_eq!(GceClient::operation_path(&global), "projects/p/global/operations/op1");
        let zonal = OperationRef { project: "p".into(), name: "op2".into(), scope: OperationScope::Zone("z".into()) };
        assert_eq!(GceClient::operation_path(&zonal), "projects/p/zones/z/operations/op2");
    }
}
