// hanadiskbackup/src/cloud/metadata.rs
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use super::InstanceContext;
use crate::errors::{BackupError, Result, Service};
use crate::utils::resource_name;

const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Reader for the instance metadata server: identity of the current
/// instance and OAuth tokens of its default service account.
pub struct MetadataClient {
    http: reqwest::Client,
    base: String,
    token: Mutex<Option<CachedToken>>,
}

impl MetadataClient {
    pub fn new() -> Result<Self> {
        Self::with_base(METADATA_BASE)
    }

    pub fn with_base(base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackupError::external(Service::Metadata, format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        })
    }

    async fn get(&self, path: &str) -> Result<String> {
        let url = format!("{}/{}", self.base, path);
        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| BackupError::transient(Service::Metadata, format!("GET {url}: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackupError::transient(Service::Metadata, format!("GET {url}: {e}")))?;
        if !status.is_success() {
            let message = format!("GET {url} returned {status}: {body}");
            return Err(if status.is_server_error() {
                BackupError::transient(Service::Metadata, message)
            } else {
                BackupError::external(Service::Metadata, message)
            });
        }
        Ok(body.trim().to_string())
    }

    /// Project, zone and name of the instance this process runs on.
    pub async fn instance_context(&self) -> Result<InstanceContext> {
        let project = self.get("project/project-id").await?;
        let zone = self.get("instance/zone").await?;
        let instance_name = self.get("instance/name").await?;
        let context = InstanceContext {
            project,
            zone: resource_name(&zone).to_string(),
            instance_name,
        };
        debug!(?context, "Resolved instance metadata");
        Ok(context)
    }

    /// Numeric instance id, used as a monitored-resource label.
    pub async fn instance_id(&self) -> Result<String> {
        self.get("instance/id").await
    }

    /// Access token of the default service account, cached until shortly
    /// before it expires.
    pub async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.value.clone());
            }
        }
        let body = self.get("instance/service-accounts/default/token").await?;
        let parsed: TokenResponse = serde_json::from_str(&body)?;
        let value = parsed.access_token.clone();
        *cached = Some(CachedToken {
            value: parsed.access_token,
            expires_at: Instant::now() + Duration::from_secs(parsed.expires_in),
        });
        Ok(value)
    }
}
