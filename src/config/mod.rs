// hanadiskbackup/src/config/mod.rs
use anyhow::Context;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::errors::{BackupError, Result};
use crate::utils::backoff::BackoffConfig;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_DATA_MOUNT: &str = "/hana/data";

// Structs for deserializing the optional JSON parameter file. Command-line
// flags are folded into the same shape and win over file values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawJsonConfig {
    pub sid: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub instance_id: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub password_secret: Option<String>,
    pub hdbuserstore_key: Option<String>,
    pub disk: Option<String>,
    pub disk_zone: Option<String>,
    pub project: Option<String>,
    pub instance_name: Option<String>,
    pub snapshot_name: Option<String>,
    pub group_snapshot_name: Option<String>,
    pub snapshot_type: Option<String>,
    pub description: Option<String>,
    pub storage_location: Option<String>,
    pub labels: Option<BTreeMap<String, String>>,
    pub source_disk_key_file: Option<PathBuf>,
    pub data_mount: Option<PathBuf>,
    pub freeze_file_system: Option<bool>,
    pub abandon_prepared: Option<bool>,
    pub skip_db_snapshot_for_change_disk_type: Option<bool>,
    pub confirm_data_snapshot_after_create: Option<bool>,
    pub send_status_to_monitoring: Option<bool>,
    pub group_snapshot: Option<bool>,
    pub polling: Option<JsonPollingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JsonPollingConfig {
    pub creation: BackoffConfig,
    pub upload: BackoffConfig,
    pub call: BackoffConfig,
    pub db_query_timeout_secs: u64,
    pub api_call_timeout_secs: u64,
    pub freeze_timeout_secs: u64,
    pub deadline_secs: Option<u64>,
}

impl Default for JsonPollingConfig {
    fn default() -> Self {
        Self {
            creation: BackoffConfig::creation(),
            upload: BackoffConfig::upload(),
            call: BackoffConfig::default(),
            db_query_timeout_secs: 120,
            api_call_timeout_secs: 60,
            freeze_timeout_secs: 60,
            deadline_secs: None,
        }
    }
}

impl RawJsonConfig {
    pub fn load_from_json(config_path: &Path) -> anyhow::Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        serde_json::from_str(&config_content).with_context(|| {
            format!("Failed to parse JSON from config file at {}", config_path.display())
        })
    }

    /// Layers `overrides` on top of `self`; any value set in `overrides` wins.
    pub fn overlay(self, overrides: RawJsonConfig) -> RawJsonConfig {
        macro_rules! pick {
            ($($field:ident),* $(,)?) => {
                RawJsonConfig { $($field: overrides.$field.or(self.$field),)* }
            };
        }
        pick!(
            sid, host, port, instance_id, user, password, password_secret, hdbuserstore_key,
            disk, disk_zone, project, instance_name, snapshot_name, group_snapshot_name,
            snapshot_type, description, storage_location, labels, source_disk_key_file,
            data_mount, freeze_file_system, abandon_prepared,
            skip_db_snapshot_for_change_disk_type, confirm_data_snapshot_after_create,
            send_status_to_monitoring, group_snapshot, polling,
        )
    }
}

// Application's internal, validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialMode {
    Password { user: String, password: String },
    SecretRef { user: String, secret_name: String },
    UserstoreKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotType {
    Standard,
    Archive,
}

impl SnapshotType {
    pub fn as_api_str(&self) -> &'static str {
        match self {
            SnapshotType::Standard => "STANDARD",
            SnapshotType::Archive => "ARCHIVE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSelection {
    Explicit(Vec<String>),
    Discover,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSpec {
    pub name: Option<String>,
    pub group_name: Option<String>,
    pub snapshot_type: SnapshotType,
    pub description: String,
    pub storage_location: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollingConfig {
    pub creation: BackoffConfig,
    pub upload: BackoffConfig,
    pub call: BackoffConfig,
    pub db_query_timeout: Duration,
    pub api_call_timeout: Duration,
    pub freeze_timeout: Duration,
    pub deadline: Option<Duration>,
}

impl From<JsonPollingConfig> for PollingConfig {
    fn from(raw: JsonPollingConfig) -> Self {
        PollingConfig {
            creation: raw.creation,
            upload: raw.upload,
            call: raw.call,
            db_query_timeout: Duration::from_secs(raw.db_query_timeout_secs),
            api_call_timeout: Duration::from_secs(raw.api_call_timeout_secs),
            freeze_timeout: Duration::from_secs(raw.freeze_timeout_secs),
            deadline: raw.deadline_secs.map(Duration::from_secs),
        }
    }
}

/// Workflow variant selected by the request flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Standard,
    ChangeDiskType,
    GroupSnapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupRequest {
    pub sid: String,
    pub host: String,
    pub port: Option<u16>,
    pub credentials: Option<CredentialMode>,
    pub disks: DiskSelection,
    pub disk_zone: Option<String>,
    pub project: Option<String>,
    pub instance_name: Option<String>,
    pub snapshot: SnapshotSpec,
    pub source_disk_key_file: Option<PathBuf>,
    pub data_mount: PathBuf,
    pub freeze_file_system: bool,
    pub abandon_prepared: bool,
    pub skip_db_snapshot: bool,
    pub confirm_after_create: bool,
    pub send_status_to_monitoring: bool,
    pub group_snapshot: bool,
    pub polling: PollingConfig,
}

impl BackupRequest {
    pub fn mode(&self) -> BackupMode {
        if self.skip_db_snapshot {
            BackupMode::ChangeDiskType
        } else if self.group_snapshot {
            BackupMode::GroupSnapshot
        } else {
            BackupMode::Standard
        }
    }

    /// `<sid>adm`, the OS user owning the instance's client tools.
    pub fn sid_admin_user(&self) -> String {
        format!("{}adm", self.sid.to_lowercase())
    }
}

/// Default SQL port for a two-digit instance number: `3<nn>13`.
pub fn default_port_for_instance(instance_id: &str) -> Result<u16> {
    let valid = instance_id.len() == 2 && instance_id.chars().all(|c| c.is_ascii_digit());
    if !valid {
        return Err(BackupError::Usage(format!(
            "instance_id must be two digits, got '{instance_id}'"
        )));
    }
    format!("3{instance_id}13")
        .parse()
        .map_err(|_| BackupError::Usage(format!("instance_id '{instance_id}' does not map to a port")))
}

fn resource_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]([-a-z0-9]{0,61}[a-z0-9])?$").expect("static regex"))
}

fn sid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9]{0,2}$").expect("static regex"))
}

fn label_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_-]{0,62}$").expect("static regex"))
}

fn label_value_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9_-]{0,63}$").expect("static regex"))
}

pub fn is_valid_resource_name(name: &str) -> bool {
    resource_name_regex().is_match(name)
}

/// Parses `key=value,key2=value2` into a label map.
pub fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| BackupError::Usage(format!("label '{pair}' must be of the form key=value")))?;
        labels.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(labels)
}

fn validate_labels(labels: &BTreeMap<String, String>) -> Result<()> {
    for (key, value) in labels {
        if !label_key_regex().is_match(key) || !label_value_regex().is_match(value) {
            return Err(BackupError::Usage(format!(
                "label '{key}={value}' is not a valid cloud label"
            )));
        }
    }
    Ok(())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn resolve_credentials(raw: &RawJsonConfig, skip_db: bool) -> Result<Option<CredentialMode>> {
    let password = non_empty(&raw.password);
    let secret = non_empty(&raw.password_secret);
    let userstore = non_empty(&raw.hdbuserstore_key);
    let provided = [password.is_some(), secret.is_some(), userstore.is_some()]
        .iter()
        .filter(|set| **set)
        .count();

    if provided > 1 {
        return Err(BackupError::Usage(
            "only one of password, password_secret or hdbuserstore_key may be set".to_string(),
        ));
    }
    if provided == 0 {
        if skip_db {
            return Ok(None);
        }
        return Err(BackupError::Usage(
            "one of password, password_secret or hdbuserstore_key must be set".to_string(),
        ));
    }

    if let Some(key) = userstore {
        return Ok(Some(CredentialMode::UserstoreKey(key)));
    }
    let user = non_empty(&raw.user)
        .ok_or_else(|| BackupError::Usage("user must be set when authenticating with a password".to_string()))?;
    match (password, secret) {
        (Some(password), _) => Ok(Some(CredentialMode::Password { user, password })),
        (None, Some(secret_name)) => Ok(Some(CredentialMode::SecretRef { user, secret_name })),
        (None, None) => Err(BackupError::Usage("no credential mode resolved".to_string())),
    }
}

/// Validates the merged raw parameters and builds the immutable request.
pub fn build_backup_request(raw: &RawJsonConfig) -> Result<BackupRequest> {
    let sid = non_empty(&raw.sid).ok_or_else(|| BackupError::Usage("sid must be set".to_string()))?;
    if !sid_regex().is_match(&sid) {
        return Err(BackupError::Usage(format!(
            "sid '{sid}' must be one to three alphanumerics, starting with a letter"
        )));
    }
    let sid = sid.to_uppercase();

    let skip_db = raw.skip_db_snapshot_for_change_disk_type.unwrap_or(false);
    let group_snapshot = raw.group_snapshot.unwrap_or(false);
    if skip_db && group_snapshot {
        return Err(BackupError::Usage(
            "group_snapshot cannot be combined with skip_db_snapshot_for_change_disk_type".to_string(),
        ));
    }

    let credentials = resolve_credentials(raw, skip_db)?;

    let port = match (raw.port, non_empty(&raw.instance_id)) {
        (Some(port), _) => Some(port),
        (None, Some(instance_id)) => Some(default_port_for_instance(&instance_id)?),
        (None, None) => None,
    };
    let needs_port = matches!(
        credentials,
        Some(CredentialMode::Password { .. }) | Some(CredentialMode::SecretRef { .. })
    );
    if needs_port && port.is_none() {
        return Err(BackupError::Usage(
            "port or instance_id must be set when authenticating with a password".to_string(),
        ));
    }

    let disks = match non_empty(&raw.disk) {
        Some(list) => DiskSelection::Explicit(
            list.split(',').map(str::trim).filter(|d| !d.is_empty()).map(String::from).collect(),
        ),
        None => DiskSelection::Discover,
    };

    let name = non_empty(&raw.snapshot_name);
    let group_name = non_empty(&raw.group_snapshot_name);
    for candidate in name.iter().chain(group_name.iter()) {
        if !is_valid_resource_name(candidate) {
            return Err(BackupError::Usage(format!(
                "'{candidate}' is not a valid snapshot name; use lowercase letters, digits and hyphens"
            )));
        }
    }

    let snapshot_type = match non_empty(&raw.snapshot_type).map(|t| t.to_uppercase()).as_deref() {
        None | Some("STANDARD") => SnapshotType::Standard,
        Some("ARCHIVE") => SnapshotType::Archive,
        Some(other) => {
            return Err(BackupError::Usage(format!(
                "snapshot_type must be STANDARD or ARCHIVE, got '{other}'"
            )));
        }
    };

    let labels = raw.labels.clone().unwrap_or_default();
    validate_labels(&labels)?;

    let description = non_empty(&raw.description)
        .unwrap_or_else(|| format!("Data snapshot of SAP HANA system {sid}"));

    Ok(BackupRequest {
        host: non_empty(&raw.host).unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port,
        credentials,
        disks,
        disk_zone: non_empty(&raw.disk_zone),
        project: non_empty(&raw.project),
        instance_name: non_empty(&raw.instance_name),
        snapshot: SnapshotSpec {
            name,
            group_name,
            snapshot_type,
            description,
            storage_location: non_empty(&raw.storage_location),
            labels,
        },
        source_disk_key_file: raw.source_disk_key_file.clone(),
        data_mount: raw
            .data_mount
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_MOUNT)),
        freeze_file_system: raw.freeze_file_system.unwrap_or(false),
        abandon_prepared: raw.abandon_prepared.unwrap_or(false),
        skip_db_snapshot: skip_db,
        confirm_after_create: raw.confirm_data_snapshot_after_create.unwrap_or(false),
        send_status_to_monitoring: raw.send_status_to_monitoring.unwrap_or(false),
        group_snapshot,
        polling: raw.polling.clone().unwrap_or_default().into(),
        sid,
    })
}
