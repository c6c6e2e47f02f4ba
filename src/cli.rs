// hanadiskbackup/src/cli.rs
use clap::Parser;
use std::path::PathBuf;

use crate::config::{RawJsonConfig, parse_labels};
use crate::errors::{BackupError, Result};

/// Application-consistent disk snapshot backup of an SAP HANA system.
#[derive(Parser, Debug)]
#[command(name = "hanadiskbackup", version)]
#[command(about = "Coordinates a HANA data snapshot with a filesystem freeze and a cloud disk snapshot", long_about = None)]
pub struct Cli {
    /// JSON parameter file; flags given here win over its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    #[arg(long)]
    pub sid: Option<String>,
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// Two-digit instance number; the SQL port defaults to 3<nn>13.
    #[arg(long)]
    pub instance_id: Option<String>,

    #[arg(long)]
    pub user: Option<String>,
    #[arg(long, env = "HANADISKBACKUP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    /// Secret manager secret holding the password.
    #[arg(long)]
    pub password_secret: Option<String>,
    #[arg(long)]
    pub hdbuserstore_key: Option<String>,

    /// Disk name, or a comma-separated list in group mode. Discovered from
    /// the data mount when omitted.
    #[arg(long)]
    pub disk: Option<String>,
    #[arg(long)]
    pub disk_zone: Option<String>,
    #[arg(long)]
    pub project: Option<String>,
    #[arg(long)]
    pub instance_name: Option<String>,
    #[arg(long)]
    pub data_mount: Option<PathBuf>,

    #[arg(long)]
    pub snapshot_name: Option<String>,
    #[arg(long)]
    pub group_snapshot_name: Option<String>,
    /// STANDARD or ARCHIVE.
    #[arg(long)]
    pub snapshot_type: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long)]
    pub storage_location: Option<String>,
    /// key=value,key2=value2
    #[arg(long)]
    pub labels: Option<String>,
    /// Customer-supplied encryption key file.
    #[arg(long)]
    pub source_disk_key_file: Option<PathBuf>,

    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub freeze_file_system: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub abandon_prepared: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub skip_db_snapshot_for_change_disk_type: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub confirm_data_snapshot_after_create: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub send_status_to_monitoring: Option<bool>,
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub group_snapshot: Option<bool>,
}

impl Cli {
    /// The flags in config-file shape, ready to be overlaid on the file.
    pub fn to_raw_config(&self) -> Result<RawJsonConfig> {
        let labels = self.labels.as_deref().map(parse_labels).transpose()?;
        Ok(RawJsonConfig {
            sid: self.sid.clone(),
            host: self.host.clone(),
            port: self.port,
            instance_id: self.instance_id.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            password_secret: self.password_secret.clone(),
            hdbuserstore_key: self.hdbuserstore_key.clone(),
            disk: self.disk.clone(),
            disk_zone: self.disk_zone.clone(),
            project: self.project.clone(),
            instance_name: self.instance_name.clone(),
            snapshot_name: self.snapshot_name.clone(),
            group_snapshot_name: self.group_snapshot_name.clone(),
            snapshot_type: self.snapshot_type.clone(),
            description: self.description.clone(),
            storage_location: self.storage_location.clone(),
            labels,
            source_disk_key_file: self.source_disk_key_file.clone(),
            data_mount: self.data_mount.clone(),
            freeze_file_system: self.freeze_file_system,
            abandon_prepared: self.abandon_prepared,
            skip_db_snapshot_for_change_disk_type: self.skip_db_snapshot_for_change_disk_type,
            confirm_data_snapshot_after_create: self.confirm_data_snapshot_after_create,
            send_status_to_monitoring: self.send_status_to_monitoring,
            group_snapshot: self.group_snapshot,
            polling: None,
        })
    }

    /// Config file (if any) overlaid with the flags.
    pub fn merged_config(&self) -> Result<RawJsonConfig> {
        let flags = self.to_raw_config()?;
        match &self.config {
            Some(path) => {
                let file = RawJsonConfig::load_from_json(path).map_err(|e| BackupError::Usage(format!("{e:#}")))?;
                Ok(file.overlay(flags))
            }
            None => Ok(flags),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boolean_flags_accept_bare_and_explicit_values() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "hanadiskbackup",
            "--sid",
            "HDB",
            "--freeze-file-system",
            "--abandon-prepared=false",
            "--labels",
            "env=prod,team=basis",
        ])?;
        let raw = cli.to_raw_config()?;
        assert_eq!(raw.freeze_file_system, Some(true));
        assert_eq!(raw.abandon_prepared, Some(false));
        assert_eq!(raw.group_snapshot, None);
        assert_eq!(raw.labels.as_ref().and_then(|l| l.get("team")).map(String::as_str), Some("basis"));
        Ok(())
    }

    #[test]
    fn test_flags_override_config_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"sid": "ABC", "disk": "hana-data", "freeze_file_system": true}"#)?;
        let cli = Cli::try_parse_from([
            "hanadiskbackup",
            "--config",
            path.to_str().unwrap_or_default(),
            "--sid",
            "HDB",
        ])?;
        let raw = cli.merged_config()?;
        assert_eq!(raw.sid.as_deref(), Some("HDB"));
        assert_eq!(raw.disk.as_deref(), Some("hana-data"));
        assert_eq!(raw.freeze_file_system, Some(true));
        Ok(())
    }

    #[test]
    fn test_malformed_labels_are_a_usage_error() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["hanadiskbackup", "--labels", "novalue"])?;
        assert!(cli.to_raw_config().unwrap_err().is_usage());
        Ok(())
    }
}
