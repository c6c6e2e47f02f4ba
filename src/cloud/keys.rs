// hanadiskbackup/src/cloud/keys.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use super::EncryptionKey;
use crate::utils::resource_name;

/// One entry of a customer-supplied encryption key file.
#[derive(Debug, Clone, Deserialize)]
pub struct KeyFileEntry {
    pub uri: String,
    pub key: String,
    #[serde(rename = "key-type")]
    pub key_type: String,
}

pub fn load_key_file(path: &Path) -> Result<Vec<KeyFileEntry>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read encryption key file at {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse encryption key file at {}", path.display()))
}

/// Looks up the key for a disk. Entries match on the full URI (self-link
/// suffix) or, failing that, on the disk name alone.
pub fn key_for_disk(entries: &[KeyFileEntry], self_link: &str, disk_name: &str) -> Result<Option<EncryptionKey>> {
    let entry = entries
        .iter()
        .find(|e| !self_link.is_empty() && (self_link.ends_with(&e.uri) || e.uri.ends_with(self_link)))
        .or_else(|| entries.iter().find(|e| resource_name(&e.uri) == disk_name));
    let Some(entry) = entry else {
        return Ok(None);
    };
    match entry.key_type.as_str() {
        "raw" => Ok(Some(EncryptionKey::Raw(entry.key.clone()))),
        "rsa-encrypted" => Ok(Some(EncryptionKey::RsaWrapped(entry.key.clone()))),
        other => anyhow::bail!("Unsupported key-type '{other}' for {}", entry.uri),
    }
}
