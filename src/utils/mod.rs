pub mod backoff;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use which::which;

/// Finds an executable in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).with_context(|| {
        format!("{name} executable not found in PATH. Please ensure it is installed and in your PATH.")
    })
}

/// Timestamp suffix used in derived snapshot names, e.g. `20240131-235959`.
pub fn name_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d-%H%M%S").to_string()
}

/// Last path segment of a resource self-link or URI.
pub fn resource_name(link: &str) -> &str {
    link.trim_end_matches('/').rsplit('/').next().unwrap_or(link)
}
