// hanadiskbackup/src/discovery/mod.rs
//! Resolves which cloud disks back the database data mount: mount table,
//! then block-device stacking, then the cloud device-name symlinks.

use anyhow::{Context, Result as AnyResult, bail};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cloud::{InstanceContext, InstanceService};
use crate::errors::{BackupError, Result};

const GOOGLE_DEVICE_PREFIX: &str = "google-";

#[async_trait]
pub trait DiskDiscovery: Send + Sync {
    async fn data_disks(&self, instance: &InstanceContext) -> Result<Vec<String>>;
}

/// Filesystem roots read during discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryRoots {
    pub proc_mounts: PathBuf,
    pub sys_block: PathBuf,
    pub by_id: PathBuf,
}

impl Default for DiscoveryRoots {
    fn default() -> Self {
        Self {
            proc_mounts: PathBuf::from("/proc/mounts"),
            sys_block: PathBuf::from("/sys/class/block"),
            by_id: PathBuf::from("/dev/disk/by-id"),
        }
    }
}

pub struct MountDiscovery<'a> {
    instances: &'a dyn InstanceService,
    mount: PathBuf,
    roots: DiscoveryRoots,
}

impl<'a> MountDiscovery<'a> {
    pub fn new(instances: &'a dyn InstanceService, mount: &Path, roots: DiscoveryRoots) -> Self {
        Self {
            instances,
            mount: mount.to_path_buf(),
            roots,
        }
    }

    /// Cloud device names (without the `google-` prefix) backing the mount.
    pub fn device_names(&self) -> AnyResult<Vec<String>> {
        let source = mount_source(&self.roots.proc_mounts, &self.mount)?;
        let device = fs::canonicalize(&source)
            .with_context(|| format!("Failed to resolve mount source {}", source.display()))?;
        let block = file_name(&device)?;
        let mut leaves = BTreeSet::new();
        backing_devices(&self.roots.sys_block, &block, &mut leaves, 0)?;
        debug!(mount = %self.mount.display(), ?leaves, "Backing block devices");

        let mut names = Vec::new();
        for leaf in &leaves {
            names.push(google_device_name(&self.roots.by_id, leaf)?);
        }
        Ok(names)
    }
}

#[async_trait]
impl DiskDiscovery for MountDiscovery<'_> {
    async fn data_disks(&self, instance: &InstanceContext) -> Result<Vec<String>> {
        let device_names = self
            .device_names()
            .map_err(|e| BackupError::Precondition(format!("Cannot discover data disks: {e:#}")))?;
        let attached = self.instances.attached_disks(instance).await?;
        let mut disks = Vec::new();
        for device in &device_names {
            let disk = attached
                .iter()
                .find(|a| &a.device_name == device)
                .ok_or_else(|| {
                    BackupError::Precondition(format!(
                        "device {device} backing {} is not attached to {}",
                        self.mount.display(),
                        instance.instance_name
                    ))
                })?;
            disks.push(disk.disk_name.clone());
        }
        disks.sort();
        disks.dedup();
        info!(mount = %self.mount.display(), disks = ?disks, "Discovered data disks");
        Ok(disks)
    }
}

fn file_name(path: &Path) -> AnyResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
        .with_context(|| format!("Invalid device path {}", path.display()))
}

/// `/proc/mounts` escapes whitespace in paths as octal.
fn unescape_mount_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Source device of the last mount over `mount`.
pub fn mount_source(proc_mounts: &Path, mount: &Path) -> AnyResult<PathBuf> {
    let table = fs::read_to_string(proc_mounts)
        .with_context(|| format!("Failed to read mount table {}", proc_mounts.display()))?;
    let wanted = mount.to_string_lossy();
    let wanted = wanted.trim_end_matches('/');
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = unescape_mount_field(fields.next()?);
            (target.trim_end_matches('/') == wanted).then(|| PathBuf::from(unescape_mount_field(source)))
        })
        .last()
        .with_context(|| format!("{} is not a mount point", mount.display()))
}

/// Leaf block devices under `block`: device-mapper and md devices expand
/// through `slaves/`, partitions map to their parent disk.
fn backing_devices(sys_block: &Path, block: &str, out: &mut BTreeSet<String>, depth: usize) -> AnyResult<()> {
    if depth > 8 {
        bail!("Block device stack under {block} is too deep");
    }
    let entry = sys_block.join(block);
    let slaves = entry.join("slaves");
    if slaves.is_dir() {
        let mut children = Vec::new();
        for child in fs::read_dir(&slaves).with_context(|| format!("Failed to list {}", slaves.display()))? {
            children.push(child?.file_name().to_string_lossy().into_owned());
        }
        if !children.is_empty() {
            for child in children {
                backing_devices(sys_block, &child, out, depth + 1)?;
            }
            return Ok(());
        }
    }
    if entry.join("partition").exists() {
        let resolved = fs::canonicalize(&entry)
            .with_context(|| format!("Failed to resolve {}", entry.display()))?;
        let parent = resolved
            .parent()
            .with_context(|| format!("Partition {block} has no parent device"))?;
        out.insert(file_name(parent)?);
        return Ok(());
    }
    out.insert(block.to_string());
    Ok(())
}

/// Finds the `google-<name>` symlink that resolves to `block`.
fn google_device_name(by_id: &Path, block: &str) -> AnyResult<String> {
    for entry in fs::read_dir(by_id).with_context(|| format!("Failed to list {}", by_id.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(device) = name.strip_prefix(GOOGLE_DEVICE_PREFIX) else {
            continue;
        };
        if device.contains("-part") {
            continue;
        }
        let Ok(target) = fs::canonicalize(entry.path()) else {
            continue;
        };
        if target.file_name().and_then(|n| n.to_str()) == Some(block) {
            return Ok(device.to_string());
        }
    }
    bail!("No {GOOGLE_DEVICE_PREFIX}* device link points to {block}")
}
