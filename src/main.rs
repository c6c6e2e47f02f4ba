//! HANA Disk Snapshot Backup Tool
//!
//! Takes an application-consistent snapshot of the disks under a HANA data
//! volume, bracketed by a database data snapshot and an optional
//! filesystem freeze.

// hanadiskbackup/src/main.rs
mod backup;
mod cli;
mod cloud;
mod config;
mod database;
mod discovery;
mod errors;
mod filesystem;
mod status;
mod utils;

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use backup::{BackupServices, check_supported_os, run_backup_flow};
use cli::Cli;
use cloud::gce::GceClient;
use cloud::metadata::MetadataClient;
use cloud::InstanceContext;
use config::{BackupRequest, build_backup_request};
use database::hdbsql::HdbsqlOpener;
use discovery::{DiscoveryRoots, MountDiscovery};
use errors::Result;
use filesystem::{FilesystemControl, FsFreeze};
use status::{BackupOutcome, CloudMonitoringEmitter, MetricsEmitter, StatusReporter};

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run_app(&cli).await {
        Ok(outcome) if outcome.success => {
            println!("✅ {}", outcome.message());
            ExitCode::SUCCESS
        }
        Ok(outcome) => {
            eprintln!("❌ {}", outcome.message());
            outcome.error.as_ref().map_or(ExitCode::FAILURE, |e| e.exit_code())
        }
        Err(e) => {
            eprintln!("❌ Error: {e}");
            e.exit_code()
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn run_app(cli: &Cli) -> Result<BackupOutcome> {
    let raw = cli.merged_config()?;
    let request = build_backup_request(&raw)?;
    check_supported_os()?;

    let started = Instant::now();
    match run_on_instance(&request).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            error!(sid = %request.sid, error = %e, "Backup could not start");
            let outcome = BackupOutcome::failed(&request.sid, started.elapsed(), e);
            StatusReporter::new(None).report(&outcome).await;
            Ok(outcome)
        }
    }
}

async fn run_on_instance(request: &BackupRequest) -> Result<BackupOutcome> {
    let metadata = Arc::new(MetadataClient::new()?);
    let gce = Arc::new(GceClient::new(metadata.clone())?);
    let instance = resolve_instance(&metadata, request).await?;

    let opener = HdbsqlOpener::new(Some(gce.clone()), instance.project.clone());
    // A missing fsfreeze is rejected by the workflow, which reports it.
    let fsfreeze = if request.freeze_file_system {
        FsFreeze::locate()
            .inspect_err(|e| warn!(error = %e, "fsfreeze not found"))
            .ok()
    } else {
        None
    };
    let discovery = MountDiscovery::new(gce.as_ref(), &request.data_mount, DiscoveryRoots::default());
    let emitter = if request.send_status_to_monitoring {
        monitoring_emitter(&metadata, &gce, &instance).await
    } else {
        None
    };

    let services = BackupServices {
        database: &opener,
        disks: gce.as_ref(),
        groups: gce.as_ref(),
        instances: gce.as_ref(),
        discovery: &discovery,
        filesystem: fsfreeze.as_ref().map(|f| f as &dyn FilesystemControl),
        metrics: emitter.as_ref().map(|e| e as &dyn MetricsEmitter),
    };

    let cancel = CancellationToken::new();
    let watcher = watch_for_cancellation(cancel.clone(), request.polling.deadline);
    let outcome = run_backup_flow(request, instance, services, cancel).await;
    watcher.abort();
    Ok(outcome)
}

/// The current instance, with any project or instance name given in the
/// request taking precedence.
async fn resolve_instance(metadata: &MetadataClient, request: &BackupRequest) -> Result<InstanceContext> {
    let current = metadata.instance_context().await?;
    let instance = InstanceContext {
        project: request.project.clone().unwrap_or(current.project),
        zone: current.zone,
        instance_name: request.instance_name.clone().unwrap_or(current.instance_name),
    };
    info!(project = %instance.project, zone = %instance.zone, instance = %instance.instance_name, "Running on instance");
    Ok(instance)
}

/// Telemetry is best effort, so a failed identity lookup only disables it.
async fn monitoring_emitter(
    metadata: &MetadataClient,
    gce: &Arc<GceClient>,
    instance: &InstanceContext,
) -> Option<CloudMonitoringEmitter> {
    match metadata.instance_id().await {
        Ok(id) => Some(CloudMonitoringEmitter::new(
            gce.clone(),
            instance.project.clone(),
            id,
            instance.zone.clone(),
        )),
        Err(e) => {
            warn!(error = %e, "Cannot read instance id; status metrics disabled");
            None
        }
    }
}

/// Cancels the workflow on Ctrl-C or when the deadline passes.
fn watch_for_cancellation(cancel: CancellationToken, deadline: Option<Duration>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let elapsed = async {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("Interrupt received, cancelling backup"),
            _ = elapsed => warn!(?deadline, "Workflow deadline passed, cancelling backup"),
            _ = cancel.cancelled() => return,
        }
        cancel.cancel();
    })
}
