mod logic;

#[cfg(test)]
pub(crate) mod fakes;

pub use logic::{BackupServices, check_supported_os};

use logic::BackupOrchestrator;

use tokio_util::sync::CancellationToken;

use crate::cloud::InstanceContext;
use crate::config::BackupRequest;
use crate::status::BackupOutcome;

/// Public entry point for the backup process. Never fails: the outcome
/// carries the error, any cleanup failures and the timings.
pub async fn run_backup_flow(
    request: &BackupRequest,
    instance: InstanceContext,
    services: BackupServices<'_>,
    cancel: CancellationToken,
) -> BackupOutcome {
    BackupOrchestrator::new(request, instance, services, cancel).run().await
}
