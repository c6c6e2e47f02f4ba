//! Backup-catalog commands that bracket an external data snapshot.

pub mod hdbsql;

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::BackupRequest;
use crate::errors::{BackupError, Result, Service};
use crate::utils::backoff::with_timeout;

const PREPARED_SNAPSHOT_QUERY: &str = "SELECT BACKUP_ID FROM M_BACKUP_CATALOG \
     WHERE ENTRY_TYPE_NAME = 'data snapshot' AND STATE_NAME = 'prepared'";

/// Executes single statements against the database.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    /// First column of the first row, if the statement returned any.
    async fn query_scalar(&self, statement: &str) -> Result<Option<String>>;
    async fn execute(&self, statement: &str) -> Result<()>;
}

/// Establishes a verified connection for a request.
#[async_trait]
pub trait DatabaseOpener: Send + Sync {
    async fn open(&self, request: &BackupRequest) -> Result<Box<dyn DatabaseConnector>>;
}

/// A prepared data snapshot inside the database. Holding one blocks any
/// other snapshot until it is confirmed or abandoned.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSnapshotToken {
    backup_id: String,
}

impl DbSnapshotToken {
    pub fn backup_id(&self) -> &str {
        &self.backup_id
    }
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn valid_backup_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_digit())
}

/// Create / confirm / abandon of a database data snapshot. Every failure
/// propagates; nothing is swallowed here.
pub struct DbSnapshotController<'a> {
    conn: &'a dyn DatabaseConnector,
    timeout: Duration,
}

impl<'a> DbSnapshotController<'a> {
    pub fn new(conn: &'a dyn DatabaseConnector, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    async fn query(&self, statement: &str) -> Result<Option<String>> {
        with_timeout(Service::Database, self.timeout, "database query", self.conn.query_scalar(statement)).await
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        with_timeout(Service::Database, self.timeout, "database statement", self.conn.execute(statement)).await
    }

    /// Token of a snapshot already prepared in the catalog, if any.
    pub async fn prepared_snapshot(&self) -> Result<Option<DbSnapshotToken>> {
        match self.query(PREPARED_SNAPSHOT_QUERY).await? {
            Some(id) if valid_backup_id(&id) => Ok(Some(DbSnapshotToken { backup_id: id })),
            Some(id) => Err(BackupError::external(
                Service::Database,
                format!("unexpected BACKUP_ID '{id}' in backup catalog"),
            )),
            None => Ok(None),
        }
    }

    /// Clears the way for a new data snapshot. An existing prepared
    /// snapshot is abandoned only when `abandon_prepared` is set.
    pub async fn clear_prepared(&self, abandon_prepared: bool) -> Result<()> {
        let Some(existing) = self.prepared_snapshot().await? else {
            return Ok(());
        };
        if !abandon_prepared {
            return Err(BackupError::external(
                Service::Database,
                format!(
                    "data snapshot {} is already prepared; set abandon_prepared to discard it",
                    existing.backup_id
                ),
            ));
        }
        warn!(backup_id = %existing.backup_id, "Abandoning previously prepared data snapshot");
        self.abandon(&existing, "abandoned before taking a new snapshot").await
    }

    /// Issues CREATE SNAPSHOT and reads the new token back from the catalog.
    pub async fn create_snapshot(&self, comment: &str) -> Result<DbSnapshotToken> {
        self.execute(&format!(
            "BACKUP DATA FOR FULL SYSTEM CREATE SNAPSHOT COMMENT {}",
            sql_literal(comment)
        ))
        .await?;

        let token = self.prepared_snapshot().await?.ok_or_else(|| {
            BackupError::external(
                Service::Database,
                "snapshot was created but no prepared entry appeared in the backup catalog",
            )
        })?;
        info!(backup_id = %token.backup_id, "Database data snapshot prepared");
        Ok(token)
    }

    /// Marks the snapshot successful, recording the external snapshot name.
    pub async fn confirm(&self, token: &DbSnapshotToken, external_id: &str) -> Result<()> {
        self.execute(&format!(
            "BACKUP DATA FOR FULL SYSTEM CLOSE SNAPSHOT BACKUP_ID {} SUCCESSFUL {}",
            token.backup_id,
            sql_literal(external_id)
        ))
        .await?;
        info!(backup_id = %token.backup_id, external_id, "Database data snapshot confirmed");
        Ok(())
    }

    pub async fn abandon(&self, token: &DbSnapshotToken, reason: &str) -> Result<()> {
        self.execute(&format!(
            "BACKUP DATA FOR FULL SYSTEM CLOSE SNAPSHOT BACKUP_ID {} UNSUCCESSFUL {}",
            token.backup_id,
            sql_literal(reason)
        ))
        .await?;
        info!(backup_id = %token.backup_id, reason, "Database data snapshot abandoned");
        Ok(())
    }
}
