// hanadiskbackup/src/database/hdbsql.rs
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{DatabaseConnector, DatabaseOpener};
use crate::cloud::gce::GceClient;
use crate::config::{BackupRequest, CredentialMode};
use crate::errors::{BackupError, Result, Service};
use crate::utils::find_executable;

/// Single-quotes a value for `sh -c`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// First field of the first non-empty line of `hdbsql -a -x` output.
pub(crate) fn parse_scalar(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split(',').next())
        .map(|field| field.trim().trim_matches('"').to_string())
        .filter(|field| !field.is_empty())
}

/// How hdbsql is launched.
#[derive(Clone)]
enum Launch {
    /// Connection parameters on the command line.
    Direct {
        binary: PathBuf,
        target: String,
        user: String,
        password: String,
    },
    /// Userstore keys live in the instance admin's secure store, so the
    /// client runs in that user's login shell.
    AsSidAdmin { os_user: String, key: String },
}

impl fmt::Debug for Launch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Launch::Direct { binary, target, user, .. } => f
                .debug_struct("Direct")
                .field("binary", binary)
                .field("target", target)
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
            Launch::AsSidAdmin { os_user, key } => f
                .debug_struct("AsSidAdmin")
                .field("os_user", os_user)
                .field("key", key)
                .finish(),
        }
    }
}

/// Runs statements through the `hdbsql` command-line client.
#[derive(Debug)]
pub struct HdbsqlConnector {
    launch: Launch,
}

impl HdbsqlConnector {
    /// hdbsql only takes a password through `-p`, so it is visible in the
    /// process table while a statement runs. Use a userstore key where
    /// local users are not trusted.
    pub fn with_password(host: &str, port: u16, user: &str, password: &str) -> Result<Self> {
        let binary = find_executable("hdbsql").map_err(|e| BackupError::Precondition(e.to_string()))?;
        warn!(user, "hdbsql takes the password on its command line; prefer hdbuserstore_key");
        Ok(Self::direct(binary, host, port, user, password))
    }

    fn direct(binary: PathBuf, host: &str, port: u16, user: &str, password: &str) -> Self {
        Self {
            launch: Launch::Direct {
                binary,
                target: format!("{host}:{port}"),
                user: user.to_string(),
                password: password.to_string(),
            },
        }
    }

    pub fn with_userstore_key(os_user: &str, key: &str) -> Self {
        Self {
            launch: Launch::AsSidAdmin {
                os_user: os_user.to_string(),
                key: key.to_string(),
            },
        }
    }

    fn command(&self, statement: &str) -> Command {
        match &self.launch {
            Launch::Direct {
                binary,
                target,
                user,
                password,
            } => {
                let mut cmd = Command::new(binary);
                cmd.args(["-n", target.as_str(), "-u", user.as_str(), "-p", password.as_str()])
                    .args(["-a", "-x", "-j"])
                    .arg(statement);
                cmd
            }
            Launch::AsSidAdmin { os_user, key } => {
                let script = format!("hdbsql -U {} -a -x -j {}", shell_quote(key), shell_quote(statement));
                let mut cmd = Command::new("su");
                cmd.args(["-", os_user.as_str(), "-c", script.as_str()]);
                cmd
            }
        }
    }

    async fn run(&self, statement: &str) -> Result<String> {
        debug!(statement, "Running hdbsql");
        let output = self
            .command(statement)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackupError::external(Service::Database, format!("Failed to execute hdbsql: {e}")))?;
        if !output.status.success() {
            return Err(BackupError::external(
                Service::Database,
                format!(
                    "hdbsql failed with status: {}\nStdout: {}\nStderr: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stdout).trim(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DatabaseConnector for HdbsqlConnector {
    async fn query_scalar(&self, statement: &str) -> Result<Option<String>> {
        Ok(parse_scalar(&self.run(statement).await?))
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        self.run(statement).await.map(|_| ())
    }
}

/// Opens hdbsql connections, resolving secret-manager passwords first.
pub struct HdbsqlOpener {
    secrets: Option<Arc<GceClient>>,
    project: String,
}

impl HdbsqlOpener {
    pub fn new(secrets: Option<Arc<GceClient>>, project: String) -> Self {
        Self { secrets, project }
    }
}

#[async_trait]
impl DatabaseOpener for HdbsqlOpener {
    async fn open(&self, request: &BackupRequest) -> Result<Box<dyn DatabaseConnector>> {
        let connector = match &request.credentials {
            Some(CredentialMode::UserstoreKey(key)) => {
                HdbsqlConnector::with_userstore_key(&request.sid_admin_user(), key)
            }
            Some(CredentialMode::Password { user, password }) => {
                HdbsqlConnector::with_password(&request.host, port_of(request)?, user, password)?
            }
            Some(CredentialMode::SecretRef { user, secret_name }) => {
                let secrets = self.secrets.as_ref().ok_or_else(|| {
                    BackupError::Usage("password_secret requires access to the secret manager".to_string())
                })?;
                let password = secrets.access_secret(&self.project, secret_name).await?;
                HdbsqlConnector::with_password(&request.host, port_of(request)?, user, &password)?
            }
            None => {
                return Err(BackupError::Usage("no database credentials configured".to_string()));
            }
        };
        connector.query_scalar("SELECT 1 FROM DUMMY").await?;
        info!(sid = %request.sid, "Connected to database");
        Ok(Box::new(connector))
    }
}

fn port_of(request: &BackupRequest) -> Result<u16> {
    request
        .port
        .ok_or_else(|| BackupError::Usage("port or instance_id must be set".to_string()))
}
