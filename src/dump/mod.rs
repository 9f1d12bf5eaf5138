use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::BackupRequest;
use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgresql,
    Mysql,
    Mongodb,
}

impl DatabaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseKind::Postgresql => "postgresql",
            DatabaseKind::Mysql => "mysql",
            DatabaseKind::Mongodb => "mongodb",
        }
    }
}

/// Resolved external-process description for one dump run. Owned by a single
/// execution and discarded when it ends.
#[derive(Debug, Clone)]
pub struct DumpInvocation {
    /// Program name; PATH lookup happens at spawn time, not here.
    pub program: String,
    pub args: Vec<String>,
    /// Environment overlay. The secret credential travels here, never in
    /// `args`, so it is not visible in process listings.
    pub env: Vec<(String, String)>,
}

/// Maps a database kind + connection parameters to a dump tool invocation
/// that writes the dump payload to stdout and diagnostics to stderr.
/// Pure: no filesystem or network access.
pub fn resolve(request: &BackupRequest) -> Result<DumpInvocation> {
    match request.kind {
        DatabaseKind::Postgresql => {
            let mut env = vec![("PGPASSWORD".to_string(), request.password.clone())];
            if request.require_tls {
                env.push(("PGSSLMODE".to_string(), "require".to_string()));
            }
            Ok(DumpInvocation {
                program: "pg_dump".to_string(),
                args: vec![
                    "--host".to_string(),
                    request.host.clone(),
                    "--port".to_string(),
                    request.port.to_string(),
                    "--username".to_string(),
                    request.username.clone(),
                    "--dbname".to_string(),
                    request.database.clone(),
                    "--format=custom".to_string(),
                    "--no-password".to_string(),
                ],
                env,
            })
        }
        DatabaseKind::Mysql => {
            let mut args = vec![
                "--host".to_string(),
                request.host.clone(),
                "--port".to_string(),
                request.port.to_string(),
                "--user".to_string(),
                request.username.clone(),
                "--single-transaction".to_string(),
                "--quick".to_string(),
                "--routines".to_string(),
                "--triggers".to_string(),
            ];
            if request.require_tls {
                args.push("--ssl-mode=REQUIRED".to_string());
            }
            args.push(request.database.clone());
            Ok(DumpInvocation {
                program: "mysqldump".to_string(),
                args,
                env: vec![("MYSQL_PWD".to_string(), request.password.clone())],
            })
        }
        // mongodump has no environment path for the password; refusing is
        // safer than leaking it through argv.
        DatabaseKind::Mongodb => Err(AppError::UnsupportedKind(
            request.kind.as_str().to_string(),
        )),
    }
}

/// Derives the artifact name the dump is stored under. Set at creation so
/// cancellation and failure paths can still reference the partial artifact.
pub fn artifact_name(subject: &str) -> String {
    format!("{}_{}.dump", subject, Utc::now().format("%Y%m%d_%H%M%S"))
}
