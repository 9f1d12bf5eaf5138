use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::dump::DatabaseKind;

/// S3-compatible object storage settings. All fields are required except the
/// key prefix and the presigned-URL lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub endpoint_url: String,
    pub region: String,
    pub bucket_name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default = "default_url_ttl_secs")]
    pub url_ttl_secs: u64,
}

fn default_url_ttl_secs() -> u64 {
    3600
}

/// One validated backup request, as handed over by the (out-of-scope)
/// request surface. An absent `schedule` means "run once now"; a present
/// cron expression means "register with the scheduler".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRequest {
    pub kind: DatabaseKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Subject database name; doubles as the human-readable job label.
    pub database: String,
    #[serde(default)]
    pub require_tls: bool,
    pub storage: StorageSettings,
    #[serde(default)]
    pub schedule: Option<String>,
}

impl BackupRequest {
    /// Schedule identity: one live timer per kind + host + subject.
    pub fn schedule_identity(&self) -> String {
        format!("{}:{}:{}", self.kind.as_str(), self.host, self.database)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_record_store_path")]
    pub record_store_path: PathBuf,
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    pub request: BackupRequest,
}

fn default_record_store_path() -> PathBuf {
    PathBuf::from("./jobs.json")
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("./spool")
}

impl AppSettings {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let settings: AppSettings = serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;

        if settings.request.database.trim().is_empty() {
            anyhow::bail!("request.database cannot be empty in {}", config_path.display());
        }
        if settings.request.storage.bucket_name.trim().is_empty() {
            anyhow::bail!(
                "request.storage.bucket_name cannot be empty in {}",
                config_path.display()
            );
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_config(database: &str, bucket: &str) -> String {
        format!(
            r#"{{
                "request": {{
                    "kind": "postgresql",
                    "host": "db.internal",
                    "port": 5432,
                    "username": "backup",
                    "password": "hunter2",
                    "database": "{database}",
                    "require_tls": true,
                    "storage": {{
                        "endpoint_url": "http://minio:9000",
                        "region": "us-east-1",
                        "bucket_name": "{bucket}",
                        "access_key_id": "AK",
                        "secret_access_key": "SK"
                    }},
                    "schedule": "0 0 3 * * *"
                }}
            }}"#
        )
    }

    fn write_config(contents: &str) -> anyhow::Result<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(contents.as_bytes())?;
        Ok(file)
    }

    #[test]
    fn test_load_settings_with_defaults() -> anyhow::Result<()> {
        let file = write_config(&sample_config("appdb", "backups"))?;
        let settings = AppSettings::load_from_json(file.path())?;

        assert_eq!(settings.record_store_path, PathBuf::from("./jobs.json"));
        assert_eq!(settings.spool_dir, PathBuf::from("./spool"));
        assert_eq!(settings.request.database, "appdb");
        assert_eq!(settings.request.storage.url_ttl_secs, 3600);
        assert_eq!(settings.request.schedule.as_deref(), Some("0 0 3 * * *"));
        Ok(())
    }

    #[test]
    fn test_empty_database_rejected() -> anyhow::Result<()> {
        let file = write_config(&sample_config("", "backups"))?;
        assert!(AppSettings::load_from_json(file.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_empty_bucket_rejected() -> anyhow::Result<()> {
        let file = write_config(&sample_config("appdb", ""))?;
        assert!(AppSettings::load_from_json(file.path()).is_err());
        Ok(())
    }

    #[test]
    fn test_schedule_identity_format() {
        let file = write_config(&sample_config("appdb", "backups")).unwrap();
        let settings = AppSettings::load_from_json(file.path()).unwrap();
        assert_eq!(
            settings.request.schedule_identity(),
            "postgresql:db.internal:appdb"
        );
    }
}
