//! Timestamped `mysqldump` backups. Unlike apply, a backup keeps going when
//! one database fails to dump and reports the failures alongside the
//! successes; the run errors only when nothing was backed up at all.

use crate::config::Config;
use crate::mysql::{self, MysqlInvoker};
use crate::snapshot;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub run_id: String,
    pub folder: PathBuf,
    pub dumped: Vec<String>,
    /// (database, error) for each dump that failed.
    pub failed: Vec<(String, String)>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupFolder {
    pub name: String,
    pub created: DateTime<Utc>,
    pub sql_files: usize,
}

/// Backup folder name, e.g. `08_24_2026_03_15_PM`.
fn folder_timestamp() -> String {
    Local::now().format("%m_%d_%Y_%I_%M_%p").to_string()
}

/// Per-dump file name, e.g. `app_20260824_151503.sql`.
fn dump_file_name(db: &str) -> String {
    format!("{db}_{}.sql", Local::now().format("%Y%m%d_%H%M%S"))
}

pub async fn backup_all(invoker: &dyn MysqlInvoker, config: &Config) -> Result<BackupReport> {
    let started = Instant::now();
    let run_id = uuid::Uuid::new_v4().to_string();
    let timeout = Duration::from_secs(config.mysql.command_timeout_secs);

    let databases: Vec<String> = match mysql::list_databases(invoker, timeout).await {
        Ok(all) => all
            .into_iter()
            .filter(|db| !mysql::is_system_database(db))
            .collect(),
        Err(e) => {
            crate::health::mark_component_error("backup", format!("{e:#}"));
            return Err(e);
        }
    };
    if databases.is_empty() {
        crate::health::mark_component_error("backup", "No databases to back up");
        bail!("No databases to back up");
    }

    let folder = config.paths.backup_root.join(folder_timestamp());
    if let Err(e) = std::fs::create_dir_all(&folder) {
        crate::health::mark_component_error("backup", format!("{e:#}"));
        return Err(e)
            .with_context(|| format!("Failed to create backup folder: {}", folder.display()));
    }

    info!(run_id = %run_id, folder = %folder.display(), databases = databases.len(), "starting backup");

    let mut dumped = Vec::new();
    let mut failed = Vec::new();
    for db in databases {
        let out_path = folder.join(dump_file_name(&db));
        match mysql::dump_database(invoker, timeout, &db, &out_path).await {
            Ok(()) => {
                info!(run_id = %run_id, database = %db, file = %out_path.display(), "dumped");
                dumped.push(db);
            }
            Err(e) => {
                error!(run_id = %run_id, database = %db, error = %format!("{e:#}"), "dump failed");
                failed.push((db, format!("{e:#}")));
            }
        }
    }

    if dumped.is_empty() {
        let summary = failed
            .iter()
            .map(|(db, e)| format!("{db}: {e}"))
            .collect::<Vec<_>>()
            .join("; ");
        crate::health::mark_component_error("backup", &summary);
        bail!("No databases were backed up — {summary}");
    }

    let duration = started.elapsed();
    crate::health::mark_component_ok_timed("backup", duration);
    info!(
        run_id = %run_id,
        dumped = dumped.len(),
        failed = failed.len(),
        elapsed_ms = duration.as_millis() as u64,
        "backup complete"
    );

    Ok(BackupReport {
        run_id,
        folder,
        dumped,
        failed,
        duration_ms: duration.as_millis() as u64,
    })
}

/// Backup folders under `root`, newest first. Same bookkeeping as migration
/// versions: one folder per run, `.sql` files inside.
pub fn list_backups(root: &Path) -> Result<Vec<BackupFolder>> {
    let folders = snapshot::list_versions(root)?
        .into_iter()
        .map(|v| BackupFolder {
            name: v.name,
            created: v.created,
            sql_files: v.sql_files,
        })
        .collect();
    Ok(folders)
}
