//! Concurrent migration application: wipe every non-system schema, then
//! recreate one database per `.sql` file and stream the file in, with a
//! bounded number of `mysql` children in flight. Any single file failing
//! fails the whole run.

use crate::config::Config;
use crate::mysql::{self, MysqlInvoker};
use crate::snapshot;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub run_id: String,
    pub version: String,
    /// Databases applied, in completion order.
    pub databases: Vec<String>,
    pub duration_ms: u64,
}

pub async fn apply_version(
    invoker: Arc<dyn MysqlInvoker>,
    config: &Config,
    version: &str,
) -> Result<ApplyReport> {
    let started = Instant::now();
    let run_id = uuid::Uuid::new_v4().to_string();
    let timeout = Duration::from_secs(config.mysql.command_timeout_secs);

    let dir = snapshot::version_dir(&config.paths.migration_root, version)?;
    if !dir.is_dir() {
        bail!("Migration version not found: {version}");
    }

    // Validation happens before anything is dropped: a bad version folder
    // must not leave the server empty.
    let targets = snapshot::collect_sql_targets(&dir)
        .with_context(|| format!("Invalid migration version: {version}"))?;
    if targets.is_empty() {
        bail!("Migration version {version} contains no .sql files");
    }

    info!(run_id = %run_id, version = %version, files = targets.len(), "starting migration apply");

    match run(invoker, config, &targets, timeout, &run_id).await {
        Ok(databases) => {
            let duration = started.elapsed();
            crate::health::mark_component_ok_timed("apply", duration);
            info!(
                run_id = %run_id,
                version = %version,
                databases = databases.len(),
                elapsed_ms = duration.as_millis() as u64,
                "migration apply complete"
            );
            Ok(ApplyReport {
                run_id,
                version: version.to_string(),
                databases,
                duration_ms: duration.as_millis() as u64,
            })
        }
        Err(e) => {
            crate::health::mark_component_error("apply", format!("{e:#}"));
            Err(e).with_context(|| format!("Failed to apply migration version {version}"))
        }
    }
}

async fn run(
    invoker: Arc<dyn MysqlInvoker>,
    config: &Config,
    targets: &[snapshot::SqlTarget],
    timeout: Duration,
    run_id: &str,
) -> Result<Vec<String>> {
    drop_all_schemas(invoker.as_ref(), timeout).await?;

    let max_parallel = config.apply.effective_parallel();
    let semaphore = Arc::new(Semaphore::new(max_parallel));
    let mut set: JoinSet<Result<String>> = JoinSet::new();
    let mut applied = Vec::with_capacity(targets.len());

    // The permit is taken before spawning, so files start in listed order and
    // one permit degrades to plain sequential application.
    for target in targets {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("apply run was aborted")?;

        // Fail-fast: a finished worker surfaces here before the next spawn.
        while let Some(joined) = set.try_join_next() {
            collect_worker(joined, &mut set, &mut applied)?;
        }

        let invoker = invoker.clone();
        let db = target.database.clone();
        let path = target.path.clone();
        let run_id = run_id.to_string();

        set.spawn(async move {
            let _permit = permit;

            mysql::create_database(invoker.as_ref(), timeout, &db).await?;
            mysql::apply_sql_file(invoker.as_ref(), timeout, &db, &path)
                .await
                .with_context(|| format!("SQL file: {}", path.display()))?;

            info!(run_id = %run_id, database = %db, "applied snapshot");
            Ok(db)
        });
    }

    while let Some(joined) = set.join_next().await {
        collect_worker(joined, &mut set, &mut applied)?;
    }

    Ok(applied)
}

fn collect_worker(
    joined: std::result::Result<Result<String>, tokio::task::JoinError>,
    set: &mut JoinSet<Result<String>>,
    applied: &mut Vec<String>,
) -> Result<()> {
    match joined {
        Ok(Ok(db)) => {
            applied.push(db);
            Ok(())
        }
        Ok(Err(e)) => {
            // Stop everything still in flight.
            set.abort_all();
            Err(e)
        }
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => {
            set.abort_all();
            bail!("apply worker panicked: {e}")
        }
    }
}

/// Drop every non-system schema the server reports.
pub async fn drop_all_schemas(invoker: &dyn MysqlInvoker, timeout: Duration) -> Result<Vec<String>> {
    let databases = mysql::list_databases(invoker, timeout).await?;
    let mut dropped = Vec::new();
    for db in databases {
        if mysql::is_system_database(&db) {
            continue;
        }
        mysql::drop_database(invoker, timeout, &db).await?;
        warn!(database = %db, "dropped schema");
        dropped.push(db);
    }
    Ok(dropped)
}
