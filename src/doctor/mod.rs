//! `schemadeck doctor` — environment diagnostics. Prints one line per check
//! and fails the process when any check fails.

use crate::config::Config;
use crate::mysql;
use crate::snapshot;
use anyhow::{bail, Result};
use std::time::Duration;

const PING_TIMEOUT: Duration = Duration::from_secs(10);
const PARALLEL_WARN_CEILING: usize = 64;

pub async fn run(config: &Config) -> Result<()> {
    let mut failures = 0_u32;

    println!("🩺 schemadeck doctor");
    println!("  Config: {}", config.config_path.display());

    // ── Binaries ──────────────────────────────────────────────
    for name in ["mysql", "mysqldump"] {
        match mysql::resolve_binary(name) {
            Ok(path) => println!("  ✅ {name} found: {}", path.display()),
            Err(e) => {
                failures += 1;
                println!("  ❌ {e}");
            }
        }
    }

    // ── Connectivity ──────────────────────────────────────────
    match mysql::CliInvoker::from_config(&config.mysql) {
        Ok(invoker) => match mysql::ping(&invoker, PING_TIMEOUT).await {
            Ok(()) => println!(
                "  ✅ MySQL reachable as {}@{}:{}",
                config.mysql.username, config.mysql.host, config.mysql.port
            ),
            Err(e) => {
                failures += 1;
                println!(
                    "  ❌ MySQL unreachable as {}@{}:{} — {e:#}",
                    config.mysql.username, config.mysql.host, config.mysql.port
                );
            }
        },
        Err(e) => {
            // Binary resolution already reported above; don't double-count.
            println!("  ℹ️ skipping connectivity check: {e}");
        }
    }

    // ── Folders ───────────────────────────────────────────────
    let migration_root = &config.paths.migration_root;
    if migration_root.is_dir() {
        let count = snapshot::list_versions(migration_root)
            .map(|v| v.len())
            .unwrap_or(0);
        println!(
            "  ✅ migration root: {} ({count} version{})",
            migration_root.display(),
            if count == 1 { "" } else { "s" }
        );
    } else {
        failures += 1;
        println!("  ❌ migration root missing: {}", migration_root.display());
    }

    let backup_root = &config.paths.backup_root;
    match check_writable(backup_root) {
        Ok(()) => println!("  ✅ backup root writable: {}", backup_root.display()),
        Err(e) => {
            failures += 1;
            println!(
                "  ❌ backup root not writable: {} — {e}",
                backup_root.display()
            );
        }
    }

    // ── Apply settings ────────────────────────────────────────
    let parallel = config.apply.effective_parallel();
    if config.apply.max_parallel == 0 {
        println!("  ⚠️ apply.max_parallel is 0 — clamped to 1 (sequential)");
    } else if parallel > PARALLEL_WARN_CEILING {
        println!("  ⚠️ apply.max_parallel = {parallel} — that is a lot of mysql children");
    } else {
        println!("  ✅ apply.max_parallel = {parallel}");
    }

    println!();
    if failures > 0 {
        bail!("{failures} check(s) failed");
    }
    println!("All checks passed.");
    Ok(())
}

/// Probe by creating and removing a uniquely named file.
fn check_writable(dir: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(format!(".doctor-probe-{}", uuid::Uuid::new_v4()));
    std::fs::write(&probe, b"probe")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}
