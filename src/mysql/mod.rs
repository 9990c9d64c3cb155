//! The subprocess seam. Every interaction with the `mysql` and `mysqldump`
//! binaries goes through [`MysqlInvoker`], so the orchestration layers never
//! touch argv or credentials directly.

use crate::config::MysqlConfig;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::process::Command;

/// Schemas that are never listed, dropped, or dumped.
pub const SYSTEM_DATABASES: [&str; 4] = ["information_schema", "mysql", "performance_schema", "sys"];

#[derive(Debug, Error)]
pub enum MysqlError {
    #[error("{name} not found on PATH — install the MySQL client tools")]
    BinaryMissing { name: String },

    #[error("command failed ({status}): {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("command timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("invalid database name: {name:?} (allowed: [A-Za-z0-9_], max 64 chars, no system schemas)")]
    InvalidDatabaseName { name: String },
}

pub fn is_system_database(name: &str) -> bool {
    SYSTEM_DATABASES.iter().any(|s| s.eq_ignore_ascii_case(name))
}

/// Identifiers are spliced into SQL (backtick-quoted), so the character set
/// is deliberately narrow.
pub fn validate_database_name(name: &str) -> Result<(), MysqlError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !is_system_database(name);
    if ok {
        Ok(())
    } else {
        Err(MysqlError::InvalidDatabaseName { name: name.into() })
    }
}

// ── Credentials file ──────────────────────────────────────────────

/// Temporary `[client]` credentials handed to the binaries via
/// `--defaults-extra-file`. Passwords never appear on argv. The file is
/// removed when the guard drops.
pub struct DefaultsFile {
    file: NamedTempFile,
}

impl DefaultsFile {
    pub fn new(mysql: &MysqlConfig) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(".schemadeck-defaults-")
            .suffix(".cnf")
            .tempfile()
            .context("Failed to create credentials file")?;

        writeln!(file, "[client]")?;
        writeln!(file, "user={}", mysql.username)?;
        writeln!(file, "password={}", mysql.password)?;
        writeln!(file, "host={}", mysql.host)?;
        writeln!(file, "port={}", mysql.port)?;
        file.flush()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
                .context("Failed to restrict credentials file permissions")?;
        }

        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// The argument the binaries expect. Must come first on argv.
    pub fn argv_flag(&self) -> String {
        format!("--defaults-extra-file={}", self.path().display())
    }
}

// ── Invoker trait ─────────────────────────────────────────────────

/// Builds ready-to-spawn commands for the MySQL client tools. The production
/// impl shells out to the real binaries; tests substitute a fake.
pub trait MysqlInvoker: Send + Sync {
    fn mysql_command(&self, args: &[String]) -> Result<Command>;
    fn mysqldump_command(&self, args: &[String]) -> Result<Command>;
}

/// Production invoker: binaries resolved on PATH once at construction,
/// credentials held in a [`DefaultsFile`] for the invoker's lifetime.
pub struct CliInvoker {
    mysql_bin: PathBuf,
    mysqldump_bin: PathBuf,
    defaults: DefaultsFile,
}

impl CliInvoker {
    pub fn from_config(mysql: &MysqlConfig) -> Result<Self> {
        let mysql_bin = resolve_binary("mysql")?;
        let mysqldump_bin = resolve_binary("mysqldump")?;
        let defaults = DefaultsFile::new(mysql)?;
        Ok(Self {
            mysql_bin,
            mysqldump_bin,
            defaults,
        })
    }

    fn build(&self, bin: &Path, args: &[String]) -> Command {
        let mut cmd = Command::new(bin);
        cmd.arg(self.defaults.argv_flag());
        cmd.args(args);
        cmd
    }
}

impl MysqlInvoker for CliInvoker {
    fn mysql_command(&self, args: &[String]) -> Result<Command> {
        Ok(self.build(&self.mysql_bin, args))
    }

    fn mysqldump_command(&self, args: &[String]) -> Result<Command> {
        Ok(self.build(&self.mysqldump_bin, args))
    }
}

pub fn resolve_binary(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| {
        MysqlError::BinaryMissing {
            name: name.to_string(),
        }
        .into()
    })
}

// ── Execution ─────────────────────────────────────────────────────

/// Run a prepared command to completion, capturing output. Non-zero exit
/// becomes an error carrying the status and a stderr excerpt.
async fn run_capture(mut cmd: Command, timeout: Duration) -> Result<String> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    // Children must not outlive an aborted or timed-out operation.
    cmd.kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| MysqlError::Timeout {
            secs: timeout.as_secs(),
        })?
        .context("Failed to spawn MySQL client process")?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let detail = if stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            excerpt(stderr, 500)
        };
        Err(MysqlError::CommandFailed {
            status: output.status.to_string(),
            stderr: detail,
        }
        .into())
    }
}

fn excerpt(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i < max)
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());
        format!("{}…", &s[..cut])
    }
}

fn batch_args(sql: &str) -> Vec<String> {
    vec![
        "--batch".into(),
        "--skip-column-names".into(),
        "-e".into(),
        sql.into(),
    ]
}

/// One database name per non-empty line of `--batch` output.
fn parse_database_lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// All databases the server reports, system schemas included. Callers
/// filter with [`is_system_database`].
pub async fn list_databases(invoker: &dyn MysqlInvoker, timeout: Duration) -> Result<Vec<String>> {
    let cmd = invoker.mysql_command(&batch_args("SHOW DATABASES"))?;
    let stdout = run_capture(cmd, timeout)
        .await
        .context("SHOW DATABASES failed")?;
    Ok(parse_database_lines(&stdout))
}

pub async fn drop_database(invoker: &dyn MysqlInvoker, timeout: Duration, name: &str) -> Result<()> {
    validate_database_name(name)?;
    let cmd = invoker.mysql_command(&batch_args(&format!("DROP DATABASE IF EXISTS `{name}`")))?;
    run_capture(cmd, timeout)
        .await
        .with_context(|| format!("Failed to drop database `{name}`"))?;
    Ok(())
}

pub async fn create_database(
    invoker: &dyn MysqlInvoker,
    timeout: Duration,
    name: &str,
) -> Result<()> {
    validate_database_name(name)?;
    let cmd = invoker.mysql_command(&batch_args(&format!("CREATE DATABASE `{name}`")))?;
    run_capture(cmd, timeout)
        .await
        .with_context(|| format!("Failed to create database `{name}`"))?;
    Ok(())
}

/// Stream a `.sql` file into `mysql <db>` via stdin.
pub async fn apply_sql_file(
    invoker: &dyn MysqlInvoker,
    timeout: Duration,
    db: &str,
    path: &Path,
) -> Result<()> {
    validate_database_name(db)?;
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open SQL file: {}", path.display()))?;
    let mut cmd = invoker.mysql_command(&[db.to_string()])?;
    cmd.stdin(Stdio::from(file));
    run_capture(cmd, timeout)
        .await
        .with_context(|| format!("Failed to apply {} to `{db}`", path.display()))?;
    Ok(())
}

/// `mysqldump` one database straight to a file. The flag set matches what
/// a consistent InnoDB snapshot needs without locking the server.
pub async fn dump_database(
    invoker: &dyn MysqlInvoker,
    timeout: Duration,
    db: &str,
    out_path: &Path,
) -> Result<()> {
    validate_database_name(db)?;
    let cmd = invoker.mysqldump_command(&[
        "--single-transaction".into(),
        "--set-gtid-purged=OFF".into(),
        "--quick".into(),
        format!("--result-file={}", out_path.display()),
        db.to_string(),
    ])?;
    run_capture(cmd, timeout)
        .await
        .with_context(|| format!("Failed to dump database `{db}`"))?;
    Ok(())
}

/// Cheapest possible connectivity probe.
pub async fn ping(invoker: &dyn MysqlInvoker, timeout: Duration) -> Result<()> {
    let cmd = invoker.mysql_command(&batch_args("SELECT 1"))?;
    run_capture(cmd, timeout)
        .await
        .context("MySQL connectivity check failed")?;
    Ok(())
}
