//! Migration version bookkeeping: each immediate subdirectory of the
//! migration root is one version, holding `.sql` snapshot files whose stems
//! name the target databases.

use crate::mysql::validate_database_name;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct MigrationVersion {
    pub name: String,
    pub created: DateTime<Utc>,
    pub sql_files: usize,
}

/// One discovered `.sql` file and the database its stem names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqlTarget {
    pub database: String,
    pub path: PathBuf,
}

/// Plain directory names only. Anything that could walk out of the root
/// (separators, `.`, `..`, empty) is refused before touching the filesystem.
fn valid_version_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Resolve a version folder under `root`, with name hygiene.
pub fn version_dir(root: &Path, name: &str) -> Result<PathBuf> {
    if !valid_version_name(name) {
        bail!("Invalid migration version name: {name:?}");
    }
    Ok(root.join(name))
}

fn entry_created(path: &Path) -> DateTime<Utc> {
    fs::metadata(path)
        .and_then(|m| m.created().or_else(|_| m.modified()))
        .map_or_else(|_| Utc::now(), DateTime::<Utc>::from)
}

fn count_sql_files(dir: &Path) -> usize {
    let mut count = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if is_sql_file(&path) {
                count += 1;
            }
        }
    }
    count
}

fn is_sql_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("sql"))
}

/// Immediate subdirectories of `root`, newest first (name descending as
/// tiebreaker so the order is stable on coarse timestamps).
pub fn list_versions(root: &Path) -> Result<Vec<MigrationVersion>> {
    // Tolerate the root vanishing at runtime; it is recreated at startup.
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut versions = Vec::new();
    let entries = fs::read_dir(root)
        .with_context(|| format!("Failed to read migration root: {}", root.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        versions.push(MigrationVersion {
            name: name.to_string(),
            created: entry_created(&path),
            sql_files: count_sql_files(&path),
        });
    }

    versions.sort_by(|a, b| b.created.cmp(&a.created).then(b.name.cmp(&a.name)));
    Ok(versions)
}

/// Remove a version folder. Errors when the folder does not exist so the
/// caller can report 404 instead of silently succeeding.
pub fn delete_version(root: &Path, name: &str) -> Result<()> {
    let dir = version_dir(root, name)?;
    if !dir.is_dir() {
        bail!("Migration version not found: {name}");
    }
    fs::remove_dir_all(&dir)
        .with_context(|| format!("Failed to delete migration version: {}", dir.display()))?;
    Ok(())
}

/// Recursively collect `.sql` files under a version folder. Files are
/// sorted per directory for a deterministic order; each file's stem must be
/// a valid database name, and two files may not name the same database.
pub fn collect_sql_targets(version_dir: &Path) -> Result<Vec<SqlTarget>> {
    let mut targets = Vec::new();
    walk_sql_files(version_dir, &mut targets)?;

    // Duplicates can span directories, so check after the full walk.
    let mut seen: std::collections::HashMap<&str, &Path> = std::collections::HashMap::new();
    for target in &targets {
        if let Some(first) = seen.insert(target.database.as_str(), &target.path) {
            bail!(
                "Two SQL files target database `{}`: {} and {}",
                target.database,
                first.display(),
                target.path.display()
            );
        }
    }

    Ok(targets)
}

fn walk_sql_files(dir: &Path, targets: &mut Vec<SqlTarget>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();

    for path in paths {
        if path.is_dir() {
            walk_sql_files(&path, targets)?;
        } else if is_sql_file(&path) {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            validate_database_name(stem).with_context(|| {
                format!("SQL file does not name a valid database: {}", path.display())
            })?;
            targets.push(SqlTarget {
                database: stem.to_string(),
                path,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "CREATE TABLE t (id INT);").unwrap();
    }

    // ── Name hygiene ─────────────────────────────────────────

    #[test]
    fn version_name_hygiene() {
        assert!(valid_version_name("v1"));
        assert!(valid_version_name("migration_20240101_120000"));
        assert!(!valid_version_name(""));
        assert!(!valid_version_name("."));
        assert!(!valid_version_name(".."));
        assert!(!valid_version_name("../escape"));
        assert!(!valid_version_name("a/b"));
        assert!(!valid_version_name("a\\b"));
    }

    #[test]
    fn version_dir_rejects_traversal() {
        let root = Path::new("/data/migrations");
        assert!(version_dir(root, "../../etc").is_err());
        assert_eq!(
            version_dir(root, "v1").unwrap(),
            PathBuf::from("/data/migrations/v1")
        );
    }

    // ── Listing ──────────────────────────────────────────────

    #[test]
    fn list_versions_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(list_versions(&missing).unwrap().is_empty());
    }

    #[test]
    fn list_versions_skips_plain_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("v1")).unwrap();
        fs::write(dir.path().join("README.md"), "not a version").unwrap();

        let versions = list_versions(dir.path()).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].name, "v1");
    }

    #[test]
    fn list_versions_counts_sql_recursively() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("v1/app.sql"));
        touch(&dir.path().join("v1/nested/analytics.sql"));
        fs::write(dir.path().join("v1/notes.txt"), "skip me").unwrap();

        let versions = list_versions(dir.path()).unwrap();
        assert_eq!(versions[0].sql_files, 2);
    }

    #[test]
    fn list_versions_name_descending_tiebreak() {
        let dir = TempDir::new().unwrap();
        // Created back-to-back; filesystem timestamps may collide, so the
        // name tiebreaker decides.
        fs::create_dir(dir.path().join("v1")).unwrap();
        fs::create_dir(dir.path().join("v2")).unwrap();

        let versions = list_versions(dir.path()).unwrap();
        let names: Vec<&str> = versions.iter().map(|v| v.name.as_str()).collect();
        if versions[0].created == versions[1].created {
            assert_eq!(names, vec!["v2", "v1"]);
        } else {
            assert_eq!(versions.len(), 2);
        }
    }

    // ── Deletion ─────────────────────────────────────────────

    #[test]
    fn delete_version_removes_folder() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("v1/app.sql"));

        delete_version(dir.path(), "v1").unwrap();
        assert!(!dir.path().join("v1").exists());
    }

    #[test]
    fn delete_version_missing_errors() {
        let dir = TempDir::new().unwrap();
        assert!(delete_version(dir.path(), "ghost").is_err());
    }

    #[test]
    fn delete_version_refuses_traversal() {
        let dir = TempDir::new().unwrap();
        assert!(delete_version(dir.path(), "../sibling").is_err());
    }

    // ── Target collection ────────────────────────────────────

    #[test]
    fn collect_targets_sorted_and_recursive() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("b_db.sql"));
        touch(&dir.path().join("a_db.sql"));
        touch(&dir.path().join("sub/c_db.sql"));

        let targets = collect_sql_targets(dir.path()).unwrap();
        let dbs: Vec<&str> = targets.iter().map(|t| t.database.as_str()).collect();
        assert_eq!(dbs, vec!["a_db", "b_db", "c_db"]);
    }

    #[test]
    fn collect_targets_ignores_non_sql() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("app.sql"));
        fs::write(dir.path().join("schema.json"), "{}").unwrap();
        fs::write(dir.path().join("dump.sql.bak"), "").unwrap();

        let targets = collect_sql_targets(dir.path()).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].database, "app");
    }

    #[test]
    fn collect_targets_case_insensitive_extension() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("app.SQL"));

        let targets = collect_sql_targets(dir.path()).unwrap();
        assert_eq!(targets.len(), 1);
    }

    #[test]
    fn collect_targets_rejects_duplicate_database() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("app.sql"));
        touch(&dir.path().join("sub/app.sql"));

        let err = collect_sql_targets(dir.path()).unwrap_err();
        assert!(err.to_string().contains("app"), "{err}");
    }

    #[test]
    fn collect_targets_rejects_invalid_stem() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("my-app.sql"));

        assert!(collect_sql_targets(dir.path()).is_err());
    }

    #[test]
    fn collect_targets_rejects_system_schema_stem() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("mysql.sql"));

        assert!(collect_sql_targets(dir.path()).is_err());
    }

    #[test]
    fn collect_targets_empty_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(collect_sql_targets(dir.path()).unwrap().is_empty());
    }
}
