use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub mysql: MysqlConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub apply: ApplyConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

// ── MySQL connection ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MysqlConfig {
    /// Account used by the mysql/mysqldump binaries (default: root)
    #[serde(default = "default_mysql_username")]
    pub username: String,
    /// Never logged; handed to the binaries via --defaults-extra-file
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_mysql_host")]
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    /// Hard cap for a single mysql/mysqldump invocation
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_mysql_username() -> String {
    "root".into()
}

fn default_mysql_host() -> String {
    "localhost".into()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_command_timeout_secs() -> u64 {
    600
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            username: default_mysql_username(),
            password: String::new(),
            host: default_mysql_host(),
            port: default_mysql_port(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

// ── Filesystem roots ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory whose subdirectories are migration versions
    #[serde(default = "default_migration_root")]
    pub migration_root: PathBuf,
    /// Directory that receives timestamped backup folders
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,
}

fn schemadeck_dir() -> PathBuf {
    let home = UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
    home.join(".schemadeck")
}

fn default_migration_root() -> PathBuf {
    schemadeck_dir().join("migrations")
}

fn default_backup_root() -> PathBuf {
    schemadeck_dir().join("backups")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            migration_root: default_migration_root(),
            backup_root: default_backup_root(),
        }
    }
}

// ── Migration application ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Upper bound on concurrent mysql child processes (default: 4)
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_max_parallel() -> usize {
    4
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
        }
    }
}

impl ApplyConfig {
    /// Configured bound clamped to at least one worker.
    pub fn effective_parallel(&self) -> usize {
        self.max_parallel.max(1)
    }
}

// ── Gateway ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway port (default: 2480)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Allow binding to non-localhost (default: false)
    #[serde(default)]
    pub allow_public_bind: bool,
}

fn default_gateway_port() -> u16 {
    2480
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            allow_public_bind: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: schemadeck_dir().join("config.toml"),
            mysql: MysqlConfig::default(),
            paths: PathsConfig::default(),
            apply: ApplyConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let base_dir = schemadeck_dir();
        let config_path = base_dir.join("config.toml");

        if !base_dir.exists() {
            fs::create_dir_all(&base_dir).context("Failed to create .schemadeck directory")?;
        }

        let mut config = if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
            config.config_path = config_path;
            config
        } else {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            let toml_str =
                toml::to_string_pretty(&config).context("Failed to serialize default config")?;
            fs::write(&config_path, toml_str).with_context(|| {
                format!("Failed to write starter config: {}", config_path.display())
            })?;
            config
        };

        config.apply_env_overrides();
        config.ensure_roots()?;
        Ok(config)
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("SCHEMADECK_MYSQL_USER") {
            if !user.is_empty() {
                self.mysql.username = user;
            }
        }

        if let Ok(password) = std::env::var("SCHEMADECK_MYSQL_PASSWORD") {
            self.mysql.password = password;
        }

        if let Ok(host) = std::env::var("SCHEMADECK_MYSQL_HOST") {
            if !host.is_empty() {
                self.mysql.host = host;
            }
        }

        if let Ok(port_str) = std::env::var("SCHEMADECK_MYSQL_PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.mysql.port = port;
            }
        }

        if let Ok(root) = std::env::var("SCHEMADECK_MIGRATION_ROOT") {
            if !root.is_empty() {
                self.paths.migration_root = PathBuf::from(root);
            }
        }

        if let Ok(root) = std::env::var("SCHEMADECK_BACKUP_ROOT") {
            if !root.is_empty() {
                self.paths.backup_root = PathBuf::from(root);
            }
        }

        if let Ok(n_str) = std::env::var("SCHEMADECK_MAX_PARALLEL") {
            if let Ok(n) = n_str.parse::<usize>() {
                self.apply.max_parallel = n;
            }
        }

        // Gateway port: SCHEMADECK_GATEWAY_PORT or PORT
        if let Ok(port_str) =
            std::env::var("SCHEMADECK_GATEWAY_PORT").or_else(|_| std::env::var("PORT"))
        {
            if let Ok(port) = port_str.parse::<u16>() {
                self.gateway.port = port;
            }
        }

        // Gateway host: SCHEMADECK_GATEWAY_HOST or HOST
        if let Ok(host) =
            std::env::var("SCHEMADECK_GATEWAY_HOST").or_else(|_| std::env::var("HOST"))
        {
            if !host.is_empty() {
                self.gateway.host = host;
            }
        }

        if let Ok(val) = std::env::var("SCHEMADECK_ALLOW_PUBLIC_BIND") {
            self.gateway.allow_public_bind = val == "1" || val.eq_ignore_ascii_case("true");
        }
    }

    /// Create the migration and backup roots if they are missing.
    pub fn ensure_roots(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.migration_root).with_context(|| {
            format!(
                "Failed to create migration root: {}",
                self.paths.migration_root.display()
            )
        })?;
        fs::create_dir_all(&self.paths.backup_root).with_context(|| {
            format!(
                "Failed to create backup root: {}",
                self.paths.backup_root.display()
            )
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    // ── Defaults ─────────────────────────────────────────────

    #[test]
    fn config_default_has_sane_values() {
        let c = Config::default();
        assert_eq!(c.mysql.username, "root");
        assert!(c.mysql.password.is_empty());
        assert_eq!(c.mysql.host, "localhost");
        assert_eq!(c.mysql.port, 3306);
        assert!(c.config_path.to_string_lossy().contains("config.toml"));
        assert!(
            c.paths
                .migration_root
                .to_string_lossy()
                .contains("migrations")
        );
        assert!(c.paths.backup_root.to_string_lossy().contains("backups"));
    }

    #[test]
    fn mysql_config_default_timeout() {
        let m = MysqlConfig::default();
        assert_eq!(m.command_timeout_secs, 600);
    }

    #[test]
    fn apply_config_default() {
        let a = ApplyConfig::default();
        assert_eq!(a.max_parallel, 4);
        assert_eq!(a.effective_parallel(), 4);
    }

    #[test]
    fn apply_config_zero_clamps_to_one() {
        let a = ApplyConfig { max_parallel: 0 };
        assert_eq!(a.effective_parallel(), 1);
    }

    #[test]
    fn gateway_config_default() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 2480);
        assert_eq!(g.host, "127.0.0.1");
        assert!(!g.allow_public_bind);
    }

    // ── Serde round-trip ─────────────────────────────────────

    #[test]
    fn config_toml_roundtrip() {
        let config = Config {
            config_path: PathBuf::from("/tmp/test/config.toml"),
            mysql: MysqlConfig {
                username: "admin".into(),
                password: "hunter2".into(),
                host: "db.internal".into(),
                port: 3307,
                command_timeout_secs: 120,
            },
            paths: PathsConfig {
                migration_root: PathBuf::from("/srv/migrations"),
                backup_root: PathBuf::from("/srv/backups"),
            },
            apply: ApplyConfig { max_parallel: 8 },
            gateway: GatewayConfig {
                port: 9000,
                host: "0.0.0.0".into(),
                allow_public_bind: true,
            },
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.mysql.username, "admin");
        assert_eq!(parsed.mysql.password, "hunter2");
        assert_eq!(parsed.mysql.host, "db.internal");
        assert_eq!(parsed.mysql.port, 3307);
        assert_eq!(parsed.mysql.command_timeout_secs, 120);
        assert_eq!(parsed.paths.migration_root, PathBuf::from("/srv/migrations"));
        assert_eq!(parsed.paths.backup_root, PathBuf::from("/srv/backups"));
        assert_eq!(parsed.apply.max_parallel, 8);
        assert_eq!(parsed.gateway.port, 9000);
        assert!(parsed.gateway.allow_public_bind);
    }

    #[test]
    fn config_minimal_toml_uses_defaults() {
        let parsed: Config = toml::from_str("").unwrap();
        assert_eq!(parsed.mysql.username, "root");
        assert_eq!(parsed.mysql.port, 3306);
        assert_eq!(parsed.apply.max_parallel, 4);
        assert_eq!(parsed.gateway.port, 2480);
        assert!(!parsed.gateway.allow_public_bind);
    }

    #[test]
    fn config_partial_section_keeps_other_defaults() {
        let parsed: Config = toml::from_str(
            r#"
[mysql]
username = "deploy"
"#,
        )
        .unwrap();
        assert_eq!(parsed.mysql.username, "deploy");
        assert_eq!(parsed.mysql.host, "localhost");
        assert_eq!(parsed.mysql.command_timeout_secs, 600);
    }

    #[test]
    fn config_unknown_keys_ignored() {
        let parsed: Result<Config, _> = toml::from_str(
            r#"
future_flag = true

[mysql]
username = "root"
"#,
        );
        // toml rejects unknown top-level keys only when deny_unknown_fields is set
        assert!(parsed.is_ok());
    }

    // ── ensure_roots ─────────────────────────────────────────

    #[test]
    fn ensure_roots_creates_missing_dirs() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            paths: PathsConfig {
                migration_root: dir.path().join("m"),
                backup_root: dir.path().join("b"),
            },
            ..Config::default()
        };
        config.ensure_roots().unwrap();
        assert!(dir.path().join("m").is_dir());
        assert!(dir.path().join("b").is_dir());
    }

    #[test]
    fn ensure_roots_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            paths: PathsConfig {
                migration_root: dir.path().join("m"),
                backup_root: dir.path().join("b"),
            },
            ..Config::default()
        };
        config.ensure_roots().unwrap();
        config.ensure_roots().unwrap();
        assert!(dir.path().join("m").is_dir());
    }

    // ── Environment variable overrides (Docker support) ─────────

    fn env_override_test_guard() -> std::sync::MutexGuard<'static, ()> {
        static ENV_OVERRIDE_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        ENV_OVERRIDE_TEST_LOCK
            .lock()
            .expect("env override test lock poisoned")
    }

    fn set_env(key: &str, value: &str) {
        // Guarded by env_override_test_guard; no concurrent env access.
        unsafe { std::env::set_var(key, value) };
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    #[test]
    fn env_override_mysql_user() {
        let _env_guard = env_override_test_guard();
        let mut config = Config::default();

        set_env("SCHEMADECK_MYSQL_USER", "backup_bot");
        config.apply_env_overrides();
        assert_eq!(config.mysql.username, "backup_bot");

        remove_env("SCHEMADECK_MYSQL_USER");
    }

    #[test]
    fn env_override_mysql_password_allows_empty() {
        let _env_guard = env_override_test_guard();
        let mut config = Config::default();
        config.mysql.password = "old".into();

        set_env("SCHEMADECK_MYSQL_PASSWORD", "");
        config.apply_env_overrides();
        assert!(config.mysql.password.is_empty());

        remove_env("SCHEMADECK_MYSQL_PASSWORD");
    }

    #[test]
    fn env_override_gateway_port_fallback() {
        let _env_guard = env_override_test_guard();
        let mut config = Config::default();

        remove_env("SCHEMADECK_GATEWAY_PORT");
        set_env("PORT", "8081");
        config.apply_env_overrides();
        assert_eq!(config.gateway.port, 8081);

        remove_env("PORT");
    }

    #[test]
    fn env_override_migration_root() {
        let _env_guard = env_override_test_guard();
        let mut config = Config::default();

        set_env("SCHEMADECK_MIGRATION_ROOT", "/data/migrations");
        config.apply_env_overrides();
        assert_eq!(
            config.paths.migration_root,
            PathBuf::from("/data/migrations")
        );

        remove_env("SCHEMADECK_MIGRATION_ROOT");
    }

    #[test]
    fn env_override_invalid_port_ignored() {
        let _env_guard = env_override_test_guard();
        let mut config = Config::default();

        remove_env("PORT");
        set_env("SCHEMADECK_GATEWAY_PORT", "not-a-port");
        config.apply_env_overrides();
        assert_eq!(config.gateway.port, 2480);

        remove_env("SCHEMADECK_GATEWAY_PORT");
    }

    #[test]
    fn env_override_allow_public_bind() {
        let _env_guard = env_override_test_guard();
        let mut config = Config::default();

        set_env("SCHEMADECK_ALLOW_PUBLIC_BIND", "true");
        config.apply_env_overrides();
        assert!(config.gateway.allow_public_bind);

        set_env("SCHEMADECK_ALLOW_PUBLIC_BIND", "0");
        config.apply_env_overrides();
        assert!(!config.gateway.allow_public_bind);

        remove_env("SCHEMADECK_ALLOW_PUBLIC_BIND");
    }

    #[test]
    fn env_override_empty_values_ignored() {
        let _env_guard = env_override_test_guard();
        let mut config = Config::default();

        set_env("SCHEMADECK_MYSQL_USER", "");
        set_env("SCHEMADECK_MYSQL_HOST", "");
        config.apply_env_overrides();
        assert_eq!(config.mysql.username, "root");
        assert_eq!(config.mysql.host, "localhost");

        remove_env("SCHEMADECK_MYSQL_USER");
        remove_env("SCHEMADECK_MYSQL_HOST");
    }
}
