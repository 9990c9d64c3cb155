#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::items_after_statements,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use schemadeck::config::Config;
use schemadeck::mysql::{self, CliInvoker, MysqlInvoker};
use schemadeck::{apply, backup, doctor, gateway, snapshot};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

/// `schemadeck` — MySQL schema administration from one place.
#[derive(Parser, Debug)]
#[command(name = "schemadeck")]
#[command(version)]
#[command(about = "MySQL migration snapshots, schema drops, and mysqldump backups.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the JSON dashboard gateway
    Serve {
        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (0 for a random port); defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Allow binding to a non-localhost address (exposes destructive routes)
        #[arg(long)]
        allow_public: bool,
    },

    /// One-screen summary: config, binaries, connectivity, counts
    Status,

    /// Run environment diagnostics (exits non-zero on failure)
    Doctor,

    /// Apply a migration version: drop all schemas, then one database per .sql file
    Apply {
        /// Version folder name under the migration root
        version: String,
    },

    /// Drop every non-system schema on the server
    DropSchemas {
        /// Confirm the drop (refused without this flag)
        #[arg(long)]
        yes: bool,
    },

    /// Dump every non-system database into a timestamped backup folder
    Backup,

    /// Inspect and manage migration version folders
    Migrations {
        #[command(subcommand)]
        migrations_command: MigrationsCommands,
    },

    /// Inspect backup folders
    Backups {
        #[command(subcommand)]
        backups_command: BackupsCommands,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate for
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
enum MigrationsCommands {
    /// List migration versions, newest first
    List {
        /// Maximum number of versions to show
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete a migration version folder
    Delete {
        /// Version folder name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum BackupsCommands {
    /// List backup folders, newest first
    List {
        /// Maximum number of folders to show
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn build_invoker(config: &Config) -> Result<Arc<dyn MysqlInvoker>> {
    Ok(Arc::new(CliInvoker::from_config(&config.mysql)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    // Completions need no config and must not create one on first run.
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(
            *shell,
            &mut Cli::command(),
            "schemadeck",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let config = Config::load_or_init()?;

    match cli.command {
        Commands::Completions { .. } => unreachable!(),

        Commands::Serve {
            host,
            port,
            allow_public,
        } => {
            let mut config = config;
            if allow_public {
                config.gateway.allow_public_bind = true;
            }
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let port = port.unwrap_or(config.gateway.port);
            let invoker = build_invoker(&config)?;
            gateway::run_gateway(&host, port, Arc::new(config), invoker).await
        }

        Commands::Status => run_status(&config).await,

        Commands::Doctor => doctor::run(&config).await,

        Commands::Apply { version } => {
            let invoker = build_invoker(&config)?;
            let report = apply::apply_version(invoker, &config, &version).await?;
            println!(
                "{} Applied migration version {}",
                console::style("✓").green().bold(),
                console::style(&report.version).white().bold()
            );
            let mut databases = report.databases.clone();
            databases.sort();
            for db in &databases {
                println!("  {db}");
            }
            println!(
                "  {} database(s) in {:.1}s",
                databases.len(),
                report.duration_ms as f64 / 1000.0
            );
            Ok(())
        }

        Commands::DropSchemas { yes } => {
            if !yes {
                bail!(
                    "This drops EVERY non-system schema on {}:{}.\n\
                     Re-run with --yes to confirm.",
                    config.mysql.host,
                    config.mysql.port
                );
            }
            let invoker = build_invoker(&config)?;
            let timeout = Duration::from_secs(config.mysql.command_timeout_secs);
            let dropped = apply::drop_all_schemas(invoker.as_ref(), timeout).await?;
            if dropped.is_empty() {
                println!("No non-system schemas to drop.");
            } else {
                println!(
                    "{} Dropped {} schema(s):",
                    console::style("✓").green().bold(),
                    dropped.len()
                );
                for db in &dropped {
                    println!("  {db}");
                }
            }
            Ok(())
        }

        Commands::Backup => {
            let invoker = build_invoker(&config)?;
            let report = backup::backup_all(invoker.as_ref(), &config).await?;
            println!(
                "{} Backup complete: {}",
                console::style("✓").green().bold(),
                report.folder.display()
            );
            println!("  dumped: {}", report.dumped.len());
            for (db, err) in &report.failed {
                println!(
                    "  {} {db}: {err}",
                    console::style("✗").red().bold()
                );
            }
            Ok(())
        }

        Commands::Migrations {
            migrations_command,
        } => match migrations_command {
            MigrationsCommands::List { limit } => {
                let versions = snapshot::list_versions(&config.paths.migration_root)?;
                let total = versions.len();
                let shown = limit.unwrap_or(total);
                if versions.is_empty() {
                    println!(
                        "No migration versions in {}",
                        config.paths.migration_root.display()
                    );
                    return Ok(());
                }
                for v in versions.iter().take(shown) {
                    println!(
                        "  {}  {}  {} file(s)",
                        console::style(&v.name).white().bold(),
                        v.created.format("%Y-%m-%d %H:%M:%S UTC"),
                        v.sql_files
                    );
                }
                if shown < total {
                    println!("  … and {} more", total - shown);
                }
                Ok(())
            }
            MigrationsCommands::Delete { name } => {
                snapshot::delete_version(&config.paths.migration_root, &name)?;
                println!(
                    "{} Deleted migration version {name}",
                    console::style("✓").green().bold()
                );
                Ok(())
            }
        },

        Commands::Backups { backups_command } => match backups_command {
            BackupsCommands::List { limit } => {
                let folders = backup::list_backups(&config.paths.backup_root)?;
                let total = folders.len();
                let shown = limit.unwrap_or(total);
                if folders.is_empty() {
                    println!("No backups in {}", config.paths.backup_root.display());
                    return Ok(());
                }
                for f in folders.iter().take(shown) {
                    println!(
                        "  {}  {}  {} dump(s)",
                        console::style(&f.name).white().bold(),
                        f.created.format("%Y-%m-%d %H:%M:%S UTC"),
                        f.sql_files
                    );
                }
                if shown < total {
                    println!("  … and {} more", total - shown);
                }
                Ok(())
            }
        },
    }
}

async fn run_status(config: &Config) -> Result<()> {
    println!("🗄️  schemadeck status");
    println!();
    println!("Version:        {}", env!("CARGO_PKG_VERSION"));
    println!("Config:         {}", config.config_path.display());
    println!(
        "MySQL target:   {}@{}:{}",
        config.mysql.username, config.mysql.host, config.mysql.port
    );

    match CliInvoker::from_config(&config.mysql) {
        Ok(invoker) => {
            let reachable = mysql::ping(&invoker, Duration::from_secs(10)).await.is_ok();
            println!(
                "Connectivity:   {}",
                if reachable {
                    console::style("✅ reachable").green().to_string()
                } else {
                    console::style("❌ unreachable").red().to_string()
                }
            );
        }
        Err(e) => println!("Connectivity:   ❌ {e}"),
    }

    let versions = snapshot::list_versions(&config.paths.migration_root)?;
    let backups = backup::list_backups(&config.paths.backup_root)?;
    println!();
    println!(
        "Migrations:     {} version(s) in {}",
        versions.len(),
        config.paths.migration_root.display()
    );
    if let Some(latest) = versions.first() {
        println!("  newest:       {}", latest.name);
    }
    println!(
        "Backups:        {} folder(s) in {}",
        backups.len(),
        config.paths.backup_root.display()
    );
    if let Some(latest) = backups.first() {
        println!("  newest:       {}", latest.name);
    }
    println!();
    println!("Apply workers:  {}", config.apply.effective_parallel());
    println!(
        "Gateway:        {}:{}",
        config.gateway.host, config.gateway.port
    );
    Ok(())
}
