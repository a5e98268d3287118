use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use config::{ConfigStore, DeployConfig};
use core_types::{BuildRequest, ContainerEngine, DeployError, archive_file_name, format_bytes};
use engine_docker::DockerEngine;
use storage_sqlite::ConversationStore;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Deployment toolkit for the emergency-agents service image and its
/// operational database.
#[derive(Parser, Debug)]
#[command(name = "emdeploy")]
#[command(about = "Build and export the emergency-agents service image")]
#[command(version)]
struct Cli {
    /// Config directory override.
    #[arg(long, env = "EMDEPLOY_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the service image.
    Build {
        /// Image tag; defaults to the configured tag (`latest`).
        tag: Option<String>,
    },
    /// Export the image to a timestamped, gzip-compressed archive.
    Export {
        /// Image tag; defaults to the configured tag (`latest`).
        tag: Option<String>,
    },
    /// Report deployment preconditions without building anything.
    Check,
    /// Operational database maintenance.
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand, Debug)]
enum DbCommands {
    /// Apply the conversation/message schema, creating the database if needed.
    Migrate {
        /// Database file; defaults to `operational.db` in the app data dir.
        #[arg(long, env = "EMDEPLOY_DB")]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    data_dir.push("emdeploy");
    if let Err(err) = fs::create_dir_all(&data_dir) {
        eprintln!("failed to prepare data dir: {err}");
    }
    let _log_guard = init_logging(&data_dir.join("logs"));

    let config_store = match cli.config_dir {
        Some(dir) => ConfigStore::from_dir(dir),
        None => ConfigStore::from_default_location()?,
    };
    let config = config_store.load_or_init()?;

    let engine = DockerEngine::new();
    match cli.command {
        Commands::Build { tag } => run_build(&config, &engine, tag.as_deref()).await,
        Commands::Export { tag } => run_export(&config, &engine, tag.as_deref()).await,
        Commands::Check => run_check(&config, &engine).await,
        Commands::Db {
            command: DbCommands::Migrate { db },
        } => {
            let db = db.unwrap_or_else(|| data_dir.join("operational.db"));
            run_db_migrate(&db).await
        }
    }
}

/// Precondition checks shared by `build` and `check`, in script order: the
/// engine probe runs first so a missing tool fails before any file check,
/// and every failure aborts before the engine build is ever attempted.
async fn preflight(config: &DeployConfig, engine: &dyn ContainerEngine) -> Result<()> {
    let version = engine.version().await?;
    info!(engine = %version, "container engine available");
    require_file(&config.dockerfile)?;
    require_file(&config.env_file)?;
    Ok(())
}

fn require_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(DeployError::MissingFile(path.to_path_buf()).into())
    }
}

async fn run_build(
    config: &DeployConfig,
    engine: &dyn ContainerEngine,
    tag: Option<&str>,
) -> Result<()> {
    preflight(config, engine).await?;

    let request = BuildRequest {
        image: config.image(tag),
        dockerfile: config.dockerfile.clone(),
        context: config.build_context.clone(),
        build_args: config.build_args.clone(),
    };
    engine.build(&request).await?;
    println!("built {}", request.image);
    Ok(())
}

async fn run_export(
    config: &DeployConfig,
    engine: &dyn ContainerEngine,
    tag: Option<&str>,
) -> Result<()> {
    let version = engine.version().await?;
    info!(engine = %version, "container engine available");

    let image = config.image(tag);
    if !engine.image_exists(&image).await? {
        return Err(DeployError::ImageNotFound(image).into());
    }

    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("failed to create {}", config.output_dir.display()))?;
    let output = config
        .output_dir
        .join(archive_file_name(&config.image_name, Local::now()));

    let archive = engine.export(&image, &output).await?;
    println!(
        "exported {} -> {} ({})",
        image,
        archive.path.display(),
        format_bytes(archive.bytes)
    );
    Ok(())
}

async fn run_check(config: &DeployConfig, engine: &dyn ContainerEngine) -> Result<()> {
    let mut all_ok = true;

    match engine.version().await {
        Ok(version) => println!("ok    container engine ({version})"),
        Err(err) => {
            all_ok = false;
            println!("FAIL  container engine ({err})");
        }
    }

    for (label, path) in [
        ("dockerfile", &config.dockerfile),
        ("env file", &config.env_file),
    ] {
        if path.is_file() {
            println!("ok    {label} ({})", path.display());
        } else {
            all_ok = false;
            println!("FAIL  {label} ({} missing)", path.display());
        }
    }

    if config.output_dir.is_dir() {
        println!("ok    output dir ({})", config.output_dir.display());
    } else {
        println!(
            "ok    output dir ({}, created on export)",
            config.output_dir.display()
        );
    }

    if !all_ok {
        bail!("deployment preconditions not satisfied");
    }
    Ok(())
}

async fn run_db_migrate(db: &Path) -> Result<()> {
    if let Some(parent) = db.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = ConversationStore::connect(db).await?;
    let version = store.schema_version().await?;
    println!(
        "operational database ready at {} (schema v{version})",
        db.display()
    );
    Ok(())
}

fn init_logging(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "emdeploy.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,app_cli=debug,engine_docker=debug"));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();
    let file_layer = fmt::layer().json().with_ansi(false).with_writer(writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use core_types::{ArchiveInfo, ImageRef};
    use tempfile::tempdir;

    use super::*;

    /// Recording engine stand-in: counts invocations so tests can assert the
    /// build/export is never reached when a precondition fails.
    #[derive(Default)]
    struct MockEngine {
        available: bool,
        image_present: bool,
        build_calls: AtomicUsize,
        export_calls: AtomicUsize,
    }

    #[async_trait]
    impl ContainerEngine for MockEngine {
        async fn version(&self) -> Result<String> {
            if self.available {
                Ok("Docker version 27.0.0-mock".to_string())
            } else {
                Err(DeployError::EngineUnavailable("docker".to_string()).into())
            }
        }

        async fn image_exists(&self, _image: &ImageRef) -> Result<bool> {
            Ok(self.image_present)
        }

        async fn build(&self, _request: &BuildRequest) -> Result<()> {
            self.build_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn export(&self, _image: &ImageRef, output: &Path) -> Result<ArchiveInfo> {
            self.export_calls.fetch_add(1, Ordering::SeqCst);
            fs::write(output, b"fake-archive")?;
            Ok(ArchiveInfo {
                path: output.to_path_buf(),
                bytes: 12,
            })
        }
    }

    fn config_in(dir: &Path, with_dockerfile: bool, with_env_file: bool) -> DeployConfig {
        let dockerfile = dir.join("Dockerfile");
        let env_file = dir.join("config/env.external");
        if with_dockerfile {
            fs::write(&dockerfile, "FROM scratch\n").expect("dockerfile");
        }
        if with_env_file {
            fs::create_dir_all(env_file.parent().unwrap()).expect("config dir");
            fs::write(&env_file, "API_BASE=http://internal\n").expect("env file");
        }
        DeployConfig {
            dockerfile,
            env_file,
            build_context: dir.to_path_buf(),
            output_dir: dir.join("dist"),
            ..DeployConfig::default()
        }
    }

    #[tokio::test]
    async fn build_fails_before_engine_when_tool_missing() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path(), true, true);
        let engine = MockEngine {
            available: false,
            ..MockEngine::default()
        };

        let err = run_build(&config, &engine, None).await.expect_err("fail");
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::EngineUnavailable(_))
        ));
        assert_eq!(engine.build_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn build_fails_without_env_file_and_never_invokes_engine() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path(), true, false);
        let engine = MockEngine {
            available: true,
            ..MockEngine::default()
        };

        let err = run_build(&config, &engine, None).await.expect_err("fail");
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::MissingFile(path)) if path.ends_with("env.external")
        ));
        assert_eq!(engine.build_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn build_runs_once_preconditions_pass() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path(), true, true);
        let engine = MockEngine {
            available: true,
            ..MockEngine::default()
        };

        run_build(&config, &engine, Some("v1.2")).await.expect("build");
        assert_eq!(engine.build_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn export_rejects_absent_image_before_serializing() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path(), true, true);
        let engine = MockEngine {
            available: true,
            image_present: false,
            ..MockEngine::default()
        };

        let err = run_export(&config, &engine, None).await.expect_err("fail");
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::ImageNotFound(_))
        ));
        assert_eq!(engine.export_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn export_produces_timestamped_archive_in_output_dir() {
        let dir = tempdir().expect("tempdir");
        let config = config_in(dir.path(), true, true);
        let engine = MockEngine {
            available: true,
            image_present: true,
            ..MockEngine::default()
        };

        run_export(&config, &engine, None).await.expect("export");

        let entries: Vec<_> = fs::read_dir(&config.output_dir)
            .expect("output dir")
            .map(|entry| entry.expect("entry").file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = &entries[0];
        assert!(name.starts_with("emergency-agents-external-"));
        assert!(name.ends_with(".tar.gz"));
        // fixed-width timestamp: <name>-YYYYMMDD-HHMM.tar.gz
        assert_eq!(
            name.len(),
            "emergency-agents-external-".len() + 13 + ".tar.gz".len()
        );
    }

    #[tokio::test]
    async fn db_migrate_creates_operational_database() {
        let dir = tempdir().expect("tempdir");
        let db = dir.path().join("state/operational.db");
        run_db_migrate(&db).await.expect("migrate");
        assert!(db.exists());
        // re-running is idempotent
        run_db_migrate(&db).await.expect("migrate again");
    }
}
