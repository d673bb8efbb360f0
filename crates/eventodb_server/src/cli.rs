use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use eventodb::Store;
use eventodb_memory::MemoryStore;
use eventodb_postgres::PostgresStore;
use eventodb_sled::SledStore;
use eventodb_sqlite::SqliteStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::{self, AppState};
use crate::pubsub::Hub;

const DEFAULT_SQLITE_REGISTRY: &str = "registry.db";

/// EventoDB - append-only, namespace-isolated event store
#[derive(Parser, Debug, Clone)]
#[command(name = "eventodb", version, about, long_about = None)]
pub struct Config {
    /// Port to listen on
    #[clap(long, env = "EVENTODB_PORT", default_value = "8080")]
    pub port: u16,
    /// Database URL: postgres://..., sqlite://file.db, or sled:///path
    #[clap(long, env = "EVENTODB_DB_URL")]
    pub db_url: Option<String>,
    /// Data directory; required with sqlite://
    #[clap(long, env = "EVENTODB_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
    /// Backend override (postgres, timescale, sqlite, sled, memory)
    #[clap(long, env = "EVENTODB_DB_TYPE", value_enum)]
    pub db_type: Option<DbType>,
    /// Default-namespace token (generated and printed once if absent)
    #[clap(long, env = "EVENTODB_TOKEN")]
    pub token: Option<String>,
    /// In-memory backend and auth bypass
    #[clap(long, env = "EVENTODB_TEST_MODE")]
    pub test_mode: bool,
    /// Request deadline in seconds for RPC dispatch
    #[clap(long, env = "EVENTODB_REQUEST_TIMEOUT", default_value = "30")]
    pub request_timeout: u64,
    /// Log level
    #[clap(long, env = "EVENTODB_LOG_LEVEL", default_value = "info", value_enum)]
    pub log_level: LogLevel,
    /// Log format
    #[clap(long, env = "EVENTODB_LOG_FORMAT", default_value = "console", value_enum)]
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DbType {
    Postgres,
    /// Postgres wire-compatible; uses the postgres adapter
    Timescale,
    Sqlite,
    Sled,
    Memory,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Console,
    Json,
}

/// The backend a configuration resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendSelection {
    Memory,
    Sled { path: PathBuf },
    Sqlite { data_dir: PathBuf, registry_file: String },
    Postgres { url: String },
}

impl Config {
    /// Resolves the backend from `--test-mode`, `--db-type`, and the
    /// `--db-url` scheme, in that order of authority.
    pub fn backend(&self) -> Result<BackendSelection> {
        if self.test_mode {
            return Ok(BackendSelection::Memory);
        }

        if let Some(DbType::Memory) = self.db_type {
            return Ok(BackendSelection::Memory);
        }

        let Some(url) = self.db_url.as_deref() else {
            bail!("one of --db-url or --test-mode is required");
        };

        let selection = match self.db_type {
            Some(DbType::Postgres) | Some(DbType::Timescale) => {
                if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                    bail!("--db-type postgres requires a postgres:// url");
                }
                BackendSelection::Postgres {
                    url: url.to_string(),
                }
            }
            Some(DbType::Sqlite) => self.sqlite_selection(url.strip_prefix("sqlite://"))?,
            Some(DbType::Sled) => sled_selection(url.strip_prefix("sled://"))?,
            Some(DbType::Memory) => unreachable!(),
            None => {
                if url.starts_with("postgres://") || url.starts_with("postgresql://") {
                    BackendSelection::Postgres {
                        url: url.to_string(),
                    }
                } else if let Some(rest) = url.strip_prefix("sqlite://") {
                    self.sqlite_selection(Some(rest))?
                } else if let Some(rest) = url.strip_prefix("sled://") {
                    sled_selection(Some(rest))?
                } else {
                    bail!("unsupported db url: {url}");
                }
            }
        };

        Ok(selection)
    }

    fn sqlite_selection(&self, rest: Option<&str>) -> Result<BackendSelection> {
        let Some(data_dir) = self.data_dir.clone() else {
            bail!("--data-dir is required with sqlite://");
        };
        let registry_file = match rest {
            Some(file) if !file.is_empty() => file.to_string(),
            _ => DEFAULT_SQLITE_REGISTRY.to_string(),
        };

        Ok(BackendSelection::Sqlite {
            data_dir,
            registry_file,
        })
    }
}

fn sled_selection(rest: Option<&str>) -> Result<BackendSelection> {
    match rest {
        Some(path) if !path.is_empty() => Ok(BackendSelection::Sled {
            path: PathBuf::from(path),
        }),
        _ => bail!("sled:// requires a path"),
    }
}

pub async fn open_store(selection: &BackendSelection) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match selection {
        BackendSelection::Memory => Arc::new(MemoryStore::new()),
        BackendSelection::Sled { path } => Arc::new(
            SledStore::open(path).with_context(|| format!("failed to open sled store at {}", path.display()))?,
        ),
        BackendSelection::Sqlite {
            data_dir,
            registry_file,
        } => Arc::new(
            SqliteStore::open(data_dir.clone(), registry_file)
                .await
                .with_context(|| format!("failed to open sqlite store in {}", data_dir.display()))?,
        ),
        BackendSelection::Postgres { url } => Arc::new(
            PostgresStore::connect(url)
                .await
                .context("failed to connect to postgres")?,
        ),
    };

    Ok(store)
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    match config.log_format {
        LogFormat::Console => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

pub async fn start() -> Result<()> {
    let config = Config::parse();
    init_tracing(&config);

    let backend = config.backend()?;
    let store = open_store(&backend).await?;

    let default_token = app::bootstrap_default_namespace(store.as_ref(), config.token.clone())
        .await?
        .map(Arc::from);

    let hub = Hub::new();
    let state = AppState {
        store,
        hub: hub.clone(),
        test_mode: config.test_mode,
        default_token,
        request_timeout: Duration::from_secs(config.request_timeout),
    };

    let router = app::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, backend = backend_name(&backend), "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await
        .context("server error")?;

    info!("shut down cleanly");
    Ok(())
}

fn backend_name(selection: &BackendSelection) -> &'static str {
    match selection {
        BackendSelection::Memory => "memory",
        BackendSelection::Sled { .. } => "sled",
        BackendSelection::Sqlite { .. } => "sqlite",
        BackendSelection::Postgres { .. } => "postgres",
    }
}

/// Resolves on INT or TERM. Closing the hub ends every SSE stream, so the
/// graceful drain is bounded by in-flight RPCs rather than open
/// subscriptions.
async fn shutdown_signal(hub: Hub) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining");
    hub.close_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> Config {
        Config::parse_from(std::iter::once("eventodb").chain(args.iter().copied()))
    }

    #[test]
    fn backend_resolution_from_url_scheme() {
        let cfg = config(&["--db-url", "postgres://localhost/eventodb"]);
        assert!(matches!(
            cfg.backend().unwrap(),
            BackendSelection::Postgres { .. }
        ));

        let cfg = config(&["--db-url", "sled:///var/lib/eventodb"]);
        assert_eq!(
            cfg.backend().unwrap(),
            BackendSelection::Sled {
                path: PathBuf::from("/var/lib/eventodb")
            }
        );

        let cfg = config(&["--db-url", "sqlite://registry.db", "--data-dir", "/tmp/data"]);
        assert_eq!(
            cfg.backend().unwrap(),
            BackendSelection::Sqlite {
                data_dir: PathBuf::from("/tmp/data"),
                registry_file: "registry.db".to_string(),
            }
        );
    }

    #[test]
    fn sqlite_requires_data_dir() {
        let cfg = config(&["--db-url", "sqlite://registry.db"]);
        assert!(cfg.backend().is_err());
    }

    #[test]
    fn test_mode_forces_memory() {
        let cfg = config(&["--test-mode", "--db-url", "postgres://localhost/x"]);
        assert_eq!(cfg.backend().unwrap(), BackendSelection::Memory);
    }

    #[test]
    fn timescale_override_uses_postgres_adapter() {
        let cfg = config(&[
            "--db-url",
            "postgres://localhost/eventodb",
            "--db-type",
            "timescale",
        ]);
        assert!(matches!(
            cfg.backend().unwrap(),
            BackendSelection::Postgres { .. }
        ));
    }

    #[test]
    fn missing_configuration_is_an_error() {
        let cfg = config(&[]);
        assert!(cfg.backend().is_err());
    }
}
