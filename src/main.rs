use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tally::config::{CheckMode, LimiterConfig, LoggingConfig, StoreConfig, TallyConfig};
use tally::mesh::Cluster;
use tally::store::{AtomicStore, MemoryStore, MeshStore};
use tally::FixedWindowRateLimiter;

/// Exit code when at least one operation was over its limit.
const EXIT_EXCEEDED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "tally", version, about = "Fixed time window rate limiter")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overrides the configuration file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check and record one attempt for each operation
    Check {
        /// Operation names
        #[arg(required = true)]
        operations: Vec<String>,
    },
    /// Read operation names from stdin and print a decision per line
    Gate,
    /// Show the current window of an operation without recording anything
    Status {
        /// Operation name
        operation: String,
    },
}

type Limiter = FixedWindowRateLimiter<dyn AtomicStore>;

/// A configured store plus whatever keeps it running.
struct Backend {
    store: Arc<dyn AtomicStore>,
    sweeper: Option<JoinHandle<()>>,
    cluster: Option<Arc<Cluster>>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("sweeper", &self.sweeper)
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

impl Backend {
    async fn shutdown(self) -> anyhow::Result<()> {
        if let Some(sweeper) = self.sweeper {
            sweeper.abort();
            // Wait for the task to drop its handle on the store.
            let _ = sweeper.await;
        }
        drop(self.store);
        if let Some(cluster) = self.cluster {
            match Arc::try_unwrap(cluster) {
                Ok(cluster) => cluster.shutdown().await?,
                Err(_) => warn!("Cluster still referenced, skipping graceful shutdown"),
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TallyConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TallyConfig::default(),
    };

    init_tracing(&config.logging, cli.log_level.as_deref());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        max_operations = config.limiter.max_operations,
        period_secs = config.limiter.period_secs,
        strategy = %config.limiter.strategy,
        "Configuration loaded"
    );

    let backend = build_backend(&config.store).await?;
    let (limiter, backend) = build_limiter(&config.limiter, backend).await?;
    let mode = config.limiter.mode;

    let outcome = match cli.command {
        Command::Check { operations } => run_check(&limiter, mode, &operations).await,
        Command::Gate => run_gate(&limiter, mode).await,
        Command::Status { operation } => run_status(&limiter, &operation).await,
    };

    drop(limiter);
    backend.shutdown().await?;
    outcome
}

/// Initialize tracing on stderr; stdout carries decisions only.
fn init_tracing(logging: &LoggingConfig, override_level: Option<&str>) {
    let filter = match override_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level)),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_backend(config: &StoreConfig) -> anyhow::Result<Backend> {
    match config {
        StoreConfig::Memory {
            sweep_interval_secs,
        } => {
            let store = Arc::new(MemoryStore::new());
            let sweeper = store.spawn_sweeper(Duration::from_secs((*sweep_interval_secs).max(1)));
            info!("Using in-memory counter store");
            Ok(Backend {
                store,
                sweeper: Some(sweeper),
                cluster: None,
            })
        }
        StoreConfig::Mesh(mesh) => {
            let store = MeshStore::start(mesh.cluster_config()).await?;
            let cluster = store.cluster().clone();
            let sweeper = store.spawn_sweeper(Duration::from_secs(mesh.sweep_interval_secs.max(1)));
            info!(node_id = %cluster.node_id(), "Using gossip mesh counter store");
            Ok(Backend {
                store: Arc::new(store),
                sweeper: Some(sweeper),
                cluster: Some(cluster),
            })
        }
        #[cfg(feature = "redis")]
        StoreConfig::Redis(redis) => {
            let store = tally::store::RedisStore::connect(&redis.url, redis.prefix.clone()).await?;
            info!(url = %redis.url, "Using Redis counter store");
            Ok(Backend {
                store: Arc::new(store),
                sweeper: None,
                cluster: None,
            })
        }
        #[cfg(not(feature = "redis"))]
        StoreConfig::Redis(_) => {
            anyhow::bail!("the redis store requires building tally with the `redis` feature")
        }
    }
}

/// Build the limiter over `backend`, shutting the backend down if that fails.
async fn build_limiter(config: &LimiterConfig, backend: Backend) -> anyhow::Result<(Limiter, Backend)> {
    match FixedWindowRateLimiter::new(config.max_operations, config.period(), backend.store.clone()) {
        Ok(limiter) => Ok((limiter.with_strategy(config.strategy), backend)),
        Err(e) => {
            if let Err(shutdown_err) = backend.shutdown().await {
                warn!(error = %shutdown_err, "Failed to shut down store backend");
            }
            Err(e.into())
        }
    }
}

async fn decide(limiter: &Limiter, mode: CheckMode, operation: &str) -> tally::Result<bool> {
    match mode {
        CheckMode::ReadThenIncrement => limiter.limit_exceeded(operation).await,
        CheckMode::Strict => limiter.limit_exceeded_strict(operation).await,
    }
}

fn verdict(exceeded: bool) -> &'static str {
    if exceeded {
        "exceeded"
    } else {
        "allowed"
    }
}

async fn run_check(
    limiter: &Limiter,
    mode: CheckMode,
    operations: &[String],
) -> anyhow::Result<ExitCode> {
    let mut any_exceeded = false;
    for operation in operations {
        let exceeded = decide(limiter, mode, operation).await?;
        any_exceeded |= exceeded;
        println!("{}\t{}", operation, verdict(exceeded));
    }

    Ok(if any_exceeded {
        ExitCode::from(EXIT_EXCEEDED)
    } else {
        ExitCode::SUCCESS
    })
}

async fn run_gate(limiter: &Limiter, mode: CheckMode) -> anyhow::Result<ExitCode> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("Gating operations read from stdin");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => break,
        };
        let Some(line) = line else {
            break;
        };
        let operation = line.trim();
        if operation.is_empty() {
            continue;
        }

        // Store failures deny the operation and keep the gate running.
        let decision = match decide(limiter, mode, operation).await {
            Ok(exceeded) => verdict(exceeded),
            Err(e) => {
                warn!(operation = %operation, error = %e, "Decision unavailable, denying");
                "error"
            }
        };
        stdout
            .write_all(format!("{}\t{}\n", operation, decision).as_bytes())
            .await?;
        stdout.flush().await?;
    }

    info!("Gate stopped");
    Ok(ExitCode::SUCCESS)
}

async fn run_status(limiter: &Limiter, operation: &str) -> anyhow::Result<ExitCode> {
    let status = limiter.status(operation).await?;
    println!("key\t{}", status.key);
    println!("count\t{}", status.count);
    println!("remaining\t{}", status.remaining);
    println!("resets_in_secs\t{:.3}", status.resets_in.as_secs_f64());
    Ok(ExitCode::SUCCESS)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally::ratelimit::ManualClock;

    #[test]
    fn test_cli_parses_check() {
        let cli = Cli::try_parse_from(["tally", "--config", "tally.yaml", "check", "login", "search"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("tally.yaml")));
        match cli.command {
            Command::Check { operations } => assert_eq!(operations, vec!["login", "search"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_check_requires_operation() {
        assert!(Cli::try_parse_from(["tally", "check"]).is_err());
    }

    #[tokio::test]
    async fn test_memory_backend_limits() {
        let backend = build_backend(&StoreConfig::default()).await.unwrap();
        let limiter: Limiter =
            FixedWindowRateLimiter::new(1, Duration::from_secs(60), backend.store.clone())
                .unwrap()
                .with_clock(Arc::new(ManualClock::new(chrono::Utc::now())));

        assert!(!decide(&limiter, CheckMode::Strict, "login").await.unwrap());
        assert!(decide(&limiter, CheckMode::ReadThenIncrement, "login").await.unwrap());

        drop(limiter);
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_limiter_config_releases_backend() {
        let backend = build_backend(&StoreConfig::default()).await.unwrap();
        let store = backend.store.clone();
        let config = LimiterConfig {
            period_secs: 0,
            ..LimiterConfig::default()
        };

        let err = build_limiter(&config, backend).await.unwrap_err();
        assert!(err.to_string().contains("period"));

        // The sweeper task has been stopped and released its handle
        assert_eq!(Arc::strong_count(&store), 1);
    }

    #[tokio::test]
    async fn test_build_limiter_applies_config() {
        let backend = build_backend(&StoreConfig::default()).await.unwrap();
        let config = LimiterConfig {
            max_operations: 4,
            strategy: tally::BucketStrategy::Cyclic,
            ..LimiterConfig::default()
        };

        let (limiter, backend) = build_limiter(&config, backend).await.unwrap();
        assert_eq!(limiter.max_operations(), 4);
        assert_eq!(limiter.strategy(), tally::BucketStrategy::Cyclic);

        drop(limiter);
        backend.shutdown().await.unwrap();
    }
}
