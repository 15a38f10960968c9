//! tidekv server entry point.
//!
//! Parses command-line flags into an [`EngineConfig`], starts the engine and
//! serves RESP over TCP until Ctrl+C.

use anyhow::{bail, Context};
use std::sync::Arc;
use tidekv::config::{EngineConfig, MemoryConfig};
use tidekv::connection::{handle_connection, ConnectionStats};
use tidekv::engine::Engine;
use tidekv::storage::EvictionPolicy;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Server configuration
struct ServerConfig {
    host: String,
    port: u16,
    engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: tidekv::DEFAULT_HOST.to_string(),
            port: tidekv::DEFAULT_PORT,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parses configuration from command-line arguments.
    ///
    /// Returns `None` when the process should exit right away (`--help`,
    /// `--version`).
    fn from_args() -> anyhow::Result<Option<Self>> {
        let mut config = ServerConfig::default();
        let mut args = std::env::args().skip(1);

        while let Some(flag) = args.next() {
            let mut value = |name: &str| {
                args.next()
                    .with_context(|| format!("{} requires a value", name))
            };

            match flag.as_str() {
                "--host" | "-h" => config.host = value("--host")?,
                "--port" | "-p" => {
                    config.port = value("--port")?.parse().context("invalid port number")?;
                }
                "--shards" => {
                    config.engine.shard_count =
                        value("--shards")?.parse().context("invalid shard count")?;
                }
                "--maxmemory" => {
                    let limit = parse_size(&value("--maxmemory")?)?;
                    config.engine.memory = if limit == 0 {
                        MemoryConfig::unlimited()
                    } else {
                        MemoryConfig::with_limit(limit)
                    };
                }
                "--eviction-policy" => {
                    config.engine.eviction.policy = value("--eviction-policy")?
                        .parse::<EvictionPolicy>()?;
                }
                "--notify-queue" => {
                    config.engine.notification_queue_capacity = value("--notify-queue")?
                        .parse()
                        .context("invalid notification queue capacity")?;
                }
                "--help" => {
                    print_help();
                    return Ok(None);
                }
                "--version" | "-v" => {
                    println!("tidekv version {}", tidekv::VERSION);
                    return Ok(None);
                }
                other => {
                    print_help();
                    bail!("unknown argument: {}", other);
                }
            }
        }

        config.engine.validate()?;
        Ok(Some(config))
    }

    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parses a byte size with an optional `kb`, `mb` or `gb` suffix.
fn parse_size(text: &str) -> anyhow::Result<usize> {
    let lower = text.trim().to_ascii_lowercase();
    let (digits, unit) = match lower.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => lower.split_at(split),
        None => (lower.as_str(), ""),
    };
    let multiplier: usize = match unit {
        "" | "b" => 1,
        "kb" | "k" => 1024,
        "mb" | "m" => 1024 * 1024,
        "gb" | "g" => 1024 * 1024 * 1024,
        _ => bail!("invalid memory size: {}", text),
    };
    let amount: usize = digits
        .parse()
        .with_context(|| format!("invalid memory size: {}", text))?;
    amount
        .checked_mul(multiplier)
        .with_context(|| format!("memory size overflows: {}", text))
}

fn print_help() {
    println!(
        r#"
tidekv - sharded in-memory key-value engine with live query subscriptions

USAGE:
    tidekv [OPTIONS]

OPTIONS:
    -h, --host <HOST>               Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>               Port to listen on (default: 6379)
        --shards <N>                Number of shards (default: CPU count)
        --maxmemory <SIZE>          Memory limit, e.g. 64mb (default: 0 = unlimited)
        --eviction-policy <POLICY>  allkeys-lru | allkeys-lfu | allkeys-random | noeviction
        --notify-queue <N>          Per-client notification queue depth (default: 256)
    -v, --version                   Print version information
        --help                      Print this help message

WATCHING:
    Append .WATCH to any read-only command to receive its result whenever
    it changes:
    $ redis-cli -p 6379
    127.0.0.1:6379> GET.WATCH name
    1) "watch"
    2) "5f0c3a9e12b4d870"
    3) (integer) 0
    4) (nil)
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(config) = ServerConfig::from_args()? else {
        return Ok(());
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let engine = Arc::new(Engine::with_builtins(config.engine.clone())?);
    info!(
        shards = config.engine.shard_count,
        maxmemory = config.engine.memory.max_memory,
        policy = %config.engine.eviction.policy,
        "Engine started"
    );

    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    info!("tidekv v{} listening on {}", tidekv::VERSION, config.bind_address());

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&engine), stats) => {}
        _ = shutdown => {}
    }

    engine.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}

async fn accept_loop(listener: TcpListener, engine: Arc<Engine>, stats: Arc<ConnectionStats>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(handle_connection(
                    stream,
                    addr,
                    Arc::clone(&engine),
                    Arc::clone(&stats),
                ));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
