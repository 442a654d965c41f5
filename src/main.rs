use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command, value_parser};
use sqlgate::{GatewayConfig, Server};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

fn cli() -> Command {
    Command::new("sqlgate")
        .about("PostgreSQL wire-protocol gateway for embedded SQLite databases")
        .arg(Arg::new("host").long("host").value_name("HOST").help("Address to listen on"))
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Directory holding one <database>.db file per logical database"),
        )
        .arg(usize_arg("max-connections"))
        .arg(usize_arg("workers"))
        .arg(usize_arg("worker-queue").help("Pending connections each worker may queue"))
        .arg(millis_arg("busy-timeout-ms").help("Give up on contended writes after this long; 0 waits until cancelled"))
        .arg(millis_arg("busy-retry-ms"))
        .arg(millis_arg("engine-lock-wait-ms"))
        .arg(millis_arg("connect-timeout-ms"))
        .arg(usize_arg("max-message-size"))
        .arg(
            Arg::new("accept-ratio")
                .long("accept-ratio")
                .value_name("PERCENT")
                .value_parser(value_parser!(u8)),
        )
        .arg(usize_arg("write-chunk"))
        .arg(
            Arg::new("users")
                .long("users")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("JSON role file; without it every user is trusted"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("FILTER")
                .help("Overrides RUST_LOG"),
        )
}

fn usize_arg(name: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .value_name("N")
        .value_parser(value_parser!(usize))
}

fn millis_arg(name: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .value_name("MS")
        .value_parser(value_parser!(u64))
}

fn config_from(matches: &ArgMatches) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    let millis = |name: &str| matches.get_one::<u64>(name).copied().map(Duration::from_millis);
    let count = |name: &str| matches.get_one::<usize>(name).copied();

    if let Some(host) = matches.get_one::<String>("host") {
        config.listen_host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.listen_port = *port;
    }
    if let Some(dir) = matches.get_one::<PathBuf>("data-dir") {
        config.data_dir = dir.clone();
    }
    config.max_connections = count("max-connections").unwrap_or(config.max_connections);
    config.workers = count("workers").unwrap_or(config.workers);
    config.worker_queue_capacity = count("worker-queue").unwrap_or(config.worker_queue_capacity);
    config.busy_timeout = millis("busy-timeout-ms").unwrap_or(config.busy_timeout);
    config.busy_retry_interval = millis("busy-retry-ms").unwrap_or(config.busy_retry_interval);
    config.engine_lock_wait = millis("engine-lock-wait-ms").unwrap_or(config.engine_lock_wait);
    config.connect_timeout = millis("connect-timeout-ms").unwrap_or(config.connect_timeout);
    config.max_message_size = count("max-message-size").unwrap_or(config.max_message_size);
    if let Some(ratio) = matches.get_one::<u8>("accept-ratio") {
        config.accept_ratio = *ratio;
    }
    config.write_chunk_size = count("write-chunk").unwrap_or(config.write_chunk_size);
    config.users_file = matches.get_one::<PathBuf>("users").cloned();
    config
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let filter = match matches.get_one::<String>("log-level") {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    fmt().with_env_filter(filter).init();

    let config = config_from(&matches);
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;
    let server = Server::start(config).context("starting gateway")?;

    shutdown_signal().await;
    info!("shutdown requested");
    server.shutdown();
    Ok(())
}
