use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mimalloc::MiMalloc;
use secrecy::SecretString;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use chat_relay::config_parser::Config;
use chat_relay::gateway_util::{build_router, AppStateData};
use chat_relay::observability::{self, LogFormat};
use chat_relay::reaper;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Use the specified config file. Incompatible with `--default-config`
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Use the default configuration
    #[arg(long)]
    default_config: bool,

    /// Sets the log format used for all gateway logs
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // Set up logs immediately, so that we can use `tracing`
    observability::setup_logs(args.log_format);

    if args.config_file.is_some() && args.default_config {
        tracing::error!("Cannot specify both `--config-file` and `--default-config`");
        std::process::exit(1);
    }

    let config = match &args.config_file {
        Some(path) => Arc::new(
            Config::load_from_path(path)
                .ok() // The error was already logged when it was constructed
                .expect_pretty(&format!(
                    "Failed to load config file `{}`",
                    path.display()
                )),
        ),
        None => {
            if !args.default_config {
                tracing::warn!(
                    "No config file provided; starting with the default configuration. Use `--config-file path/to/chat-relay.toml` to specify one."
                );
            }
            Arc::new(Config::default())
        }
    };

    let api_key = std::env::var("OPENROUTER_API_KEY")
        .ok()
        .map(SecretString::from);

    tracing::info!(
        "Starting {} {}",
        config.gateway.service_name,
        env!("CARGO_PKG_VERSION")
    );
    tracing::info!("├ Model: {}", config.upstream.model);
    tracing::info!(
        "├ API key: {}",
        if api_key.is_some() { "set" } else { "MISSING" }
    );
    tracing::info!(
        "├ Limits: {}/day, {}/hour, {}/minute, {}s cooldown",
        config.limits.max_per_day,
        config.limits.max_per_hour,
        config.limits.max_per_minute,
        config.limits.cooldown_secs
    );

    let app_state = AppStateData::new(config.clone(), api_key);

    // The reaper is owned by the process lifecycle: spawned here, cancelled
    // and awaited after the server drains
    let reaper_cancel = CancellationToken::new();
    let reaper_handle = reaper::spawn_reaper(
        app_state.quota_store.clone(),
        Duration::from_secs(config.limits.reaper_interval_secs),
        reaper_cancel.clone(),
    );

    let router = build_router(app_state);

    // Bind to the socket address specified in the config, or default to 0.0.0.0:3000
    let bind_address = config
        .gateway
        .bind_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to socket address {bind_address}: {e}. Tip: Ensure no other process is using port {} or try a different port.",
                bind_address.port()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to bind to socket address {bind_address}: {e}");
            std::process::exit(1);
        }
    };

    // This will give us the chosen port if the user specified a port of 0
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get bind address from listener");
    tracing::info!("└ Listening on {actual_bind_address}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Failed to start server");

    reaper_cancel.cancel();
    if reaper_handle.await.is_err() {
        tracing::warn!("Reaper task panicked during shutdown");
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
    };
}

/// We don't allow panic, unwrap, or similar methods outside of tests, except
/// for the private `expect_pretty` method, which is to be used only in
/// main.rs during initialization. After initialization, we expect all code
/// to handle errors gracefully.
///
/// `expect_pretty` will print an error message and exit with a status code
/// of 1.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}
