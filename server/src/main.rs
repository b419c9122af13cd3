//! Palace card game server entry point

use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::Server;
use std::path::{Path, PathBuf};

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about = "TCP session server for the Palace card game")]
struct Args {
    /// Load configuration from a key=value file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Server IP address to bind to (overrides the config file)
    #[clap(long)]
    ip: Option<String>,

    /// Server port to listen on (overrides the config file)
    #[clap(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = ServerConfig::default();
    if let Some(path) = &args.config {
        if let Err(e) = config.load_from_file(path) {
            eprintln!("Failed to read config file {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
    if let Some(ip) = args.ip {
        config.ip = ip;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    init_logging(&config);
    info!(
        "Starting Palace server on {} (max {} rooms)",
        config.bind_addr(),
        config.max_rooms
    );

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run(shutdown_signal()).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

/// Initializes the logger, honoring `RUST_LOG` with an `info` default.
/// With file logging enabled, output goes to the configured file instead of
/// stderr; failure to open it falls back to stderr with a note.
fn init_logging(config: &ServerConfig) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if config.enable_file_logging {
        if let Some(parent) = Path::new(&config.log_file).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)
        {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!(
                    "Could not open log file {}: {}, logging to stderr",
                    config.log_file, e
                );
            }
        }
    }
    builder.init();
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
