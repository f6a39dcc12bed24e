//! `astm-bridge` binary: ASTM listeners, HTTP listener and the forwarding
//! handlers between them.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use astm_bridge::config::BridgeConfig;
use astm_bridge::forward::{AstmForwardHandler, HttpForwardHandler};
use astm_bridge::handler::{DispatchMode, HandlerService};
use astm_bridge::tcp::AstmTcpServer;
use astm_bridge::{http, Result};

const DEFAULT_CONFIG_PATH: &str = "astm-bridge.toml";

/// Bridge between ASTM LIS01-A2 / E1381-95 instruments and HTTP
#[derive(Parser, Debug)]
#[command(name = "astm-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start all listeners
    Run {
        /// Path to configuration file; defaults are used if it does not exist
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Validate configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config } => cmd_run(&config).await,
        Commands::Validate { config } => cmd_validate(&config).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn cmd_run(path: &Path) -> Result<()> {
    let config = if path.exists() {
        let config = BridgeConfig::load(path).await?;
        init_logging(&config.logging.level);
        config
    } else {
        let config = BridgeConfig::default();
        init_logging(&config.logging.level);
        warn!(
            "configuration file {} not found, using defaults",
            path.display()
        );
        config
    };

    let shutdown = CancellationToken::new();
    let (astm_service, http_service) = build_services(&config, &shutdown);

    let mut tasks: JoinSet<Result<()>> = JoinSet::new();
    for listener in &config.astm_listen {
        let server = AstmTcpServer::bind(&listener.bind_addr(), listener.version).await?;
        tasks.spawn(server.run(astm_service.clone(), shutdown.clone()));
    }

    let http_listener = TcpListener::bind(config.http_listen.bind_addr()).await?;
    tasks.spawn(http::serve(http_listener, http_service, shutdown.clone()));

    info!("astm-bridge started, press Ctrl+C to stop");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("failed to listen for shutdown signal: {}", e);
            }
            info!("shutdown requested");
        }
        Some(finished) = tasks.join_next() => {
            warn!("a listener stopped unexpectedly: {:?}", finished);
        }
    }
    shutdown.cancel();

    while let Some(finished) = tasks.join_next().await {
        match finished {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("listener failed: {}", e),
            Err(e) => error!("listener task panicked: {}", e),
        }
    }
    info!("astm-bridge stopped");
    Ok(())
}

async fn cmd_validate(path: &Path) -> Result<()> {
    init_logging("warn");
    let config = BridgeConfig::load(path).await?;
    println!("configuration {} is valid", path.display());
    println!("{}", config.to_toml()?);
    Ok(())
}

/// ASTM side messages go to HTTP; HTTP side messages go to ASTM.
fn build_services(
    config: &BridgeConfig,
    shutdown: &CancellationToken,
) -> (HandlerService, HandlerService) {
    let forward_http = &config.forward_http;
    let astm_service = HandlerService::new(DispatchMode::All).with_handler(
        HttpForwardHandler::new(&forward_http.uri)
            .with_credentials(forward_http.username.clone(), forward_http.password.clone()),
    );

    let forward_astm = &config.forward_astm;
    let http_service = HandlerService::new(DispatchMode::First).with_handler(
        AstmForwardHandler::new(
            &forward_astm.host_name,
            forward_astm.port,
            forward_astm.version,
            astm_service.clone(),
        )
        .with_cancellation(shutdown.child_token()),
    );

    (astm_service, http_service)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .ok();
}
