mod cli;
mod config;
mod error;
mod filter;
mod metrics;
mod pool;
mod server;
mod sink;
mod template;
mod types;
mod writer;

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cli::Cli;
use config::Config;
use metrics::Metrics;
use server::AppState;
use sink::Sink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli)?;

    let filter = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let sink = Arc::new(Sink::start(
        config.sink_config(),
        config.template(),
        config.filter(),
    ));
    let state = AppState::new(sink.clone(), Arc::new(Metrics::new()), &config.tag_header)?
        .with_max_body_size(config.max_body_size);

    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Could not listen on {}", addr))?;

    info!(
        "Writing records to {} using pattern {}",
        config.target.display(),
        config.pattern
    );
    info!("Starting to listen on {}…", addr);

    let stop = CancellationToken::new();
    let mut server = tokio::spawn(server::serve(listener, server::router(state), stop.clone()));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received signal, shutting down…");
        }
        result = &mut server => {
            // the server died on its own, still flush what was accepted
            sink.close().await?;
            return result?;
        }
    }

    stop.cancel();
    match tokio::time::timeout(config.shutdown_timeout(), server).await {
        Ok(Ok(Ok(()))) => info!("HTTP server stopped."),
        Ok(Ok(Err(err))) => error!("{:#}", err),
        Ok(Err(err)) => error!("HTTP server task failed: {}", err),
        Err(_) => warn!(
            "HTTP server did not stop within {:?}, closing sink anyway",
            config.shutdown_timeout()
        ),
    }

    info!("Shutting down log processor…");
    sink.close().await?;
    info!(
        "Processor closed after opening {} files, exiting.",
        sink.opened_writers()
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
