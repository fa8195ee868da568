//! CacheCraft Daemon Binary
//!
//! Runs the client core against a repository directory. The front-end
//! endpoint given with `--listen-on-tcp` is bound here so a misconfigured
//! port fails fast; the proxy logic itself lives in the front-end program.

use std::path::PathBuf;
use std::process::ExitCode;

use cachecraft_core::{Cancel, Error};
use cachecraft_daemon::ClientService;
use cachecraft_settings::Settings;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// CacheCraft - peer-to-peer distributed web cache
#[derive(Parser)]
#[command(name = "cachecraft-daemon")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Repository directory (store, settings, port hints)
    #[arg(long)]
    repo: PathBuf,

    /// Local proxy endpoint for the HTTP front-end
    #[arg(long)]
    listen_on_tcp: Option<String>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cachecraft=debug"));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse();
    tracing::info!(repo = %cli.repo.display(), "Starting CacheCraft daemon...");

    let mut settings = match Settings::load_or_default(&cli.repo) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::error!(%err, "cannot load settings");
            return ExitCode::from(1);
        }
    };
    if let Some(listen) = cli.listen_on_tcp {
        settings.listen_on_tcp = listen;
    }

    // Reserve the front-end endpoint up front so a bad --listen-on-tcp is
    // a startup error, not a surprise later.
    let front_end = match tokio::net::TcpListener::bind(&settings.listen_on_tcp).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(endpoint = %settings.listen_on_tcp, %err, "cannot bind proxy endpoint");
            return ExitCode::from(1);
        }
    };

    let cancel = Cancel::new();
    let service = match ClientService::start(&cli.repo, settings, &cancel).await {
        Ok(service) => service,
        Err(Error::StoreCorruption(err)) => {
            tracing::error!(%err, "store corruption");
            return ExitCode::from(2);
        }
        Err(Error::Config(err)) => {
            tracing::error!(%err, "configuration error");
            return ExitCode::from(1);
        }
        Err(err) => {
            tracing::error!(%err, "startup failed");
            return ExitCode::from(1);
        }
    };
    tracing::info!(peer_endpoint = %service.peer_endpoint(), "daemon running");

    // Hold front-end connections until the real front-end attaches over
    // the service facade; plain connects are dropped.
    let fe_cancel = cancel.child();
    tokio::spawn(async move {
        loop {
            match fe_cancel.run(front_end.accept()).await {
                Err(_) => return,
                Ok(Ok((_stream, remote))) => {
                    tracing::debug!(%remote, "front-end connection (no handler attached)");
                }
                Ok(Err(err)) => tracing::debug!(%err, "front-end accept failed"),
            }
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(err) => tracing::error!(%err, "cannot listen for shutdown signal"),
    }
    service.stop().await;
    cancel.fire();

    tracing::info!("Daemon stopped");
    ExitCode::SUCCESS
}
