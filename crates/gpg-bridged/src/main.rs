use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use clap::{Parser, Subcommand};
use gpg_bridge_core::certs::{CertError, CertificateProvider, EnsureOutcome};
use gpg_bridge_core::context::BridgeContext;
use gpg_bridge_core::events::{
    BridgeEvent, EventSink, JsonLinesEventSink, MultiEventSink, TracingEventSink,
};
use gpg_bridge_core::gpg::Gpg;
use gpg_bridge_core::locator::GpgLocator;
use gpg_bridge_core::runner::TokioRunner;
use gpg_bridge_core::session::Passcode;
use tracing::{error, info, warn};

mod config;
mod server;

use config::BridgeConfig;

/// Time given to open connections to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before exiting on a certificate problem so the message stays on
/// screen when launched from a desktop shortcut.
const CERT_ERROR_PAUSE: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(name = "gpg-bridged", version, about = "Local GPG signing bridge for the browser")]
struct Cli {
    /// Config file (default: $GPG_BRIDGE_CONFIG or ~/.gpg-bridge/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Listen port, overriding the config file.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Also write UI events to stdout as JSON lines.
    #[arg(long, global = true)]
    events_stdout: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Run the bridge (default).
    Serve,
    /// Create the TLS key and certificate if none exist, then exit.
    InitCerts,
}

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Certificates(#[from] CertError),

    #[error("failed to load TLS material: {0}")]
    Tls(#[source] io::Error),

    #[error("failed to generate passcode: {0}")]
    Passcode(String),

    #[error("failed to create temp directory: {0}")]
    TempDir(#[source] io::Error),

    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let mut config = config::load_config(cli.config.as_deref());
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run(config, cli.events_stdout).await,
        Command::InitCerts => init_certs(&config).await,
    };

    if let Err(e) = result {
        error!("{e}");
        if matches!(e, StartupError::Certificates(_)) {
            tokio::time::sleep(CERT_ERROR_PAUSE).await;
        }
        eprintln!("gpg-bridged: {e}");
        std::process::exit(1);
    }
}

/// Logs go to stderr; stdout is reserved for `--events-stdout`.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn init_certs(config: &BridgeConfig) -> Result<(), StartupError> {
    let provider = CertificateProvider::new(config.cert_dir());
    match provider.ensure().await? {
        EnsureOutcome::Generated => {
            info!("wrote new certificate to {}", provider.dir().display())
        }
        EnsureOutcome::Existing => {
            info!("certificate already present in {}", provider.dir().display())
        }
    }
    Ok(())
}

fn event_sink(events_stdout: bool) -> Arc<dyn EventSink> {
    let tracing: Arc<dyn EventSink> = Arc::new(TracingEventSink);
    if events_stdout {
        Arc::new(MultiEventSink::new(vec![
            tracing,
            Arc::new(JsonLinesEventSink::stdout()),
        ]))
    } else {
        tracing
    }
}

fn process_temp_dir(config: &BridgeConfig) -> io::Result<tempfile::TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("gpg-bridge-");
    match &config.gpg.temp_dir {
        Some(parent) => builder.tempdir_in(parent),
        None => builder.tempdir(),
    }
}

async fn run(config: BridgeConfig, events_stdout: bool) -> Result<(), StartupError> {
    let provider = CertificateProvider::new(config.cert_dir());
    if config.tls.generate && provider.ensure().await? == EnsureOutcome::Generated {
        info!("created self-signed certificate in {}", provider.dir().display());
    }
    let bundle = provider.load().await?;
    let tls = RustlsConfig::from_pem(
        bundle.certificate.into_bytes(),
        bundle.private_key.into_bytes(),
    )
    .await
    .map_err(StartupError::Tls)?;

    let passcode = Passcode::generate().map_err(|e| StartupError::Passcode(e.to_string()))?;
    let temp = process_temp_dir(&config).map_err(StartupError::TempDir)?;

    let gpg = Gpg::new(
        Arc::new(GpgLocator::system(config.gpg.path.clone())),
        Arc::new(TokioRunner),
    );
    if let Err(e) = gpg.executable().await {
        warn!("{e}; commands that need gpg will fail until it is installed");
    }

    let ctx = Arc::new(
        BridgeContext::builder(passcode, gpg, temp.path())
            .events(event_sink(events_stdout))
            .product(gpg_bridge_core::APP_NAME, env!("CARGO_PKG_VERSION"))
            .build(),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = axum_server::Handle::new();
    let app = server::build_router(ctx.clone(), shutdown_rx);

    let server = axum_server::bind_rustls(config.listen_addr(), tls)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    tokio::pin!(server);

    {
        let handle = handle.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Some(addr) = handle.listening().await {
                ctx.emit(BridgeEvent::ServerUp {
                    port: addr.port(),
                    passcode: ctx.passcode().expose().to_owned(),
                });
            }
        });
    }

    let signalled = tokio::select! {
        res = &mut server => {
            res.map_err(StartupError::Serve)?;
            false
        }
        _ = wait_for_shutdown_signal() => true,
    };

    if signalled {
        let _ = shutdown_tx.send(true);
        handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
        info!("draining active connections (up to {}s)...", DRAIN_TIMEOUT.as_secs());
        if let Err(e) = server.await {
            warn!("server error during shutdown: {e}");
        }
    }

    ctx.emit(BridgeEvent::ServerDown);
    if let Err(e) = temp.close() {
        warn!("failed to remove temp directory: {e}");
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("shutdown requested (ctrl-c)"),
                    _ = sigterm.recv() => info!("shutdown requested (sigterm)"),
                }
                return;
            }
            Err(e) => warn!("cannot listen for SIGTERM: {e}"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested (ctrl-c)");
}
