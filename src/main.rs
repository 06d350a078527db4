use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tenantgate::config::Config;
use tenantgate::manager::{TenantManager, REAP_INTERVAL};
use tenantgate::router::GateServer;
use tenantgate::{PKG_NAME, VERSION};
use tokio::sync::watch;
use tracing::{error, info};

/// Header-routed reverse proxy that starts tenant workers on demand
#[derive(Debug, Parser)]
#[command(name = "tenantgate", version)]
struct Options {
    /// Config file to load settings from
    #[arg(short = 'c', long = "config")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tenantgate=info".parse().expect("valid log directive")),
        )
        .init();

    let options = Options::parse();

    let config = Config::load(&options.config).map_err(|e| {
        error!(path = %options.config.display(), error = %e, "failed to load configuration");
        e
    })?;
    let config = Arc::new(config);

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = TenantManager::new(Arc::clone(&config));
    let server = GateServer::new(Arc::clone(&config), Arc::clone(&manager), shutdown_rx.clone())?;

    // Spawn idle reap loop
    let reap_manager = Arc::clone(&manager);
    let reap_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        reap_loop(reap_manager, reap_shutdown_rx).await;
    });

    // Spawn the gate server
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "gate server error");
        }
    });

    wait_for_shutdown_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Kill all live workers and give their supervisors a moment to drain
    info!("killing live workers...");
    manager.kill_all();
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        while manager.live_workers() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("shutdown complete");
    Ok(())
}

/// Periodically reap workers whose tenants have gone idle.
async fn reap_loop(manager: Arc<TenantManager>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(REAP_INTERVAL) => {
                manager.reap_idle();
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "starting gate");
    info!(
        bind = %config.bind,
        header = %config.header,
        regex = %config.regex,
        "routing configuration"
    );
    info!(
        binary = %config.program.binary,
        args = ?config.program.args,
        env_entries = config.program.env.len(),
        "worker program"
    );
    info!(
        id_start = config.id_start,
        max_procs = config.max_procs,
        process_timeout_secs = config.process_timeout,
        http_timeout_secs = config.http_timeout,
        tenants = config.data.len(),
        "lifecycle configuration"
    );
}
