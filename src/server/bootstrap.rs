use crate::config::GatewayConfig;
use crate::server;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
}

/// Gateway lifecycle: init → load config → build state → serve → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut config = GatewayConfig::load(&args.config_path)?;

    let listen = args
        .listen
        .unwrap_or_else(|| format!("0.0.0.0:{}", config.gateway.port));

    // A CLI admin listener implies a dedicated admin port even when the
    // config document left it inline.
    let admin_listen = match args.admin_listen {
        Some(addr) => {
            let parsed: SocketAddr = addr
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid admin listen address {}: {}", addr, e))?;
            config.gateway.admin_port = Some(parsed.port());
            Some(addr)
        }
        None => config
            .gateway
            .admin_port
            .map(|port| format!("0.0.0.0:{}", port)),
    };

    // Health checkers spawn as upstreams enter the store.
    let state = server::GatewayState::new(config)?;
    state.registry.ratelimit_store().start_gc();

    let shutdown = Arc::new(Notify::new());

    if let Some(admin_addr) = admin_listen {
        let admin_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_admin_server(&admin_addr, admin_state).await {
                tracing::error!("server: admin failed, error={}", e);
            }
        });
    } else {
        tracing::info!("server: admin API inline under /admin");
    }

    tracing::info!("server: starting gateway, listen={}", listen);

    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    state.shutdown();

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
