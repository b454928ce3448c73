//! Composition root: load configuration, construct the repository, the
//! publisher, and the route tables, then serve until SIGINT/SIGTERM.
//! Teardown order: stop accepting, drain in-flight requests (5 s grace),
//! close the publisher, close the repository.

use anyhow::Context;
use service_gateway::audit::kafka::build_publisher;
use service_gateway::core::config::GatewayConfig;
use service_gateway::gateway::dynamic::DynamicGateway;
use service_gateway::gateway::server::{build_app, AppState, MiddlewareSettings};
use service_gateway::policy::build_repository;
use service_gateway::proxy::{build_client, ReverseProxy, TransformTable};
use service_gateway::routing::{Route, RouteRegistry, RouteTable};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path =
        std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "configs/gateway.yaml".to_string());
    let config = GatewayConfig::load_from_file(&config_path)
        .await
        .with_context(|| format!("loading {config_path}"))?;

    info!(
        app = %config.application.name,
        addr = %config.server.addr,
        "starting service gateway"
    );

    let repo = build_repository(&config)
        .await
        .context("initializing policy repository")?;
    let publisher = build_publisher(&config.kafka, &config.application.log.topic)
        .context("initializing audit publisher")?;

    // Shared outbound client; the overall budget covers a full
    // read-and-respond round trip.
    let client_timeout =
        config.server.read_timeout() + config.server.write_timeout() + Duration::from_secs(2);
    let client = build_client(client_timeout).context("building HTTP client")?;

    // Route tables: code-registered first, then the YAML-declared table.
    let (registered, registered_options) = RouteRegistry::new().build()?;
    let yaml_routes: Vec<Route> = config.routes.iter().map(Route::from_definition).collect();
    let table = RouteTable::new(yaml_routes).context("compiling route table")?;

    let rproxy = Arc::new(ReverseProxy::new(client.clone(), TransformTable::builtin()));
    let dynamic = Arc::new(DynamicGateway::new(
        Arc::clone(&repo),
        Arc::clone(&publisher),
        client,
        &config,
    ));

    let state = AppState {
        registered: Arc::new(registered),
        registered_options: Arc::new(registered_options),
        table: Arc::new(table),
        rproxy,
        dynamic,
    };
    let app = build_app(state, MiddlewareSettings::from_config(&config));

    let addr: SocketAddr = config.server.addr.parse().context("parsing server.addr")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "gateway listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight requests");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => warn!(error = %e, "server task join failed"),
        Err(_) => warn!("grace period elapsed, aborting in-flight requests"),
    }

    publisher.close().await;
    repo.close().await;
    info!("gateway stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
