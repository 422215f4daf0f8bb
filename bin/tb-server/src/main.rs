//! Turn Bridge server.
//!
//! One process runs all four subsystems: the webhook HTTP surface, the
//! inbound dedup/publish pipeline, the outbound consumer, and the
//! session-timeout reaper. Multiple processes may run side by side; shared
//! state (claims, locks, seen markers) lives in Redis.

use std::sync::Arc;

use anyhow::{Context, Result};
use lapin::{Connection, ConnectionProperties};
use metrics_exporter_prometheus::PrometheusBuilder;
use redis::aio::ConnectionManager;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use tb_bus::{spawn_bus_monitor, BusMonitor, Publisher, SessionReaper};
use tb_claims::{ClaimRegistry, MessageLock, SeenMarkers};
use tb_config::AppConfig;
use tb_consumer::{OutboundConsumer, OutboundDispatcher, TurnApiClient, TurnApiConfig};
use tb_webhook::{create_router, AppState, InboundPipeline, WebhookSchema};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tb_common::logging::init_logging("tb-server");

    let config = Arc::new(AppConfig::from_env().context("reading configuration")?);
    info!(
        transport_name = %config.transport_name,
        api_host = %config.api_host,
        concurrency = config.concurrency,
        redis = config.redis_url.is_some(),
        hmac = config.hmac_secret.is_some(),
        "Starting Turn Bridge"
    );
    if config.sentry_dsn.is_some() {
        warn!("SENTRY_DSN is set but error reporting is not built into this binary");
    }

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing metrics recorder")?;

    // Redis is optional: without it, dedup, claim bookkeeping, and the
    // reaper are disabled and every webhook message publishes directly.
    let redis = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).context("parsing REDIS_URL")?;
            Some(
                ConnectionManager::new(client)
                    .await
                    .context("connecting to redis")?,
            )
        }
        None => {
            info!("REDIS_URL not set, deduplication and claim tracking disabled");
            None
        }
    };

    let connection = Arc::new(
        Connection::connect(
            &config.amqp_url,
            ConnectionProperties::default().with_connection_name("turn-bridge".into()),
        )
        .await
        .context("connecting to AMQP broker")?,
    );

    let publisher = Arc::new(
        Publisher::new(&connection, &config.transport_name, config.publish_timeout)
            .await
            .context("setting up publisher")?,
    );

    let claims = redis.clone().map(ClaimRegistry::new);
    let lock = redis
        .clone()
        .map(|conn| MessageLock::new(conn, config.lock_timeout));
    let seen = redis
        .clone()
        .map(|conn| SeenMarkers::new(conn, config.deduplication_window));

    let reaper = claims.clone().map(|registry| {
        SessionReaper::new(
            publisher.clone(),
            registry,
            &config.whatsapp_number,
            &config.transport_name,
        )
        .spawn()
    });

    let bus_monitor = Arc::new(BusMonitor::new());
    bus_monitor.touch();
    let (monitor_shutdown_tx, _) = broadcast::channel(1);
    let _monitor = spawn_bus_monitor(
        connection.clone(),
        bus_monitor.clone(),
        monitor_shutdown_tx.clone(),
    );

    let turn_config = TurnApiConfig::new(&config.api_host, config.api_token.clone())
        .context("building provider API config")?
        .with_timeout(config.consume_timeout)
        .with_concurrency(config.concurrency as usize);
    let dispatcher = Arc::new(OutboundDispatcher::new(
        TurnApiClient::new(turn_config).context("building provider API client")?,
        claims.clone(),
    ));
    let consumer = OutboundConsumer::start(
        &connection,
        &config.outbound_queue(),
        config.concurrency,
        dispatcher,
    )
    .await
    .context("starting outbound consumer")?;

    let pipeline = Arc::new(InboundPipeline {
        publisher: publisher.clone(),
        claims,
        lock,
        seen,
        whatsapp_number: config.whatsapp_number.clone(),
        transport_name: config.transport_name.clone(),
    });

    let state = AppState {
        config: config.clone(),
        pipeline,
        schema: Arc::new(WebhookSchema::compile()),
        amqp: connection.clone(),
        bus_monitor,
        redis,
        metrics: Some(metrics_handle),
    };

    let addr = format!("{}:{}", config.http_host, config.http_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "HTTP server listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, create_router(state)).await {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received");

    // The reaper must stop before the AMQP connection goes away so a final
    // sweep cannot fire on a closed channel.
    consumer.stop().await;
    if let Some(reaper) = reaper {
        reaper.teardown().await;
    }
    let _ = monitor_shutdown_tx.send(());
    server.abort();
    let _ = connection.close(200, "Shutdown").await;
    info!("Turn Bridge stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
