use std::{
    net::SocketAddr,
    sync::{atomic::AtomicI64, Arc},
};

use anyhow::Context;
use clap::Parser;
use tokio::{net::TcpListener, signal};
use tracing::info;

use crate::{
    room::{advancer::RoomAdvancers, hub::RoomHub, presence},
    settings::Settings,
    state::{AppState, Shutdown},
    store::{Cache, Db},
    utils::init_tracing,
};

mod auth;
mod protocol;
mod room;
mod routes;
mod settings;
mod sfu;
mod state;
mod store;
mod utils;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();
    init_tracing(settings.log);

    let cache = Cache::connect(&settings.redis_url)
        .await
        .context("failed to connect to the shared store")?;
    let db = Db::connect(&settings.database_url)
        .await
        .context("failed to connect to the durable store")?;
    MIGRATOR
        .run(&*db)
        .await
        .context("failed to migrate the durable store")?;

    let shutdown = Shutdown::new();
    let advancers = RoomAdvancers::new(
        cache.clone(),
        db.clone(),
        settings.audience_delay_seconds_default,
        shutdown.clone(),
    );
    let (hub, relay) = RoomHub::new(cache.clone());
    tokio::spawn(relay.run(advancers.clone(), shutdown.clone()));
    tokio::spawn(presence::broadcast_loop(
        cache.clone(),
        hub.clone(),
        settings.presence_broadcast_every_ms,
        shutdown.clone(),
    ));

    let bind_addr = settings.bind_addr;
    let state = AppState {
        db,
        cache,
        hub,
        advancers,
        settings: Arc::new(settings),
        http: reqwest::Client::new(),
        shutdown: shutdown.clone(),
        sessions_online: Arc::new(AtomicI64::new(0)),
    };

    let app = routes::router(state);
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("Starting server on {bind_addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await
    .context("server exited with an error")?;

    info!("Successfully shut down");
    Ok(())
}

async fn shutdown_signal(shutdown: Shutdown) {
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
        _ = shutdown.cancelled() => {}
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Starting to shut down...");
    shutdown.shutdown();
}
