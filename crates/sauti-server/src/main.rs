//! Sauti relay server - WebSocket delivery for a conversational audio engine

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod events;
mod settings;
mod state;
mod upstream;

use sauti_core::Relay;

use events::WsEventRouter;
use settings::Settings;
use state::AppState;
use upstream::{HttpUpstream, UpstreamSignal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sauti_server=debug,sauti_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Sauti relay server");

    let settings = Settings::load()?;
    info!("Upstream engine at {}", settings.upstream.base_url);

    let routes = Arc::new(WsEventRouter::default());
    let (upstream, mut signals) = HttpUpstream::new(&settings.upstream)?;
    let relay = Arc::new(Relay::new(
        settings.delivery.clone(),
        routes.clone(),
        Arc::new(upstream),
    )?);

    // Pump streamed engine output into the relay.
    let pump_relay = relay.clone();
    tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            match signal {
                UpstreamSignal::Event(event) => {
                    if let Err(e) = pump_relay.on_upstream_event(event).await {
                        warn!("Upstream event dropped: {}", e);
                    }
                }
                UpstreamSignal::Disconnected { conversation_id } => {
                    pump_relay.on_upstream_disconnected(&conversation_id).await;
                }
            }
        }
    });

    // Sweep away conversations abandoned without a clean close.
    let sweep_relay = relay.clone();
    let max_idle = Duration::from_secs(settings.session.idle_timeout_secs);
    let mut sweep_tick =
        tokio::time::interval(Duration::from_secs(settings.session.sweep_interval_secs));
    tokio::spawn(async move {
        loop {
            sweep_tick.tick().await;
            let swept = sweep_relay.sweep_idle(max_idle);
            if swept > 0 {
                info!(swept, "Swept idle conversations");
            }
        }
    });

    let app = api::create_router(AppState::new(relay, routes));

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
