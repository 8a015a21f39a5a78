//! Fleet Dispatch - Axum Server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use fleet_dispatch::api::{self, AppState};
use fleet_dispatch::clock::SystemClock;
use fleet_dispatch::config::DispatchConfig;
use fleet_dispatch::console;
use fleet_dispatch::demo_data;
use fleet_dispatch::distance::HaversineProvider;
use fleet_dispatch::planner::Planner;
use fleet_dispatch::state::FleetState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("fleet_dispatch=info".parse().unwrap()))
        .init();

    let config = match DispatchConfig::load_from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(2);
        }
    };

    let fleet = Arc::new(
        FleetState::new(Arc::new(SystemClock))
            .with_lease_timeout(Duration::from_millis(config.engines.lease_timeout_ms)),
    );
    let demo = demo_data::generate_riyadh();
    if let Err(e) = demo.load_into(&fleet) {
        tracing::error!(error = %e, "Failed to load demo fleet");
        std::process::exit(1);
    }

    let distance = Arc::new(HaversineProvider::from_settings(&config.providers));
    let planner = Arc::new(Planner::new(config, distance));
    let state = Arc::new(AppState::new(planner, Arc::clone(&fleet)));

    console::print_banner();
    console::print_fleet(demo.vehicles.len(), demo.pickups.len(), demo.deliveries.len());
    state.automation.start_all();

    let app = api::create_router(Arc::clone(&state));
    let addr = SocketAddr::from(([0, 0, 0, 0], 7860));
    println!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    state.automation.stop_all().await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
