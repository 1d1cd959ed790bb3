#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use changefeed::config::SimulationConfig;
use changefeed::simulation::{Simulator, SimulatorConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "changefeed=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match SimulationConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Running simulation: seed={}, steps={}, groups={}",
        config.seed,
        config.steps,
        config.groups
    );

    let result = Simulator::new(SimulatorConfig::from(&config)).run().await;

    tracing::info!(
        "Simulation finished: operations={}, left_operations={}, events={}",
        result.operations_run,
        result.left_operations,
        result.events_received
    );
    if let Some(error) = &result.error {
        tracing::error!("Simulation stopped early: {error}");
    }
    for violation in &result.invariant_violations {
        tracing::error!(
            "Invariant violation at operation {}: {} ({})",
            violation.operation_index,
            violation.description,
            violation.context
        );
    }

    if !result.passed() {
        tracing::error!("Simulation failed; rerun with CHANGEFEED_SEED={}", result.seed);
        std::process::exit(1);
    }
    tracing::info!("Simulation passed");
}
