use anyhow::Result;
use tracing::info;

mod federation;

use federation::{FederationModule, SimulationSettings};

#[tokio::main]
async fn main() -> Result<()> {
    fedshield_core::init_tracing("coordinator")?;
    let cfg = fedshield_core::load_config()?;
    let settings = SimulationSettings::from_env()?;
    info!(target: "coordinator", clients = settings.clients, rounds = settings.rounds, "starting_coordinator");

    let module = FederationModule::new(cfg, &settings)?;
    for _ in 0..settings.rounds {
        let summary = module.run_round().await?;
        info!(target: "coordinator", summary = %serde_json::to_string(&summary)?, "round_finished");
    }
    module.shutdown().await?;
    Ok(())
}
