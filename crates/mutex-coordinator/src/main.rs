use anyhow::Context;
use tracing::info;

use mutex_coordinator::logging::init_tracing;
use mutex_coordinator::{CoordinatorConfig, Driver};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("mutex-coordinator {}", env!("CARGO_PKG_VERSION"));

    let config = CoordinatorConfig::from_env().context("reading configuration")?;
    info!(
        workers = config.workers,
        first_id = config.first_id,
        hold_ms = config.hold.as_millis() as u64,
        "Configuration loaded"
    );

    let driver = Driver::new(&config)?;
    let report = driver.run_to_completion().await?;

    if let Err(violation) = report.verify() {
        anyhow::bail!("run trace shows a broken critical section: {violation}");
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
