//! `shipwright sweep`: one stuck-job pass against the database.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use shipwright::config::ShipwrightConfig;
use shipwright::pipeline::StuckJobSweep;
use shipwright::store::SqliteStore;

pub async fn cmd_sweep(config: &ShipwrightConfig) -> Result<()> {
    if !config.storage.db_path.exists() {
        anyhow::bail!(
            "No database at {}. Run 'shipwright init' first.",
            config.storage.db_path.display()
        );
    }
    let store = Arc::new(SqliteStore::open(&config.storage.db_path)?);
    let sweep = StuckJobSweep::new(store, config.stale_after());
    let report = sweep
        .sweep_once(Utc::now())
        .await
        .context("Sweep failed")?;

    println!(
        "Examined {} stuck job(s): {} failed, {} skipped, {} error(s)",
        report.examined, report.failed, report.skipped, report.errors
    );
    Ok(())
}
