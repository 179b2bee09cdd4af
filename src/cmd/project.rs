//! Project setup commands: `shipwright init` and `shipwright set-secret`.

use std::path::Path;

use anyhow::{Context, Result};

use shipwright::config::ShipwrightConfig;
use shipwright::store::{SecretStore, SqliteStore};

/// Write a default config file (unless one exists) and create the database
/// and artifact directory it points at.
pub fn cmd_init(config_path: &Path, config: &ShipwrightConfig, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        println!("Config already exists at {}", config_path.display());
    } else {
        config.save(config_path)?;
        println!("Wrote {}", config_path.display());
    }

    SqliteStore::open(&config.storage.db_path)?;
    println!("Database ready at {}", config.storage.db_path.display());

    std::fs::create_dir_all(&config.storage.artifact_dir).with_context(|| {
        format!(
            "Failed to create artifact directory {}",
            config.storage.artifact_dir.display()
        )
    })?;
    println!("Artifacts stored in {}", config.storage.artifact_dir.display());
    Ok(())
}

pub async fn cmd_set_secret(
    config: &ShipwrightConfig,
    owner: &str,
    value: &str,
    name: Option<&str>,
) -> Result<()> {
    if owner.trim().is_empty() {
        anyhow::bail!("Owner id must not be empty");
    }
    if value.trim().is_empty() {
        anyhow::bail!("Secret value must not be empty");
    }
    let name = name.unwrap_or(&config.provider.secret_name);
    let store = SqliteStore::open(&config.storage.db_path)?;
    store
        .write_secret(owner, name, value)
        .await
        .context("Failed to store secret")?;
    println!("Stored secret '{name}' for {owner}");
    Ok(())
}
