//! Database and config bootstrap — `agencyflow init`.

use std::path::PathBuf;

use anyhow::Result;

use agencyflow::config::{AppConfig, CONFIG_FILE, is_placeholder};
use agencyflow::crm::auth::issue_anon_key;
use agencyflow::crm::db::CrmDb;

pub fn cmd_init(config: &AppConfig, db_path: Option<PathBuf>, force: bool) -> Result<()> {
    let mut toml = config.file.clone();
    if let Some(db_path) = db_path {
        toml.server.db_path = Some(db_path);
    }
    let stored_db_path = toml
        .server
        .db_path
        .clone()
        .unwrap_or_else(|| config.db_path.clone());
    toml.server.db_path = Some(stored_db_path.clone());

    let resolved_db_path = if stored_db_path.is_absolute() {
        stored_db_path
    } else {
        config.dir.join(&stored_db_path)
    };
    CrmDb::new(&resolved_db_path)?;
    println!("Database initialized at {}", resolved_db_path.display());

    let host = toml.server.host.clone().unwrap_or_else(|| config.host.clone());
    let port = toml.server.port.unwrap_or(config.port);
    if toml.backend.url.as_deref().is_none_or(is_placeholder) {
        toml.backend.url = Some(format!("http://{}:{}", host, port));
    }

    let has_key = toml
        .backend
        .anon_key
        .as_deref()
        .is_some_and(|k| !is_placeholder(k));
    if has_key && !force {
        println!("Keeping existing anon key (use --force to replace it)");
    } else {
        toml.backend.anon_key = Some(issue_anon_key());
        println!("Generated a new anon key");
    }

    let config_path = config.dir.join(CONFIG_FILE);
    toml.save(&config_path)?;
    println!("Wrote {}", config_path.display());
    println!();
    println!("Next: 'agencyflow user add --email <email> --agency <name>' then 'agencyflow serve'.");

    Ok(())
}
