//! Configuration display command — `agencyflow config`.

use anyhow::Result;

use agencyflow::config::{AppConfig, BackendStatus, CONFIG_FILE};

/// Show the first few characters of a secret.
fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(6).collect();
    if secret.chars().count() <= 6 {
        "******".to_string()
    } else {
        format!("{}…", visible)
    }
}

pub fn cmd_config(config: &AppConfig) -> Result<()> {
    let config_path = config.dir.join(CONFIG_FILE);
    println!();
    if config_path.exists() {
        println!("Configuration from {}:", config_path.display());
    } else {
        println!("No {} found (using defaults and environment):", CONFIG_FILE);
    }
    println!();

    println!("[backend]");
    println!("  url = {}", config.url.as_deref().unwrap_or("(unset)"));
    println!(
        "  anon_key = {}",
        config.anon_key.as_deref().map(mask).unwrap_or_else(|| "(unset)".into())
    );
    println!();
    println!("[server]");
    println!("  host = {}", config.host);
    println!("  port = {}", config.port);
    println!("  db_path = {}", config.server_config().db_path.display());
    println!(
        "  stripe_secret_key = {}",
        config
            .stripe_secret_key
            .as_deref()
            .map(mask)
            .unwrap_or_else(|| "(unset, checkout disabled)".into())
    );
    println!();
    println!("[logging]");
    println!("  json = {}", config.log_json);
    println!();

    match config.backend_status() {
        BackendStatus::Enabled { url, .. } => println!("Backend: enabled ({})", url),
        BackendStatus::Disabled { reason } => println!("Backend: disabled ({})", reason),
    }
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_hides_secret() {
        assert_eq!(mask("afa_0123456789"), "afa_01…");
        assert_eq!(mask("short"), "******");
    }
}
