//! REST, realtime and checkout service command — `agencyflow serve`.

use std::path::PathBuf;

use anyhow::Result;

use agencyflow::config::{AppConfig, ENV_ANON_KEY};
use agencyflow::crm::auth::issue_anon_key;

/// Flags that take precedence over the resolved configuration.
#[derive(Debug, Default)]
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
}

pub async fn cmd_serve(config: AppConfig, overrides: ServeOverrides) -> Result<()> {
    let mut server = config.server_config();
    if let Some(host) = overrides.host {
        server.host = host;
    }
    if let Some(port) = overrides.port {
        server.port = port;
    }
    if let Some(db_path) = overrides.db_path {
        server.db_path = db_path;
    }

    if server.anon_key.is_empty() {
        if !overrides.dev {
            anyhow::bail!(
                "No anon key configured. Run 'agencyflow init' or set {}.",
                ENV_ANON_KEY
            );
        }
        server.anon_key = issue_anon_key();
        tracing::warn!("no anon key configured; generated a temporary one for this run");
        println!("Temporary anon key: {}", server.anon_key);
    }

    agencyflow::crm::server::start_server(server).await
}
