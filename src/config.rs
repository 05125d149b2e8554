//! Layered configuration for AgencyFlow.
//!
//! Settings come from `agencyflow.toml` in the working directory, then a
//! `.env` file next to it, then the process environment, then CLI flags.
//! Later layers win.
//!
//! # Configuration File Format
//!
//! ```toml
//! [backend]
//! url = "http://127.0.0.1:4173"
//! anon_key = "afa_..."
//!
//! [server]
//! host = "127.0.0.1"
//! port = 4173
//! db_path = ".agencyflow/agencyflow.db"
//! stripe_secret_key = "sk_test_..."
//!
//! [logging]
//! json = false
//! ```
//!
//! Backend credentials that are absent or still hold template values
//! produce [`BackendStatus::Disabled`]; the client built from it stays
//! usable but every call fails with a configuration error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::crm::server::ServerConfig;

pub const CONFIG_FILE: &str = "agencyflow.toml";
pub const ENV_FILE: &str = ".env";

pub const ENV_URL: &str = "AGENCYFLOW_URL";
pub const ENV_ANON_KEY: &str = "AGENCYFLOW_ANON_KEY";
pub const ENV_HOST: &str = "AGENCYFLOW_HOST";
pub const ENV_PORT: &str = "AGENCYFLOW_PORT";
pub const ENV_DB_PATH: &str = "AGENCYFLOW_DB_PATH";
pub const ENV_STRIPE_KEY: &str = "STRIPE_SECRET_KEY";
pub const ENV_LOG_JSON: &str = "AGENCYFLOW_LOG_JSON";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSection {
    pub url: Option<String>,
    pub anon_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub stripe_secret_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json: bool,
}

/// The complete agencyflow.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgencyflowToml {
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl AgencyflowToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse agencyflow.toml")
    }

    /// Load `agencyflow.toml` from `dir`, or defaults when it does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize agencyflow.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

/// Whether the client has usable backend credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    Enabled { url: String, anon_key: String },
    Disabled { reason: String },
}

impl BackendStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }
}

/// True for values that were never filled in: empty strings, anything
/// mentioning "placeholder" and `your-...` templates.
pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim().to_ascii_lowercase();
    value.is_empty()
        || value.contains("placeholder")
        || value.starts_with("your-")
        || value.starts_with("your_")
        || value.contains("://your-")
}

/// Resolved configuration with every layer applied except CLI flags.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub dir: PathBuf,
    pub file: AgencyflowToml,
    pub url: Option<String>,
    pub anon_key: Option<String>,
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub stripe_secret_key: Option<String>,
    pub log_json: bool,
}

impl AppConfig {
    /// Load the file, `.env` and process environment for `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let file = AgencyflowToml::load_or_default(dir)?;
        let dotenv = read_env_file(&dir.join(ENV_FILE))?;
        Ok(Self::from_layers(dir, file, |key| {
            std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
        }))
    }

    /// Combine a parsed file with an environment lookup. Environment values
    /// override the file.
    pub fn from_layers(dir: &Path, file: AgencyflowToml, env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = ServerConfig::default();
        let pick = |key: &str, from_file: Option<String>| {
            env(key).filter(|v| !v.trim().is_empty()).or(from_file)
        };

        let url = pick(ENV_URL, file.backend.url.clone());
        let anon_key = pick(ENV_ANON_KEY, file.backend.anon_key.clone());
        let host = pick(ENV_HOST, file.server.host.clone()).unwrap_or(defaults.host);
        let port = match env(ENV_PORT).and_then(|p| p.trim().parse().ok()) {
            Some(port) => port,
            None => file.server.port.unwrap_or(defaults.port),
        };
        let db_path = env(ENV_DB_PATH)
            .map(PathBuf::from)
            .or_else(|| file.server.db_path.clone())
            .unwrap_or(defaults.db_path);
        let stripe_secret_key = pick(ENV_STRIPE_KEY, file.server.stripe_secret_key.clone())
            .filter(|k| !is_placeholder(k));
        let log_json = env(ENV_LOG_JSON)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(file.logging.json);

        Self {
            dir: dir.to_path_buf(),
            file,
            url,
            anon_key,
            host,
            port,
            db_path,
            stripe_secret_key,
            log_json,
        }
    }

    /// Validate the client credentials.
    pub fn backend_status(&self) -> BackendStatus {
        let url = match self.url.as_deref() {
            None => return disabled(format!("{} is not set", ENV_URL)),
            Some(url) if is_placeholder(url) => {
                return disabled(format!("{} is a placeholder value", ENV_URL));
            }
            Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                return disabled(format!("{} must be an http(s) URL", ENV_URL));
            }
            Some(url) => url,
        };
        match self.anon_key.as_deref() {
            None => disabled(format!("{} is not set", ENV_ANON_KEY)),
            Some(key) if is_placeholder(key) => {
                disabled(format!("{} is a placeholder value", ENV_ANON_KEY))
            }
            Some(key) => BackendStatus::Enabled {
                url: url.trim_end_matches('/').to_string(),
                anon_key: key.to_string(),
            },
        }
    }

    /// Server settings, relative paths resolved against the config dir.
    pub fn server_config(&self) -> ServerConfig {
        let db_path = if self.db_path.is_absolute() {
            self.db_path.clone()
        } else {
            self.dir.join(&self.db_path)
        };
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            db_path,
            anon_key: self
                .anon_key
                .clone()
                .filter(|k| !is_placeholder(k))
                .unwrap_or_default(),
            stripe_secret_key: self.stripe_secret_key.clone(),
        }
    }
}

fn disabled(reason: String) -> BackendStatus {
    tracing::warn!(%reason, "backend disabled");
    BackendStatus::Disabled { reason }
}

/// Key/value pairs from a `.env` file without touching the process
/// environment. A missing file yields nothing.
fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut values = HashMap::new();
    for item in iter {
        let (key, value) = item.with_context(|| format!("Failed to parse {}", path.display()))?;
        values.insert(key, value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_placeholder_detection() {
        assert!(is_placeholder(""));
        assert!(is_placeholder("   "));
        assert!(is_placeholder("placeholder-key"));
        assert!(is_placeholder("your-anon-key"));
        assert!(is_placeholder("https://your-project.example.co"));
        assert!(!is_placeholder("afa_3b1f0c"));
        assert!(!is_placeholder("http://127.0.0.1:4173"));
    }

    #[test]
    fn test_missing_credentials_disable_backend() {
        let dir = tempdir().unwrap();
        let config = AppConfig::from_layers(dir.path(), AgencyflowToml::default(), env_of(&[]));
        match config.backend_status() {
            BackendStatus::Disabled { reason } => assert!(reason.contains(ENV_URL)),
            other => panic!("Expected Disabled, got {:?}", other),
        }
    }

    #[test]
    fn test_placeholder_key_disables_backend() {
        let dir = tempdir().unwrap();
        let config = AppConfig::from_layers(
            dir.path(),
            AgencyflowToml::default(),
            env_of(&[(ENV_URL, "http://localhost:4173"), (ENV_ANON_KEY, "your-anon-key")]),
        );
        assert!(!config.backend_status().is_enabled());
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempdir().unwrap();
        let file = AgencyflowToml::parse(
            r#"
[backend]
url = "http://file.example"
anon_key = "file-key"

[server]
port = 5000
"#,
        )
        .unwrap();
        let config = AppConfig::from_layers(
            dir.path(),
            file,
            env_of(&[(ENV_URL, "http://env.example/"), (ENV_PORT, "6000")]),
        );
        assert_eq!(
            config.backend_status(),
            BackendStatus::Enabled {
                url: "http://env.example".into(),
                anon_key: "file-key".into(),
            }
        );
        assert_eq!(config.port, 6000);
    }

    #[test]
    fn test_defaults_and_relative_db_path() {
        let dir = tempdir().unwrap();
        let config = AppConfig::from_layers(dir.path(), AgencyflowToml::default(), env_of(&[]));
        let server = config.server_config();
        assert_eq!(server.port, 4173);
        assert_eq!(server.db_path, dir.path().join(".agencyflow/agencyflow.db"));
        assert!(server.anon_key.is_empty());
        assert!(server.stripe_secret_key.is_none());
        assert!(!config.log_json);
    }

    #[test]
    fn test_load_reads_file_and_dotenv() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[server]\nstripe_secret_key = \"sk_test_file\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join(ENV_FILE),
            "AGENCYFLOW_LOG_JSON=true\n",
        )
        .unwrap();
        let config = AppConfig::load(dir.path()).unwrap();
        assert_eq!(config.stripe_secret_key.as_deref(), Some("sk_test_file"));
        assert!(config.log_json);
    }

    #[test]
    fn test_save_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut file = AgencyflowToml::default();
        file.backend.anon_key = Some("afa_key".into());
        file.server.port = Some(4200);
        file.save(&path).unwrap();
        assert_eq!(AgencyflowToml::load(&path).unwrap(), file);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(AgencyflowToml::parse("[server\nport = 1").is_err());
    }
}
