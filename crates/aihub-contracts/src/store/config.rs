use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const SAVED_FILE_NAME: &str = "saved.json";

/// Per-user base folder: `$AIHUB_HOME`, else `~/aihub`.
pub fn base_dir() -> PathBuf {
    if let Some(home) = non_empty_env("AIHUB_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("aihub")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub apikey: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            protocol: "ws".to_string(),
            apikey: "YOUR_API_KEY".to_string(),
        }
    }
}

impl HubConfig {
    /// Loads `config.json` from `base`, creating it or filling missing keys
    /// with defaults and rewriting the file when anything was added.
    pub fn ensure_and_load(base: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base)
            .with_context(|| format!("create base folder {}", base.display()))?;
        let path = base.join(CONFIG_FILE_NAME);

        let mut stored = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<Value>(&raw)
                .with_context(|| format!("failed to read config file {}", path.display()))?
                .as_object()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("config file {} is not an object", path.display()))?,
            Err(_) => {
                tracing::info!(path = %path.display(), "config not found, creating with defaults");
                Map::new()
            }
        };

        let defaults = serde_json::to_value(Self::default())?;
        let mut changed = false;
        if let Some(defaults) = defaults.as_object() {
            for (key, value) in defaults {
                if !stored.contains_key(key) {
                    tracing::info!(key = %key, "adding missing config option");
                    stored.insert(key.clone(), value.clone());
                    changed = true;
                }
            }
        }
        if changed {
            std::fs::write(&path, serde_json::to_string_pretty(&Value::Object(stored.clone()))?)
                .with_context(|| format!("error saving config file {}", path.display()))?;
        }

        let config = Self {
            host: text_of(&stored, "host").unwrap_or_else(|| Self::default().host),
            port: port_of(stored.get("port")).unwrap_or(8000),
            protocol: text_of(&stored, "protocol").unwrap_or_else(|| Self::default().protocol),
            apikey: text_of(&stored, "apikey").unwrap_or_else(|| Self::default().apikey),
        };
        Ok(config.with_env_overrides())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(host) = non_empty_env("AIHUB_HOST") {
            self.host = host;
        }
        if let Some(port) = non_empty_env("AIHUB_PORT").and_then(|raw| raw.parse::<u16>().ok()) {
            self.port = port;
        }
        if let Some(protocol) = non_empty_env("AIHUB_PROTOCOL") {
            self.protocol = protocol;
        }
        if let Some(apikey) = non_empty_env("AIHUB_API_KEY") {
            self.apikey = apikey;
        }
        self
    }

    pub fn is_secure(&self) -> bool {
        self.protocol == "wss"
    }

    pub fn websocket_url(&self) -> String {
        format!("{}://{}:{}/ws", self.protocol, self.host, self.port)
    }

    pub fn preview_url(&self, workflow_id: &str) -> String {
        let scheme = if self.is_secure() { "https" } else { "http" };
        format!(
            "{scheme}://{}:{}/workflows/{workflow_id}.png",
            self.host, self.port
        )
    }

    pub fn server_label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn text_of(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

fn port_of(value: Option<&Value>) -> Option<u16> {
    match value? {
        Value::Number(number) => number.as_u64().and_then(|port| u16::try_from(port).ok()),
        Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
