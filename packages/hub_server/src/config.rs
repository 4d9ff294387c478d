use group_hub::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / hub.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   hub.toml:        [worker]
//                    ttl_secs = 3600
//
//   env var:         HUB_WORKER__TTL_SECS=3600   (double underscore = nesting)
//                    HUB_WORKER__TICK_FORMAT=json
//
//   CLI flags override host/port after extraction.

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub worker: WorkerFileConfig,
}

/// Listener settings (lives under `[server]` in hub.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prepended to the path segment of `/ws/{group}`
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            group_prefix: default_group_prefix(),
        }
    }
}

/// Producer lifecycle knobs (lives under `[worker]` in hub.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerFileConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_idle_check_secs")]
    pub idle_check_secs: u64,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default)]
    pub tick_format: TickFormat,
}

/// Wire form of ticker messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickFormat {
    /// `"<group>: <n>"`
    #[default]
    Text,
    /// [`group_hub::NotifyMessage`] envelope
    Json,
}

impl Default for WorkerFileConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            idle_check_secs: default_idle_check_secs(),
            grace_secs: default_grace_secs(),
            tick_secs: default_tick_secs(),
            tick_format: TickFormat::default(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_group_prefix() -> String {
    "ticker_".to_string()
}
fn default_ttl_secs() -> u64 {
    24 * 3600
}
fn default_idle_check_secs() -> u64 {
    1
}
fn default_grace_secs() -> u64 {
    3
}
fn default_tick_secs() -> u64 {
    2
}

/// Build a figment that layers: defaults → hub.toml → HUB_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `HUB_SERVER__PORT=9000`  →  `server.port = 9000`
///   `HUB_WORKER__GRACE_SECS=5`  →  `worker.grace_secs = 5`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("HUB_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the server)
// =============================================================================

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub group_prefix: String,
    /// Producer lifetime cap passed to every notify
    pub ttl: Duration,
    /// Delay between ticker broadcasts
    pub tick: Duration,
    pub tick_format: TickFormat,
    pub worker: WorkerConfig,
}

impl HubConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            host: fc.server.host.clone(),
            port: fc.server.port,
            group_prefix: fc.server.group_prefix.clone(),
            ttl: Duration::from_secs(fc.worker.ttl_secs),
            // Zero would make the ticker and idle intervals panic.
            tick: Duration::from_secs(fc.worker.tick_secs.max(1)),
            tick_format: fc.worker.tick_format,
            worker: WorkerConfig {
                idle_interval: Duration::from_secs(fc.worker.idle_check_secs.max(1)),
                grace: Duration::from_secs(fc.worker.grace_secs),
            },
        }
    }

    /// Registry key for the `/ws/{name}` path segment.
    pub fn group_for(&self, name: &str) -> String {
        format!("{}{}", self.group_prefix, name)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}
