use std::{env, path::PathBuf, str::FromStr, time::Duration};

use dashmap::DashMap;
use portable_plugin::PortableConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PortableError;

pub const PYTHON_BIN_KEY: &str = "PORTABLE_PYTHON_BIN";
pub const SOCKET_DIR_KEY: &str = "PORTABLE_SOCKET_DIR";
pub const SEND_TIMEOUT_KEY: &str = "PORTABLE_SEND_TIMEOUT_MS";
pub const HANDSHAKE_TIMEOUT_KEY: &str = "PORTABLE_HANDSHAKE_TIMEOUT_MS";
pub const CRASH_POLICY_KEY: &str = "PORTABLE_CRASH_POLICY";

#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Reads settings from the process environment, seeded from an optional
/// `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        match &env_file {
            Some(path) if path.exists() => match dotenvy::from_path(path) {
                Ok(()) => info!("Loaded .env from {}", path.display()),
                Err(err) => warn!("could not parse .env at {}: {err}", path.display()),
            },
            Some(path) => warn!("no .env at {}, using the process environment", path.display()),
            None => {}
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait::async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        };
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        match &self.env_file {
            Some(path) => format!("EnvConfigManager({})", path.display()),
            None => "EnvConfigManager".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }
}

#[typetag::serde]
#[async_trait::async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// What the exit watcher does with an instance whose process died on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum CrashPolicy {
    /// Clear the process handle only; channel and audit log stay for the
    /// next start.
    #[default]
    Preserve,
    /// Close the channel and drop the instance from the registry.
    Discard,
}

impl FromStr for CrashPolicy {
    type Err = PortableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preserve" => Ok(CrashPolicy::Preserve),
            "discard" => Ok(CrashPolicy::Discard),
            other => Err(PortableError::config(format!(
                "{CRASH_POLICY_KEY} must be `preserve` or `discard`, got `{other}`"
            ))),
        }
    }
}

/// Host-side settings of the portable runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PortableSettings {
    pub python_bin: String,
    pub socket_dir: PathBuf,
    pub send_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub crash_policy: CrashPolicy,
}

impl Default for PortableSettings {
    fn default() -> Self {
        Self {
            python_bin: "python".to_string(),
            socket_dir: env::temp_dir(),
            send_timeout_ms: 1000,
            handshake_timeout_ms: 5000,
            crash_policy: CrashPolicy::Preserve,
        }
    }
}

impl PortableSettings {
    /// Overlay whatever keys `config` provides on top of the defaults.
    pub async fn load(config: &ConfigManager) -> Result<Self, PortableError> {
        let mut settings = Self::default();
        if let Some(bin) = config.0.get(PYTHON_BIN_KEY).await {
            if bin.trim().is_empty() {
                return Err(PortableError::config(format!("{PYTHON_BIN_KEY} must not be empty")));
            }
            settings.python_bin = bin;
        }
        if let Some(dir) = config.0.get(SOCKET_DIR_KEY).await {
            settings.socket_dir = PathBuf::from(dir);
        }
        if let Some(ms) = config.0.get(SEND_TIMEOUT_KEY).await {
            settings.send_timeout_ms = parse_millis(SEND_TIMEOUT_KEY, &ms)?;
        }
        if let Some(ms) = config.0.get(HANDSHAKE_TIMEOUT_KEY).await {
            settings.handshake_timeout_ms = parse_millis(HANDSHAKE_TIMEOUT_KEY, &ms)?;
        }
        if let Some(policy) = config.0.get(CRASH_POLICY_KEY).await {
            settings.crash_policy = policy.parse()?;
        }
        Ok(settings)
    }

    /// The part of the settings every plugin process receives.
    pub fn portable_config(&self) -> PortableConfig {
        PortableConfig {
            send_timeout: self.send_timeout_ms,
            socket_dir: self.socket_dir.clone(),
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64, PortableError> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(PortableError::config(format!("{key} must be greater than zero"))),
        Ok(ms) => Ok(ms),
        Err(err) => Err(PortableError::config(format!("{key}=`{value}` is not a number of milliseconds: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();
        mgr.set("foo", "bar").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));
        mgr.set("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));
        assert_eq!(mgr.keys().await, vec!["foo".to_string()]);
    }

    #[tokio::test]
    async fn test_settings_default_when_nothing_set() {
        let config = ConfigManager(MapConfigManager::new());
        let settings = PortableSettings::load(&config).await.unwrap();
        assert_eq!(settings, PortableSettings::default());
        assert_eq!(settings.python_bin, "python");
        assert_eq!(settings.portable_config().send_timeout, 1000);
    }

    #[tokio::test]
    async fn test_settings_overrides() {
        let map = MapConfigManager::new();
        map.set(PYTHON_BIN_KEY, "/usr/bin/python3").await.unwrap();
        map.set(SOCKET_DIR_KEY, "/run/portable").await.unwrap();
        map.set(SEND_TIMEOUT_KEY, "250").await.unwrap();
        map.set(HANDSHAKE_TIMEOUT_KEY, " 800 ").await.unwrap();
        map.set(CRASH_POLICY_KEY, "Discard").await.unwrap();
        let settings = PortableSettings::load(&ConfigManager(map)).await.unwrap();

        assert_eq!(settings.python_bin, "/usr/bin/python3");
        assert_eq!(settings.send_timeout(), Duration::from_millis(250));
        assert_eq!(settings.handshake_timeout(), Duration::from_millis(800));
        assert_eq!(settings.crash_policy, CrashPolicy::Discard);
        let conf = settings.portable_config();
        assert_eq!(conf.socket_dir, PathBuf::from("/run/portable"));
        assert_eq!(conf.send_timeout, 250);
    }

    #[tokio::test]
    async fn test_settings_reject_bad_values() {
        let map = MapConfigManager::new();
        map.set(SEND_TIMEOUT_KEY, "soon").await.unwrap();
        let err = PortableSettings::load(&ConfigManager(map)).await.unwrap_err();
        assert!(matches!(err, PortableError::Config(msg) if msg.contains(SEND_TIMEOUT_KEY)));

        let map = MapConfigManager::new();
        map.set(CRASH_POLICY_KEY, "restart").await.unwrap();
        assert!(PortableSettings::load(&ConfigManager(map)).await.is_err());

        let map = MapConfigManager::new();
        map.set(HANDSHAKE_TIMEOUT_KEY, "0").await.unwrap();
        assert!(PortableSettings::load(&ConfigManager(map)).await.is_err());
    }

    #[tokio::test]
    async fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "PORTABLE_TEST_ONLY_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(Some(env_path));
        assert_eq!(mgr.get("PORTABLE_TEST_ONLY_KEY").await, Some("abc123".to_string()));
        assert!(mgr.debug_box().contains(".env"));
    }
}
