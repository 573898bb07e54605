use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use tokio::io::AsyncWriteExt;

use crate::support::{env_string, env_u64};

pub const DEFAULT_SERVER_PORT: u16 = 7777;
const DEFAULT_API_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 7780);
const CONFIG_FILE: &str = "config.json";

#[cfg(windows)]
const DEFAULT_EXECUTABLE: &str = "LocalAdmin.exe";
#[cfg(not(windows))]
const DEFAULT_EXECUTABLE: &str = "LocalAdmin";

/// Retry schedule for gateway requests: fixed delay, no growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub port: u16,
    pub api_addr: SocketAddr,
    pub server_dir: Option<PathBuf>,
    pub executable_name: String,
    pub nat_retry: RetryPolicy,
    pub nat_timeout: Duration,
    pub port_retry_delay: Duration,
    pub stop_drain_timeout: Duration,
    pub fatal_ack_timeout: Duration,
    pub stats_interval: Duration,
}

impl AgentConfig {
    pub fn with_data_root(data_root: PathBuf) -> Self {
        Self {
            data_root,
            port: DEFAULT_SERVER_PORT,
            api_addr: DEFAULT_API_ADDR.into(),
            server_dir: None,
            executable_name: DEFAULT_EXECUTABLE.to_string(),
            nat_retry: RetryPolicy::default(),
            nat_timeout: Duration::from_secs(10),
            port_retry_delay: Duration::from_millis(1000),
            stop_drain_timeout: Duration::from_secs(5),
            fatal_ack_timeout: Duration::from_secs(120),
            stats_interval: Duration::from_millis(1000),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::with_data_root(data_root());
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Fills the server directory from `config.json` unless the environment set it.
    pub async fn merge_persisted(&mut self) -> anyhow::Result<()> {
        let persisted = load_persisted(&self.config_path()).await?;
        if self.server_dir.is_none() {
            self.server_dir = persisted.server_dir();
        }
        Ok(())
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Some(port) = env_u64("SLNET_SERVER_PORT") {
            self.port = u16::try_from(port.clamp(1024, u16::MAX as u64))
                .context("SLNET_SERVER_PORT")?;
        }
        if let Some(addr) = env_string("SLNET_API_ADDR") {
            self.api_addr = addr
                .parse()
                .with_context(|| format!("invalid SLNET_API_ADDR: {addr}"))?;
        }
        if let Some(dir) = env_string("SLNET_SERVER_DIR") {
            self.server_dir = Some(PathBuf::from(dir));
        }
        if let Some(name) = env_string("SLNET_SERVER_EXECUTABLE") {
            self.executable_name = name;
        }
        if let Some(v) = env_u64("SLNET_NAT_MAX_ATTEMPTS") {
            self.nat_retry.max_attempts = v.clamp(1, 20) as u32;
        }
        if let Some(v) = env_u64("SLNET_NAT_RETRY_DELAY_MS") {
            self.nat_retry.delay = Duration::from_millis(v.clamp(100, 60_000));
        }
        if let Some(v) = env_u64("SLNET_NAT_TIMEOUT_MS") {
            self.nat_timeout = Duration::from_millis(v.clamp(500, 120_000));
        }
        if let Some(v) = env_u64("SLNET_FATAL_ACK_TIMEOUT_MS") {
            self.fatal_ack_timeout = Duration::from_millis(v.clamp(0, 60 * 60 * 1000));
        }
        if let Some(v) = env_u64("SLNET_STATS_INTERVAL_MS") {
            self.stats_interval = Duration::from_millis(v.clamp(250, 60_000));
        }
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_root.join(CONFIG_FILE)
    }

    pub fn crash_dir(&self) -> PathBuf {
        self.data_root.join("crashes")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }

    pub fn executable_path(&self) -> Option<PathBuf> {
        self.server_dir
            .as_ref()
            .map(|dir| dir.join(&self.executable_name))
    }

    pub fn launch_args(&self) -> Vec<String> {
        vec![
            "--port".to_string(),
            self.port.to_string(),
            "--color".to_string(),
            "--interactive-flag".to_string(),
        ]
    }
}

pub fn data_root() -> PathBuf {
    if let Some(root) = env_string("SLNET_DATA_ROOT") {
        return PathBuf::from(root);
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .map(|appdata| PathBuf::from(appdata).join("slnet"))
            .unwrap_or_else(|_| PathBuf::from("./slnet-data"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".local/share/slnet"))
            .unwrap_or_else(|_| PathBuf::from("./slnet-data"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PersistedConfig {
    // Empty string means "not chosen yet".
    #[serde(default)]
    pub server_path: String,
}

impl PersistedConfig {
    pub fn server_dir(&self) -> Option<PathBuf> {
        let p = self.server_path.trim();
        (!p.is_empty()).then(|| PathBuf::from(p))
    }
}

/// Reads `config.json`, creating it with an empty server path when missing.
pub async fn load_persisted(path: &Path) -> anyhow::Result<PersistedConfig> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let initial = PersistedConfig::default();
            save_persisted(path, &initial).await?;
            tracing::info!(path = %path.display(), "created config file");
            Ok(initial)
        }
        Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
    }
}

pub async fn save_persisted(path: &Path, cfg: &PersistedConfig) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("create data root")?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(cfg).context("serialize config.json")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create config.json.tmp")?;
    f.write_all(&data).await.context("write config.json.tmp")?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, path)
        .await
        .context("persist config.json")?;
    Ok(())
}
