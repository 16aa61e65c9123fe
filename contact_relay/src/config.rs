use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use toml;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub endpoint: EndpointConfig,
    pub queue: QueueConfig,
    pub sync_worker: SyncWorkerConfig,
    pub connectivity: ConnectivityConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    // Base URL of the backend, the contact route is appended to it
    pub base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncWorkerConfig {
    // Period of the background trigger, 0 disables it
    pub background_interval_secs: u64,
    // Upper bound for a single delivery attempt, expiry counts as failure
    pub delivery_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
    pub enabled: bool,
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub slow_threshold_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub enabled: bool,
}

pub fn load_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config: Config = toml::from_str(&contents)?;
    Ok(config)
}
