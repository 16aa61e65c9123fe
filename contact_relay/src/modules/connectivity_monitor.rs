use log::{info, warn};
use std::time::Duration;
use tokio::{
    net::TcpStream,
    time::{sleep, timeout, Instant},
};

use crate::{
    config,
    modules::{
        error::RelayError,
        reachability::{ConnectionClass, ReachabilityHandle, ReachabilityState},
    },
};

// Platform reachability signal for a native process: probes the endpoint host
// and publishes the result for the reachability detector to read
pub struct ConnectivityMonitor {

    // host:port the endpoint lives on
    target: String,

    // Publishing side of the reachability channel
    handle: ReachabilityHandle,

    // Configuration for ConnectivityMonitor
    config: config::ConnectivityConfig,
}

impl ConnectivityMonitor {

    pub fn new(base_url: &str,
        handle: ReachabilityHandle,
        config: config::ConnectivityConfig) -> Result<Self, RelayError> {
        Ok(Self {
            target: probe_target(base_url)?,
            handle,
            config,
        })
    }

    // Probe forever, publishing every change of state
    pub async fn start_monitoring(&self) {
        info!(" ~ Monitoring connectivity to {}", self.target);
        loop {
            self.check().await;
            sleep(Duration::from_secs(self.config.probe_interval_secs)).await;
        }
    }

    // Single probe, returns the state it published
    pub async fn check(&self) -> ReachabilityState {
        let state = self.probe().await;
        let previous = self.handle.current();

        if self.handle.publish(state) {
            if state.online != previous.online {
                if state.online {
                    info!(" ~~ Back online ({:?})", state.connection);
                } else {
                    warn!(" ~~ Connection to {} lost", self.target);
                }
            } else {
                info!(" ~~ Connection is now {:?}", state.connection);
            }
        }
        state
    }

    async fn probe(&self) -> ReachabilityState {
        let started = Instant::now();
        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);

        match timeout(probe_timeout, TcpStream::connect(self.target.as_str())).await {
            Ok(Ok(_stream)) => {
                let elapsed = started.elapsed();
                if elapsed <= Duration::from_millis(self.config.slow_threshold_ms) {
                    ReachabilityState::online(ConnectionClass::Fast)
                } else {
                    ReachabilityState::online(ConnectionClass::Slow)
                }
            }
            Ok(Err(_)) | Err(_) => ReachabilityState::offline(),
        }
    }
}

// host:port of a base URL, with the scheme's default port when none is given
fn probe_target(base_url: &str) -> Result<String, RelayError> {
    let url = reqwest::Url::parse(base_url)
        .map_err(|e| RelayError::TransportError(format!("invalid endpoint URL {}: {}", base_url, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::TransportError(format!("endpoint URL {} has no host", base_url)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| RelayError::TransportError(format!("endpoint URL {} has no port", base_url)))?;
    Ok(format!("{}:{}", host, port))
}
