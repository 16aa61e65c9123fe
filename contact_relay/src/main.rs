use crate::modules::{
    connectivity_monitor::ConnectivityMonitor,
    contact::ContactPayload,
    dispatcher::SubmissionDispatcher,
    endpoint::HttpEndpoint,
    notifier::{LogSurface, NotificationEmitter},
    reachability::{reachability_channel, ConnectionClass, Reachability, ReachabilityState},
    submission_queue::SubmissionQueue,
    sync_worker::{SyncTrigger, SyncWorker},
};
use log::{error, info, warn};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{stdin, AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tokio_stream::{wrappers::LinesStream, StreamExt};


mod config;
mod modules;

const DEFAULT_CONFIG_PATH: &str = "contact_relay/Config.toml";

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load the configuration, path may be given as the first argument
    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading configuration from {}: {}", config_path, e);
            return;
        }
    };

    // Open the offline queue, shared by the dispatcher and the sync worker
    let queue = match SubmissionQueue::open(&config.queue.database_path) {
        Ok(queue) => Arc::new(queue),
        Err(e) => {
            error!("Error opening offline queue: {}", e);
            return;
        }
    };

    // Build the reachability signal, probing the endpoint host when enabled
    let reachability = if config.connectivity.enabled {
        let (handle, reachability) = reachability_channel(ReachabilityState::online(ConnectionClass::Unknown));
        match ConnectivityMonitor::new(&config.endpoint.base_url, handle, config.connectivity.clone()) {
            Ok(monitor) => {
                tokio::spawn(async move {
                    monitor.start_monitoring().await;
                });
                reachability
            }
            Err(e) => {
                warn!("Connectivity monitoring disabled: {}", e);
                Reachability::always_online()
            }
        }
    } else {
        Reachability::always_online()
    };
    reachability.on_change(|state| {
        info!("Reachability changed: online={} connection={:?}", state.online, state.connection);
    });

    let endpoint = match HttpEndpoint::new(
        &config.endpoint.base_url,
        Duration::from_secs(config.endpoint.request_timeout_secs),
    ) {
        Ok(endpoint) => Arc::new(endpoint),
        Err(e) => {
            error!("Error building the contact endpoint client: {}", e);
            return;
        }
    };
    info!("Delivering submissions to {}", endpoint.url());

    let notifier = Arc::new(if config.notifications.enabled {
        NotificationEmitter::new(Some(Box::new(LogSurface)), true)
    } else {
        NotificationEmitter::disabled()
    });

    let delivery_timeout = Duration::from_millis(config.sync_worker.delivery_timeout_ms);

    let dispatcher = SubmissionDispatcher::new(
        queue.clone(),
        reachability.clone(),
        endpoint.clone(),
        notifier.clone(),
        delivery_timeout,
    );

    // Start the sync worker
    let worker = SyncWorker::new(
        queue.clone(),
        endpoint,
        notifier,
        reachability,
        delivery_timeout,
        Duration::from_secs(config.sync_worker.background_interval_secs),
    );
    let (trigger_tx, trigger_rx) = mpsc::channel(8);
    let worker_task = tokio::spawn(async move {
        worker.run(trigger_rx).await;
    });

    // Form submissions arrive as one JSON object per line
    let mut lines = LinesStream::new(BufReader::new(stdin()).lines());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("Error reading submissions: {}", e);
                break;
            }
        };

        match line.trim() {
            "" => continue,
            "sync" => {
                if trigger_tx.send(SyncTrigger::Manual).await.is_err() {
                    warn!("Sync worker is not running");
                }
            }
            "pending" => match queue.list_pending() {
                Ok(pending) => match serde_json::to_string_pretty(&pending) {
                    Ok(json) => info!("{} pending submission(s):\n{}", pending.len(), json),
                    Err(e) => error!("Error serializing pending submissions: {}", e),
                },
                Err(e) => error!("Error listing pending submissions: {}", e),
            },
            "clear" => {
                if let Err(e) = queue.clear_all() {
                    error!("Error clearing offline queue: {}", e);
                }
            }
            json => match serde_json::from_str::<ContactPayload>(json) {
                Ok(payload) => {
                    let outcome = dispatcher.submit(payload).await;
                    info!("Submission outcome: {:?}", outcome);
                }
                Err(e) => error!("Unreadable submission: {}", e),
            },
        }
    }

    // Input closed: let the worker finish its current drain and stop
    drop(trigger_tx);
    if let Err(e) = worker_task.await {
        error!("Sync worker ended abnormally: {}", e);
    }
}
