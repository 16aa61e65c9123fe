use log::{debug, error, info, warn};
use serde::Serialize;
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    time::{interval, MissedTickBehavior},
};

use crate::modules::{
    endpoint::{deliver_with_timeout, Delivery, SubmissionEndpoint},
    notifier::{NotificationEmitter, NotificationKind},
    reachability::{Reachability, ReachabilityState},
    submission_queue::{QueueKey, SubmissionQueue},
};

// Why a drain was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncTrigger {
    // Reachability went from offline to online
    ConnectivityRestored,
    // Periodic background signal
    Background,
    // Explicit request, e.g. the app came to the foreground
    Manual,
}

// Result of one pass over the queue
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    // Entries of the snapshot a delivery was attempted for
    pub attempted: usize,
    // Entries the endpoint accepted
    pub succeeded: usize,
    // Entries of the snapshot still in the queue afterwards
    pub remaining: usize,
    // Failed deliveries of this pass
    pub errors: Vec<(QueueKey, String)>,
}

// What woke the trigger loop up
enum Wake {
    Trigger(SyncTrigger),
    SignalClosed,
    Shutdown,
}

// Handles
// - Taking a snapshot of the offline queue
// - Delivering each queued submission in FIFO order
// - Removing delivered entries, leaving failed ones for the next drain
pub struct SyncWorker {

    // Offline queue, shared with the dispatcher
    queue: Arc<SubmissionQueue>,

    // Where queued submissions are delivered
    endpoint: Arc<dyn SubmissionEndpoint>,

    // Outcome acknowledgement
    notifier: Arc<NotificationEmitter>,

    // Source of connectivity-restored triggers
    reachability: Reachability,

    // Upper bound for a single delivery
    delivery_timeout: Duration,

    // Period of the background trigger
    background_interval: Duration,

    // Held for the whole of a drain so two triggers never deliver the same snapshot
    draining: Mutex<()>,
}

impl SyncWorker {
    pub fn new(
        queue: Arc<SubmissionQueue>,
        endpoint: Arc<dyn SubmissionEndpoint>,
        notifier: Arc<NotificationEmitter>,
        reachability: Reachability,
        delivery_timeout: Duration,
        background_interval: Duration,
    ) -> Self {
        Self {
            queue,
            endpoint,
            notifier,
            reachability,
            delivery_timeout,
            background_interval,
            draining: Mutex::new(()),
        }
    }

    // One pass over the entries pending at the moment the drain starts.
    // Entries enqueued while it runs are left for the next pass
    pub async fn drain(&self) -> DrainReport {
        let _draining = self.draining.lock().await;

        let snapshot = match self.queue.list_pending() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Offline queue could not be read: {}", e);
                return DrainReport::default();
            }
        };

        if snapshot.is_empty() {
            debug!("Nothing to sync");
            return DrainReport::default();
        }

        info!(" - Syncing {} offline submission(s)...", snapshot.len());
        let mut report = DrainReport::default();

        for queued in &snapshot {
            report.attempted += 1;
            let delivery = Delivery::from(queued);

            match deliver_with_timeout(self.endpoint.as_ref(), &delivery, self.delivery_timeout).await {
                Ok(()) => {
                    report.succeeded += 1;
                    // A failed removal only means the destination sees this submission again
                    match self.queue.remove(queued.key) {
                        Ok(()) => info!(" -- Synced offline submission {}", queued.key),
                        Err(e) => {
                            error!(" -- Submission {} delivered but still queued: {}", queued.key, e);
                            report.remaining += 1;
                        }
                    }
                }

                // Leave the entry in place and move on to the next one
                Err(e) => {
                    warn!(" -- Failed to sync {}: {}", queued.key, e);
                    if let Err(record_err) = self.queue.record_failure(queued.key, &e.to_string()) {
                        warn!(" --- Failure of {} not recorded: {}", queued.key, record_err);
                    }
                    report.remaining += 1;
                    report.errors.push((queued.key, e.to_string()));
                }
            }
        }

        info!(
            " - Sync finished: {} attempted, {} succeeded, {} remaining",
            report.attempted, report.succeeded, report.remaining
        );

        match self.queue.len() {
            Ok(count) => self.notifier.set_badge(count),
            Err(e) => warn!("Badge not updated: {}", e),
        }
        if report.succeeded > 0 {
            self.notifier.notify(
                NotificationKind::Sent,
                &format!("{} saved request(s) sent.", report.succeeded),
            );
        }

        report
    }

    // Trigger loop: drains on connectivity restored, on each background tick and on
    // every manual trigger. Runs until the manual trigger channel closes
    pub async fn run(&self, mut triggers: mpsc::Receiver<SyncTrigger>) {
        let mut connectivity = self.reachability.subscribe();
        let mut last_online = self.reachability.is_online();

        // A zero interval disables the background trigger. Otherwise the first tick
        // completes immediately, which gives the startup drain
        let mut background = if self.background_interval.is_zero() {
            info!("Background sync disabled");
            if self.reachability.is_online() {
                self.drain().await;
            }
            None
        } else {
            let mut ticks = interval(self.background_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(ticks)
        };

        loop {
            let wake = tokio::select! {
                _ = async {
                    match background.as_mut() {
                        Some(ticks) => { ticks.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => Wake::Trigger(SyncTrigger::Background),
                restored = async {
                    match connectivity.as_mut() {
                        Some(receiver) => connectivity_restored(receiver, &mut last_online).await,
                        None => std::future::pending().await,
                    }
                } => {
                    if restored { Wake::Trigger(SyncTrigger::ConnectivityRestored) } else { Wake::SignalClosed }
                },
                message = triggers.recv() => match message {
                    Some(trigger) => Wake::Trigger(trigger),
                    None => Wake::Shutdown,
                },
            };

            match wake {
                Wake::Trigger(SyncTrigger::Background) if !self.reachability.is_online() => {
                    debug!("Background sync skipped while offline");
                }
                Wake::Trigger(trigger) => {
                    info!("Sync triggered: {:?}", trigger);
                    self.drain().await;
                }
                Wake::SignalClosed => {
                    warn!("Reachability signal closed, relying on background and manual sync");
                    connectivity = None;
                }
                Wake::Shutdown => {
                    info!("Sync worker stopped");
                    break;
                }
            }
        }
    }
}

// Resolves true on the next offline to online transition, false once the signal closes
async fn connectivity_restored(
    receiver: &mut watch::Receiver<ReachabilityState>,
    last_online: &mut bool,
) -> bool {
    loop {
        if receiver.changed().await.is_err() {
            return false;
        }
        let online = receiver.borrow_and_update().online;
        let restored = online && !*last_online;
        *last_online = online;
        if restored {
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{
        contact::sample_payload,
        endpoint::testing::ScriptedEndpoint,
        notifier::testing::RecordingSurface,
        reachability::{reachability_channel, ConnectionClass, ReachabilityHandle},
    };
    use tokio::time::sleep;

    struct Harness {
        worker: Arc<SyncWorker>,
        queue: Arc<SubmissionQueue>,
        endpoint: Arc<ScriptedEndpoint>,
        surface: RecordingSurface,
        signal: ReachabilityHandle,
    }

    fn harness(endpoint: ScriptedEndpoint, initial: ReachabilityState) -> Harness {
        harness_with_interval(endpoint, initial, Duration::from_secs(3600))
    }

    fn harness_with_interval(endpoint: ScriptedEndpoint, initial: ReachabilityState, background: Duration) -> Harness {
        let queue = Arc::new(SubmissionQueue::open_in_memory().unwrap());
        let (signal, reachability) = reachability_channel(initial);
        let endpoint = Arc::new(endpoint);
        let surface = RecordingSurface::default();
        let notifier = Arc::new(NotificationEmitter::new(Some(Box::new(surface.clone())), true));
        let worker = Arc::new(SyncWorker::new(
            queue.clone(),
            endpoint.clone(),
            notifier,
            reachability,
            Duration::from_secs(5),
            background,
        ));
        Harness { worker, queue, endpoint, surface, signal }
    }

    fn online() -> ReachabilityState {
        ReachabilityState::online(ConnectionClass::Fast)
    }

    fn pending_names(queue: &SubmissionQueue) -> Vec<String> {
        queue.list_pending().unwrap().into_iter().map(|s| s.payload.name).collect()
    }

    #[tokio::test]
    async fn empty_drain_reports_zero() {
        let h = harness(ScriptedEndpoint::accepting(), online());

        assert_eq!(h.worker.drain().await, DrainReport::default());
        assert!(h.endpoint.attempted_names().is_empty());
        assert!(h.surface.tags().is_empty());
    }

    #[tokio::test]
    async fn second_drain_finds_nothing() {
        let h = harness(ScriptedEndpoint::accepting(), online());
        for name in ["Ana", "Beto", "Carla"] {
            h.queue.enqueue(&sample_payload(name)).unwrap();
        }

        let first = h.worker.drain().await;
        assert_eq!((first.attempted, first.succeeded, first.remaining), (3, 3, 0));

        let second = h.worker.drain().await;
        assert_eq!(second, DrainReport::default());

        assert_eq!(h.endpoint.delivered_names(), vec!["Ana", "Beto", "Carla"]);
        assert_eq!(h.surface.last_badge(), Some(0));
        assert_eq!(h.surface.tags(), vec!["form-success"]);
    }

    #[tokio::test]
    async fn failing_item_does_not_block_later_items() {
        let h = harness(ScriptedEndpoint::rejecting(&["Beto"]), online());
        let _a = h.queue.enqueue(&sample_payload("Ana")).unwrap();
        let b = h.queue.enqueue(&sample_payload("Beto")).unwrap();
        let _c = h.queue.enqueue(&sample_payload("Carla")).unwrap();

        let report = h.worker.drain().await;

        assert_eq!((report.attempted, report.succeeded, report.remaining), (3, 2, 1));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, b);

        let pending = h.queue.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key, b);
        assert_eq!(pending[0].payload, sample_payload("Beto"));
        assert!(pending[0].last_error.as_deref().unwrap().contains("503"));
        assert_eq!(h.endpoint.attempted_names(), vec!["Ana", "Beto", "Carla"]);
        assert_eq!(h.surface.last_badge(), Some(1));
    }

    #[tokio::test]
    async fn failed_items_are_retried_on_next_drain() {
        let h = harness(ScriptedEndpoint::rejecting_all(), online());
        h.queue.enqueue(&sample_payload("Ana")).unwrap();

        let report = h.worker.drain().await;
        assert_eq!((report.attempted, report.succeeded, report.remaining), (1, 0, 1));

        h.endpoint.set_reject_all(false);
        let report = h.worker.drain().await;
        assert_eq!((report.attempted, report.succeeded, report.remaining), (1, 1, 0));
        assert!(h.queue.list_pending().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn items_enqueued_mid_drain_wait_for_next_pass() {
        let h = harness(ScriptedEndpoint::accepting().with_delay(Duration::from_secs(1)), online());
        for name in ["Ana", "Beto", "Carla"] {
            h.queue.enqueue(&sample_payload(name)).unwrap();
        }

        let worker = h.worker.clone();
        let drain = tokio::spawn(async move { worker.drain().await });

        sleep(Duration::from_millis(1500)).await;
        h.queue.enqueue(&sample_payload("Dario")).unwrap();

        let report = drain.await.unwrap();
        assert_eq!((report.attempted, report.succeeded, report.remaining), (3, 3, 0));
        assert!(!h.endpoint.attempted_names().contains(&"Dario".to_string()));
        assert_eq!(pending_names(&h.queue), vec!["Dario"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_delivery_counts_as_failure() {
        let h = harness(ScriptedEndpoint::accepting().with_delay(Duration::from_secs(60)), online());
        h.queue.enqueue(&sample_payload("Ana")).unwrap();

        let report = h.worker.drain().await;

        assert_eq!((report.attempted, report.succeeded, report.remaining), (1, 0, 1));
        assert!(report.errors[0].1.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_drains_do_not_deliver_twice() {
        let h = harness(ScriptedEndpoint::accepting().with_delay(Duration::from_millis(100)), online());
        for name in ["Ana", "Beto"] {
            h.queue.enqueue(&sample_payload(name)).unwrap();
        }

        let (first, second) = tokio::join!(h.worker.drain(), h.worker.drain());

        assert_eq!(first.attempted + second.attempted, 2);
        assert_eq!(h.endpoint.delivered_names(), vec!["Ana", "Beto"]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_when_connectivity_returns() {
        let h = harness(ScriptedEndpoint::accepting(), ReachabilityState::offline());
        let (trigger_tx, trigger_rx) = mpsc::channel(4);
        let worker = h.worker.clone();
        let running = tokio::spawn(async move { worker.run(trigger_rx).await });

        h.queue.enqueue(&sample_payload("Ana")).unwrap();
        sleep(Duration::from_millis(10)).await;
        // The startup tick is skipped while offline
        assert!(h.endpoint.attempted_names().is_empty());

        h.signal.publish(online());
        sleep(Duration::from_millis(10)).await;
        assert!(h.queue.list_pending().unwrap().is_empty());
        assert_eq!(h.endpoint.delivered_names(), vec!["Ana"]);

        drop(trigger_tx);
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_on_manual_trigger() {
        let h = harness(ScriptedEndpoint::accepting(), online());
        let (trigger_tx, trigger_rx) = mpsc::channel(4);
        let worker = h.worker.clone();
        let running = tokio::spawn(async move { worker.run(trigger_rx).await });
        sleep(Duration::from_millis(10)).await;

        h.queue.enqueue(&sample_payload("Beto")).unwrap();
        trigger_tx.send(SyncTrigger::Manual).await.unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(h.endpoint.delivered_names(), vec!["Beto"]);

        drop(trigger_tx);
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_on_background_tick() {
        let h = harness(ScriptedEndpoint::accepting(), online());
        let (_trigger_tx, trigger_rx) = mpsc::channel(4);
        let worker = h.worker.clone();
        let running = tokio::spawn(async move { worker.run(trigger_rx).await });
        sleep(Duration::from_millis(10)).await;

        h.queue.enqueue(&sample_payload("Carla")).unwrap();
        sleep(Duration::from_secs(3601)).await;

        assert_eq!(h.endpoint.delivered_names(), vec!["Carla"]);
        running.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_background_interval_disables_ticks() {
        let h = harness_with_interval(ScriptedEndpoint::accepting(), online(), Duration::ZERO);
        h.queue.enqueue(&sample_payload("Ana")).unwrap();
        let (trigger_tx, trigger_rx) = mpsc::channel(4);
        let worker = h.worker.clone();
        let running = tokio::spawn(async move { worker.run(trigger_rx).await });
        sleep(Duration::from_millis(10)).await;

        // Startup drain still happens
        assert_eq!(h.endpoint.delivered_names(), vec!["Ana"]);

        h.queue.enqueue(&sample_payload("Beto")).unwrap();
        sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(pending_names(&h.queue), vec!["Beto"]);

        trigger_tx.send(SyncTrigger::Manual).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(h.endpoint.delivered_names(), vec!["Ana", "Beto"]);

        drop(trigger_tx);
        running.await.unwrap();
    }
}
