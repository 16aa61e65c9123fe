use log::debug;
use serde::Serialize;
use tokio::{
    sync::watch,
    task::JoinHandle,
};

// Qualitative connection class, as far as the platform can tell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionClass {
    Unknown,
    Slow,
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReachabilityState {
    pub online: bool,
    pub connection: ConnectionClass,
}

impl ReachabilityState {
    pub fn online(connection: ConnectionClass) -> Self {
        Self { online: true, connection }
    }

    pub fn offline() -> Self {
        Self { online: false, connection: ConnectionClass::Unknown }
    }
}

// Publishing side of the platform signal
#[derive(Debug)]
pub struct ReachabilityHandle {
    sender: watch::Sender<ReachabilityState>,
}

impl ReachabilityHandle {
    // Publish a new state, returns whether it differs from the previous one
    pub fn publish(&self, state: ReachabilityState) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    pub fn current(&self) -> ReachabilityState {
        *self.sender.borrow()
    }
}

// Create a platform signal starting from `initial`
pub fn reachability_channel(initial: ReachabilityState) -> (ReachabilityHandle, Reachability) {
    let (sender, receiver) = watch::channel(initial);
    (ReachabilityHandle { sender }, Reachability::new(Some(receiver)))
}

// Read side used by the dispatcher and the sync worker.
// Without a platform signal it reports online: a wrong guess only costs a failed
// direct send, which the dispatcher queues anyway
#[derive(Debug, Clone)]
pub struct Reachability {
    signal: Option<watch::Receiver<ReachabilityState>>,
}

impl Reachability {
    pub fn new(signal: Option<watch::Receiver<ReachabilityState>>) -> Self {
        Self { signal }
    }

    // Detector with no underlying signal
    pub fn always_online() -> Self {
        Self::new(None)
    }

    // Current state, read fresh from the signal
    pub fn state(&self) -> ReachabilityState {
        match &self.signal {
            Some(receiver) => *receiver.borrow(),
            None => ReachabilityState::online(ConnectionClass::Unknown),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state().online
    }

    // New receiver for the signal, `None` when there is no signal to follow
    pub fn subscribe(&self) -> Option<watch::Receiver<ReachabilityState>> {
        self.signal.clone()
    }

    // Call `callback` on every online/offline transition.
    // The listener ends once the publishing side is dropped
    pub fn on_change<F>(&self, mut callback: F) -> Option<JoinHandle<()>>
    where
        F: FnMut(ReachabilityState) + Send + 'static,
    {
        let mut receiver = self.subscribe()?;
        // Read before spawning so a transition published right after registration is not missed
        let mut last_online = receiver.borrow_and_update().online;
        Some(tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let state = *receiver.borrow_and_update();
                if state.online != last_online {
                    last_online = state.online;
                    callback(state);
                } else {
                    debug!("Connection class changed to {:?}", state.connection);
                }
            }
        }))
    }
}
