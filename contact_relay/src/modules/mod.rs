pub mod connectivity_monitor;
pub mod contact;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod notifier;
pub mod reachability;
pub mod submission_queue;
pub mod sync_worker;
