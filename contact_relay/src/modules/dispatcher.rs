use log::{error, info, warn};
use serde::Serialize;
use std::{
    sync::Arc,
    time::Duration,
};
use uuid::Uuid;

use crate::modules::{
    contact::{validate_payload, ContactPayload},
    endpoint::{deliver_with_timeout, Delivery, SubmissionEndpoint},
    notifier::{NotificationEmitter, NotificationKind},
    reachability::Reachability,
    submission_queue::SubmissionQueue,
};

// What happened to a submission handed to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubmitOutcome {
    // Accepted by the endpoint
    Sent,
    // Stored in the offline queue for the sync worker
    Queued,
    // Neither delivered nor stored, the user has been told
    Failed,
}

// Entry point for form submissions.
// A failed direct send is never final: it degrades to the offline queue
pub struct SubmissionDispatcher {
    queue: Arc<SubmissionQueue>,
    reachability: Reachability,
    endpoint: Arc<dyn SubmissionEndpoint>,
    notifier: Arc<NotificationEmitter>,
    delivery_timeout: Duration,
}

impl SubmissionDispatcher {
    pub fn new(
        queue: Arc<SubmissionQueue>,
        reachability: Reachability,
        endpoint: Arc<dyn SubmissionEndpoint>,
        notifier: Arc<NotificationEmitter>,
        delivery_timeout: Duration,
    ) -> Self {
        Self { queue, reachability, endpoint, notifier, delivery_timeout }
    }

    pub async fn submit(&self, payload: ContactPayload) -> SubmitOutcome {
        let payload = payload.normalized();

        // Invalid submissions would fail the same way on every sync, so they are not queued
        if let Err(e) = validate_payload(&payload) {
            warn!("Submission from {:?} rejected locally: {}", payload.name, e);
            self.notifier.notify(NotificationKind::Failed, "Please check the form fields and try again.");
            return SubmitOutcome::Failed;
        }

        // Offline submissions get their id from the queue, sent ones keep it when falling back
        let mut submission_id = None;

        let state = self.reachability.state();
        if state.online {
            let delivery = Delivery::direct(payload.clone());
            submission_id = Some(delivery.submission_id);
            match deliver_with_timeout(self.endpoint.as_ref(), &delivery, self.delivery_timeout).await {
                Ok(()) => {
                    info!("Submission {} sent directly", delivery.submission_id);
                    self.notifier.notify(
                        NotificationKind::Sent,
                        "We received your request and will contact you shortly.",
                    );
                    return SubmitOutcome::Sent;
                }
                Err(e) if e.is_transport_failure() => {
                    warn!("Direct send of {} failed, storing offline: {}", delivery.submission_id, e);
                }
                Err(e) => {
                    error!("Unexpected failure sending {}, storing offline: {}", delivery.submission_id, e);
                }
            }
        } else {
            info!("Offline ({:?}), storing submission for later", state.connection);
        }

        self.enqueue(&payload, submission_id)
    }

    fn enqueue(&self, payload: &ContactPayload, submission_id: Option<Uuid>) -> SubmitOutcome {
        let stored = match submission_id {
            Some(submission_id) => self.queue.enqueue_with_id(payload, submission_id),
            None => self.queue.enqueue(payload),
        };
        match stored {
            Ok(_) => {
                self.notifier.notify(
                    NotificationKind::Queued,
                    "Your request will be sent automatically once you are back online.",
                );
                self.update_badge();
                SubmitOutcome::Queued
            }
            Err(e) => {
                error!("Submission from {:?} could not be stored: {}", payload.name, e);
                self.notifier.notify(
                    NotificationKind::Failed,
                    "Your request could not be sent or saved. Please try again.",
                );
                SubmitOutcome::Failed
            }
        }
    }

    fn update_badge(&self) {
        match self.queue.len() {
            Ok(count) => self.notifier.set_badge(count),
            Err(e) => warn!("Badge not updated: {}", e),
        }
    }
}
