use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use std::time::Duration;
use uuid::Uuid;

use crate::modules::{
    contact::ContactPayload,
    error::RelayError,
    submission_queue::QueuedSubmission,
};

// Route of the contact endpoint relative to the backend base URL
pub const CONTACT_ROUTE: &str = "/api/contact";

// One delivery attempt of a submission
#[derive(Debug, Clone)]
pub struct Delivery {
    // Identifies the submission across attempts
    pub submission_id: Uuid,
    pub payload: ContactPayload,
    // Set when the submission comes out of the offline queue
    pub queued_at: Option<DateTime<Utc>>,
}

impl Delivery {
    // Direct delivery of a fresh submission
    pub fn direct(payload: ContactPayload) -> Self {
        Self { submission_id: Uuid::new_v4(), payload, queued_at: None }
    }
}

impl From<&QueuedSubmission> for Delivery {
    fn from(queued: &QueuedSubmission) -> Self {
        Self {
            submission_id: queued.submission_id,
            payload: queued.payload.clone(),
            queued_at: Some(queued.enqueued_at),
        }
    }
}

// The external collaborator that accepts submissions
#[async_trait]
pub trait SubmissionEndpoint: Send + Sync {
    // Ok only when the endpoint accepted the submission
    async fn deliver(&self, delivery: &Delivery) -> Result<(), RelayError>;
}

// Deliver with an upper bound, expiry is reported as a timeout failure
pub async fn deliver_with_timeout(
    endpoint: &dyn SubmissionEndpoint,
    delivery: &Delivery,
    timeout: Duration,
) -> Result<(), RelayError> {
    match tokio::time::timeout(timeout, endpoint.deliver(delivery)).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::TimeoutError(timeout.as_millis() as u64)),
    }
}

// Contact endpoint reached over HTTP
pub struct HttpEndpoint {
    client: reqwest::Client,
    url: String,
    request_timeout: Duration,
}

impl HttpEndpoint {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RelayError::TransportError(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), CONTACT_ROUTE),
            request_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SubmissionEndpoint for HttpEndpoint {
    async fn deliver(&self, delivery: &Delivery) -> Result<(), RelayError> {
        let mut request = self.client
            .post(&self.url)
            .header("X-Submission-Id", delivery.submission_id.to_string())
            .json(&delivery.payload.to_request_body());

        // Queued submissions carry their storage time, in epoch milliseconds
        if let Some(queued_at) = delivery.queued_at {
            request = request.header("X-Offline-Storage", queued_at.timestamp_millis().to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RelayError::TimeoutError(self.request_timeout.as_millis() as u64)
                } else {
                    RelayError::TransportError(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!("Submission {} accepted with status {}", delivery.submission_id, status);
            Ok(())
        } else {
            Err(RelayError::RejectedError(status.as_u16()))
        }
    }
}
