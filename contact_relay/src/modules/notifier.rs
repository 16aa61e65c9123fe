use log::{debug, info};
use serde::Serialize;

use crate::modules::error::RelayError;

// Outcome a notification reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationKind {
    Sent,
    Queued,
    Failed,
}

impl NotificationKind {
    pub fn title(&self) -> &'static str {
        match self {
            NotificationKind::Sent => "Form sent!",
            NotificationKind::Queued => "Form saved offline",
            NotificationKind::Failed => "Form not sent",
        }
    }

    // Notifications with the same tag replace each other on the surface
    pub fn tag(&self) -> &'static str {
        match self {
            NotificationKind::Sent => "form-success",
            NotificationKind::Queued => "form-offline",
            NotificationKind::Failed => "form-error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub tag: String,
}

// Platform surface that shows notifications
pub trait NotificationSurface: Send + Sync {
    fn show(&self, notification: &Notification) -> Result<(), RelayError>;

    // Pending-work badge, zero clears it. Surfaces without a badge ignore it
    fn set_badge(&self, _count: usize) -> Result<(), RelayError> {
        Ok(())
    }
}

// Native surface: notifications go to the application log
pub struct LogSurface;

impl NotificationSurface for LogSurface {
    fn show(&self, notification: &Notification) -> Result<(), RelayError> {
        info!("[{}] {}: {}", notification.tag, notification.title, notification.body);
        Ok(())
    }

    fn set_badge(&self, count: usize) -> Result<(), RelayError> {
        if count > 0 {
            info!("[badge] {} submission(s) waiting for delivery", count);
        } else {
            info!("[badge] cleared");
        }
        Ok(())
    }
}

// Best-effort user acknowledgement. Never fails towards the caller
pub struct NotificationEmitter {
    surface: Option<Box<dyn NotificationSurface>>,
    permission_granted: bool,
}

impl NotificationEmitter {
    pub fn new(surface: Option<Box<dyn NotificationSurface>>, permission_granted: bool) -> Self {
        Self { surface, permission_granted }
    }

    // Emitter with nowhere to send notifications
    pub fn disabled() -> Self {
        Self::new(None, false)
    }

    pub fn notify(&self, kind: NotificationKind, message: &str) {
        let notification = Notification {
            title: kind.title().to_string(),
            body: message.to_string(),
            tag: kind.tag().to_string(),
        };

        if let Err(e) = self.surface().and_then(|surface| surface.show(&notification)) {
            debug!("Notification '{}' dropped: {}", notification.tag, e);
        }
    }

    pub fn set_badge(&self, count: usize) {
        if let Err(e) = self.surface().and_then(|surface| surface.set_badge(count)) {
            debug!("Badge update dropped: {}", e);
        }
    }

    fn surface(&self) -> Result<&dyn NotificationSurface, RelayError> {
        if !self.permission_granted {
            return Err(RelayError::NotificationUnavailable("permission not granted".to_string()));
        }
        self.surface
            .as_deref()
            .ok_or_else(|| RelayError::NotificationUnavailable("no notification surface".to_string()))
    }
}
