//! Notifications as structured tracing events.
//!
//! Events go to target `notifications`, so a subscriber can route them to a
//! separate sink (file, log shipper) with an `EnvFilter` directive.

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{NotificationSink, NotifyError, Severity};

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl TracingNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationSink for TracingNotifier {
    async fn notify(
        &self,
        user_id: &str,
        title: &str,
        message: &str,
        severity: Severity,
    ) -> Result<(), NotifyError> {
        match severity {
            Severity::Info => info!(target: "notifications", user_id, title, message, "Notification"),
            Severity::Warning => warn!(target: "notifications", user_id, title, message, "Notification"),
            Severity::Critical => error!(target: "notifications", user_id, title, message, "Notification"),
        }
        Ok(())
    }
}
