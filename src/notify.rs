//! Host notifications.
//!
//! The console reports connection changes, finished commands and refused
//! sends through a [`Notifier`]. [`Notifications`] applies the
//! `[notifications]` settings before anything reaches the host.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::NotificationConfig;
use crate::connection::ConnectionState;
use crate::execution::ExecutionStatus;

/// Host-side sink for user-visible notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!(target: "relay_console::notify", title, "{body}");
    }
}

/// A [`Notifier`] filtered by [`NotificationConfig`].
#[derive(Clone)]
pub struct Notifications {
    config: NotificationConfig,
    sink: Arc<dyn Notifier>,
}

impl Notifications {
    pub fn new(config: NotificationConfig, sink: Arc<dyn Notifier>) -> Self {
        Self { config, sink }
    }

    pub fn config(&self) -> NotificationConfig {
        self.config
    }

    pub fn connection(&self, state: ConnectionState) {
        if !self.config.desktop || !self.config.connection_status {
            return;
        }
        let body = match state {
            ConnectionState::Connected => "Connected to relay server".to_string(),
            ConnectionState::Disconnected => "Disconnected from relay server".to_string(),
            ConnectionState::Error => "Connection error".to_string(),
            ConnectionState::Reconnecting { attempt, delay } => format!(
                "Connection lost, reconnecting (attempt {attempt}) in {}s",
                delay.as_secs()
            ),
            ConnectionState::Connecting => return,
        };
        self.sink.notify("Connection", &body);
    }

    pub fn command_complete(&self, status: ExecutionStatus, elapsed: Duration, detail: Option<&str>) {
        if !self.config.desktop || !self.config.command_complete {
            return;
        }
        let body = match (status, detail) {
            (ExecutionStatus::Success, _) => {
                format!("Completed in {}ms", elapsed.as_millis())
            }
            (ExecutionStatus::Timeout, _) => "Timed out waiting for a response".to_string(),
            (_, Some(detail)) => format!("Failed: {detail}"),
            (_, None) => "Failed".to_string(),
        };
        self.sink.notify("Command", &body);
    }

    pub fn send_failed(&self, reason: &str) {
        if !self.config.desktop {
            return;
        }
        self.sink.notify("Send failed", reason);
    }
}
