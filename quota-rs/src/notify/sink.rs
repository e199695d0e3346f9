use crate::notify::types::UsageNotification;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Delivery target for notifications
///
/// Delivery is fire-and-forget: a failing sink never affects accounting.
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: &UsageNotification);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, notification: &UsageNotification) {
        warn!("{}", notification.message());
    }
}

/// Forwards notifications to an async consumer
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<UsageNotification>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<UsageNotification>) -> Self {
        ChannelSink { tx }
    }

    /// Sink plus the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UsageNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn deliver(&self, notification: &UsageNotification) {
        if self.tx.send(notification.clone()).is_err() {
            debug!("Notification receiver dropped");
        }
    }
}
