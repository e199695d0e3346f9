/// Threshold notifications
///
/// Watches remaining-budget fractions after each reservation and
/// reconciliation and emits each threshold at most once per period:
/// - `NotificationEngine` tracks what was already emitted
/// - `NotificationSink` delivers notifications (log, channel, ...)

pub mod engine;
pub mod sink;
pub mod types;

pub use engine::NotificationEngine;
pub use sink::{ChannelSink, LogSink, NotificationSink};
pub use types::{NotificationScope, NotificationThresholds, Threshold, UsageNotification};
