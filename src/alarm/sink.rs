//! Notification sinks receiving alarm transitions.

use crate::db::Alarm;

/// Receives every alarm the ledger raises or clears. Delivery is up to the
/// implementation.
pub trait NotificationSink: Send + Sync {
    fn on_alarm_raised(&self, alarm: &Alarm);
    fn on_alarm_cleared(&self, alarm: &Alarm);
}

/// Sink that only writes to the log. Used when no delivery channel is wired.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn on_alarm_raised(&self, alarm: &Alarm) {
        tracing::info!(
            target: "ponwatch::notify",
            alarm_id = alarm.id,
            device_id = alarm.device_id,
            severity = %alarm.severity,
            kind = %alarm.kind,
            "{}",
            alarm.message
        );
    }

    fn on_alarm_cleared(&self, alarm: &Alarm) {
        tracing::info!(
            target: "ponwatch::notify",
            alarm_id = alarm.id,
            device_id = alarm.device_id,
            kind = %alarm.kind,
            "cleared"
        );
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingSink;

#[cfg(test)]
mod recording {
    use super::*;
    use std::sync::Mutex;

    /// Collects notifications for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        raised: Mutex<Vec<Alarm>>,
        cleared: Mutex<Vec<Alarm>>,
    }

    impl RecordingSink {
        pub fn raised(&self) -> Vec<Alarm> {
            self.raised.lock().unwrap().clone()
        }

        pub fn cleared(&self) -> Vec<Alarm> {
            self.cleared.lock().unwrap().clone()
        }
    }

    impl NotificationSink for RecordingSink {
        fn on_alarm_raised(&self, alarm: &Alarm) {
            self.raised.lock().unwrap().push(alarm.clone());
        }

        fn on_alarm_cleared(&self, alarm: &Alarm) {
            self.cleared.lock().unwrap().push(alarm.clone());
        }
    }
}
