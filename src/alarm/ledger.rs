//! Dedup ledger of open alarms.
//!
//! Keeps at most one open alarm per (subject, kind). The in-memory map mirrors
//! the open rows of the [`AlarmStore`] and the lock is held across the
//! persistence call, so two sweeps reconciling the same key cannot both raise.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::rules::Evaluation;
use super::sink::NotificationSink;
use crate::db::{Alarm, AlarmKind, AlarmStore, AlarmSubject, NewAlarm, RepositoryError};

type AlarmKey = (AlarmSubject, AlarmKind);

/// A transition the ledger applied.
#[derive(Debug, Clone, PartialEq)]
pub enum AlarmEvent {
    Raised(Alarm),
    Cleared(Alarm),
}

pub struct DedupLedger {
    store: Arc<dyn AlarmStore>,
    sink: Arc<dyn NotificationSink>,
    open: Mutex<HashMap<AlarmKey, Alarm>>,
}

impl DedupLedger {
    /// Build the ledger from the alarms already open in the store.
    pub fn load(
        store: Arc<dyn AlarmStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, RepositoryError> {
        let open: HashMap<AlarmKey, Alarm> = store
            .open_alarms()?
            .into_iter()
            .map(|a| ((a.subject(), a.kind), a))
            .collect();

        if !open.is_empty() {
            tracing::info!("DedupLedger: restored {} open alarms", open.len());
        }

        Ok(Self {
            store,
            sink,
            open: Mutex::new(open),
        })
    }

    /// Apply one evaluation and notify the sink of whatever changed.
    pub fn reconcile(
        &self,
        evaluation: &Evaluation,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlarmEvent>, RepositoryError> {
        let events = {
            let mut open = self.open.lock().map_err(|_| RepositoryError::Poisoned)?;
            self.transition(&mut open, evaluation, now)?
        };

        for event in &events {
            match event {
                AlarmEvent::Raised(alarm) => {
                    tracing::warn!(
                        "Alarm raised: {} [{}] device={} unit={:?}: {}",
                        alarm.kind,
                        alarm.severity,
                        alarm.device_id,
                        alarm.unit_id,
                        alarm.message
                    );
                    self.sink.on_alarm_raised(alarm);
                }
                AlarmEvent::Cleared(alarm) => {
                    tracing::info!(
                        "Alarm cleared: {} device={} unit={:?}",
                        alarm.kind,
                        alarm.device_id,
                        alarm.unit_id
                    );
                    self.sink.on_alarm_cleared(alarm);
                }
            }
        }

        Ok(events)
    }

    fn transition(
        &self,
        open: &mut HashMap<AlarmKey, Alarm>,
        evaluation: &Evaluation,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlarmEvent>, RepositoryError> {
        let key = (evaluation.subject, evaluation.kind);
        let mut events = Vec::new();

        let wanted = evaluation.verdict.as_ref().map(|v| v.severity);
        let current = open.get(&key).map(|a| a.severity);

        if current.is_some() && current != wanted {
            // Cleared first so the store never sees two open rows for the key.
            if let Some(id) = open.get(&key).map(|a| a.id) {
                self.store.clear_alarm(id, now)?;
            }
            if let Some(mut existing) = open.remove(&key) {
                existing.cleared_at = Some(now);
                events.push(AlarmEvent::Cleared(existing));
            }
        }

        if let Some(verdict) = &evaluation.verdict {
            if !open.contains_key(&key) {
                let alarm = self.store.insert_alarm(&NewAlarm {
                    subject: evaluation.subject,
                    severity: verdict.severity,
                    kind: evaluation.kind,
                    message: verdict.message.clone(),
                    raised_at: now,
                })?;
                open.insert(key, alarm.clone());
                events.push(AlarmEvent::Raised(alarm));
            }
        }

        Ok(events)
    }

    pub fn open_alarm(&self, subject: AlarmSubject, kind: AlarmKind) -> Option<Alarm> {
        let open = self.open.lock().ok()?;
        open.get(&(subject, kind)).cloned()
    }

    /// Open alarms raised against the device itself, not its units.
    pub fn open_device_alarms(&self, device_id: i64) -> Vec<Alarm> {
        match self.open.lock() {
            Ok(open) => open
                .values()
                .filter(|a| a.device_id == device_id && a.unit_id.is_none())
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().map(|open| open.len()).unwrap_or(0)
    }
}
