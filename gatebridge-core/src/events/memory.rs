//! In-process event log with consumer-group semantics.
//!
//! Single group. Each consumer handle reads new entries in order and
//! reclaims entries whose last delivery has been idle longer than the
//! redelivery timeout.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{DecisionEvent, EventFields, EventLog, EventPublisher, LogEntry, LogError};

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<(String, EventFields)>,
    /// Index of the next never-delivered entry
    cursor: usize,
    /// entry index → last delivery time
    pending: BTreeMap<usize, Instant>,
    acked: HashSet<String>,
}

/// Shared log; hand out per-consumer views with [`consumer`](Self::consumer).
#[derive(Debug)]
pub struct InMemoryEventLog {
    state: Mutex<LogState>,
    appended: Notify,
    redelivery_timeout: Duration,
}

impl InMemoryEventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new(redelivery_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LogState::default()),
            appended: Notify::new(),
            redelivery_timeout,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, LogState>, LogError> {
        self.state.lock().map_err(|_| LogError::Unavailable {
            reason: "event log lock poisoned".to_string(),
        })
    }

    /// Appends an entry and returns its id.
    pub fn append(&self, fields: EventFields) -> String {
        let id = match self.state.lock() {
            Ok(mut state) => {
                let id = format!("{}-0", state.entries.len() + 1);
                state.entries.push((id.clone(), fields));
                id
            }
            Err(_) => String::new(),
        };
        self.appended.notify_waiters();
        id
    }

    /// Creates a consumer in the group.
    #[must_use]
    pub fn consumer(self: &Arc<Self>, name: impl Into<String>) -> InMemoryConsumer {
        InMemoryConsumer {
            log: Arc::clone(self),
            name: name.into(),
        }
    }

    /// All entries whose `event_type` matches, oldest first.
    #[must_use]
    pub fn entries_of_type(&self, event_type: &str) -> Vec<EventFields> {
        self.state
            .lock()
            .map(|state| {
                state
                    .entries
                    .iter()
                    .filter(|(_, f)| f.get("event_type").map(String::as_str) == Some(event_type))
                    .map(|(_, f)| f.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entries delivered but not yet acknowledged.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    /// Whether an entry has been acknowledged.
    #[must_use]
    pub fn is_acked(&self, entry_id: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.acked.contains(entry_id))
            .unwrap_or(false)
    }

    fn take(&self, count: usize) -> Result<Vec<LogEntry>, LogError> {
        let now = Instant::now();
        let mut state = self.lock()?;
        let mut batch = Vec::new();

        let stale: Vec<usize> = state
            .pending
            .iter()
            .filter(|(_, delivered_at)| now.duration_since(**delivered_at) >= self.redelivery_timeout)
            .map(|(index, _)| *index)
            .take(count)
            .collect();
        for index in stale {
            state.pending.insert(index, now);
            let (id, fields) = state.entries[index].clone();
            batch.push(LogEntry {
                id,
                fields,
                redelivered: true,
            });
        }
        if !batch.is_empty() {
            return Ok(batch);
        }

        while batch.len() < count && state.cursor < state.entries.len() {
            let index = state.cursor;
            state.cursor += 1;
            state.pending.insert(index, now);
            let (id, fields) = state.entries[index].clone();
            batch.push(LogEntry {
                id,
                fields,
                redelivered: false,
            });
        }
        Ok(batch)
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventLog {
    async fn publish(&self, event: &DecisionEvent) -> Result<String, LogError> {
        Ok(self.append(event.to_fields().into_iter().collect()))
    }
}

/// One consumer of an [`InMemoryEventLog`].
#[derive(Debug, Clone)]
pub struct InMemoryConsumer {
    log: Arc<InMemoryEventLog>,
    name: String,
}

#[async_trait]
impl EventLog for InMemoryConsumer {
    fn consumer_name(&self) -> &str {
        &self.name
    }

    async fn ensure_group(&self) -> Result<(), LogError> {
        Ok(())
    }

    async fn read(&self, count: usize, block: Duration) -> Result<Vec<LogEntry>, LogError> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking to avoid a lost wakeup.
            let appended = self.log.appended.notified();
            let batch = self.log.take(count.max(1))?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Wake on append, or periodically so idle entries get reclaimed.
            let wait = (deadline - now)
                .min(self.log.redelivery_timeout.max(Duration::from_millis(10)));
            let _ = tokio::time::timeout(wait, appended).await;
        }
    }

    async fn ack(&self, entry_id: &str) -> Result<(), LogError> {
        let mut state = self.log.lock()?;
        let index = state.entries.iter().position(|(id, _)| id == entry_id);
        if let Some(index) = index {
            state.pending.remove(&index);
        }
        state.acked.insert(entry_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> EventFields {
        EventFields::from([
            ("event_type".to_string(), "GATE_REQUESTED".to_string()),
            ("request_id".to_string(), id.to_string()),
        ])
    }

    const BLOCK: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_competing_consumers_split_entries() {
        let log = InMemoryEventLog::new(Duration::from_secs(30));
        let a = log.consumer("a");
        let b = log.consumer("b");
        log.append(event("r1"));
        log.append(event("r2"));

        let first = a.read(1, BLOCK).await.unwrap();
        let second = b.read(1, BLOCK).await.unwrap();
        assert_eq!(first[0].fields["request_id"], "r1");
        assert_eq!(second[0].fields["request_id"], "r2");
        assert!(a.read(10, BLOCK).await.unwrap().is_empty());
        assert_eq!(log.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_ack_removes_from_pending() {
        let log = InMemoryEventLog::new(Duration::from_secs(30));
        let consumer = log.consumer("a");
        let id = log.append(event("r1"));

        let batch = consumer.read(10, BLOCK).await.unwrap();
        consumer.ack(&batch[0].id).await.unwrap();
        assert_eq!(log.pending_count(), 0);
        assert!(log.is_acked(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_entry_is_redelivered_after_timeout() {
        let log = InMemoryEventLog::new(Duration::from_secs(5));
        let a = log.consumer("a");
        let b = log.consumer("b");
        log.append(event("r1"));

        let first = a.read(1, BLOCK).await.unwrap();
        assert!(!first[0].redelivered);
        assert!(b.read(1, BLOCK).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let again = b.read(1, BLOCK).await.unwrap();
        assert_eq!(again[0].id, first[0].id);
        assert!(again[0].redelivered);
    }

    #[tokio::test]
    async fn test_read_wakes_on_append() {
        let log = InMemoryEventLog::new(Duration::from_secs(30));
        let consumer = log.consumer("a");
        let writer = Arc::clone(&log);

        let reader = tokio::spawn(async move { consumer.read(1, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.append(event("late"));

        let batch = reader.await.unwrap().unwrap();
        assert_eq!(batch[0].fields["request_id"], "late");
    }
}
