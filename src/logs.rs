use crate::models::{LogEntry, LogRecord};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Append-only request log, one sequence per instance.
///
/// Appends are serialized by a single short critical section; the broadcast fan-out to
/// live subscribers happens outside it.
pub struct LogPipeline {
    entries: Mutex<HashMap<Uuid, Vec<Arc<LogEntry>>>>,
    next_id: AtomicU64,
    stream: broadcast::Sender<Arc<LogEntry>>,
}

impl LogPipeline {
    pub fn new(stream_capacity: usize) -> Self {
        let (stream, _) = broadcast::channel(stream_capacity.max(1));
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            stream,
        }
    }

    pub fn record(&self, record: LogRecord) -> Arc<LogEntry> {
        let entry = {
            let mut entries = self.entries.lock();
            // Ids follow arrival order
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let entry = Arc::new(record.into_entry(id));
            entries.entry(entry.instance_id).or_default().push(entry.clone());
            entry
        };
        // No subscribers is fine
        let _ = self.stream.send(entry.clone());
        entry
    }

    /// Entries in arrival order, filtered by literal case-sensitive substring if a keyword is given.
    pub fn query(&self, instance_id: Uuid, keyword: Option<&str>) -> Vec<LogEntry> {
        let keyword = keyword.filter(|k| !k.is_empty());
        let entries = self.entries.lock();
        let Some(log) = entries.get(&instance_id) else {
            return Vec::new();
        };
        log.iter()
            .filter(|entry| keyword.is_none_or(|k| entry.request.contains(k)))
            .map(|entry| (**entry).clone())
            .collect()
    }

    /// Removes one entry; returns whether it existed.
    pub fn delete_one(&self, instance_id: Uuid, entry_id: u64) -> bool {
        let mut entries = self.entries.lock();
        let Some(log) = entries.get_mut(&instance_id) else {
            return false;
        };
        let before = log.len();
        log.retain(|entry| entry.id != entry_id);
        log.len() != before
    }

    pub fn clear_all(&self, instance_id: Uuid) {
        if let Some(log) = self.entries.lock().get_mut(&instance_id) {
            log.clear();
        }
    }

    pub(crate) fn forget(&self, instance_id: Uuid) {
        self.entries.lock().remove(&instance_id);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<LogEntry>> {
        self.stream.subscribe()
    }
}
