use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::dispatcher::InboundMessage;

// ============================================================================
// Dead Letter Queue
// ============================================================================
//
// A message whose handler kept failing after every allowed delivery becomes
// a `DeadLetter`. The broker consumer publishes it to `<topic>.dlq` before
// committing past it. The memory consumer keeps it in a bounded
// `DeadLetterQueue` for inspection.
//
// ============================================================================

pub const DLQ_TOPIC_SUFFIX: &str = ".dlq";
pub const DEFAULT_DLQ_CAPACITY: usize = 1000;

/// Topic that receives the dead letters of `topic`.
pub fn dlq_topic_for(topic: &str) -> String {
    format!("{}{}", topic, DLQ_TOPIC_SUFFIX)
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    pub topic: String,
    pub event_type: String,
    pub payload: String,
    pub error_message: String,
    pub failure_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        message: &InboundMessage,
        event_type: &str,
        error_message: &str,
        first_failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: message.topic.clone(),
            event_type: event_type.to_string(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            error_message: error_message.to_string(),
            failure_count: message.delivery_attempt,
            first_failed_at,
            last_failed_at: Utc::now(),
        }
    }

    pub fn dlq_topic(&self) -> String {
        dlq_topic_for(&self.topic)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DlqStats {
    pub total_messages: usize,
    pub by_event_type: HashMap<String, usize>,
    /// Entries dropped because the queue was full
    pub evicted: u64,
}

struct Entries {
    items: VecDeque<DeadLetter>,
    evicted: u64,
}

/// In-process dead letters, oldest first. When full, the oldest entry is
/// dropped to make room.
pub struct DeadLetterQueue {
    entries: RwLock<Entries>,
    capacity: usize,
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DLQ_CAPACITY)
    }
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Entries {
                items: VecDeque::new(),
                evicted: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub async fn add(&self, entry: DeadLetter) -> Uuid {
        let id = entry.id;
        let mut entries = self.entries.write().await;

        if entries.items.len() >= self.capacity {
            if let Some(oldest) = entries.items.pop_front() {
                entries.evicted += 1;
                tracing::warn!(
                    event_id = %oldest.id,
                    event_type = %oldest.event_type,
                    capacity = self.capacity,
                    "Dead Letter Queue full, dropping oldest entry"
                );
            }
        }

        entries.items.push_back(entry);
        id
    }

    /// Oldest entries first, at most `limit`.
    pub async fn list(&self, limit: usize) -> Vec<DeadLetter> {
        self.entries.read().await.items.iter().take(limit).cloned().collect()
    }

    pub async fn stats(&self) -> DlqStats {
        let entries = self.entries.read().await;
        let mut by_event_type = HashMap::new();
        for entry in entries.items.iter() {
            *by_event_type.entry(entry.event_type.clone()).or_insert(0) += 1;
        }

        DlqStats {
            total_messages: entries.items.len(),
            by_event_type,
            evicted: entries.evicted,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
