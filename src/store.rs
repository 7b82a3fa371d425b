//! Persistence and queueing seams.
//!
//! The processor only talks to [`MessageRepository`] and [`MessageQueue`]; the in-memory
//! implementations here back the binary and the tests. A database or broker slots in by
//! implementing the same traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{Mutex, RwLock};

use crate::error::StoreError;
use crate::hl7::{Hl7Message, MessageType};
use crate::transform::MappedRecord;

/// A processed message as handed to the repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub message_type: MessageType,
    pub received_at: DateTime<Utc>,
    pub message: Hl7Message,
    pub transformed: Option<MappedRecord>,
    pub warnings: Vec<String>,
}

impl StoredMessage {
    pub fn new(message: Hl7Message) -> StoredMessage {
        StoredMessage {
            id: message.id.clone(),
            message_type: message.message_type,
            received_at: Utc::now(),
            message,
            transformed: None,
            warnings: Vec::new(),
        }
    }
}

/// Filters and paging for [`MessageRepository::query`]. Pages are zero based.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageQuery {
    pub message_type: Option<MessageType>,
    /// Inclusive lower bound on `received_at`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `received_at`
    pub to: Option<DateTime<Utc>>,
    pub page: usize,
    pub page_size: usize,
}

impl Default for MessageQuery {
    fn default() -> Self {
        MessageQuery {
            message_type: None,
            from: None,
            to: None,
            page: 0,
            page_size: 50,
        }
    }
}

impl MessageQuery {
    pub fn matches(&self, stored: &StoredMessage) -> bool {
        self.message_type.map_or(true, |t| stored.message_type == t)
            && self.from.map_or(true, |from| stored.received_at >= from)
            && self.to.map_or(true, |to| stored.received_at < to)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matches across all pages
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Stores `message`, replacing any earlier record with the same id.
    async fn save(&self, message: StoredMessage) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<StoredMessage, StoreError>;

    /// Matching messages, newest first.
    async fn query(&self, query: &MessageQuery) -> Result<Page<StoredMessage>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryRepository {
    messages: RwLock<HashMap<String, StoredMessage>>,
}

impl InMemoryRepository {
    pub fn new() -> InMemoryRepository {
        InMemoryRepository::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

#[async_trait]
impl MessageRepository for InMemoryRepository {
    async fn save(&self, message: StoredMessage) -> Result<(), StoreError> {
        debug!("Storing message {}", message.id);
        self.messages.write().await.insert(message.id.clone(), message);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<StoredMessage, StoreError> {
        self.messages
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn query(&self, query: &MessageQuery) -> Result<Page<StoredMessage>, StoreError> {
        let messages = self.messages.read().await;
        let mut matching: Vec<&StoredMessage> = messages.values().filter(|m| query.matches(m)).collect();
        matching.sort_by(|a, b| b.received_at.cmp(&a.received_at).then_with(|| a.id.cmp(&b.id)));

        let page_size = query.page_size.max(1);
        Ok(Page {
            total: matching.len(),
            items: matching
                .into_iter()
                .skip(query.page * page_size)
                .take(page_size)
                .cloned()
                .collect(),
            page: query.page,
            page_size,
        })
    }
}

/// A message handed out by [`MessageQueue::receive`], held in flight until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub payload: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, payload: String) -> Result<(), StoreError>;

    /// The next ready message, if any. It stays in flight until acknowledged or rejected.
    async fn receive(&self) -> Result<Option<Delivery>, StoreError>;

    async fn acknowledge(&self, tag: u64) -> Result<(), StoreError>;

    /// Moves an in-flight message to the dead-letter queue.
    async fn reject(&self, tag: u64, reason: &str) -> Result<(), StoreError>;

    async fn publish_dead_letter(&self, payload: String, reason: &str) -> Result<(), StoreError>;

    async fn receive_dead_letter(&self) -> Result<Option<DeadLetter>, StoreError>;
}

#[derive(Default)]
struct QueueState {
    next_tag: u64,
    ready: VecDeque<String>,
    in_flight: HashMap<u64, String>,
    dead_letters: VecDeque<DeadLetter>,
}

#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new() -> InMemoryQueue {
        InMemoryQueue::default()
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.state.lock().await.dead_letters.len()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(&self, payload: String) -> Result<(), StoreError> {
        self.state.lock().await.ready.push_back(payload);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(payload) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.next_tag += 1;
        let tag = state.next_tag;
        state.in_flight.insert(tag, payload.clone());
        Ok(Some(Delivery { tag, payload }))
    }

    async fn acknowledge(&self, tag: u64) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(&tag)
            .map(|_| ())
            .ok_or(StoreError::UnknownDelivery(tag))
    }

    async fn reject(&self, tag: u64, reason: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let payload = state
            .in_flight
            .remove(&tag)
            .ok_or(StoreError::UnknownDelivery(tag))?;
        warn!("Delivery {} rejected: {}", tag, reason);
        state.dead_letters.push_back(DeadLetter {
            payload,
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn publish_dead_letter(&self, payload: String, reason: &str) -> Result<(), StoreError> {
        warn!("Dead-lettering message: {}", reason);
        self.state.lock().await.dead_letters.push_back(DeadLetter {
            payload,
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn receive_dead_letter(&self) -> Result<Option<DeadLetter>, StoreError> {
        Ok(self.state.lock().await.dead_letters.pop_front())
    }
}
