//! Glue between the listener and the collaborators: raw text in, a stored (and optionally
//! transformed) message out. Input without a header is dead-lettered instead of stored.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::hl7::parse_message;
use crate::server::ServerEvent;
use crate::store::{MessageQueue, MessageRepository, StoredMessage};
use crate::transform::{TransformContext, TransformationEngine};

pub const MISSING_HEADER_REASON: &str = "message has no MSH header";

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Stored { id: String, warnings: Vec<String> },
    DeadLettered { reason: String },
}

pub struct MessageProcessor {
    engine: Option<Arc<TransformationEngine>>,
    repository: Arc<dyn MessageRepository>,
    queue: Arc<dyn MessageQueue>,
}

impl MessageProcessor {
    pub fn new(repository: Arc<dyn MessageRepository>, queue: Arc<dyn MessageQueue>) -> MessageProcessor {
        MessageProcessor {
            engine: None,
            repository,
            queue,
        }
    }

    pub fn with_engine(mut self, engine: Arc<TransformationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub async fn process(&self, raw: &str) -> Result<ProcessingOutcome, StoreError> {
        let message = parse_message(raw);
        if message.header.is_none() {
            self.queue
                .publish_dead_letter(raw.to_string(), MISSING_HEADER_REASON)
                .await?;
            return Ok(ProcessingOutcome::DeadLettered {
                reason: MISSING_HEADER_REASON.to_string(),
            });
        }

        let mut stored = StoredMessage::new(message);
        stored.warnings = stored.message.validation_errors.clone();
        if let Some(engine) = &self.engine {
            let outcome = engine.transform(&stored.message, &TransformContext::new());
            stored.warnings.extend(outcome.warnings);
            stored.transformed = Some(outcome.record);
        }

        let id = stored.id.clone();
        let warnings = stored.warnings.clone();
        self.repository.save(stored).await?;
        debug!("Processed message {} with {} warning(s)", id, warnings.len());
        Ok(ProcessingOutcome::Stored { id, warnings })
    }

    /// Works through everything currently ready on the queue, returning how many were handled.
    pub async fn drain_queue(&self) -> Result<usize, StoreError> {
        let mut handled = 0;
        while let Some(delivery) = self.queue.receive().await? {
            // headerless input is dead-lettered inside `process`, so it still counts as handled
            match self.process(&delivery.payload).await {
                Ok(_) => self.queue.acknowledge(delivery.tag).await?,
                Err(e) => self.queue.reject(delivery.tag, &e.to_string()).await?,
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Queues and processes every received message until the listener goes away or `shutdown` fires.
    pub async fn consume(&self, mut events: broadcast::Receiver<ServerEvent>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ServerEvent::MessageReceived { peer, message }) => {
                    debug!("Queueing message from {}", peer);
                    if let Err(e) = self.queue.publish(message).await {
                        warn!("Failed to queue message from {}; error = {}", peer, e);
                        continue;
                    }
                    if let Err(e) = self.drain_queue().await {
                        warn!("Failed to process queued messages; error = {}", e);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!("Processor lagged behind the listener, {} event(s) missed", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Message processor stopped");
    }
}
