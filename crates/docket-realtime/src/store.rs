//! The shared coordination store contract and its in-memory implementation.
//!
//! The store is the only cross-instance shared resource: key/value entries
//! with a TTL (presence records) plus publish/subscribe of serialized
//! envelopes. It is eventually consistent and never a source of ordering
//! guarantees. The concrete technology is a deployment detail;
//! [`MemoryCoordinationStore`] backs single-instance deployments and tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use docket_core::{InstanceId, Update};

/// Coordination store failure. Always treated as degradation, never fatal.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

/// The envelope broadcast between instances.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// The instance that originated the update.
    pub origin: InstanceId,
    /// The update itself.
    pub update: Update,
}

/// Key/value-with-TTL plus publish/subscribe semantics.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Write a key with a time-to-live; overwrites refresh the TTL.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Delete a key. Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Publish a payload on a broadcast key.
    async fn publish(&self, key: &str, payload: String) -> Result<(), StoreError>;

    /// Open a subscription yielding `(key, payload)` pairs for every
    /// publish after this call. The receiver closing ends the subscription.
    async fn subscribe(&self) -> Result<mpsc::Receiver<(String, String)>, StoreError>;
}

/// In-process coordination store: a TTL map plus one broadcast channel.
pub struct MemoryCoordinationStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    tx: broadcast::Sender<(String, String)>,
}

impl MemoryCoordinationStore {
    /// Create a store with the given pub/sub buffer depth.
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(16));
        Self {
            entries: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Read a live (unexpired) value.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries);
        entries.get(key).map(|(value, _)| value.clone())
    }

    /// Number of live (unexpired) entries.
    pub fn live_len(&self) -> usize {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries);
        entries.len()
    }

    fn purge_expired(entries: &mut HashMap<String, (String, Instant)>) {
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
    }
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries);
        let _ = entries.insert(key.to_owned(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _ = self.entries.lock().remove(key);
        Ok(())
    }

    async fn publish(&self, key: &str, payload: String) -> Result<(), StoreError> {
        // No subscribers is fine — other instances may simply not exist.
        let _ = self.tx.send((key.to_owned(), payload));
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<(String, String)>, StoreError> {
        let mut rx = self.tx.subscribe();
        let (out_tx, out_rx) = mpsc::channel(256);
        let _ = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(pair) => {
                        if out_tx.send(pair).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "coordination subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out_rx)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
