//! A simple persisted queue with visibility timeouts.
//!
//! Messages become invisible while a worker holds them and reappear if the
//! worker dies without acking. Visibility is wall-clock so a retry delay
//! survives a restart.

use anyhow::Result;
use fjall::{Keyspace, Partition, PersistMode};
use jiff::Timestamp;
use minicbor::{Decode, Encode};
use uuid::{Bytes, Uuid};

use super::uuidgen;

#[derive(Debug, Encode, Decode)]
pub(super) struct QueueMessage {
    #[cbor(n(0), with = "minicbor::bytes")]
    pub(super) body: Vec<u8>,
    #[n(1)]
    pub(super) receipt_handle: Bytes,
}

#[derive(Debug)]
pub(super) struct ReceiveResult {
    pub(super) key: Bytes,
    pub(super) message: QueueMessage,
    pub(super) receipt_handle: Bytes,
}

#[derive(Clone)]
pub(super) struct SimpleQueue {
    keyspace: Keyspace,
    messages: Partition,
    visibility: Partition,
}

fn now_secs() -> u64 {
    Timestamp::now().as_second().max(0) as u64
}

impl SimpleQueue {
    pub(super) fn new(keyspace: Keyspace) -> Result<SimpleQueue> {
        let messages = keyspace.open_partition("queue_messages", Default::default())?;
        let visibility = keyspace.open_partition("queue_visibility", Default::default())?;
        Ok(SimpleQueue {
            keyspace,
            messages,
            visibility,
        })
    }

    pub(super) fn is_empty(&self) -> Result<bool> {
        Ok(self.messages.is_empty()?)
    }

    pub(super) fn send_message(&self, body: &[u8]) -> Result<()> {
        self.send_message_after(body, 0)
    }

    /// Enqueue with an initial visibility delay in seconds.
    pub(super) fn send_message_after(&self, body: &[u8], delay: u64) -> Result<()> {
        let key = uuidgen();
        let message = QueueMessage {
            body: body.into(),
            receipt_handle: uuidgen(),
        };
        let bytes = minicbor::to_vec(message)?;

        let mut batch = self.keyspace.batch();
        batch.insert(&self.messages, key, bytes);
        if delay > 0 {
            batch.insert(&self.visibility, key, (now_secs() + delay).to_le_bytes());
        }
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Pop the first visible message, hiding it for `visibility_timeout`
    /// seconds. The returned receipt handle is required for ack and retry.
    pub(super) fn receive_message(&self, visibility_timeout: u64) -> Result<Option<ReceiveResult>> {
        let now = now_secs();

        for item in self.messages.iter() {
            let (key_bytes, value_bytes) = item?;
            let key = Uuid::from_bytes(key_bytes.as_ref().try_into()?);

            if let Some(visible_at) = self.visibility.get(key)? {
                let visible_at = u64::from_le_bytes(visible_at.as_ref().try_into()?);
                if visible_at > now {
                    continue;
                }
            }

            let mut message: QueueMessage = minicbor::decode(&value_bytes)?;
            let new_receipt_handle = Uuid::now_v7();
            message.receipt_handle = new_receipt_handle.into_bytes();
            let bytes = minicbor::to_vec(&message)?;

            let mut batch = self.keyspace.batch();
            batch.insert(
                &self.visibility,
                key.into_bytes(),
                (now + visibility_timeout).to_le_bytes(),
            );
            batch.insert(&self.messages, key.into_bytes(), bytes);
            batch.commit()?;
            self.keyspace.persist(PersistMode::SyncAll)?;

            return Ok(Some(ReceiveResult {
                key: key.into_bytes(),
                message,
                receipt_handle: new_receipt_handle.into_bytes(),
            }));
        }

        Ok(None)
    }

    /// Ack: drop the message if the receipt handle still matches.
    pub(super) fn delete_message(&self, key: Bytes, receipt_handle: Bytes) -> Result<bool> {
        let mut batch = self.keyspace.batch();

        if let Some(message) = self.messages.get(key)? {
            let message: QueueMessage = minicbor::decode(&message)?;
            if message.receipt_handle == receipt_handle {
                batch.remove(&self.messages, key);
                batch.remove(&self.visibility, key);
            } else {
                return Ok(false);
            }
        }

        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(true)
    }

    /// Nack with backoff: replace the body and hide the message for `delay`
    /// seconds. Fails when the receipt handle was rotated by another worker.
    pub(super) fn retry_message(
        &self,
        key: Bytes,
        receipt_handle: Bytes,
        body: &[u8],
        delay: u64,
    ) -> Result<bool> {
        let Some(stored) = self.messages.get(key)? else {
            return Ok(false);
        };
        let stored: QueueMessage = minicbor::decode(&stored)?;
        if stored.receipt_handle != receipt_handle {
            return Ok(false);
        }
        let message = QueueMessage {
            body: body.into(),
            receipt_handle: uuidgen(),
        };
        let bytes = minicbor::to_vec(message)?;

        let mut batch = self.keyspace.batch();
        batch.insert(&self.messages, key, bytes);
        batch.insert(&self.visibility, key, (now_secs() + delay).to_le_bytes());
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(true)
    }
}
