//! Federated delivery: worker actors drain the persisted queue, sign each
//! activity with the sending account's key and POST it to the recipient's
//! inbox, retrying transient failures with capped exponential backoff.

use std::time::Duration;

use anyhow::{Context, Result};
use minicbor::{Decode, Encode};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use reqwest::StatusCode;
use tokio::task::block_in_place;
use tracing::{info, warn};

use crate::config::RuntimeConfig;

use super::repo::AccountRepo;
use super::simple_queue::SimpleQueue;
use super::{Mailman, hs2019};

#[derive(Debug, Clone, Encode, Decode)]
pub(crate) struct DeliveryQueueItem {
    /// Local username whose key signs the request.
    #[n(0)]
    pub(crate) sender: String,
    /// Remote actor IRI; the inbox is resolved at delivery time.
    #[n(1)]
    pub(crate) recipient: String,
    /// Serialized activity JSON.
    #[n(2)]
    pub(crate) activity: String,
    #[n(3)]
    pub(crate) attempts: u32,
}

impl DeliveryQueueItem {
    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        minicbor::to_vec(self).context("unable to encode delivery item")
    }
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<DeliveryQueueItem> {
        minicbor::decode(bytes).context("unable to decode delivery item")
    }
}

pub(crate) struct DeliveryWorker;

pub(crate) enum DeliveryWorkerMsg {
    RunLoop,
}

pub(crate) struct DeliveryWorkerInit {
    pub(crate) config: RuntimeConfig,
}

pub(crate) struct DeliveryWorkerState {
    queue: SimpleQueue,
    accounts: AccountRepo,
    mailman: Mailman,
    max_attempts: u32,
}

impl Actor for DeliveryWorker {
    type Msg = DeliveryWorkerMsg;
    type State = DeliveryWorkerState;
    type Arguments = DeliveryWorkerInit;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let DeliveryWorkerInit { config } = args;
        block_in_place(|| {
            let queue = SimpleQueue::new(config.keyspace.clone())?;
            let accounts = AccountRepo::new(config.keyspace.clone())?;
            Ok(DeliveryWorkerState {
                queue,
                accounts,
                mailman: Mailman::new(),
                max_attempts: config.init.delivery_max_attempts,
            })
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        myself.send_after(POLL_INTERVAL, || DeliveryWorkerMsg::RunLoop);
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DeliveryWorkerMsg::RunLoop => {
                match state.handle_delivery().await {
                    Ok(true) => {
                        // There might be more work, immediately schedule the next loop
                        ractor::cast!(myself, DeliveryWorkerMsg::RunLoop)?;
                    }
                    Ok(false) => {
                        myself.send_after(POLL_INTERVAL, || DeliveryWorkerMsg::RunLoop);
                    }
                    Err(error) => {
                        warn!(target: "delivery", %error, "delivery loop failed");
                        myself.send_after(POLL_INTERVAL, || DeliveryWorkerMsg::RunLoop);
                    }
                }
            }
        }
        Ok(())
    }
}

const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// A popped job stays invisible to other workers this long.
const VISIBILITY_TIMEOUT: u64 = 60;

/// Retry delays top out at one day.
const MAX_BACKOFF_SECS: u64 = 86_400;

enum Outcome {
    Delivered,
    Permanent(String),
    Transient(String),
}

impl DeliveryWorkerState {
    async fn handle_delivery(&mut self) -> Result<bool> {
        if self.queue.is_empty()? {
            return Ok(false);
        }
        let Some(received) = self.queue.receive_message(VISIBILITY_TIMEOUT)? else {
            return Ok(false);
        };
        let mut item = DeliveryQueueItem::from_bytes(&received.message.body)?;

        match self.deliver(&item).await {
            Outcome::Delivered => {
                info!(target: "delivery", recipient = %item.recipient, "delivered");
                self.queue.delete_message(received.key, received.receipt_handle)?;
            }
            Outcome::Permanent(reason) => {
                warn!(target: "delivery", recipient = %item.recipient, %reason, "dropping undeliverable activity");
                self.queue.delete_message(received.key, received.receipt_handle)?;
            }
            Outcome::Transient(reason) => {
                item.attempts += 1;
                if item.attempts >= self.max_attempts {
                    warn!(
                        target: "delivery",
                        recipient = %item.recipient,
                        attempts = item.attempts,
                        %reason,
                        "retiring delivery after too many attempts"
                    );
                    self.queue.delete_message(received.key, received.receipt_handle)?;
                } else {
                    let delay = backoff_delay(item.attempts);
                    info!(
                        target: "delivery",
                        recipient = %item.recipient,
                        attempts = item.attempts,
                        delay,
                        %reason,
                        "delivery failed, will retry"
                    );
                    self.queue.retry_message(
                        received.key,
                        received.receipt_handle,
                        &item.to_bytes()?,
                        delay,
                    )?;
                }
            }
        }
        Ok(true)
    }

    async fn deliver(&self, item: &DeliveryQueueItem) -> Outcome {
        let account = match self.accounts.find_by_username(&item.sender) {
            Ok(Some(account)) => account,
            Ok(None) => return Outcome::Permanent("sending account no longer exists".into()),
            Err(error) => return Outcome::Transient(format!("account lookup failed: {error}")),
        };
        // Resolve the recipient actor to find their inbox
        let actor_doc = match self.mailman.fetch(&item.recipient).await {
            Ok(doc) => doc,
            Err(error) => return Outcome::Transient(format!("actor fetch failed: {error}")),
        };
        let Some(inbox) = actor_doc.get("inbox").and_then(|v| v.as_str()) else {
            return Outcome::Permanent("recipient actor has no inbox".into());
        };
        let headers = match hs2019::post_headers(
            &account.key_iri,
            inbox,
            &item.activity,
            &account.private_key_der,
        ) {
            Ok(headers) => headers,
            Err(error) => return Outcome::Permanent(format!("signing failed: {error}")),
        };
        match self.mailman.post(inbox, headers, &item.activity).await {
            Ok(status) => classify_status(status),
            Err(error) => Outcome::Transient(format!("post failed: {error}")),
        }
    }
}

fn classify_status(status: StatusCode) -> Outcome {
    if status.is_success() {
        return Outcome::Delivered;
    }
    match status.as_u16() {
        408 | 429 => Outcome::Transient(format!("status {status}")),
        400..=499 => Outcome::Permanent(format!("status {status}")),
        _ => Outcome::Transient(format!("status {status}")),
    }
}

/// Exponential backoff with jitter, capped at a day.
fn backoff_delay(attempts: u32) -> u64 {
    let base = 30u64.saturating_mul(1u64 << attempts.min(20));
    let jitter = rand::random::<u64>() % (base / 2 + 1);
    (base + jitter).min(MAX_BACKOFF_SECS)
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{DeliveryQueueItem, MAX_BACKOFF_SECS, Outcome, backoff_delay, classify_status};

    #[test]
    fn queue_item_round_trip() {
        let item = DeliveryQueueItem {
            sender: "alice".into(),
            recipient: "https://remote.example/person/bob".into(),
            activity: "{\"type\":\"Follow\"}".into(),
            attempts: 3,
        };
        let bytes = item.to_bytes().unwrap();
        let decoded = DeliveryQueueItem::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.sender, "alice");
        assert_eq!(decoded.recipient, "https://remote.example/person/bob");
        assert_eq!(decoded.attempts, 3);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::ACCEPTED),
            Outcome::Delivered
        ));
        assert!(matches!(
            classify_status(StatusCode::OK),
            Outcome::Delivered
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            Outcome::Permanent(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            Outcome::Permanent(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT),
            Outcome::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            Outcome::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            Outcome::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            Outcome::Transient(_)
        ));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff_delay(1);
        assert!((60..=90).contains(&first));
        for attempts in 0..40 {
            assert!(backoff_delay(attempts) <= MAX_BACKOFF_SECS);
        }
        assert_eq!(backoff_delay(30), MAX_BACKOFF_SECS);
    }
}
