//! Post-commit update fan-out.
//!
//! The indexer publishes one `BlockUpdate` and then one `TxUpdate` per
//! transaction after each commit. Delivery is non-blocking: every
//! subscriber owns a bounded queue and an overflow policy, so a slow
//! consumer can never stall the ingestion path.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use stxindex_core::types::{Block, Tx};

/// One fan-out update. Payloads are shared so a wide subscriber set does
/// not clone row data per queue.
#[derive(Debug, Clone)]
pub enum IndexUpdate {
    BlockUpdate(Arc<Block>),
    TxUpdate(Arc<Tx>),
}

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop this update for this subscriber and count it.
    #[default]
    DropUpdate,
    /// Remove the subscriber entirely.
    Disconnect,
}

struct Subscriber {
    name: String,
    sender: mpsc::Sender<IndexUpdate>,
    policy: OverflowPolicy,
    dropped: u64,
}

/// Fan-out hub owning the subscriber set.
#[derive(Default)]
pub struct Notifier {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with a bounded queue of `capacity` updates.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> mpsc::Receiver<IndexUpdate> {
        let (sender, receiver) = mpsc::channel(capacity);
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .push(Subscriber {
                name: name.into(),
                sender,
                policy,
                dropped: 0,
            });
        receiver
    }

    pub fn block_update(&self, block: &Block) {
        self.publish(IndexUpdate::BlockUpdate(Arc::new(block.clone())));
    }

    pub fn tx_update(&self, tx: &Tx) {
        self.publish(IndexUpdate::TxUpdate(Arc::new(tx.clone())));
    }

    fn publish(&self, update: IndexUpdate) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock");
        subscribers.retain_mut(|sub| match sub.sender.try_send(update.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => match sub.policy {
                OverflowPolicy::DropUpdate => {
                    sub.dropped += 1;
                    warn!(subscriber = %sub.name, dropped = sub.dropped, "Subscriber queue full, update dropped");
                    true
                }
                OverflowPolicy::Disconnect => {
                    warn!(subscriber = %sub.name, "Subscriber queue full, disconnecting");
                    false
                }
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = %sub.name, "Subscriber gone, removing");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber lock").len()
    }

    /// Updates dropped so far for a named subscriber.
    pub fn dropped_count(&self, name: &str) -> Option<u64> {
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.dropped)
    }

    /// Drop every subscriber channel, letting receivers observe the end
    /// of the stream. Called on shutdown after the last commit.
    pub fn close(&self) {
        self.subscribers.lock().expect("subscriber lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stxindex_core::types::{TxPayload, TxStatus};

    fn block(height: u64) -> Block {
        Block {
            block_hash: vec![height as u8; 32],
            index_block_hash: vec![height as u8 + 100; 32],
            parent_index_block_hash: vec![height as u8 + 99; 32],
            parent_block_hash: vec![height as u8 - 1; 32],
            parent_microblock: vec![0; 32],
            block_height: height,
            burn_block_time: 1_700_000_000,
            canonical: true,
        }
    }

    fn tx(seed: u8) -> Tx {
        Tx {
            tx_id: vec![seed; 32],
            tx_index: seed as u32,
            index_block_hash: vec![101; 32],
            block_hash: vec![1; 32],
            block_height: 1,
            burn_block_time: 1_700_000_000,
            status: TxStatus::Success,
            canonical: true,
            post_conditions: vec![],
            fee_rate: 0,
            sender_address: "SP1".into(),
            sponsored: false,
            origin_hash_mode: 0,
            payload: TxPayload::Coinbase { payload: vec![0; 32] },
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe("ws", 16, OverflowPolicy::DropUpdate);

        notifier.block_update(&block(1));
        notifier.tx_update(&tx(0));
        notifier.tx_update(&tx(1));

        match rx.recv().await.unwrap() {
            IndexUpdate::BlockUpdate(b) => assert_eq!(b.block_height, 1),
            other => panic!("expected block first, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            IndexUpdate::TxUpdate(t) => assert_eq!(t.tx_index, 0),
            other => panic!("expected tx, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            IndexUpdate::TxUpdate(t) => assert_eq!(t.tx_index, 1),
            other => panic!("expected tx, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let notifier = Notifier::new();
        let _rx = notifier.subscribe("slow", 1, OverflowPolicy::DropUpdate);

        notifier.block_update(&block(1));
        notifier.block_update(&block(2));
        notifier.block_update(&block(3));

        assert_eq!(notifier.dropped_count("slow"), Some(2));
        assert_eq!(notifier.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn full_queue_disconnects_when_asked() {
        let notifier = Notifier::new();
        let _rx = notifier.subscribe("strict", 1, OverflowPolicy::Disconnect);

        notifier.block_update(&block(1));
        notifier.block_update(&block(2));

        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe("gone", 4, OverflowPolicy::DropUpdate);
        drop(rx);

        notifier.block_update(&block(1));
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_ends_the_stream() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe("ws", 4, OverflowPolicy::DropUpdate);
        notifier.block_update(&block(1));
        notifier.close();

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
