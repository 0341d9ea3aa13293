//! Single-slot mailbox between the retrain worker and the ingestion loop
//!
//! Backed by a `tokio::sync::watch` channel: `put` overwrites whatever the
//! consumer has not taken yet, so the consumer only ever sees the freshest
//! snapshot. The slot holds an `Arc<ModelSnapshot>`, which keeps classifier
//! and query together.

use crate::types::{Generation, ModelSnapshot};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

type Slot = Option<Arc<ModelSnapshot>>;

/// Producer side, owned by the scheduler
#[derive(Debug)]
pub struct ClassifierHandoff {
    tx: watch::Sender<Slot>,
}

impl Default for ClassifierHandoff {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassifierHandoff {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Publish a snapshot, replacing any unconsumed one
    pub fn put(&self, snapshot: Arc<ModelSnapshot>) {
        debug!("Handoff: publishing {}", snapshot.generation);
        if let Some(stale) = self.tx.send_replace(Some(snapshot)) {
            debug!("Handoff: replaced {}", stale.generation);
        }
    }

    /// Most recently published snapshot, consumed or not
    pub fn latest(&self) -> Option<Arc<ModelSnapshot>> {
        self.tx.borrow().clone()
    }

    pub fn latest_generation(&self) -> Option<Generation> {
        self.tx.borrow().as_ref().map(|s| s.generation)
    }

    /// Consumer handle; a snapshot already in the slot counts as unconsumed
    pub fn subscribe(&self) -> HandoffReceiver {
        let mut rx = self.tx.subscribe();
        if rx.borrow().is_some() {
            rx.mark_changed();
        }
        HandoffReceiver { rx }
    }
}

/// Consumer side, owned by the ingestion loop
#[derive(Debug)]
pub struct HandoffReceiver {
    rx: watch::Receiver<Slot>,
}

impl HandoffReceiver {
    /// Take the pending snapshot without waiting
    ///
    /// Returns `None` when nothing new was published since the last take.
    pub fn try_take(&mut self) -> Option<Arc<ModelSnapshot>> {
        match self.rx.has_changed() {
            Ok(true) => self.rx.borrow_and_update().clone(),
            _ => None,
        }
    }

    /// Wait for the next snapshot; `None` once the producer is gone
    pub async fn changed(&mut self) -> Option<Arc<ModelSnapshot>> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(snapshot) = self.rx.borrow_and_update().clone() {
                return Some(snapshot);
            }
        }
    }
}
