//! Boundary between the node and the application it orders transactions for.
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::Transaction;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("The node no longer accepts transactions")]
    SubmitClosed,
    #[error("Application rejected the committed batch: {0}")]
    CommitRejected(String),
}

/// Application side of a node.
///
/// The node takes the submission stream once, when it starts running, and calls
/// [`AppProxy::commit_batch`] once for every consensus event, strictly in
/// consensus order. Events without transactions give empty batches.
/// `commit_batch` runs while the node state is locked, so implementations
/// must return promptly.
pub trait AppProxy: Send + Sync + 'static {
    /// Transactions submitted by the application. `None` once taken.
    fn take_submit_receiver(&self) -> Option<mpsc::UnboundedReceiver<Transaction>>;

    fn commit_batch(&self, batch: Vec<Transaction>) -> Result<(), ProxyError>;
}

/// Proxy living in the same process as the application, keeps everything that
/// was committed.
pub struct InmemAppProxy {
    submit_tx: mpsc::UnboundedSender<Transaction>,
    submit_rx: Mutex<Option<mpsc::UnboundedReceiver<Transaction>>>,
    committed: Mutex<Vec<Transaction>>,
    batches: AtomicUsize,
}

impl InmemAppProxy {
    pub fn new() -> Self {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        Self {
            submit_tx,
            submit_rx: Mutex::new(Some(submit_rx)),
            committed: Mutex::new(vec![]),
            batches: AtomicUsize::new(0),
        }
    }

    pub fn submit_tx(&self, tx: Transaction) -> Result<(), ProxyError> {
        self.submit_tx.send(tx).map_err(|_| ProxyError::SubmitClosed)
    }

    /// Committed transactions in consensus order
    pub fn committed_transactions(&self) -> Vec<Transaction> {
        self.committed.lock().clone()
    }

    /// Number of `commit_batch` calls, empty batches included
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::Relaxed)
    }
}

impl Default for InmemAppProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl AppProxy for InmemAppProxy {
    fn take_submit_receiver(&self) -> Option<mpsc::UnboundedReceiver<Transaction>> {
        self.submit_rx.lock().take()
    }

    fn commit_batch(&self, batch: Vec<Transaction>) -> Result<(), ProxyError> {
        debug!("Committing {} transactions", batch.len());
        self.committed.lock().extend(batch);
        self.batches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
