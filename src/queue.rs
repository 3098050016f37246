//! Bounded hand-off between the producers and the dispatcher.
//!
//! Every producer owns a [`RecordSender`] clone. The queue closes once the
//! last sender is dropped, so the consumer can only observe the end of the
//! stream after every producer has stopped pushing.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::record::PacketRecord;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("ingestion queue is closed")]
pub struct QueueClosed;

/// Capacity is clamped to at least one slot.
pub fn bounded(capacity: usize) -> (RecordSender, RecordReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RecordSender { inner: tx }, RecordReceiver { inner: rx })
}

#[derive(Debug, Clone)]
pub struct RecordSender {
    inner: mpsc::Sender<PacketRecord>,
}

impl RecordSender {
    /// Waits for a free slot when the queue is full.
    pub async fn push(&self, record: PacketRecord) -> Result<(), QueueClosed> {
        self.inner.send(record).await.map_err(|_| QueueClosed)
    }

    /// Blocking variant for producers on plain threads. Must not be called
    /// from inside the async runtime.
    pub fn blocking_push(&self, record: PacketRecord) -> Result<(), QueueClosed> {
        self.inner.blocking_send(record).map_err(|_| QueueClosed)
    }

    pub fn capacity(&self) -> usize {
        self.inner.max_capacity()
    }
}

#[derive(Debug)]
pub struct RecordReceiver {
    inner: mpsc::Receiver<PacketRecord>,
}

impl RecordReceiver {
    /// `None` once every sender is gone and the queue is drained.
    pub async fn pop(&mut self) -> Option<PacketRecord> {
        self.inner.recv().await
    }

    pub fn blocking_pop(&mut self) -> Option<PacketRecord> {
        self.inner.blocking_recv()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
