//! Bounded stage queues with an explicit overflow policy.

use std::sync::Arc;

use epiwatch_core::OverflowPolicy;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::metrics::PipelineMetrics;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("{0} queue full")]
    Overload(&'static str),

    #[error("{0} stage has stopped")]
    Closed(&'static str),
}

/// Sending half of a stage queue.
pub struct BoundedQueue<T> {
    stage: &'static str,
    tx: mpsc::Sender<T>,
    policy: OverflowPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage,
            tx: self.tx.clone(),
            policy: self.policy,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(
        stage: &'static str,
        capacity: usize,
        policy: OverflowPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                stage,
                tx,
                policy,
                metrics,
            },
            rx,
        )
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// Enqueue under the configured overflow policy. A drop counts one
    /// `OVERLOAD` event.
    pub async fn push(&self, item: T) -> Result<(), QueueError> {
        match self.policy {
            OverflowPolicy::Block => self.push_wait(item).await,
            OverflowPolicy::Drop => match self.tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    PipelineMetrics::incr(&self.metrics.overload);
                    warn!(code = "OVERLOAD", stage = self.stage, "queue full, item dropped");
                    Err(QueueError::Overload(self.stage))
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed(self.stage)),
            },
        }
    }

    /// Enqueue regardless of policy, waiting for room. For control
    /// messages that must not be lost.
    pub async fn push_wait(&self, item: T) -> Result<(), QueueError> {
        self.tx
            .send(item)
            .await
            .map_err(|_| QueueError::Closed(self.stage))
    }
}
