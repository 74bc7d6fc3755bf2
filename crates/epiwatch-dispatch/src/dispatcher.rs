//! Alert dispatcher: one bounded outbox and one delivery task per
//! subscriber.
//!
//! Delivery is at-least-once. A task retries with exponential backoff, capped
//! at [`MAX_BACKOFF`], until its sink acknowledges, so a sink can see the same
//! alert more than once and should deduplicate by idempotency key (see
//! [`DedupSink`](crate::DedupSink)). Nothing is given up while the
//! dispatcher runs. On shutdown each task gets a bounded retry window, and
//! alerts still unacknowledged after it come back in the [`DeliveryReport`]
//! instead of vanishing. The dispatcher never touches trigger state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use epiwatch_core::config::PipelineConfig;
use epiwatch_core::{ErrorCode, OverflowPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alert::Alert;
use crate::sink::AlertSink;

const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Shortest retry window an outbox gets at shutdown.
const MIN_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown subscriber '{0}'")]
    UnknownSubscriber(String),

    #[error("outbox for '{subscriber}' is full")]
    Overload { subscriber: String },

    #[error("delivery task for '{subscriber}' has stopped")]
    Closed { subscriber: String },
}

impl DispatchError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Overload { .. } => Some(ErrorCode::Overload),
            _ => None,
        }
    }
}

/// A named subscriber and the destination its alerts travel to. The
/// destination is what the policy gate judges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub name: String,
    pub destination: String,
}

impl Subscription {
    pub fn new(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
        }
    }
}

#[derive(Debug, Default)]
struct DeliveryStats {
    delivered: AtomicU64,
    retries: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscriberReport {
    pub name: String,
    pub delivered: u64,
    pub retries: u64,
    /// Alerts still unacknowledged when the dispatcher stopped.
    pub failed: u64,
    pub dropped: u64,
    /// The unacknowledged alerts themselves, for redelivery.
    #[serde(skip)]
    pub undelivered: Vec<Arc<Alert>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub subscribers: Vec<SubscriberReport>,
}

impl DeliveryReport {
    pub fn delivered(&self) -> u64 {
        self.subscribers.iter().map(|s| s.delivered).sum()
    }

    pub fn failed(&self) -> u64 {
        self.subscribers.iter().map(|s| s.failed).sum()
    }

    /// Every unacknowledged alert, with the subscriber it was meant for.
    pub fn undelivered(&self) -> impl Iterator<Item = (&str, &Arc<Alert>)> {
        self.subscribers
            .iter()
            .flat_map(|s| s.undelivered.iter().map(move |a| (s.name.as_str(), a)))
    }
}

struct Outbox {
    subscription: Subscription,
    tx: mpsc::Sender<Arc<Alert>>,
    stats: Arc<DeliveryStats>,
    task: JoinHandle<Vec<Arc<Alert>>>,
}

impl Outbox {
    fn report(&self) -> SubscriberReport {
        SubscriberReport {
            name: self.subscription.name.clone(),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            undelivered: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Retry {
    escalate_after: u32,
    backoff: Duration,
}

impl Retry {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(10);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Time to sit out the first `escalate_after` failures.
    fn schedule(&self) -> Duration {
        (1..self.escalate_after).map(|a| self.delay(a)).sum()
    }
}

pub struct AlertDispatcher {
    capacity: usize,
    overflow: OverflowPolicy,
    retry: Retry,
    stop: watch::Sender<bool>,
    outboxes: Vec<Outbox>,
}

impl AlertDispatcher {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            capacity: config.queue_capacity.max(1),
            overflow: config.overflow,
            retry: Retry {
                escalate_after: config.delivery_escalate_after.max(1),
                backoff: Duration::from_millis(config.delivery_backoff_ms),
            },
            stop: watch::channel(false).0,
            outboxes: Vec::new(),
        }
    }

    /// Register a subscriber and start its delivery task. Must be called
    /// within a tokio runtime.
    pub fn subscribe(&mut self, subscription: Subscription, sink: Arc<dyn AlertSink>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let stats = Arc::new(DeliveryStats::default());
        let task = tokio::spawn(deliver_loop(
            subscription.name.clone(),
            rx,
            sink,
            Arc::clone(&stats),
            self.retry,
            self.stop.subscribe(),
        ));
        info!(subscriber = %subscription.name, destination = %subscription.destination, "subscriber registered");
        self.outboxes.push(Outbox {
            subscription,
            tx,
            stats,
            task,
        });
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.outboxes.iter().map(|o| &o.subscription)
    }

    /// Queue `alert` for one subscriber. With the drop policy a full outbox
    /// returns `Overload`; with the block policy this waits for room.
    pub async fn publish(&self, subscriber: &str, alert: Arc<Alert>) -> Result<(), DispatchError> {
        let outbox = self
            .outboxes
            .iter()
            .find(|o| o.subscription.name == subscriber)
            .ok_or_else(|| DispatchError::UnknownSubscriber(subscriber.to_string()))?;
        let closed = || DispatchError::Closed {
            subscriber: subscriber.to_string(),
        };

        match self.overflow {
            OverflowPolicy::Block => outbox.tx.send(alert).await.map_err(|_| closed()),
            OverflowPolicy::Drop => match outbox.tx.try_send(alert) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(alert)) => {
                    outbox.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        code = "OVERLOAD",
                        subscriber,
                        alert_id = %alert.alert_id,
                        "subscriber outbox full, alert dropped"
                    );
                    Err(DispatchError::Overload {
                        subscriber: subscriber.to_string(),
                    })
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(closed()),
            },
        }
    }

    pub fn report(&self) -> DeliveryReport {
        DeliveryReport {
            subscribers: self.outboxes.iter().map(Outbox::report).collect(),
        }
    }

    /// Close every outbox and wait for queued alerts to finish delivery.
    ///
    /// Tasks keep retrying for a grace window sized to the retry schedule.
    /// After that each unacknowledged alert gets one last attempt, and those
    /// that still fail are handed back in the report.
    pub async fn shutdown(self) -> DeliveryReport {
        let deadline = tokio::time::Instant::now() + self.retry.schedule().max(MIN_SHUTDOWN_GRACE);
        let mut pending = Vec::with_capacity(self.outboxes.len());
        for outbox in self.outboxes {
            // Dropping the sender ends the task once its queue drains.
            drop(outbox.tx);
            pending.push((outbox.subscription.name, outbox.stats, outbox.task));
        }
        let mut subscribers = Vec::with_capacity(pending.len());
        for (name, stats, mut task) in pending {
            let joined = match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(subscriber = %name, "delivery still retrying at shutdown");
                    self.stop.send_replace(true);
                    task.await
                }
            };
            let undelivered = joined.unwrap_or_else(|e| {
                error!(error = %e, "delivery task panicked");
                Vec::new()
            });
            subscribers.push(SubscriberReport {
                name,
                delivered: stats.delivered.load(Ordering::Relaxed),
                retries: stats.retries.load(Ordering::Relaxed),
                failed: stats.failed.load(Ordering::Relaxed),
                dropped: stats.dropped.load(Ordering::Relaxed),
                undelivered,
            });
        }
        DeliveryReport { subscribers }
    }
}

async fn deliver_loop(
    subscriber: String,
    mut rx: mpsc::Receiver<Arc<Alert>>,
    sink: Arc<dyn AlertSink>,
    stats: Arc<DeliveryStats>,
    retry: Retry,
    mut stop: watch::Receiver<bool>,
) -> Vec<Arc<Alert>> {
    let mut undelivered = Vec::new();
    while let Some(alert) = rx.recv().await {
        if !deliver(&subscriber, &alert, sink.as_ref(), &stats, retry, &mut stop).await {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            undelivered.push(alert);
        }
    }
    debug!(%subscriber, undelivered = undelivered.len(), "delivery task stopped");
    undelivered
}

/// Retry until acknowledged. Returns false only when shutdown cut the
/// retries short.
async fn deliver(
    subscriber: &str,
    alert: &Alert,
    sink: &dyn AlertSink,
    stats: &DeliveryStats,
    retry: Retry,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    let mut attempt = 1;
    loop {
        let e = match sink.deliver(alert).await {
            Ok(()) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(subscriber, alert_id = %alert.alert_id, attempt, "alert delivered");
                return true;
            }
            Err(e) => e,
        };
        if *stop.borrow() {
            error!(
                subscriber,
                alert_id = %alert.alert_id,
                attempts = attempt,
                error = %e,
                "alert undelivered at shutdown"
            );
            return false;
        }

        stats.retries.fetch_add(1, Ordering::Relaxed);
        let delay = retry.delay(attempt);
        if attempt == retry.escalate_after {
            error!(
                subscriber,
                alert_id = %alert.alert_id,
                attempt,
                error = %e,
                "alert delivery still failing, retrying"
            );
        } else {
            warn!(
                subscriber,
                alert_id = %alert.alert_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "alert delivery failed, retrying"
            );
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            // A dropped sender means the dispatcher is gone; treat as stop.
            changed = stop.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
        attempt = attempt.saturating_add(1);
    }
}
