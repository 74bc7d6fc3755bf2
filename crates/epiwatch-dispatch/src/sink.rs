//! Alert sinks: where a subscriber's alerts end up.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::alert::Alert;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[cfg(feature = "http")]
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("subscriber returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("subscriber channel closed")]
    Closed,
}

/// A delivery target. `deliver` returning `Ok` is the acknowledgement; the
/// dispatcher retries anything else.
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError>;
}

#[async_trait::async_trait]
impl<S: AlertSink + ?Sized> AlertSink for Arc<S> {
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        (**self).deliver(alert).await
    }
}

/// Hands alerts to an in-process receiver.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl AlertSink for ChannelSink {
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        self.tx.send(alert.clone()).map_err(|_| DeliveryError::Closed)
    }
}

/// Writes each alert as a structured log event.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        info!(
            alert_id = %alert.alert_id,
            bucket = %alert.bucket_id,
            level = %alert.alert_level,
            bond = %alert.bond_status,
            jurisdiction = %alert.jurisdiction,
            citations = alert.citations.len(),
            "alert"
        );
        Ok(())
    }
}

/// Appends one JSON object per line.
pub struct JsonlSink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait::async_trait]
impl AlertSink for JsonlSink {
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        let mut line = serde_json::to_vec(alert)?;
        line.push(b'\n');
        let io = |source: std::io::Error| DeliveryError::Io {
            path: self.path.clone(),
            source,
        };

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io)?;
        file.write_all(&line).await.map_err(io)?;
        file.flush().await.map_err(io)?;
        Ok(())
    }
}

/// POSTs alerts as JSON to a subscriber endpoint.
#[cfg(feature = "http")]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

#[cfg(feature = "http")]
impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[cfg(feature = "http")]
#[async_trait::async_trait]
impl AlertSink for WebhookSink {
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        debug!(url = %self.url, alert_id = %alert.alert_id, "posting alert");
        let resp = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", &alert.idempotency_key)
            .json(alert)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Server {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Subscriber-side deduplication by idempotency key.
///
/// Redelivered alerts are acknowledged without reaching the inner sink, so
/// at-least-once delivery looks exactly-once to whatever sits behind it.
/// Only the most recent `capacity` keys are remembered. Redelivery happens
/// within a retry cycle, so an old key falling out is harmless.
pub struct DedupSink<S> {
    inner: S,
    capacity: usize,
    seen: Mutex<SeenKeys>,
}

#[derive(Default)]
struct SeenKeys {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenKeys {
    fn insert(&mut self, key: String, capacity: usize) {
        if !self.keys.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > capacity {
            if let Some(old) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
    }
}

/// Keys a [`DedupSink`] remembers unless told otherwise.
pub const DEDUP_CAPACITY: usize = 65_536;

impl<S> DedupSink<S> {
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, DEDUP_CAPACITY)
    }

    pub fn with_capacity(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            seen: Mutex::new(SeenKeys::default()),
        }
    }

    pub fn seen(&self) -> usize {
        self.seen.lock().keys.len()
    }
}

#[async_trait::async_trait]
impl<S: AlertSink> AlertSink for DedupSink<S> {
    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        if self.seen.lock().keys.contains(&alert.idempotency_key) {
            debug!(key = %alert.idempotency_key, "duplicate alert acknowledged");
            return Ok(());
        }
        self.inner.deliver(alert).await?;
        self.seen
            .lock()
            .insert(alert.idempotency_key.clone(), self.capacity);
        Ok(())
    }
}
