//! Stage tasks.
//!
//! Detect shards each own a disjoint slice of the baselines, so a bucket's
//! statistics have a single writer. Everything downstream of scoring runs on
//! one corroborate task, which serializes trigger evaluation and publishing.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use epiwatch_core::config::DetectionConfig;
use epiwatch_core::{BucketId, NormalizedSignal, WindowIndex, WindowSpec};
use epiwatch_detect::{
    AnomalyDetector, BaselineStore, BundleExport, BundleId, CorroborationEngine, Significance,
    ZScoreResult,
};
use epiwatch_trigger::{Transition, TransitionError, TriggerRegistry};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::metrics::PipelineMetrics;
use crate::publish::Publisher;
use crate::queue::{BoundedQueue, QueueError};

// ── Detect ──

pub(crate) enum DetectMsg {
    Observe {
        bucket: BucketId,
        signal: Arc<NormalizedSignal>,
    },
    Seed {
        bucket: BucketId,
        counts: Vec<u64>,
        open: WindowIndex,
        done: oneshot::Sender<()>,
    },
    Sweep {
        now: DateTime<Utc>,
        done: oneshot::Sender<()>,
    },
    Barrier(oneshot::Sender<()>),
}

pub(crate) struct DetectShard {
    id: usize,
    store: BaselineStore,
    detector: AnomalyDetector,
    detection: DetectionConfig,
    window: WindowSpec,
    downstream: BoundedQueue<CorroborateMsg>,
    metrics: Arc<PipelineMetrics>,
}

impl DetectShard {
    pub fn new(
        id: usize,
        detection: DetectionConfig,
        downstream: BoundedQueue<CorroborateMsg>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            id,
            store: BaselineStore::new(detection.horizon_windows, detection.min_baseline_samples),
            detector: AnomalyDetector::new(detection.variance_floor, detection.min_baseline_samples),
            window: detection.window(),
            detection,
            downstream,
            metrics,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<DetectMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                DetectMsg::Observe { bucket, signal } => self.observe(bucket, signal).await,
                DetectMsg::Seed {
                    bucket,
                    counts,
                    open,
                    done,
                } => {
                    self.store.seed(&bucket, &counts, open);
                    debug!(shard = self.id, %bucket, windows = counts.len(), "baseline seeded");
                    let _ = done.send(());
                }
                DetectMsg::Sweep { now, done } => {
                    self.sweep(now).await;
                    let _ = done.send(());
                }
                DetectMsg::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!(shard = self.id, buckets = self.store.len(), "detect shard stopped");
    }

    async fn observe(&mut self, bucket: BucketId, signal: Arc<NormalizedSignal>) {
        PipelineMetrics::incr(&self.metrics.observations);
        let index = self.window.index_of(signal.timestamp());
        self.close_windows(&bucket, index).await;

        let observed = self.store.record_background(&bucket, index);
        let score = self.score(&bucket, observed);
        let msg = CorroborateMsg::Scored {
            bucket,
            signal,
            score,
        };
        if let Err(QueueError::Closed(stage)) = self.downstream.push(msg).await {
            warn!(shard = self.id, stage, "downstream stopped, observation lost");
        }
    }

    /// Close every window of `bucket` before `now`, folding the quiet ones
    /// into the baseline and reporting each closure downstream.
    async fn close_windows(&mut self, bucket: &BucketId, now: WindowIndex) {
        for closed in self.store.advance(bucket, now) {
            let score = self.score(bucket, closed.count);
            // Anomalous windows stay out of the baseline so an outbreak does
            // not raise its own bar.
            let quiet = score
                .as_ref()
                .is_none_or(|s| s.significance == Significance::Background);
            if quiet {
                self.store.fold(bucket, closed.count);
            }
            PipelineMetrics::incr(&self.metrics.windows_closed);
            let msg = CorroborateMsg::WindowClosed {
                bucket: bucket.clone(),
                window: closed.index,
                score,
                at: self.window.end_of(closed.index),
            };
            if self.downstream.push_wait(msg).await.is_err() {
                warn!(shard = self.id, %bucket, "downstream stopped, window close lost");
                return;
            }
        }
    }

    fn score(&self, bucket: &BucketId, observed: u64) -> Option<ZScoreResult> {
        let thresholds = self.detection.thresholds_for(&bucket.disease);
        let result = self
            .store
            .get_baseline(bucket)
            .and_then(|baseline| self.detector.score(bucket, observed, &baseline, thresholds));
        match result {
            Ok(score) => Some(score),
            Err(e) => {
                PipelineMetrics::incr(&self.metrics.insufficient_baseline);
                debug!(code = %e.code(), %bucket, "{e}");
                None
            }
        }
    }

    async fn sweep(&mut self, now: DateTime<Utc>) {
        let index = self.window.index_of(now);
        let buckets: Vec<BucketId> = self.store.buckets().cloned().collect();
        for bucket in &buckets {
            self.close_windows(bucket, index).await;
        }
        let evicted = self.store.evict_idle(index);
        if evicted > 0 {
            debug!(shard = self.id, evicted, "evicted stale baselines");
        }
    }
}

// ── Corroborate / trigger / publish ──

pub(crate) enum CorroborateMsg {
    Scored {
        bucket: BucketId,
        signal: Arc<NormalizedSignal>,
        score: Option<ZScoreResult>,
    },
    WindowClosed {
        bucket: BucketId,
        window: WindowIndex,
        score: Option<ZScoreResult>,
        at: DateTime<Utc>,
    },
    Export {
        bundle: BundleId,
        at: DateTime<Utc>,
        reply: oneshot::Sender<Option<BundleExport>>,
    },
    Sweep {
        now: DateTime<Utc>,
        idle: Option<TimeDelta>,
        done: oneshot::Sender<()>,
    },
    Barrier(oneshot::Sender<()>),
}

pub(crate) struct CorroborateStage {
    pub engine: CorroborationEngine,
    pub registry: Arc<TriggerRegistry>,
    pub publisher: Publisher,
}

impl CorroborateStage {
    /// Runs until every sender is gone, then hands back the publisher so its
    /// outboxes can be drained.
    pub async fn run(mut self, mut rx: mpsc::Receiver<CorroborateMsg>) -> Publisher {
        while let Some(msg) = rx.recv().await {
            match msg {
                CorroborateMsg::Scored {
                    bucket,
                    signal,
                    score,
                } => {
                    let bundle = self.engine.bundle_for(&signal, &bucket.disease);
                    let result =
                        self.registry
                            .on_signal(&bucket, score.as_ref(), &bundle, signal.timestamp());
                    self.handle(result).await;
                }
                CorroborateMsg::WindowClosed {
                    bucket,
                    window,
                    score,
                    at,
                } => {
                    let result = self
                        .registry
                        .on_window_closed(&bucket, window, score.as_ref(), at);
                    self.handle(result).await;
                }
                CorroborateMsg::Export { bundle, at, reply } => {
                    let _ = reply.send(self.engine.export(bundle, at));
                }
                CorroborateMsg::Sweep { now, idle, done } => {
                    let bundles = self.engine.evict_expired(now);
                    let states = idle.map_or(0, |idle| self.registry.evict_idle(now, idle));
                    debug!(bundles, states, "corroborate sweep");
                    let _ = done.send(());
                }
                CorroborateMsg::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!(bundles = self.engine.len(), "corroborate stage stopped");
        self.publisher
    }

    async fn handle(&self, result: Result<Option<Transition>, TransitionError>) {
        match result {
            Ok(Some(transition)) => self.publisher.publish(&transition).await,
            Ok(None) => {}
            Err(e) => self.publisher.reject(&e),
        }
    }
}
