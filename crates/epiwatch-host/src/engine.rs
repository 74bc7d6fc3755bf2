//! The running pipeline.
//!
//! ```text
//! ingest ─► normalize ─► detect shard (by bucket hash) ─► corroborate ─► trigger ─► publish
//!                          baselines + z-scores            bundles       registry    gate + outboxes
//! ```
//!
//! Every hop is a bounded queue. Control messages (seed, sweep, barrier,
//! export) always wait for room; observations follow the configured
//! overflow policy.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use epiwatch_core::{
    BucketId, DiseaseSignature, EngineConfig, GeoGrid, GeoPoint, IngestRecord, JurisdictionMap,
    NormalizedSignal, Normalizer, RawSignal, SignalId, WindowSpec,
};
use epiwatch_detect::{BundleExport, CorroborationEngine};
use epiwatch_dispatch::{
    AlertDispatcher, AlertSink, AuditEvent, AuditTrail, DeliveryReport, Subscription,
};
use epiwatch_policy::{ActionPayload, ActionRequest, ActionType, PolicyGate, RuleSet};
use epiwatch_trigger::{TriggerRegistry, TriggerState};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::HostError;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::publish::Publisher;
use crate::queue::BoundedQueue;
use crate::stages::{CorroborateMsg, CorroborateStage, DetectMsg, DetectShard};

const CORROBORATE: &str = "corroborate";
const DETECT: &str = "detect";

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub metrics: MetricsSnapshot,
    pub delivery: DeliveryReport,
}

pub struct Engine {
    config: EngineConfig,
    normalizer: Normalizer,
    grid: GeoGrid,
    window: WindowSpec,
    jurisdictions: JurisdictionMap,
    shards: Vec<BoundedQueue<DetectMsg>>,
    corroborate: BoundedQueue<CorroborateMsg>,
    registry: Arc<TriggerRegistry>,
    gate: Arc<PolicyGate>,
    audit: Arc<AuditTrail>,
    metrics: Arc<PipelineMetrics>,
    shard_tasks: Vec<JoinHandle<()>>,
    corroborate_task: JoinHandle<Publisher>,
}

impl Engine {
    /// Validate the config and spawn the stage tasks. Must be called within
    /// a tokio runtime.
    pub fn start(
        config: EngineConfig,
        gate: Arc<PolicyGate>,
        audit: Arc<AuditTrail>,
        subscribers: Vec<(Subscription, Arc<dyn AlertSink>)>,
    ) -> Result<Self, HostError> {
        config.validate()?;
        let metrics = Arc::new(PipelineMetrics::default());
        let pipeline = &config.pipeline;
        let grid = config.geo.grid();
        let jurisdictions = config.geo.jurisdiction_map();

        let mut dispatcher = AlertDispatcher::new(pipeline);
        for (subscription, sink) in subscribers {
            dispatcher.subscribe(subscription, sink);
        }
        let publisher = Publisher::new(
            Arc::clone(&gate),
            dispatcher,
            Arc::clone(&audit),
            jurisdictions.clone(),
            grid,
            Arc::clone(&metrics),
        );

        let registry = Arc::new(TriggerRegistry::new(config.trigger.clone()));
        let (corroborate, corroborate_rx) = BoundedQueue::new(
            CORROBORATE,
            pipeline.queue_capacity,
            pipeline.overflow,
            Arc::clone(&metrics),
        );
        let stage = CorroborateStage {
            engine: CorroborationEngine::new(config.corroboration.clone()),
            registry: Arc::clone(&registry),
            publisher,
        };
        let corroborate_task = tokio::spawn(stage.run(corroborate_rx));

        let shard_count = pipeline.detect_shards.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        let mut shard_tasks = Vec::with_capacity(shard_count);
        for id in 0..shard_count {
            let (queue, rx) = BoundedQueue::new(
                DETECT,
                pipeline.queue_capacity,
                pipeline.overflow,
                Arc::clone(&metrics),
            );
            let shard = DetectShard::new(
                id,
                config.detection.clone(),
                corroborate.clone(),
                Arc::clone(&metrics),
            );
            shard_tasks.push(tokio::spawn(shard.run(rx)));
            shards.push(queue);
        }

        info!(
            shards = shard_count,
            queue_capacity = pipeline.queue_capacity,
            overflow = ?pipeline.overflow,
            rules = %gate.current().version(),
            "engine started"
        );

        Ok(Self {
            window: config.detection.window(),
            grid,
            jurisdictions,
            config,
            normalizer: Normalizer::new(),
            shards,
            corroborate,
            registry,
            gate,
            audit,
            metrics,
            shard_tasks,
            corroborate_task,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bucket_of(&self, point: &GeoPoint, disease: DiseaseSignature) -> BucketId {
        BucketId::new(self.grid.cell_for(point), disease)
    }

    fn shard_for(&self, bucket: &BucketId) -> &BoundedQueue<DetectMsg> {
        let mut hasher = DefaultHasher::new();
        bucket.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    // ── Ingestion ──

    /// Normalize and route a structured signal. Malformed records are
    /// counted and rejected; nothing downstream sees them.
    pub async fn ingest(&self, record: IngestRecord) -> Result<SignalId, HostError> {
        PipelineMetrics::incr(&self.metrics.ingested);
        let normalized = self.normalizer.normalize_record(record);
        self.route(normalized).await
    }

    /// Normalize and route a raw adapter payload.
    pub async fn ingest_raw(&self, raw: RawSignal) -> Result<SignalId, HostError> {
        PipelineMetrics::incr(&self.metrics.ingested);
        let normalized = self.normalizer.normalize_raw(raw);
        self.route(normalized).await
    }

    async fn route(
        &self,
        normalized: Result<NormalizedSignal, epiwatch_core::MalformedInput>,
    ) -> Result<SignalId, HostError> {
        let signal = match normalized {
            Ok(signal) => Arc::new(signal),
            Err(e) => {
                PipelineMetrics::incr(&self.metrics.malformed);
                warn!(code = %e.code(), error = %e, "signal rejected");
                return Err(e.into());
            }
        };

        let cell = self.grid.cell_for(&signal.location());
        let min_confidence = self.config.detection.min_candidate_confidence;
        let mut result = Ok(signal.id());
        let mut routed = 0usize;
        for (disease, confidence) in signal.signatures() {
            if confidence < min_confidence {
                continue;
            }
            let bucket = BucketId::new(cell, disease);
            let msg = DetectMsg::Observe {
                bucket: bucket.clone(),
                signal: Arc::clone(&signal),
            };
            match self.shard_for(&bucket).push(msg).await {
                Ok(()) => routed += 1,
                Err(e) => result = Err(e.into()),
            }
        }
        if routed == 0 && result.is_ok() {
            debug!(signal = signal.id().0, "no candidate above the confidence floor");
        }
        result
    }

    /// Load historical window counts (oldest first) for `bucket`; `open` is
    /// any instant in the window that follows them.
    pub async fn seed_baseline(
        &self,
        bucket: BucketId,
        counts: Vec<u64>,
        open: DateTime<Utc>,
    ) -> Result<(), HostError> {
        let (done, rx) = oneshot::channel();
        let open = self.window.index_of(open);
        self.shard_for(&bucket)
            .push_wait(DetectMsg::Seed {
                bucket,
                counts,
                open,
                done,
            })
            .await?;
        rx.await.map_err(|_| stage_closed(DETECT))
    }

    // ── Control ──

    /// Wait until everything ingested so far has been evaluated and its
    /// alerts queued for delivery.
    pub async fn flush(&self) -> Result<(), HostError> {
        for shard in &self.shards {
            let (done, rx) = oneshot::channel();
            shard.push_wait(DetectMsg::Barrier(done)).await?;
            rx.await.map_err(|_| stage_closed(DETECT))?;
        }
        let (done, rx) = oneshot::channel();
        self.corroborate
            .push_wait(CorroborateMsg::Barrier(done))
            .await?;
        rx.await.map_err(|_| stage_closed(CORROBORATE))
    }

    /// Close every window that ended before `now` (quiet windows step
    /// alerts down), then evict expired bundles and, if configured, idle
    /// trigger states.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<(), HostError> {
        for shard in &self.shards {
            let (done, rx) = oneshot::channel();
            shard.push_wait(DetectMsg::Sweep { now, done }).await?;
            rx.await.map_err(|_| stage_closed(DETECT))?;
        }
        let (done, rx) = oneshot::channel();
        self.corroborate
            .push_wait(CorroborateMsg::Sweep {
                now,
                idle: self.config.buckets.idle_eviction(),
                done,
            })
            .await?;
        rx.await.map_err(|_| stage_closed(CORROBORATE))
    }

    /// Swap in a new rule set from disk. On error the current rules stay.
    pub fn reload_rules(&self, path: &Path) -> Result<Arc<RuleSet>, HostError> {
        self.gate.reload_from_path(path)?;
        let rules = self.gate.current();
        self.audit.record(
            AuditEvent::RulesReloaded,
            path.display().to_string(),
            json!({"version": rules.version(), "rules": rules.len()}),
        )?;
        Ok(rules)
    }

    // ── Queries ──

    pub fn current_state(&self, bucket: &BucketId) -> Option<TriggerState> {
        self.registry.current_state(bucket)
    }

    pub fn states(&self) -> Vec<TriggerState> {
        self.registry.states()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Hand the signals behind a bucket's justifying bundle to
    /// `destination`, if the policy gate allows moving `data_type` there.
    pub async fn request_transfer(
        &self,
        bucket: &BucketId,
        destination: &str,
        data_type: &str,
    ) -> Result<BundleExport, HostError> {
        let state = self
            .registry
            .current_state(bucket)
            .ok_or_else(|| HostError::UnknownBucket(bucket.clone()))?;
        let bundle = state
            .justifying_bundle
            .ok_or_else(|| HostError::NoBundle(bucket.clone()))?;
        let jurisdiction = self.jurisdictions.resolve(&bundle.centroid).to_string();
        let request = ActionRequest::new(
            ActionType::data_transfer(),
            ActionPayload::new()
                .with("data_type", data_type)
                .with("destination", destination)
                .with("disease", bucket.disease.as_str()),
            jurisdiction.as_str(),
        );

        let citations = match self.gate.authorize(&request) {
            Ok(citations) => citations,
            Err(e) => {
                PipelineMetrics::incr(&self.metrics.sovereignty_denials);
                self.audit.record(
                    AuditEvent::PolicyDenied,
                    bucket.to_string(),
                    json!({
                        "action": ActionType::DATA_TRANSFER,
                        "data_type": data_type,
                        "destination": destination,
                        "jurisdiction": jurisdiction,
                        "citations": e.citations(),
                    }),
                )?;
                return Err(e.into());
            }
        };

        let (reply, rx) = oneshot::channel();
        self.corroborate
            .push_wait(CorroborateMsg::Export {
                bundle: bundle.id,
                at: Utc::now(),
                reply,
            })
            .await?;
        let export = rx
            .await
            .map_err(|_| stage_closed(CORROBORATE))?
            .ok_or_else(|| HostError::BundleExpired(bucket.clone()))?;

        PipelineMetrics::incr(&self.metrics.transfers_authorized);
        self.audit.record(
            AuditEvent::TransferAuthorized,
            bucket.to_string(),
            json!({
                "bundle": export.snapshot.id,
                "signals": export.signals.len(),
                "data_type": data_type,
                "destination": destination,
                "jurisdiction": jurisdiction,
                "citations": citations,
            }),
        )?;
        info!(%bucket, bundle = %export.snapshot.id, destination, "transfer authorized");
        Ok(export)
    }

    /// Stop accepting input, drain every stage in order, and wait for the
    /// outboxes to finish delivery.
    pub async fn shutdown(self) -> ShutdownReport {
        let Self {
            shards,
            corroborate,
            shard_tasks,
            corroborate_task,
            metrics,
            ..
        } = self;

        drop(shards);
        for result in join_all(shard_tasks).await {
            if let Err(e) = result {
                error!(error = %e, "detect shard panicked");
            }
        }
        // Shards held the other senders; this is the last one.
        drop(corroborate);
        let delivery = match corroborate_task.await {
            Ok(publisher) => publisher.shutdown().await,
            Err(e) => {
                error!(error = %e, "corroborate stage panicked");
                DeliveryReport::default()
            }
        };

        let report = ShutdownReport {
            metrics: metrics.snapshot(),
            delivery,
        };
        info!(
            ingested = report.metrics.ingested,
            transitions = report.metrics.transitions,
            delivered = report.delivery.delivered(),
            failed = report.delivery.failed(),
            "engine stopped"
        );
        report
    }
}

fn stage_closed(stage: &str) -> HostError {
    HostError::StageClosed {
        stage: stage.to_string(),
    }
}
