//! Gated publishing of trigger transitions.
//!
//! Every transition is audited, then offered to each subscriber. The policy
//! gate judges the `ALERT_PUBLISH` per subscriber destination; a denial is
//! audited and counted, never retried.

use std::sync::Arc;

use epiwatch_core::{GeoGrid, GeoPoint, JurisdictionMap};
use epiwatch_dispatch::{
    Alert, AlertDispatcher, AuditEvent, AuditTrail, DeliveryReport, DispatchError,
};
use epiwatch_policy::{ActionPayload, ActionRequest, ActionType, Decision, PolicyGate};
use epiwatch_trigger::{Transition, TransitionError};
use serde_json::json;
use tracing::error;

use crate::metrics::PipelineMetrics;

/// Data category of an alert: counts and scores, no individual records.
pub const ALERT_DATA_TYPE: &str = "AGGREGATE";

pub struct Publisher {
    gate: Arc<PolicyGate>,
    dispatcher: AlertDispatcher,
    audit: Arc<AuditTrail>,
    jurisdictions: JurisdictionMap,
    grid: GeoGrid,
    metrics: Arc<PipelineMetrics>,
}

impl Publisher {
    pub fn new(
        gate: Arc<PolicyGate>,
        dispatcher: AlertDispatcher,
        audit: Arc<AuditTrail>,
        jurisdictions: JurisdictionMap,
        grid: GeoGrid,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            gate,
            dispatcher,
            audit,
            jurisdictions,
            grid,
            metrics,
        }
    }

    /// Jurisdiction governing a transition: where its bundle is centred, or
    /// the bucket's cell centre when it has none.
    pub fn jurisdiction_of(&self, transition: &Transition) -> String {
        let state = &transition.state;
        let point: GeoPoint = state
            .justifying_bundle
            .as_ref()
            .map(|b| b.centroid)
            .unwrap_or_else(|| self.grid.center(&state.bucket.cell));
        self.jurisdictions.resolve(&point).to_string()
    }

    pub async fn publish(&self, transition: &Transition) {
        PipelineMetrics::incr(&self.metrics.transitions);
        let bucket = transition.bucket().to_string();
        self.audit_event(
            AuditEvent::Transition,
            &bucket,
            json!({
                "cause": transition.cause,
                "from": transition.previous_level,
                "to": transition.state.alert_level,
                "bond_from": transition.previous_bond,
                "bond_to": transition.state.bond_status,
                "z_score": transition.z_score,
                "bundle": transition.state.justifying_bundle.as_ref().map(|b| b.id),
                "episode": transition.state.episode,
                "at": transition.at(),
            }),
        );

        let jurisdiction = self.jurisdiction_of(transition);
        for sub in self.dispatcher.subscriptions() {
            let request = ActionRequest::new(
                ActionType::alert_publish(),
                ActionPayload::new()
                    .with("data_type", ALERT_DATA_TYPE)
                    .with("destination", sub.destination.as_str())
                    .with("alert_level", transition.state.alert_level.as_str())
                    .with("disease", transition.bucket().disease.as_str()),
                jurisdiction.as_str(),
            );
            let citations = match self.gate.evaluate(&request) {
                Decision::Allow { citations } => citations,
                Decision::Deny { reason, citations } => {
                    PipelineMetrics::incr(&self.metrics.sovereignty_denials);
                    self.audit_event(
                        AuditEvent::PolicyDenied,
                        &sub.name,
                        json!({
                            "action": ActionType::ALERT_PUBLISH,
                            "bucket": bucket,
                            "destination": sub.destination,
                            "jurisdiction": jurisdiction,
                            "reason": reason,
                            "citations": citations,
                        }),
                    );
                    continue;
                }
            };

            let alert = Arc::new(Alert::from_transition(transition, jurisdiction.as_str(), citations));
            match self.dispatcher.publish(&sub.name, Arc::clone(&alert)).await {
                Ok(()) => {
                    PipelineMetrics::incr(&self.metrics.alerts_published);
                    self.audit_event(
                        AuditEvent::AlertDispatched,
                        &sub.name,
                        json!({
                            "alert_id": alert.alert_id,
                            "idempotency_key": alert.idempotency_key,
                            "level": alert.alert_level,
                        }),
                    );
                }
                Err(DispatchError::Overload { .. }) => {
                    PipelineMetrics::incr(&self.metrics.overload);
                    self.audit_event(
                        AuditEvent::Overload,
                        &sub.name,
                        json!({"stage": "dispatch", "alert_id": alert.alert_id}),
                    );
                }
                Err(e) => error!(subscriber = %sub.name, error = %e, "alert not queued"),
            }
        }
    }

    /// Record a transition the validator refused.
    pub fn reject(&self, err: &TransitionError) {
        PipelineMetrics::incr(&self.metrics.invalid_transitions);
        let TransitionError::InvalidTransition { bucket, reason } = err;
        self.audit_event(
            AuditEvent::TransitionRejected,
            &bucket.to_string(),
            json!({"code": err.code(), "reason": reason}),
        );
    }

    fn audit_event(&self, event: AuditEvent, resource: &str, detail: serde_json::Value) {
        if let Err(e) = self.audit.record(event, resource, detail) {
            error!(?event, resource, error = %e, "audit append failed");
        }
    }

    /// Drain the outboxes. Alerts no subscriber acknowledged are written to
    /// the audit trail whole, so nothing the gate allowed is silently lost.
    pub async fn shutdown(self) -> DeliveryReport {
        let Self {
            dispatcher, audit, ..
        } = self;
        let report = dispatcher.shutdown().await;
        for (subscriber, alert) in report.undelivered() {
            let event = AuditEvent::DeliveryPending;
            if let Err(e) = audit.record(event, subscriber, json!({"alert": alert.as_ref()})) {
                error!(?event, resource = subscriber, error = %e, "audit append failed");
            }
        }
        report
    }
}
