//! Trigger state machine and transition validator.
//!
//! Two kinds of evaluation drive a bucket:
//!
//! - **Signal**: runs on every scored signal. It may escalate, by several
//!   levels at once if the evidence supports it, but never de-escalates.
//! - **Window close**: runs once per closed observation window. A quiet
//!   window (not notable, or no usable baseline) steps the level down by
//!   exactly one. After enough consecutive quiet GREEN windows the bond is
//!   re-locked and a new episode begins.
//!
//! Every computed change goes through [`validate_transition`] before it is
//! applied. A violation is an `INVALID_TRANSITION` error and the state is
//! left untouched.

use chrono::{DateTime, TimeDelta, Utc};
use epiwatch_core::config::TriggerConfig;
use epiwatch_core::{BucketId, ErrorCode, WindowIndex};
use epiwatch_detect::{BundleSnapshot, Significance, ZScoreResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{AlertLevel, BondStatus, TriggerState};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("invalid transition for {bucket}: {reason}")]
    InvalidTransition { bucket: BucketId, reason: String },
}

impl TransitionError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidTransition
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    Signal,
    WindowClose,
    EpisodeReset,
}

/// An applied state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub cause: TransitionCause,
    pub previous_level: AlertLevel,
    pub previous_bond: BondStatus,
    /// State after the change.
    pub state: TriggerState,
    /// Closed window for window-driven changes.
    pub window: Option<WindowIndex>,
    /// z of the evaluation that made this change: the signal's window for
    /// escalations, the closed window for step-downs and resets. `None`
    /// without a usable baseline. `state.last_z` keeps the escalation's z.
    pub z_score: Option<f64>,
}

impl Transition {
    pub fn bucket(&self) -> &BucketId {
        &self.state.bucket
    }

    /// Strictly increasing per bucket.
    pub fn at(&self) -> DateTime<Utc> {
        self.state
            .last_transition_at
            .unwrap_or(self.state.last_activity)
    }

    pub fn is_escalation(&self) -> bool {
        self.state.alert_level > self.previous_level
    }

    pub fn payout_released(&self) -> bool {
        self.previous_bond != BondStatus::PayoutReleased
            && self.state.bond_status == BondStatus::PayoutReleased
    }
}

/// Check `from -> to` against the transition rules.
pub fn validate_transition(
    from: &TriggerState,
    to: &TriggerState,
    cause: TransitionCause,
    window: Option<WindowIndex>,
) -> Result<(), TransitionError> {
    let reject = |reason: String| {
        Err(TransitionError::InvalidTransition {
            bucket: from.bucket.clone(),
            reason,
        })
    };

    if from.bucket != to.bucket {
        return reject(format!("state moved to bucket {}", to.bucket));
    }
    if let (Some(prev), Some(next)) = (from.last_transition_at, to.last_transition_at)
        && next <= prev
    {
        return reject(format!("transition time {next} not after {prev}"));
    }

    let (a, b) = (from.alert_level, to.alert_level);
    match cause {
        TransitionCause::Signal => {
            if b < a {
                return reject(format!("signal evaluation de-escalated {a} -> {b}"));
            }
        }
        TransitionCause::WindowClose => {
            if b > a {
                return reject(format!("window close escalated {a} -> {b}"));
            }
            if b < a.step_down() {
                return reject(format!("{a} -> {b} steps down more than one level"));
            }
            if b < a {
                let Some(w) = window else {
                    return reject("step-down without a closed window".into());
                };
                if from.last_step_down.is_some_and(|last| w <= last) {
                    return reject(format!("window {} already stepped down", w.0));
                }
            }
            if to.bond_status != from.bond_status {
                return reject("window close changed the bond".into());
            }
        }
        TransitionCause::EpisodeReset => {
            if a != AlertLevel::Green || b != AlertLevel::Green {
                return reject(format!("episode reset outside GREEN ({a} -> {b})"));
            }
            if to.bond_status != BondStatus::Locked || to.episode != from.episode + 1 {
                return reject("episode reset must re-lock the bond and start the next episode".into());
            }
            return Ok(());
        }
    }

    let (x, y) = (from.bond_status, to.bond_status);
    if y < x {
        return reject(format!("bond moved backwards {x} -> {y}"));
    }
    if y != x {
        match y {
            BondStatus::Armed if b < AlertLevel::Alert => {
                return reject(format!("bond armed at {b}"));
            }
            BondStatus::PayoutReleased if x != BondStatus::Armed => {
                return reject(format!("payout released from {x}, not ARMED"));
            }
            BondStatus::PayoutReleased if b != AlertLevel::Red => {
                return reject(format!("payout released at {b}, not RED"));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Pure transition logic; owns no state.
#[derive(Debug, Clone)]
pub struct TriggerMachine {
    config: TriggerConfig,
}

impl TriggerMachine {
    pub fn new(config: TriggerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    /// Enough independent source classes with enough combined trust.
    pub fn corroborated(&self, bundle: &BundleSnapshot) -> bool {
        bundle.source_diversity >= self.config.min_sources
            && bundle.confidence >= self.config.alert_confidence
    }

    fn target_level(&self, significance: Significance, bundle: &BundleSnapshot) -> AlertLevel {
        let corroborated = self.corroborated(bundle);
        match significance {
            Significance::Background => AlertLevel::Green,
            Significance::Notable if corroborated => AlertLevel::Alert,
            Significance::TriggerEligible if corroborated => AlertLevel::Red,
            Significance::Notable | Significance::TriggerEligible => AlertLevel::Watch,
        }
    }

    /// Evaluate one scored signal and its bundle. `score` is `None` when the
    /// baseline was insufficient, which can never escalate.
    pub fn evaluate_signal(
        &self,
        state: &mut TriggerState,
        score: Option<&ZScoreResult>,
        bundle: &BundleSnapshot,
        at: DateTime<Utc>,
    ) -> Result<Option<Transition>, TransitionError> {
        state.last_activity = state.last_activity.max(at);
        let significance = score.map_or(Significance::Background, |s| s.significance);
        let target = self.target_level(significance, bundle);
        let level = state.alert_level.max(target);

        let bond = match state.bond_status {
            BondStatus::Locked if level >= AlertLevel::Alert => BondStatus::Armed,
            BondStatus::Armed
                if level == AlertLevel::Red
                    && significance == Significance::TriggerEligible
                    && bundle.confidence >= self.config.release_confidence =>
            {
                BondStatus::PayoutReleased
            }
            current => current,
        };

        if level == state.alert_level && bond == state.bond_status {
            // Fresh evidence for the level already held.
            if target == level && level > AlertLevel::Green {
                state.justifying_bundle = Some(bundle.clone());
                state.last_z = score.map(|s| s.z_score);
            }
            return Ok(None);
        }

        let mut next = state.clone();
        next.alert_level = level;
        next.bond_status = bond;
        next.justifying_bundle = Some(bundle.clone());
        next.last_z = score.map(|s| s.z_score);
        next.consecutive_green_windows = 0;
        next.last_transition_at = Some(next_stamp(state, at));
        let z = score.map(|s| s.z_score);
        self.apply(state, next, TransitionCause::Signal, None, z)
    }

    /// Evaluate a closed window. `score` is `None` when the baseline was
    /// insufficient, which counts as quiet.
    pub fn evaluate_window_close(
        &self,
        state: &mut TriggerState,
        window: WindowIndex,
        score: Option<&ZScoreResult>,
        at: DateTime<Utc>,
    ) -> Result<Option<Transition>, TransitionError> {
        state.last_activity = state.last_activity.max(at);
        let quiet = score.is_none_or(|s| !s.significance.is_notable());
        if !quiet {
            state.consecutive_green_windows = 0;
            return Ok(None);
        }

        if state.alert_level > AlertLevel::Green {
            if state.last_step_down.is_some_and(|last| window <= last) {
                return Ok(None);
            }
            let mut next = state.clone();
            next.alert_level = state.alert_level.step_down();
            next.last_step_down = Some(window);
            next.last_transition_at = Some(next_stamp(state, at));
            let z = score.map(|s| s.z_score);
            return self.apply(state, next, TransitionCause::WindowClose, Some(window), z);
        }

        state.consecutive_green_windows = state.consecutive_green_windows.saturating_add(1);
        let episode_open =
            state.bond_status != BondStatus::Locked || state.justifying_bundle.is_some();
        if state.consecutive_green_windows < self.config.reset_after_green_windows || !episode_open {
            return Ok(None);
        }

        let mut next = state.clone();
        next.bond_status = BondStatus::Locked;
        next.episode += 1;
        next.consecutive_green_windows = 0;
        next.justifying_bundle = None;
        next.last_z = None;
        next.last_transition_at = Some(next_stamp(state, at));
        let z = score.map(|s| s.z_score);
        self.apply(state, next, TransitionCause::EpisodeReset, Some(window), z)
    }

    fn apply(
        &self,
        state: &mut TriggerState,
        next: TriggerState,
        cause: TransitionCause,
        window: Option<WindowIndex>,
        z_score: Option<f64>,
    ) -> Result<Option<Transition>, TransitionError> {
        validate_transition(state, &next, cause, window)?;
        let transition = Transition {
            cause,
            previous_level: state.alert_level,
            previous_bond: state.bond_status,
            state: next.clone(),
            window,
            z_score,
        };
        *state = next;
        Ok(Some(transition))
    }
}

/// `at`, bumped past the previous transition so per-bucket stamps stay
/// strictly increasing (they key alert idempotency).
fn next_stamp(state: &TriggerState, at: DateTime<Utc>) -> DateTime<Utc> {
    match state.last_transition_at {
        Some(prev) if at <= prev => prev + TimeDelta::nanoseconds(1),
        _ => at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epiwatch_core::{DiseaseSignature, GeoPoint, SourceClass, Thresholds};
    use epiwatch_core::config::TrustWeights;
    use epiwatch_detect::{BundleId, bundle_confidence};

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn t0() -> DateTime<Utc> {
        ts("2026-03-01T08:00:00Z")
    }

    fn bucket() -> BucketId {
        "r-6c147:cholera".parse().unwrap()
    }

    fn state() -> TriggerState {
        TriggerState::new(bucket(), t0())
    }

    fn bundle(classes: &[SourceClass]) -> BundleSnapshot {
        BundleSnapshot {
            id: BundleId(1),
            disease: DiseaseSignature::new("cholera").unwrap(),
            source_classes: classes.iter().copied().collect(),
            source_diversity: classes.len(),
            confidence: bundle_confidence(classes, &TrustWeights::default()),
            signal_count: classes.len() as u64,
            centroid: GeoPoint::new(-1.29, 36.82),
            opened_at: t0(),
            last_seen_at: t0(),
            finalized: false,
        }
    }

    fn score(z: f64) -> ZScoreResult {
        ZScoreResult {
            disease: DiseaseSignature::new("cholera").unwrap(),
            z_score: z,
            observed: 10,
            mean: 4.0,
            stddev: 2.0,
            sample_size: 60,
            confidence: 0.8,
            significance: Significance::classify(z, Thresholds::default()),
        }
    }

    fn machine() -> TriggerMachine {
        TriggerMachine::new(TriggerConfig::default())
    }

    const CBS_EMR: [SourceClass; 2] = [SourceClass::Cbs, SourceClass::Emr];

    #[test]
    fn single_source_never_reaches_alert() {
        let m = machine();
        let mut s = state();
        for class in SourceClass::ALL {
            let t = m
                .evaluate_signal(&mut s, Some(&score(9.0)), &bundle(&[class]), t0())
                .unwrap();
            if let Some(t) = t {
                assert_eq!(t.state.alert_level, AlertLevel::Watch);
            }
        }
        assert_eq!(s.alert_level, AlertLevel::Watch);
        assert_eq!(s.bond_status, BondStatus::Locked);
    }

    #[test]
    fn single_voice_bundle_below_alert_threshold() {
        let voice = bundle(&[SourceClass::Voice]);
        assert!(voice.confidence < TriggerConfig::default().alert_confidence);
        assert!(!machine().corroborated(&voice));
    }

    #[test]
    fn corroborated_notable_arms_bond() {
        let m = machine();
        let mut s = state();
        let t = m
            .evaluate_signal(&mut s, Some(&score(2.0)), &bundle(&CBS_EMR), t0())
            .unwrap()
            .unwrap();
        assert_eq!(t.previous_level, AlertLevel::Green);
        assert_eq!(t.state.alert_level, AlertLevel::Alert);
        assert_eq!(t.state.bond_status, BondStatus::Armed);
        assert!(t.is_escalation());
        assert_eq!(s, t.state);
    }

    #[test]
    fn multi_level_jump_arms_but_does_not_release() {
        let m = machine();
        let mut s = state();
        let t = m
            .evaluate_signal(&mut s, Some(&score(4.0)), &bundle(&CBS_EMR), t0())
            .unwrap()
            .unwrap();
        assert_eq!(t.state.alert_level, AlertLevel::Red);
        assert_eq!(t.state.bond_status, BondStatus::Armed);
        assert!(!t.payout_released());
    }

    #[test]
    fn release_needs_prior_arm_and_release_confidence() {
        let m = machine();
        let mut s = state();
        m.evaluate_signal(&mut s, Some(&score(2.0)), &bundle(&CBS_EMR), t0())
            .unwrap();
        assert_eq!(s.bond_status, BondStatus::Armed);

        // Voice + CBS is corroborated (0.65) but below release grade (0.85).
        let weak = bundle(&[SourceClass::Voice, SourceClass::Cbs]);
        let t = m
            .evaluate_signal(&mut s, Some(&score(3.5)), &weak, t0() + TimeDelta::hours(1))
            .unwrap()
            .unwrap();
        assert_eq!(t.state.alert_level, AlertLevel::Red);
        assert_eq!(t.state.bond_status, BondStatus::Armed);

        let t = m
            .evaluate_signal(&mut s, Some(&score(3.5)), &bundle(&CBS_EMR), t0() + TimeDelta::hours(2))
            .unwrap()
            .unwrap();
        assert!(t.payout_released());
        assert_eq!(t.previous_level, AlertLevel::Red);
        assert_eq!(s.bond_status, BondStatus::PayoutReleased);
    }

    #[test]
    fn notable_z_never_releases() {
        let m = machine();
        let mut s = state();
        m.evaluate_signal(&mut s, Some(&score(3.0)), &bundle(&CBS_EMR), t0())
            .unwrap();
        assert_eq!(s.alert_level, AlertLevel::Red);
        // Still RED (levels never drop on signals) but z is only notable.
        let t = m
            .evaluate_signal(&mut s, Some(&score(2.0)), &bundle(&SourceClass::ALL), t0())
            .unwrap();
        assert!(t.is_none());
        assert_eq!(s.bond_status, BondStatus::Armed);
    }

    #[test]
    fn insufficient_baseline_cannot_escalate() {
        let m = machine();
        let mut s = state();
        let t = m
            .evaluate_signal(&mut s, None, &bundle(&SourceClass::ALL), t0())
            .unwrap();
        assert!(t.is_none());
        assert_eq!(s.alert_level, AlertLevel::Green);
    }

    #[test]
    fn signals_never_de_escalate() {
        let m = machine();
        let mut s = state();
        let zs = [2.0, 3.0, 0.0, 1.0, 2.2, -1.0, 5.0, 0.5];
        let mut prev = s.alert_level;
        for (i, z) in zs.into_iter().enumerate() {
            m.evaluate_signal(&mut s, Some(&score(z)), &bundle(&CBS_EMR), t0() + TimeDelta::minutes(i as i64))
                .unwrap();
            assert!(s.alert_level >= prev);
            prev = s.alert_level;
        }
        assert_eq!(s.alert_level, AlertLevel::Red);
    }

    #[test]
    fn quiet_windows_step_down_one_level_each() {
        let m = machine();
        let mut s = state();
        m.evaluate_signal(&mut s, Some(&score(4.0)), &bundle(&CBS_EMR), t0())
            .unwrap();

        let expected = [AlertLevel::Alert, AlertLevel::Watch, AlertLevel::Green];
        for (i, level) in expected.into_iter().enumerate() {
            let w = WindowIndex(100 + i as i64);
            let t = m
                .evaluate_window_close(&mut s, w, Some(&score(0.1)), t0() + TimeDelta::days(i as i64 + 1))
                .unwrap()
                .unwrap();
            assert_eq!(t.cause, TransitionCause::WindowClose);
            assert_eq!(t.state.alert_level, level);
            // The quiet window's z, while the state keeps the escalation's.
            assert_eq!(t.z_score, Some(0.1));
            assert_eq!(t.state.last_z, Some(4.0));

            // Same window again: no second step.
            let again = m
                .evaluate_window_close(&mut s, w, None, t0() + TimeDelta::days(i as i64 + 1))
                .unwrap();
            assert!(again.is_none());
        }
        assert_eq!(s.alert_level, AlertLevel::Green);
        assert_eq!(s.bond_status, BondStatus::Armed);
    }

    #[test]
    fn notable_window_holds_level() {
        let m = machine();
        let mut s = state();
        m.evaluate_signal(&mut s, Some(&score(2.0)), &bundle(&CBS_EMR), t0())
            .unwrap();
        let t = m
            .evaluate_window_close(&mut s, WindowIndex(1), Some(&score(2.1)), t0())
            .unwrap();
        assert!(t.is_none());
        assert_eq!(s.alert_level, AlertLevel::Alert);
    }

    #[test]
    fn green_streak_resets_episode() {
        let m = machine();
        let mut s = state();
        m.evaluate_signal(&mut s, Some(&score(2.0)), &bundle(&CBS_EMR), t0())
            .unwrap();
        // ALERT -> WATCH -> GREEN takes two windows, then seven green windows.
        let mut reset = None;
        for i in 0..9 {
            let at = t0() + TimeDelta::days(i + 1);
            if let Some(t) = m
                .evaluate_window_close(&mut s, WindowIndex(i), None, at)
                .unwrap()
                && t.cause == TransitionCause::EpisodeReset
            {
                reset = Some((i, t));
            }
        }
        let (i, t) = reset.expect("episode reset");
        assert_eq!(i, 8);
        assert_eq!(t.previous_bond, BondStatus::Armed);
        assert_eq!(t.state.bond_status, BondStatus::Locked);
        assert_eq!(t.state.episode, 2);
        assert!(s.is_dormant());
        assert!(s.justifying_bundle.is_none());
    }

    #[test]
    fn dormant_state_has_nothing_to_reset() {
        let m = machine();
        let mut s = state();
        for i in 0..20 {
            assert!(
                m.evaluate_window_close(&mut s, WindowIndex(i), None, t0())
                    .unwrap()
                    .is_none()
            );
        }
        assert_eq!(s.episode, 1);
    }

    #[test]
    fn transition_stamps_strictly_increase() {
        let m = machine();
        let mut s = state();
        let a = m
            .evaluate_signal(&mut s, Some(&score(2.0)), &bundle(&[SourceClass::Voice]), t0())
            .unwrap()
            .unwrap();
        let b = m
            .evaluate_signal(&mut s, Some(&score(2.0)), &bundle(&CBS_EMR), t0())
            .unwrap()
            .unwrap();
        assert_eq!(a.state.alert_level, AlertLevel::Watch);
        assert_eq!(b.state.alert_level, AlertLevel::Alert);
        assert!(b.at() > a.at());
        assert_eq!(b.at() - a.at(), TimeDelta::nanoseconds(1));
    }

    #[test]
    fn validator_rejects_illegal_changes() {
        let from = {
            let mut s = state();
            s.alert_level = AlertLevel::Red;
            s.bond_status = BondStatus::Armed;
            s
        };

        let mut down = from.clone();
        down.alert_level = AlertLevel::Alert;
        let err = validate_transition(&from, &down, TransitionCause::Signal, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransition);

        let mut two_steps = from.clone();
        two_steps.alert_level = AlertLevel::Watch;
        assert!(
            validate_transition(&from, &two_steps, TransitionCause::WindowClose, Some(WindowIndex(3)))
                .is_err()
        );

        let mut stepped = from.clone();
        stepped.last_step_down = Some(WindowIndex(3));
        let mut again = stepped.clone();
        again.alert_level = AlertLevel::Alert;
        assert!(
            validate_transition(&stepped, &again, TransitionCause::WindowClose, Some(WindowIndex(3)))
                .is_err()
        );

        let locked = state();
        let mut straight_to_payout = locked.clone();
        straight_to_payout.alert_level = AlertLevel::Red;
        straight_to_payout.bond_status = BondStatus::PayoutReleased;
        assert!(
            validate_transition(&locked, &straight_to_payout, TransitionCause::Signal, None).is_err()
        );

        let mut armed_alert = from.clone();
        armed_alert.alert_level = AlertLevel::Alert;
        let mut payout_at_alert = armed_alert.clone();
        payout_at_alert.bond_status = BondStatus::PayoutReleased;
        assert!(
            validate_transition(&armed_alert, &payout_at_alert, TransitionCause::Signal, None)
                .is_err()
        );

        let mut unlocked = from.clone();
        unlocked.bond_status = BondStatus::Locked;
        assert!(validate_transition(&from, &unlocked, TransitionCause::Signal, None).is_err());

        let mut stale = from.clone();
        stale.last_transition_at = Some(t0());
        let mut same_time = stale.clone();
        same_time.bond_status = BondStatus::PayoutReleased;
        assert!(
            validate_transition(&stale, &same_time, TransitionCause::Signal, None).is_err()
        );
    }
}
