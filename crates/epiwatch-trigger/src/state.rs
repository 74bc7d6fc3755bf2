use std::fmt;

use chrono::{DateTime, Utc};
use epiwatch_core::{BucketId, WindowIndex};
use epiwatch_detect::BundleSnapshot;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Green,
    Watch,
    Alert,
    Red,
}

impl AlertLevel {
    /// One level lower; GREEN stays GREEN.
    pub fn step_down(self) -> Self {
        match self {
            Self::Red => Self::Alert,
            Self::Alert => Self::Watch,
            Self::Watch | Self::Green => Self::Green,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "GREEN",
            Self::Watch => "WATCH",
            Self::Alert => "ALERT",
            Self::Red => "RED",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bond lifecycle. Moves forward only, except for an episode reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BondStatus {
    Locked,
    Armed,
    PayoutReleased,
}

impl BondStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locked => "LOCKED",
            Self::Armed => "ARMED",
            Self::PayoutReleased => "PAYOUT_RELEASED",
        }
    }
}

impl fmt::Display for BondStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger state of one (geo-bucket, disease) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerState {
    pub bucket: BucketId,
    pub alert_level: AlertLevel,
    pub bond_status: BondStatus,
    pub last_transition_at: Option<DateTime<Utc>>,
    /// Bundle behind the most recent escalation.
    pub justifying_bundle: Option<BundleSnapshot>,
    /// z-score behind the most recent escalation.
    pub last_z: Option<f64>,
    /// Starts at 1; bumped on every reset.
    pub episode: u32,
    pub consecutive_green_windows: u32,
    /// Window whose close last stepped the level down.
    pub last_step_down: Option<WindowIndex>,
    pub last_activity: DateTime<Utc>,
}

impl TriggerState {
    pub fn new(bucket: BucketId, at: DateTime<Utc>) -> Self {
        Self {
            bucket,
            alert_level: AlertLevel::Green,
            bond_status: BondStatus::Locked,
            last_transition_at: None,
            justifying_bundle: None,
            last_z: None,
            episode: 1,
            consecutive_green_windows: 0,
            last_step_down: None,
            last_activity: at,
        }
    }

    /// Nothing an idle sweep would lose by dropping this state.
    pub fn is_dormant(&self) -> bool {
        self.alert_level == AlertLevel::Green && self.bond_status == BondStatus::Locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_order_and_step_down() {
        assert!(AlertLevel::Green < AlertLevel::Watch);
        assert!(AlertLevel::Alert < AlertLevel::Red);
        assert_eq!(AlertLevel::Red.step_down(), AlertLevel::Alert);
        assert_eq!(AlertLevel::Watch.step_down(), AlertLevel::Green);
        assert_eq!(AlertLevel::Green.step_down(), AlertLevel::Green);
    }

    #[test]
    fn wire_names() {
        assert_eq!(
            serde_json::to_string(&BondStatus::PayoutReleased).unwrap(),
            "\"PAYOUT_RELEASED\""
        );
        assert_eq!(serde_json::to_string(&AlertLevel::Red).unwrap(), "\"RED\"");
        assert_eq!(BondStatus::Armed.to_string(), "ARMED");
    }

    #[test]
    fn new_state_is_dormant() {
        let state = TriggerState::new(
            "r0c0:measles".parse().unwrap(),
            "2026-03-01T00:00:00Z".parse().unwrap(),
        );
        assert!(state.is_dormant());
        assert_eq!(state.episode, 1);
    }
}
