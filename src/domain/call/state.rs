//! Call leg state
//!
//! A leg's state is a set of independent facets rather than one exclusive
//! enum: a leg can be established and held at the same time. The derived
//! status collapses the facets into a protocol-style label for
//! observability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side originated this dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Independent state facets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegState {
    pub trying: bool,
    pub ringing: bool,
    pub established: bool,
    pub canceled: bool,
    pub destroyed: bool,
    pub held: bool,
    pub referred: bool,
}

impl LegState {
    pub fn derived_status(&self) -> DerivedStatus {
        if self.established {
            DerivedStatus::Confirmed
        } else if self.ringing {
            DerivedStatus::Early
        } else if self.trying {
            DerivedStatus::Proceeding
        } else if self.destroyed {
            DerivedStatus::Terminated
        } else {
            DerivedStatus::Trying
        }
    }

    pub fn is_live(&self) -> bool {
        !self.destroyed && !self.canceled
    }
}

/// Protocol-style status label derived from the facets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivedStatus {
    Confirmed,
    Early,
    Proceeding,
    Terminated,
    Trying,
}

impl DerivedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivedStatus::Confirmed => "confirmed",
            DerivedStatus::Early => "early",
            DerivedStatus::Proceeding => "proceeding",
            DerivedStatus::Terminated => "terminated",
            DerivedStatus::Trying => "trying",
        }
    }
}

/// Wall-clock lifecycle markers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epochs {
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Epochs {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
        }
    }

    /// Set once on the established transition
    pub fn mark_answered(&mut self) {
        if self.answered_at.is_none() {
            self.answered_at = Some(Utc::now());
        }
    }

    /// Set once on the first terminal transition
    pub fn mark_ended(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }

    /// Time from creation to answer
    pub fn setup_duration(&self) -> Option<chrono::Duration> {
        self.answered_at.map(|t| t - self.started_at)
    }

    /// Time from answer to end
    pub fn talk_time(&self) -> Option<chrono::Duration> {
        match (self.answered_at, self.ended_at) {
            (Some(answered), Some(ended)) => Some(ended - answered),
            _ => None,
        }
    }
}

impl Default for Epochs {
    fn default() -> Self {
        Self::new()
    }
}
