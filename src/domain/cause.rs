//! Hangup cause table
//!
//! Fixed mapping between named teardown reasons and SIP status codes, plus
//! the reverse subset used to classify inbound failure responses.

use serde::{Deserialize, Serialize};

/// Named reason a call leg ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HangupReason {
    NormalClearing,
    UserBusy,
    NoAnswer,
    RequestTimeout,
    OriginatorCancel,
    CallRejected,
    UnallocatedNumber,
    IncompatibleDestination,
    PeerUnreachable,
    BlindTransfer,
    AttendedTransfer,
    ServerError,
    ServiceUnavailable,
    RequestTerminated,
}

impl HangupReason {
    /// Protocol status used when this reason has to be signaled as a
    /// rejection of a not-yet-established dialog.
    pub fn sip_status(&self) -> u16 {
        match self {
            HangupReason::NormalClearing => 603,
            HangupReason::UserBusy => 486,
            HangupReason::NoAnswer => 480,
            HangupReason::RequestTimeout => 408,
            HangupReason::OriginatorCancel => 487,
            HangupReason::CallRejected => 403,
            HangupReason::UnallocatedNumber => 404,
            HangupReason::IncompatibleDestination => 488,
            HangupReason::PeerUnreachable => 504,
            HangupReason::BlindTransfer => 302,
            HangupReason::AttendedTransfer => 302,
            HangupReason::ServerError => 500,
            HangupReason::ServiceUnavailable => 503,
            HangupReason::RequestTerminated => 487,
        }
    }

    /// Classify an inbound failure status. Statuses outside the reverse
    /// subset collapse to `RequestTerminated`.
    pub fn from_sip_status(status: u16) -> HangupReason {
        match status {
            403 => HangupReason::CallRejected,
            404 => HangupReason::UnallocatedNumber,
            408 => HangupReason::RequestTimeout,
            480 => HangupReason::NoAnswer,
            486 => HangupReason::UserBusy,
            487 => HangupReason::OriginatorCancel,
            488 | 606 => HangupReason::IncompatibleDestination,
            500 => HangupReason::ServerError,
            503 => HangupReason::ServiceUnavailable,
            504 => HangupReason::PeerUnreachable,
            603 => HangupReason::CallRejected,
            _ => HangupReason::RequestTerminated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HangupReason::NormalClearing => "normal-clearing",
            HangupReason::UserBusy => "user-busy",
            HangupReason::NoAnswer => "no-answer",
            HangupReason::RequestTimeout => "request-timeout",
            HangupReason::OriginatorCancel => "originator-cancel",
            HangupReason::CallRejected => "call-rejected",
            HangupReason::UnallocatedNumber => "unallocated-number",
            HangupReason::IncompatibleDestination => "incompatible-destination",
            HangupReason::PeerUnreachable => "peer-unreachable",
            HangupReason::BlindTransfer => "blind-transfer",
            HangupReason::AttendedTransfer => "attended-transfer",
            HangupReason::ServerError => "server-error",
            HangupReason::ServiceUnavailable => "service-unavailable",
            HangupReason::RequestTerminated => "request-terminated",
        }
    }
}

/// Which side initiated the teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CauseSource {
    /// This side
    Us,
    /// The far end
    Them,
}

impl CauseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CauseSource::Us => "us",
            CauseSource::Them => "them",
        }
    }
}

/// A leg's final teardown cause. Set exactly once, first writer wins; only
/// the source may be corrected once from a default to an authoritative
/// value (see `CallLeg::set_cause`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HangupCause {
    pub reason: HangupReason,
    pub sip_status: u16,
    pub source: CauseSource,
}

impl HangupCause {
    pub fn new(reason: HangupReason, source: CauseSource) -> Self {
        Self {
            reason,
            sip_status: reason.sip_status(),
            source,
        }
    }

    /// Build a cause from an inbound failure status, keeping the original
    /// status even when the reason classification is lossy.
    pub fn from_status(status: u16, source: CauseSource) -> Self {
        Self {
            reason: HangupReason::from_sip_status(status),
            sip_status: status,
            source,
        }
    }
}
