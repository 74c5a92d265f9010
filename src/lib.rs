//! Trunkline - call-control core for a SIP telephony platform
//!
//! Owns the lifecycle of a signaling dialog from offer to teardown:
//! codec negotiation, leg bridging and transfer, and a multi-index
//! directory of live calls. The SIP transport and the media engine are
//! external collaborators injected behind traits.

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use config::{AnswerOptions, CallConfig, DialOptions, NegotiationMode};
pub use domain::call::{
    CallDirection, CallEvent, CallEventKind, CallLeg, CallLegDeps, CallRegistry, DerivedStatus,
    Dispatcher, EventBus, LegState,
};
pub use domain::cause::{CauseSource, HangupCause, HangupReason};
pub use domain::shared::error::{CallError, Result};
