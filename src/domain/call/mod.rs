//! Call domain: leg state machine, directory, transfer, events

pub mod dispatcher;
pub mod dtmf;
pub mod entity;
pub mod event;
pub mod registry;
pub mod state;
pub mod timers;
pub mod transfer;

pub use dispatcher::Dispatcher;
pub use entity::{CallLeg, CallLegDeps, NegotiationPhase};
pub use event::{CallEvent, CallEventKind, EventBus};
pub use registry::{CallRegistry, DirectoryStats};
pub use state::{CallDirection, DerivedStatus, Epochs, LegState};
pub use transfer::ReplacesRef;
