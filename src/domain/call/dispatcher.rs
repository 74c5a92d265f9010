//! Inbound routing glue
//!
//! Routes an inbound invite to the leg that already owns its dialog or
//! creates a new one, and originates the follow-up attempt when a leg is
//! referred. Everything else belongs to the legs themselves.

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::DialOptions;
use crate::domain::shared::error::{CallError, Result};
use crate::domain::shared::value_objects::TargetUri;
use crate::infrastructure::signaling::InboundInvite;

use super::entity::{CallLeg, CallLegDeps};
use super::event::CallEventKind;

pub struct Dispatcher {
    deps: CallLegDeps,
}

impl Dispatcher {
    pub fn new(deps: CallLegDeps) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &CallLegDeps {
        &self.deps
    }

    /// Route an inbound invite: an existing dialog gets its leg back, a
    /// new dialog gets a fresh leg (which emits the new-call event).
    pub fn handle_invite(&self, invite: InboundInvite) -> Arc<CallLeg> {
        if let Some(existing) = self.deps.registry.find_by_dialog(&invite.dialog_id) {
            debug!(leg = %existing.id(), "invite matched existing dialog");
            return existing;
        }
        CallLeg::inbound(self.deps.clone(), invite)
    }

    /// Originate the new attempt for a referred leg
    pub async fn originate_for(&self, peer: &Arc<CallLeg>, target: &str) -> Result<Arc<CallLeg>> {
        let target = TargetUri::parse(target)
            .ok_or_else(|| CallError::InvalidState("refer target missing user or host".into()))?;
        info!(peer = %peer.id(), target = %target, "originating referred call");
        peer.dial(target, DialOptions::default()).await
    }

    /// Watch the bus and originate attempts for referred legs as they
    /// appear
    pub fn spawn_refer_watcher(self: &Arc<Self>) {
        let dispatcher = self.clone();
        let mut events = self.deps.bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let CallEventKind::Referred { target } = &event.kind {
                    if let Err(e) = dispatcher.originate_for(&event.leg, target).await {
                        tracing::warn!(leg = %event.leg.id(), "referred originate failed: {}", e);
                    }
                }
            }
        });
    }
}
