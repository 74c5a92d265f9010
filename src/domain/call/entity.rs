//! Call leg state machine
//!
//! One `CallLeg` per signaling dialog. A leg owns its media channel, its
//! negotiation state, its timers and its relational links to other legs;
//! the directory and the legs own themselves, parent/child pointers are
//! weak. All mutation happens behind short-lived sync locks that are
//! never held across a suspension point, and every resumption re-checks
//! the facets it depends on.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AnswerOptions, CallConfig, DialOptions, NegotiationMode};
use crate::domain::cause::{CauseSource, HangupCause, HangupReason};
use crate::domain::shared::error::{CallError, Result};
use crate::domain::shared::value_objects::{generate_tag, CallerIdentity, DialogId, TargetUri};
use crate::infrastructure::media::{
    ChannelId, MediaChannel, MediaEngine, MediaEvent, OpenChannelOptions,
};
use crate::infrastructure::sdp::{
    Codec, CodecNegotiator, MediaDirection, PayloadMap, SdpSession,
};
use crate::infrastructure::signaling::{
    AttemptHandle, CredentialSource, DialogEvent, DialogHandle, DialogSession, InDialogRequest,
    InboundInvite, InviteProgress, InviteRequest, SignalingError, SignalingPort,
};

use super::dtmf::DigitCollector;
use super::event::{CallEvent, CallEventKind, EventBus};
use super::registry::CallRegistry;
use super::state::{CallDirection, DerivedStatus, Epochs, LegState};
use super::timers::TimerSlot;

/// Where an outbound leg stands in the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationPhase {
    #[default]
    Idle,
    /// Early negotiation: local offer already sent, remote answer pending
    OfferSent,
    /// Late negotiation: waiting for the remote's offer
    AwaitingRemote,
    /// Final response received, codec/bridge resolution in progress
    Bridging,
}

pub(crate) struct SdpState {
    pub local: Option<SdpSession>,
    pub remote: Option<SdpSession>,
    pub selected: Option<Codec>,
    /// Narrowed preference list forwarded from a bridging child
    pub pref_override: Option<String>,
    pub phase: NegotiationPhase,
}

impl Default for SdpState {
    fn default() -> Self {
        Self {
            local: None,
            remote: None,
            selected: None,
            pref_override: None,
            phase: NegotiationPhase::Idle,
        }
    }
}

struct Links {
    parent: Weak<CallLeg>,
    children: Vec<Weak<CallLeg>>,
}

impl Default for Links {
    fn default() -> Self {
        Self {
            parent: Weak::new(),
            children: Vec::new(),
        }
    }
}

struct Shared {
    state: LegState,
    epochs: Epochs,
    dialog_id: DialogId,
    identity: Option<CallerIdentity>,
    cause: Option<HangupCause>,
    cause_source_corrected: bool,
    links: Links,
    sdp: SdpState,
    refer_target: Option<String>,
}

/// Injected collaborators and shared infrastructure
#[derive(Clone)]
pub struct CallLegDeps {
    pub config: Arc<CallConfig>,
    pub registry: Arc<CallRegistry>,
    pub signaling: Arc<dyn SignalingPort>,
    pub media: Arc<dyn MediaEngine>,
    pub bus: EventBus,
}

pub struct CallLeg {
    id: Uuid,
    direction: CallDirection,
    pub(crate) deps: CallLegDeps,
    shared: RwLock<Shared>,
    media_channel: Mutex<Option<Arc<dyn MediaChannel>>>,
    dialog: Mutex<Option<Arc<dyn DialogHandle>>>,
    attempt: Mutex<Option<Box<dyn AttemptHandle>>>,
    invite: Mutex<Option<Arc<InboundInvite>>>,
    digits: DigitCollector,
    vars: Mutex<HashMap<String, serde_json::Value>>,
    events_tx: broadcast::Sender<CallEvent>,
    no_answer_timer: TimerSlot,
    refresh_timer: TimerSlot,
    auth_generation: Mutex<u64>,
}

impl CallLeg {
    fn alloc(deps: CallLegDeps, direction: CallDirection, dialog_id: DialogId) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            id: Uuid::new_v4(),
            direction,
            deps,
            shared: RwLock::new(Shared {
                state: LegState::default(),
                epochs: Epochs::new(),
                dialog_id,
                identity: None,
                cause: None,
                cause_source_corrected: false,
                links: Links::default(),
                sdp: SdpState::default(),
                refer_target: None,
            }),
            media_channel: Mutex::new(None),
            dialog: Mutex::new(None),
            attempt: Mutex::new(None),
            invite: Mutex::new(None),
            digits: DigitCollector::new(),
            vars: Mutex::new(HashMap::new()),
            events_tx,
            no_answer_timer: TimerSlot::new(),
            refresh_timer: TimerSlot::new(),
            auth_generation: Mutex::new(0),
        })
    }

    /// Construct a leg for an inbound invite and index it
    pub fn inbound(deps: CallLegDeps, invite: InboundInvite) -> Arc<Self> {
        let remote = invite.offer.as_deref().and_then(SdpSession::parse);
        let leg = Self::alloc(deps, CallDirection::Inbound, invite.dialog_id.clone());
        {
            let mut shared = leg.shared.write().unwrap();
            shared.sdp.remote = remote;
        }
        *leg.invite.lock().unwrap() = Some(Arc::new(invite));
        leg.deps.registry.upsert(&leg);
        info!(leg = %leg.id, "inbound leg created");
        leg.emit(CallEventKind::New);
        leg
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> LegState {
        self.shared.read().unwrap().state
    }

    pub fn derived_status(&self) -> DerivedStatus {
        self.state().derived_status()
    }

    pub fn dialog_id(&self) -> DialogId {
        self.shared.read().unwrap().dialog_id.clone()
    }

    pub fn epochs(&self) -> Epochs {
        self.shared.read().unwrap().epochs.clone()
    }

    pub fn identity(&self) -> Option<CallerIdentity> {
        self.shared.read().unwrap().identity.clone()
    }

    pub fn cause(&self) -> Option<HangupCause> {
        self.shared.read().unwrap().cause
    }

    pub fn selected_codec(&self) -> Option<Codec> {
        self.shared.read().unwrap().sdp.selected.clone()
    }

    pub fn refer_target(&self) -> Option<String> {
        self.shared.read().unwrap().refer_target.clone()
    }

    pub fn parent(&self) -> Option<Arc<CallLeg>> {
        self.shared.read().unwrap().links.parent.upgrade()
    }

    pub fn children(&self) -> Vec<Arc<CallLeg>> {
        self.shared
            .read()
            .unwrap()
            .links
            .children
            .iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }

    /// The other leg of this bridge: the parent when linked upward, else
    /// the first live child
    pub fn peer(&self) -> Option<Arc<CallLeg>> {
        let (parent, children) = {
            let shared = self.shared.read().unwrap();
            (
                shared.links.parent.upgrade(),
                shared
                    .links
                    .children
                    .iter()
                    .filter_map(|w| w.upgrade())
                    .collect::<Vec<_>>(),
            )
        };
        if let Some(parent) = parent {
            if !parent.state().destroyed {
                return Some(parent);
            }
        }
        children.into_iter().find(|c| !c.state().destroyed)
    }

    pub fn has_live_children(&self) -> bool {
        self.children().iter().any(|c| !c.state().destroyed)
    }

    pub fn media_channel_id(&self) -> Option<ChannelId> {
        self.media_channel.lock().unwrap().as_ref().map(|c| c.id())
    }

    pub(crate) fn channel(&self) -> Option<Arc<dyn MediaChannel>> {
        self.media_channel.lock().unwrap().clone()
    }

    pub(crate) fn dialog_handle(&self) -> Option<Arc<dyn DialogHandle>> {
        self.dialog.lock().unwrap().clone()
    }

    pub(crate) fn remote_session(&self) -> Option<SdpSession> {
        self.shared.read().unwrap().sdp.remote.clone()
    }

    pub fn local_description(&self) -> Option<String> {
        self.shared
            .read()
            .unwrap()
            .sdp
            .local
            .as_ref()
            .map(|s| s.build())
    }

    pub(crate) fn set_local_session(&self, session: SdpSession) {
        self.shared.write().unwrap().sdp.local = Some(session);
    }

    pub(crate) fn set_selected_codec(&self, codec: Codec) {
        self.shared.write().unwrap().sdp.selected = Some(codec);
    }

    pub fn set_var(&self, key: impl Into<String>, value: serde_json::Value) {
        self.vars.lock().unwrap().insert(key.into(), value);
    }

    pub fn var(&self, key: &str) -> Option<serde_json::Value> {
        self.vars.lock().unwrap().get(key).cloned()
    }

    /// Per-leg event stream; events arrive in emission order
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events_tx.subscribe()
    }

    fn emit(self: &Arc<Self>, kind: CallEventKind) {
        let event = CallEvent::new(kind, self.clone());
        let _ = self.events_tx.send(event.clone());
        self.deps.bus.emit(event);
    }

    /// First writer wins. The source subfield alone may be corrected once
    /// from the default to an authoritative value; the reason never
    /// changes.
    pub fn record_cause(&self, cause: HangupCause) -> HangupCause {
        let mut shared = self.shared.write().unwrap();
        match shared.cause {
            None => {
                shared.cause = Some(cause);
                cause
            }
            Some(mut existing) => {
                if !shared.cause_source_corrected && existing.source != cause.source {
                    existing.source = cause.source;
                    shared.cause = Some(existing);
                    shared.cause_source_corrected = true;
                }
                shared.cause.unwrap_or(existing)
            }
        }
    }

    // ------------------------------------------------------------------
    // Linking
    // ------------------------------------------------------------------

    pub(crate) fn link_child(self: &Arc<Self>, child: &Arc<CallLeg>) {
        child.shared.write().unwrap().links.parent = Arc::downgrade(self);
        self.shared
            .write()
            .unwrap()
            .links
            .children
            .push(Arc::downgrade(child));
    }

    fn unlink_child(&self, child_id: Uuid) {
        self.shared
            .write()
            .unwrap()
            .links
            .children
            .retain(|w| w.upgrade().map(|c| c.id) != Some(child_id));
    }

    fn clear_parent(&self) {
        self.shared.write().unwrap().links.parent = Weak::new();
    }

    /// Sever the bridge linkage in both directions without affecting the
    /// liveness of either leg. Returns the former peer.
    pub fn detach(self: &Arc<Self>) -> Option<Arc<CallLeg>> {
        let peer = self.peer()?;
        {
            let mut shared = self.shared.write().unwrap();
            if shared.links.parent.upgrade().map(|p| p.id) == Some(peer.id) {
                shared.links.parent = Weak::new();
            }
            shared
                .links
                .children
                .retain(|w| w.upgrade().map(|c| c.id) != Some(peer.id));
        }
        {
            let mut shared = peer.shared.write().unwrap();
            if shared.links.parent.upgrade().map(|p| p.id) == Some(self.id) {
                shared.links.parent = Weak::new();
            }
            shared
                .links
                .children
                .retain(|w| w.upgrade().map(|c| c.id) != Some(self.id));
        }
        debug!(leg = %self.id, peer = %peer.id, "detached");
        Some(peer)
    }

    // ------------------------------------------------------------------
    // Ringing
    // ------------------------------------------------------------------

    /// Mark the leg ringing and propagate an equivalent ring upward to the
    /// parent, so a bridged leg's ring reaches the other side. Idempotent.
    pub fn ring(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let leg = self.clone();
        Box::pin(async move {
            {
                let mut shared = leg.shared.write().unwrap();
                if shared.state.ringing
                    || shared.state.established
                    || shared.state.destroyed
                {
                    return;
                }
                shared.state.ringing = true;
                shared.state.trying = false;
            }
            if leg.direction == CallDirection::Inbound {
                let invite = leg.invite.lock().unwrap().clone();
                if let Some(invite) = invite {
                    if let Err(e) = leg.deps.signaling.ring(&invite).await {
                        warn!(leg = %leg.id, "ringing signal failed: {}", e);
                    }
                }
            }
            leg.emit(CallEventKind::Ringing);
            if let Some(parent) = leg.parent() {
                parent.ring().await;
            }
        })
    }

    // ------------------------------------------------------------------
    // Answer
    // ------------------------------------------------------------------

    /// Answer an inbound leg: select a codec from the remote offer, open
    /// local media and complete the dialog. Negotiation failure leaves
    /// the leg untouched so the caller can retry or hang up.
    pub async fn answer(self: &Arc<Self>, options: AnswerOptions) -> Result<()> {
        let (mut remote, prefs) = {
            let shared = self.shared.read().unwrap();
            if shared.state.destroyed {
                return Err(CallError::InvalidState("leg is destroyed".into()));
            }
            if shared.state.canceled {
                return Err(CallError::InvalidState("leg was canceled".into()));
            }
            if shared.state.established {
                return Err(CallError::InvalidState("leg already established".into()));
            }
            let remote = shared
                .sdp
                .remote
                .clone()
                .ok_or_else(|| CallError::Negotiation("no remote offer".into()))?;
            let prefs = options
                .codec_prefs(shared.sdp.pref_override.as_deref(), &self.deps.config)
                .to_string();
            (remote, prefs)
        };
        let invite = self
            .invite
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CallError::InvalidState("no pending invite".into()))?;

        if remote.audio().is_none() {
            return Err(CallError::Negotiation("offer carries no audio media".into()));
        }
        let negotiator = CodecNegotiator::new();
        let matched = negotiator
            .intersection(&mut remote, &prefs, true)
            .ok_or_else(|| CallError::Negotiation("no compatible codec".into()))?;
        let selected = matched[0].clone();
        info!(leg = %self.id, codec = %selected.name, "answering");

        let (channel, media_events) = self
            .deps
            .media
            .open_channel(OpenChannelOptions {
                remote: remote.remote_endpoint(),
                payload_type: Some(selected.payload_type),
            })
            .await?;
        let channel: Arc<dyn MediaChannel> = channel.into();

        // Negotiation suspended us; the leg may have ended meanwhile
        if self.state().destroyed || self.state().canceled {
            channel.close().await;
            return Err(CallError::InvalidState("leg ended during negotiation".into()));
        }

        let dtmf_payload = options.dtmf_enabled(&self.deps.config).then(|| {
            remote
                .payloads()
                .payload_type("telephone-event")
                .unwrap_or(self.deps.config.dtmf.payload_type)
        });
        let local_addr = channel.local_addr();
        let local = SdpSession::audio_session(
            &local_addr.ip().to_string(),
            local_addr.port(),
            std::slice::from_ref(&selected),
            dtmf_payload,
            MediaDirection::SendRecv,
        );
        let local_tag = self
            .dialog_id()
            .local_tag
            .unwrap_or_else(generate_tag);

        let session = match self
            .deps
            .signaling
            .accept(&invite, local.build(), local_tag)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                channel.close().await;
                return Err(e.into());
            }
        };

        {
            let mut shared = self.shared.write().unwrap();
            shared.dialog_id.local_tag = Some(session.local_tag.clone());
            if shared.dialog_id.remote_tag.is_none() {
                shared.dialog_id.remote_tag = Some(session.remote_tag.clone());
            }
            shared.sdp.remote = Some(remote);
            shared.sdp.local = Some(local);
            shared.sdp.selected = Some(selected);
        }
        *self.media_channel.lock().unwrap() = Some(channel);
        *self.dialog.lock().unwrap() = Some(session.handle.clone());
        self.deps.registry.upsert(self);
        self.spawn_dialog_pump(session.events);
        self.spawn_media_pump(media_events);
        self.mark_established().await;
        Ok(())
    }

    /// Irreversible established transition: answered-at marker, session
    /// refresh, answered notification, and media mix with the peer when
    /// one exists.
    async fn mark_established(self: &Arc<Self>) {
        {
            let mut shared = self.shared.write().unwrap();
            if shared.state.established || shared.state.destroyed {
                return;
            }
            shared.state.established = true;
            shared.state.trying = false;
            shared.state.ringing = false;
            shared.epochs.mark_answered();
        }
        info!(leg = %self.id, "established");
        self.start_session_refresh();
        self.emit(CallEventKind::Answered);
        if let Some(peer) = self.peer() {
            self.mix_with(&peer).await;
        }
    }

    pub(crate) async fn mix_with(&self, peer: &Arc<CallLeg>) {
        if let (Some(a), Some(b)) = (self.media_channel_id(), peer.media_channel_id()) {
            if let Err(e) = self.deps.media.mix(a, b).await {
                warn!(leg = %self.id, "mix failed: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound legs
    // ------------------------------------------------------------------

    /// Create an outbound child leg toward `target` and start the invite.
    /// The child is linked to this leg as its parent and armed with a
    /// no-answer timeout.
    pub async fn dial(
        self: &Arc<Self>,
        target: TargetUri,
        options: DialOptions,
    ) -> Result<Arc<CallLeg>> {
        if self.state().destroyed {
            return Err(CallError::InvalidState("parent is destroyed".into()));
        }
        let config = self.deps.config.clone();
        let call_id = Uuid::new_v4().to_string();
        let local_tag = generate_tag();
        let child = Self::alloc(
            self.deps.clone(),
            CallDirection::Outbound,
            DialogId::with_tags(call_id.clone(), Some(local_tag.clone()), None),
        );
        child.shared.write().unwrap().state.trying = true;
        self.link_child(&child);
        self.deps.registry.upsert(&child);
        info!(leg = %child.id, target = %target, "outbound leg created");
        child.emit(CallEventKind::New);

        let timeout = options.no_answer_timeout(&config);
        let weak = Arc::downgrade(&child);
        child.no_answer_timer.arm(timeout, async move {
            let Some(leg) = weak.upgrade() else { return };
            // The timer can lose the race against an answer
            if leg.state().established || leg.state().destroyed {
                return;
            }
            warn!(leg = %leg.id, "no answer within timeout");
            leg.hangup(HangupCause::new(
                HangupReason::RequestTimeout,
                CauseSource::Us,
            ))
            .await;
        });

        let prefs = options.codec_prefs(&config).to_string();
        let offer = match options.negotiation(&config) {
            NegotiationMode::Early => match self.open_child_media(&child, &prefs, &config).await {
                Ok(offer) => Some(offer),
                Err(e) => {
                    child
                        .hangup(HangupCause::new(HangupReason::ServerError, CauseSource::Us))
                        .await;
                    return Err(e);
                }
            },
            NegotiationMode::Late => {
                child.shared.write().unwrap().sdp.phase = NegotiationPhase::AwaitingRemote;
                None
            }
        };

        let request = InviteRequest {
            target,
            from: self.identity(),
            call_id,
            local_tag,
            offer,
        };
        let (progress, attempt) = match self.deps.signaling.start_invite(request).await {
            Ok(pair) => pair,
            Err(SignalingError::Rejected(status)) => {
                child
                    .hangup(HangupCause::from_status(status, CauseSource::Them))
                    .await;
                return Err(CallError::PeerFailure(status));
            }
            Err(e) => {
                child
                    .hangup(HangupCause::new(HangupReason::ServerError, CauseSource::Us))
                    .await;
                return Err(e.into());
            }
        };
        *child.attempt.lock().unwrap() = Some(attempt);
        child.spawn_invite_driver(progress, prefs);
        Ok(child)
    }

    /// Early negotiation: open the child's media channel and build the
    /// local offer before the remote answer is known
    async fn open_child_media(
        &self,
        child: &Arc<CallLeg>,
        prefs: &str,
        config: &CallConfig,
    ) -> Result<String> {
        let (channel, media_events) = self
            .deps
            .media
            .open_channel(OpenChannelOptions::default())
            .await?;
        let channel: Arc<dyn MediaChannel> = channel.into();
        let addr = channel.local_addr();
        *child.media_channel.lock().unwrap() = Some(channel);
        child.spawn_media_pump(media_events);

        let codecs = preferred_codecs(prefs);
        let dtmf_payload = config.dtmf.enabled.then_some(config.dtmf.payload_type);
        let local = SdpSession::audio_session(
            &addr.ip().to_string(),
            addr.port(),
            &codecs,
            dtmf_payload,
            MediaDirection::SendRecv,
        );
        let text = local.build();
        {
            let mut shared = child.shared.write().unwrap();
            shared.sdp.local = Some(local);
            shared.sdp.phase = NegotiationPhase::OfferSent;
        }
        Ok(text)
    }

    fn spawn_invite_driver(
        self: &Arc<Self>,
        mut progress: mpsc::Receiver<InviteProgress>,
        prefs: String,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = progress.recv().await {
                let Some(leg) = weak.upgrade() else { break };
                if leg.state().destroyed {
                    break;
                }
                match event {
                    InviteProgress::Ringing => leg.ring().await,
                    InviteProgress::EarlyMedia { sdp } => {
                        if let Some(session) = SdpSession::parse(&sdp) {
                            leg.shared.write().unwrap().sdp.remote = Some(session);
                        }
                        leg.ring().await;
                    }
                    InviteProgress::Answered {
                        dialog,
                        sdp,
                        answer,
                    } => {
                        leg.on_answered(dialog, sdp, answer, &prefs).await;
                        break;
                    }
                    InviteProgress::Failed { status } => {
                        leg.on_invite_failed(status).await;
                        break;
                    }
                }
            }
        });
    }

    /// Final positive response on an outbound leg
    async fn on_answered(
        self: &Arc<Self>,
        dialog: DialogSession,
        sdp: String,
        answer: Option<oneshot::Sender<String>>,
        prefs: &str,
    ) {
        self.no_answer_timer.cancel();
        if self.state().destroyed || self.state().canceled {
            // Lost the race against a concurrent teardown
            let _ = dialog.handle.hangup().await;
            return;
        }
        let Some(mut remote) = SdpSession::parse(&sdp) else {
            warn!(leg = %self.id, "unparseable remote description");
            let _ = dialog.handle.hangup().await;
            self.hangup(HangupCause::new(
                HangupReason::IncompatibleDestination,
                CauseSource::Us,
            ))
            .await;
            return;
        };
        self.shared.write().unwrap().sdp.phase = NegotiationPhase::Bridging;

        let parent = self.parent();
        let parent_established = parent
            .as_ref()
            .map(|p| p.state().established)
            .unwrap_or(false);

        // A bridge with an established side is restricted to the codec
        // class that side already selected; disjoint sets reject rather
        // than run mismatched codecs on the two legs.
        let effective_prefs = if parent_established {
            match parent.as_ref().and_then(|p| p.selected_codec()) {
                Some(codec) => codec.name,
                None => prefs.to_string(),
            }
        } else {
            prefs.to_string()
        };

        let negotiator = CodecNegotiator::new();
        let Some(matched) = negotiator.intersection(&mut remote, &effective_prefs, true) else {
            warn!(leg = %self.id, "no codec overlap with remote answer");
            let _ = dialog.handle.hangup().await;
            self.hangup(HangupCause::new(
                HangupReason::IncompatibleDestination,
                CauseSource::Us,
            ))
            .await;
            return;
        };
        let selected = matched[0].clone();

        // Late negotiation opens the channel only now
        if self.channel().is_none() {
            match self
                .deps
                .media
                .open_channel(OpenChannelOptions {
                    remote: remote.remote_endpoint(),
                    payload_type: Some(selected.payload_type),
                })
                .await
            {
                Ok((channel, events)) => {
                    let channel: Arc<dyn MediaChannel> = channel.into();
                    *self.media_channel.lock().unwrap() = Some(channel);
                    self.spawn_media_pump(events);
                }
                Err(e) => {
                    warn!(leg = %self.id, "media open failed: {}", e);
                    let _ = dialog.handle.hangup().await;
                    self.hangup(HangupCause::new(
                        HangupReason::ServerError,
                        CauseSource::Us,
                    ))
                    .await;
                    return;
                }
            }
        }
        if let (Some(channel), Some(endpoint)) = (self.channel(), remote.remote_endpoint()) {
            if let Err(e) = channel.set_remote(endpoint, selected.payload_type).await {
                warn!(leg = %self.id, "set remote failed: {}", e);
            }
        }
        // Complete the handshake when the remote is still waiting for our
        // answer
        if let Some(answer_tx) = answer {
            if let Some(channel) = self.channel() {
                let addr = channel.local_addr();
                let dtmf_payload = self.deps.config.dtmf.enabled.then(|| {
                    remote
                        .payloads()
                        .payload_type("telephone-event")
                        .unwrap_or(self.deps.config.dtmf.payload_type)
                });
                let local = SdpSession::audio_session(
                    &addr.ip().to_string(),
                    addr.port(),
                    std::slice::from_ref(&selected),
                    dtmf_payload,
                    MediaDirection::SendRecv,
                );
                let _ = answer_tx.send(local.build());
                self.shared.write().unwrap().sdp.local = Some(local);
            }
        }

        {
            let mut shared = self.shared.write().unwrap();
            shared.dialog_id.remote_tag = Some(dialog.remote_tag.clone());
            shared.sdp.remote = Some(remote);
            shared.sdp.selected = Some(selected);
            shared.sdp.phase = NegotiationPhase::Idle;
        }
        *self.dialog.lock().unwrap() = Some(dialog.handle.clone());
        self.attempt.lock().unwrap().take();
        self.deps.registry.upsert(self);
        self.spawn_dialog_pump(dialog.events);

        if !parent_established {
            // Forward the narrowed preference list to the parent's answer
            // path before attaching
            if let Some(parent) = &parent {
                let names: Vec<String> = matched.iter().map(|c| c.name.clone()).collect();
                parent.shared.write().unwrap().sdp.pref_override = Some(names.join(" "));
            }
        }
        self.mark_established().await;
    }

    /// Final failure response on an outbound leg: tear down this leg
    /// only, unless the parent has no other live child
    async fn on_invite_failed(self: &Arc<Self>, status: u16) {
        self.no_answer_timer.cancel();
        if self.state().destroyed {
            return;
        }
        let cause = HangupCause::from_status(status, CauseSource::Them);
        info!(leg = %self.id, status, reason = cause.reason.as_str(), "outbound attempt failed");
        let parent = self.parent();
        self.hangup(cause).await;
        if let Some(parent) = parent {
            if !parent.state().destroyed && !parent.has_live_children() {
                parent.hangup(cause).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Hold / unhold
    // ------------------------------------------------------------------

    /// Renegotiation offer from the far end; detect hold/unhold and
    /// answer with the current local description
    pub(crate) async fn handle_reoffer(self: &Arc<Self>, sdp: &str) -> Option<String> {
        let offer = SdpSession::parse(sdp)?;
        let held = self.state().held;
        if offer.is_hold_request() && !held {
            self.hold().await;
        } else if !offer.is_hold_request() && held {
            self.unhold().await;
        } else {
            // Repeated identical offer; answer without changing anything
            debug!(leg = %self.id, "re-offer with no direction change");
        }
        self.shared.write().unwrap().sdp.remote = Some(offer);
        self.local_description()
    }

    /// Hold: local media goes inactive, the peer is unmixed and
    /// optionally given hold music. Only meaningful while established;
    /// idempotent.
    pub async fn hold(self: &Arc<Self>) {
        {
            let mut shared = self.shared.write().unwrap();
            if !shared.state.established || shared.state.held || shared.state.destroyed {
                return;
            }
            shared.state.held = true;
            if let Some(local) = shared.sdp.local.as_mut() {
                local.set_direction(MediaDirection::Inactive);
            }
        }
        if let Some(channel) = self.channel() {
            if let Err(e) = channel.set_direction(MediaDirection::Inactive).await {
                warn!(leg = %self.id, "hold direction failed: {}", e);
            }
        }
        if let Some(id) = self.media_channel_id() {
            let _ = self.deps.media.unmix(id).await;
        }
        if let Some(prompt) = self.deps.config.hold_music.clone() {
            if let Some(peer) = self.peer() {
                if let Some(peer_channel) = peer.channel() {
                    let _ = peer_channel.play(&prompt).await;
                }
            }
        }
        info!(leg = %self.id, "held");
        self.emit(CallEventKind::Hold);
    }

    /// Restore bidirectional media and remix with the peer. Idempotent.
    pub async fn unhold(self: &Arc<Self>) {
        {
            let mut shared = self.shared.write().unwrap();
            if !shared.state.established || !shared.state.held || shared.state.destroyed {
                return;
            }
            shared.state.held = false;
            if let Some(local) = shared.sdp.local.as_mut() {
                local.set_direction(MediaDirection::SendRecv);
            }
        }
        if let Some(channel) = self.channel() {
            if let Err(e) = channel.set_direction(MediaDirection::SendRecv).await {
                warn!(leg = %self.id, "unhold direction failed: {}", e);
            }
        }
        if let Some(peer) = self.peer() {
            self.mix_with(&peer).await;
        }
        info!(leg = %self.id, "resumed");
        self.emit(CallEventKind::Unhold);
    }

    // ------------------------------------------------------------------
    // Session refresh
    // ------------------------------------------------------------------

    fn start_session_refresh(self: &Arc<Self>) {
        let Some(interval) = self.deps.config.session_refresh_interval else {
            return;
        };
        let weak = Arc::downgrade(self);
        self.refresh_timer.arm_interval(interval, move || {
            let weak = weak.clone();
            async move {
                let Some(leg) = weak.upgrade() else { return };
                leg.session_refresh().await;
            }
        });
    }

    /// Re-send the current local description. A failed refresh is the
    /// primary signal of a silently dead peer.
    async fn session_refresh(self: &Arc<Self>) {
        let state = self.state();
        if !state.established || state.destroyed {
            return;
        }
        let Some(sdp) = self.local_description() else {
            return;
        };
        let Some(dialog) = self.dialog_handle() else {
            return;
        };
        match dialog.send_request(InDialogRequest::Refresh { sdp }).await {
            Ok(response) if response.is_success() => {
                debug!(leg = %self.id, "session refresh ok");
            }
            Ok(response) => {
                warn!(leg = %self.id, status = response.status, "session refresh rejected");
                self.hangup(HangupCause::new(
                    HangupReason::PeerUnreachable,
                    CauseSource::Us,
                ))
                .await;
            }
            Err(e) => {
                warn!(leg = %self.id, "session refresh failed: {}", e);
                self.hangup(HangupCause::new(
                    HangupReason::PeerUnreachable,
                    CauseSource::Us,
                ))
                .await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Digits
    // ------------------------------------------------------------------

    /// Wait for the digit buffer to match `pattern`. Only one wait can be
    /// outstanding; a newer wait resolves the previous one immediately.
    pub async fn wait_for_digits(&self, pattern: &str, timeout: Duration) -> Option<String> {
        self.digits.wait_for(pattern, timeout).await
    }

    pub fn clear_digits(&self) {
        self.digits.clear();
    }

    pub fn digit_buffer(&self) -> String {
        self.digits.buffer()
    }

    // ------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------

    /// Run one challenge-response round for the pending invite. A new
    /// round supersedes any outstanding one; a superseded round's result
    /// is discarded.
    pub async fn authenticate(
        self: &Arc<Self>,
        credentials: &dyn CredentialSource,
    ) -> Result<CallerIdentity> {
        let invite = self
            .invite
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CallError::InvalidState("no pending invite".into()))?;
        let generation = {
            let mut current = self.auth_generation.lock().unwrap();
            *current += 1;
            *current
        };
        let outcome = tokio::time::timeout(
            self.deps.config.auth_timeout,
            self.deps.signaling.authenticate(&invite, credentials),
        )
        .await;
        if *self.auth_generation.lock().unwrap() != generation {
            return Err(CallError::InvalidState("authentication superseded".into()));
        }
        let identity = match outcome {
            Err(_) => return Err(CallError::Timeout("authentication")),
            Ok(result) => result?,
        };
        if self.state().destroyed {
            return Err(CallError::InvalidState("leg is destroyed".into()));
        }
        self.shared.write().unwrap().identity = Some(identity.clone());
        // Joins the identity and realm indices
        self.deps.registry.upsert(self);
        info!(leg = %self.id, user = %identity.username, "authenticated");
        self.emit(CallEventKind::Authenticated);
        Ok(identity)
    }

    // ------------------------------------------------------------------
    // Transfer bookkeeping
    // ------------------------------------------------------------------

    pub(crate) fn mark_referred(self: &Arc<Self>, target: &str) {
        {
            let mut shared = self.shared.write().unwrap();
            shared.state.referred = true;
            shared.refer_target = Some(target.to_string());
        }
        self.emit(CallEventKind::Referred {
            target: target.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// The far end canceled an in-progress leg
    pub async fn cancel_by_originator(self: &Arc<Self>) {
        {
            let mut shared = self.shared.write().unwrap();
            if shared.state.established || shared.state.destroyed {
                // Lost the race against answer/teardown
                return;
            }
            shared.state.canceled = true;
            shared.epochs.mark_ended();
        }
        self.hangup(HangupCause::new(
            HangupReason::OriginatorCancel,
            CauseSource::Them,
        ))
        .await;
    }

    /// Hang up: choose a teardown action by current state, then always
    /// run the destroy sequence. Idempotent; the local state converges
    /// even when the far end is unreachable.
    pub fn hangup(self: &Arc<Self>, cause: HangupCause) -> BoxFuture<'static, ()> {
        let leg = self.clone();
        Box::pin(async move {
            if leg.state().destroyed {
                return;
            }
            let cause = leg.record_cause(cause);
            let state = leg.state();
            if state.established {
                if let Some(dialog) = leg.dialog_handle() {
                    if let Err(e) = dialog.hangup().await {
                        warn!(leg = %leg.id, "teardown signaling failed: {}", e);
                    }
                }
            } else {
                match leg.direction {
                    CallDirection::Outbound => {
                        {
                            let mut shared = leg.shared.write().unwrap();
                            if !shared.state.destroyed && !shared.state.canceled {
                                shared.state.canceled = true;
                                shared.epochs.mark_ended();
                            }
                        }
                        let attempt = leg.attempt.lock().unwrap().take();
                        if let Some(attempt) = attempt {
                            if let Err(e) = attempt.cancel().await {
                                warn!(leg = %leg.id, "cancel failed: {}", e);
                            }
                        }
                    }
                    CallDirection::Inbound => {
                        let invite = leg.invite.lock().unwrap().clone();
                        if let Some(invite) = invite {
                            if let Err(e) =
                                leg.deps.signaling.reject(&invite, cause.sip_status).await
                            {
                                warn!(leg = %leg.id, "reject failed: {}", e);
                            }
                        }
                    }
                }
            }
            leg.destroy(cause).await;
        })
    }

    /// Terminal transition: cancel timers, release media exactly once,
    /// drop out of the directory, cascade to linked legs with the same
    /// cause, then emit the destroyed notification.
    fn destroy(self: &Arc<Self>, cause: HangupCause) -> BoxFuture<'static, ()> {
        let leg = self.clone();
        Box::pin(async move {
            let (was_established, parent, children) = {
                let mut shared = leg.shared.write().unwrap();
                if shared.state.destroyed {
                    return;
                }
                let was_established = shared.state.established;
                shared.state.destroyed = true;
                shared.state.trying = false;
                shared.state.ringing = false;
                shared.epochs.mark_ended();
                if shared.cause.is_none() {
                    shared.cause = Some(cause);
                }
                let parent = shared.links.parent.upgrade();
                shared.links.parent = Weak::new();
                let children: Vec<Arc<CallLeg>> = shared
                    .links
                    .children
                    .drain(..)
                    .filter_map(|w| w.upgrade())
                    .collect();
                (was_established, parent, children)
            };
            info!(
                leg = %leg.id,
                reason = cause.reason.as_str(),
                source = cause.source.as_str(),
                "destroying"
            );
            leg.no_answer_timer.cancel();
            leg.refresh_timer.cancel();
            leg.digits.abort_wait();

            let channel = leg.media_channel.lock().unwrap().take();
            if let Some(channel) = channel {
                let _ = leg.deps.media.unmix(channel.id()).await;
                channel.close().await;
            }
            leg.dialog.lock().unwrap().take();
            leg.attempt.lock().unwrap().take();
            leg.deps.registry.remove(&leg);

            if let Some(parent) = parent {
                parent.unlink_child(leg.id);
                if was_established && !parent.state().destroyed {
                    parent.hangup(cause).await;
                }
            }
            for child in children {
                child.clear_parent();
                if !child.state().destroyed {
                    child.hangup(cause).await;
                }
            }
            leg.emit(CallEventKind::Destroyed);
        })
    }

    // ------------------------------------------------------------------
    // Event pumps
    // ------------------------------------------------------------------

    fn spawn_dialog_pump(self: &Arc<Self>, mut events: mpsc::Receiver<DialogEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(leg) = weak.upgrade() else { break };
                if leg.state().destroyed {
                    break;
                }
                match event {
                    DialogEvent::Terminated { status } => {
                        let cause = match status {
                            Some(status) => HangupCause::from_status(status, CauseSource::Them),
                            None => HangupCause::new(
                                HangupReason::NormalClearing,
                                CauseSource::Them,
                            ),
                        };
                        leg.hangup(cause).await;
                        break;
                    }
                    DialogEvent::ReOffer { sdp, answer } => {
                        let response = leg.handle_reoffer(&sdp).await;
                        let _ = answer.send(response);
                    }
                    DialogEvent::Transfer(request) => {
                        super::transfer::handle_transfer_request(&leg, request).await;
                    }
                }
            }
        });
    }

    fn spawn_media_pump(self: &Arc<Self>, mut events: mpsc::Receiver<MediaEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(leg) = weak.upgrade() else { break };
                match event {
                    MediaEvent::Dtmf(digit) => leg.digits.push(digit),
                    MediaEvent::Closed => {
                        debug!(leg = %leg.id, "media channel closed by engine");
                        break;
                    }
                }
            }
        });
    }
}

/// Build the codec list a fresh offer advertises from a preference string
fn preferred_codecs(prefs: &str) -> Vec<Codec> {
    let map = PayloadMap::with_defaults();
    CodecNegotiator::new()
        .normalize_candidates(prefs, &map)
        .into_iter()
        .filter(|name| name != "telephone-event")
        .filter_map(|name| {
            let payload_type = map.payload_type(&name)?;
            Some(Codec {
                clock_rate: map.clock_rate(&name),
                name,
                payload_type,
            })
        })
        .collect()
}
