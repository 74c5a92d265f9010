//! Call transfer
//!
//! Blind transfer re-points the peer leg at a new target and lets the
//! dispatcher originate the new attempt. Attended transfer splices two
//! previously separate bridges: the requester's peer ends up bridged
//! with the replaced dialog's peer, and both superseded legs are hung
//! up. The detach/re-link/media swap happens as one local step before
//! any external success signaling, so a failure never leaves a partial
//! swap visible.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::cause::{CauseSource, HangupCause, HangupReason};
use crate::domain::shared::value_objects::{DialogId, TargetUri};
use crate::infrastructure::sdp::{CodecNegotiator, Codec, MediaDirection, SdpSession};
use crate::infrastructure::signaling::{InDialogRequest, TransferRequest};

use super::entity::CallLeg;

/// Reference to the dialog an attended transfer replaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacesRef {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
}

impl ReplacesRef {
    /// Parse the decoded header value: `call-id;to-tag=x;from-tag=y`
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(';');
        let call_id = parts.next()?.trim().to_string();
        if call_id.is_empty() {
            return None;
        }
        let mut to_tag = None;
        let mut from_tag = None;
        for param in parts {
            let (name, value) = param.trim().split_once('=')?;
            match name.trim() {
                name if name.eq_ignore_ascii_case("to-tag") => to_tag = Some(value.to_string()),
                name if name.eq_ignore_ascii_case("from-tag") => from_tag = Some(value.to_string()),
                _ => {}
            }
        }
        Some(Self {
            call_id,
            to_tag: to_tag?,
            from_tag: from_tag?,
        })
    }
}

enum ReferKind {
    Blind(String),
    Attended(ReplacesRef),
    Malformed,
}

/// Split a Refer-To value into its target and an embedded Replaces
/// reference, if any
fn classify(refer_to: &str) -> ReferKind {
    let trimmed = refer_to.trim().trim_start_matches('<').trim_end_matches('>');
    let Some((base, headers)) = trimmed.split_once('?') else {
        return ReferKind::Blind(trimmed.to_string());
    };
    for header in headers.split('&') {
        if let Some((name, value)) = header.split_once('=') {
            if name.eq_ignore_ascii_case("replaces") {
                return match ReplacesRef::parse(&percent_decode(value)) {
                    Some(replaces) => ReferKind::Attended(replaces),
                    None => ReferKind::Malformed,
                };
            }
        }
    }
    ReferKind::Blind(base.to_string())
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(value) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(value as char);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Entry point for a far-end transfer request on `leg`
pub(crate) async fn handle_transfer_request(leg: &Arc<CallLeg>, request: TransferRequest) {
    let TransferRequest {
        refer_to,
        referred_by,
        responder,
    } = request;
    if let Some(referrer) = &referred_by {
        debug!(leg = %leg.id(), referrer = %referrer, "transfer requested");
    }
    match classify(&refer_to) {
        ReferKind::Blind(target) => blind_transfer(leg, &target, responder).await,
        ReferKind::Attended(replaces) => attended_transfer(leg, replaces, responder).await,
        ReferKind::Malformed => {
            warn!(leg = %leg.id(), "malformed transfer reference");
            let _ = responder.send(400);
        }
    }
}

/// Blind transfer: validate the target, detach the requester from its
/// peer, acknowledge, and mark the peer referred so the dispatcher can
/// originate a new attempt toward the target.
async fn blind_transfer(
    leg: &Arc<CallLeg>,
    target: &str,
    responder: tokio::sync::oneshot::Sender<u16>,
) {
    let Some(target) = TargetUri::parse(target) else {
        warn!(leg = %leg.id(), "transfer target missing user or host");
        let _ = responder.send(400);
        return;
    };
    let Some(peer) = leg.peer() else {
        warn!(leg = %leg.id(), "blind transfer without a peer leg");
        let _ = responder.send(400);
        return;
    };

    // Detach before acknowledging so stale bridge state cannot leak into
    // the new linkage
    leg.detach();
    let _ = responder.send(202);
    info!(leg = %leg.id(), target = %target, "blind transfer accepted");

    // The far end drives this leg's hangup shortly after
    leg.record_cause(HangupCause::new(
        HangupReason::BlindTransfer,
        CauseSource::Them,
    ));
    peer.mark_referred(&target.to_string());
    notify_refer_status(leg, "200 OK").await;
}

/// Attended transfer: splice the requester's peer onto the replaced
/// dialog's peer and hang up both superseded legs.
async fn attended_transfer(
    leg: &Arc<CallLeg>,
    replaces: ReplacesRef,
    responder: tokio::sync::oneshot::Sender<u16>,
) {
    // The replaced dialog is resolved with the tag pair swapped: its
    // local tag is the reference's to-tag
    let query = DialogId::with_tags(
        replaces.call_id.clone(),
        Some(replaces.to_tag.clone()),
        Some(replaces.from_tag.clone()),
    );
    let Some(replaced) = leg.deps.registry.find_by_dialog(&query) else {
        warn!(leg = %leg.id(), call_id = %replaces.call_id, "replaced dialog not found");
        let _ = responder.send(481);
        return;
    };
    let Some(replaced_peer) = replaced.peer() else {
        warn!(leg = %leg.id(), "replaced dialog has no peer leg");
        let _ = responder.send(400);
        return;
    };
    let Some(requester_peer) = leg.peer() else {
        warn!(leg = %leg.id(), "transfer requester has no peer leg");
        let _ = responder.send(400);
        return;
    };
    let _ = responder.send(202);

    // Resolve the transferred media's codec before touching any state:
    // the surviving bridge is restricted to the codec class the replaced
    // dialog's peer already runs.
    let new_codec = match resolve_transfer_codec(&requester_peer, &replaced_peer) {
        Some(codec) => codec,
        None => {
            warn!(leg = %leg.id(), "transfer renegotiation found no codec overlap");
            notify_refer_status(leg, "488 Not Acceptable Here").await;
            return;
        }
    };

    // Record orientation so a failed push can restore the exact linkage
    let requester_was_parent_of_peer = requester_peer
        .parent()
        .map(|p| p.id() == leg.id())
        .unwrap_or(false);
    let replaced_was_parent_of_peer = replaced_peer
        .parent()
        .map(|p| p.id() == replaced.id())
        .unwrap_or(false);

    // Detach, swap and re-link together, before any external signaling
    // of success
    leg.detach();
    replaced.detach();
    replaced_peer.link_child(&requester_peer);

    if let Some(id) = leg.media_channel_id() {
        let _ = leg.deps.media.unmix(id).await;
    }
    if let Some(id) = replaced.media_channel_id() {
        let _ = leg.deps.media.unmix(id).await;
    }
    requester_peer.set_selected_codec(new_codec.clone());
    requester_peer.mix_with(&replaced_peer).await;

    // Push the updated offer to the still-live far end
    let pushed = push_refreshed_offer(&requester_peer, &new_codec).await;
    if !pushed {
        warn!(leg = %leg.id(), "transfer offer push failed, restoring original bridge");
        // Undo the swap: restore both bridges with their original
        // orientation and remix the original pairs
        replaced_peer.detach();
        relink(leg, &requester_peer, requester_was_parent_of_peer);
        relink(&replaced, &replaced_peer, replaced_was_parent_of_peer);
        leg.mix_with(&requester_peer).await;
        replaced.mix_with(&replaced_peer).await;
        notify_refer_status(leg, "500 Server Internal Error").await;
        return;
    }

    info!(
        leg = %leg.id(),
        survivor_a = %requester_peer.id(),
        survivor_b = %replaced_peer.id(),
        "attended transfer complete"
    );
    notify_refer_status(leg, "200 OK").await;
    leg.hangup(HangupCause::new(
        HangupReason::AttendedTransfer,
        CauseSource::Them,
    ))
    .await;
    replaced
        .hangup(HangupCause::new(
            HangupReason::AttendedTransfer,
            CauseSource::Us,
        ))
        .await;
}

/// Intersect the transferred leg's remote description with the codec
/// class the surviving side already selected
fn resolve_transfer_codec(
    requester_peer: &Arc<CallLeg>,
    replaced_peer: &Arc<CallLeg>,
) -> Option<Codec> {
    let mut remote = requester_peer.remote_session()?;
    let target = replaced_peer
        .selected_codec()
        .or_else(|| requester_peer.selected_codec())?;
    let matched = CodecNegotiator::new().intersection(&mut remote, &target.name, true)?;
    Some(matched[0].clone())
}

/// Re-offer the transferred media to the far end of `leg`
async fn push_refreshed_offer(leg: &Arc<CallLeg>, codec: &Codec) -> bool {
    let Some(channel) = leg.channel() else {
        return false;
    };
    let Some(dialog) = leg.dialog_handle() else {
        return false;
    };
    let addr = channel.local_addr();
    let dtmf_payload = leg.deps.config.dtmf.enabled.then_some(leg.deps.config.dtmf.payload_type);
    let offer = SdpSession::audio_session(
        &addr.ip().to_string(),
        addr.port(),
        std::slice::from_ref(codec),
        dtmf_payload,
        MediaDirection::SendRecv,
    );
    let text = offer.build();
    leg.set_local_session(offer);
    match dialog
        .send_request(InDialogRequest::Refresh { sdp: text })
        .await
    {
        Ok(response) => response.is_success(),
        Err(e) => {
            warn!(leg = %leg.id(), "refresh request failed: {}", e);
            false
        }
    }
}

fn relink(leg: &Arc<CallLeg>, peer: &Arc<CallLeg>, leg_is_parent: bool) {
    if leg_is_parent {
        leg.link_child(peer);
    } else {
        peer.link_child(leg);
    }
}

async fn notify_refer_status(leg: &Arc<CallLeg>, status_line: &str) {
    let Some(dialog) = leg.dialog_handle() else {
        return;
    };
    let result = dialog
        .send_request(InDialogRequest::Notify {
            event: "refer".to_string(),
            body: format!("SIP/2.0 {}", status_line),
        })
        .await;
    if let Err(e) = result {
        debug!(leg = %leg.id(), "refer notify failed: {}", e);
    }
}
