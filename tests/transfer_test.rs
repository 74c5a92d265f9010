//! Blind and attended transfer integration tests

mod common;

use common::*;
use std::sync::Arc;

use trunkline::domain::call::{CallEventKind, CallLeg, Dispatcher};
use trunkline::domain::shared::value_objects::TargetUri;
use trunkline::infrastructure::signaling::{DialogEvent, TransferRequest};
use trunkline::{AnswerOptions, CauseSource, DialOptions, HangupCause, HangupReason};

fn target() -> TargetUri {
    TargetUri::parse("sip:carol@example.com").unwrap()
}

async fn send_refer(ctl: &Arc<DialogCtl>, refer_to: &str) -> u16 {
    let (tx, rx) = tokio::sync::oneshot::channel();
    ctl.events
        .send(DialogEvent::Transfer(TransferRequest {
            refer_to: refer_to.to_string(),
            referred_by: Some("sip:alice@example.com".to_string()),
            responder: tx,
        }))
        .await
        .unwrap();
    rx.await.unwrap()
}

/// Answered inbound leg bridged to an established outbound child
async fn bridged_pair(h: &Harness, call_id: &str) -> (Arc<CallLeg>, Arc<CallLeg>) {
    let parent = CallLeg::inbound(h.deps.clone(), inbound_invite(call_id, "rt-in", PCMA_OFFER));
    parent.answer(AnswerOptions::default()).await.unwrap();
    h.signaling.set_script(InviteScript::Answer {
        sdp: PCMA_OFFER.to_string(),
    });
    let child = parent.dial(target(), DialOptions::default()).await.unwrap();
    settle().await;
    assert!(child.state().established);
    (parent, child)
}

#[tokio::test]
async fn blind_transfer_without_peer_is_rejected_unchanged() {
    let h = harness();
    let leg = CallLeg::inbound(h.deps.clone(), inbound_invite("lone", "rt-1", PCMA_OFFER));
    leg.answer(AnswerOptions::default()).await.unwrap();

    let status = send_refer(&h.signaling.last_dialog(), "<sip:carol@example.com>").await;
    assert_eq!(status, 400);

    assert!(!leg.state().destroyed);
    assert!(!leg.state().referred);
    assert!(leg.cause().is_none());
    assert!(h.deps.registry.find_by_id(leg.id()).is_some());
}

#[tokio::test]
async fn blind_transfer_target_must_have_user_and_host() {
    let h = harness();
    let (parent, child) = bridged_pair(&h, "blind-badtarget").await;

    let status = send_refer(&h.signaling.dialog_at(0), "<sip:example.com>").await;
    assert_eq!(status, 400);

    // Nothing was mutated
    assert!(parent.peer().is_some());
    assert!(!child.state().referred);
}

#[tokio::test]
async fn blind_transfer_detaches_and_refers_peer() {
    let h = harness();
    let (parent, child) = bridged_pair(&h, "blind-ok").await;
    let mut events = h.deps.bus.subscribe();

    // The REFER arrives on the inbound (requester) dialog
    let status = send_refer(&h.signaling.dialog_at(0), "<sip:carol@example.com>").await;
    assert_eq!(status, 202);
    settle().await;

    assert!(parent.peer().is_none());
    assert!(child.state().referred);
    assert_eq!(
        child.refer_target().as_deref(),
        Some("sip:carol@example.com")
    );
    assert_eq!(
        parent.cause().unwrap().reason,
        HangupReason::BlindTransfer
    );
    // Neither leg was torn down by the transfer itself
    assert!(!parent.state().destroyed);
    assert!(!child.state().destroyed);

    // Subscription completion went out on the requester dialog
    let sent = h.signaling.dialog_at(0).dialog.sent();
    assert!(sent.iter().any(|r| r.contains("notify refer SIP/2.0 200 OK")));

    let mut referred = false;
    while let Ok(event) = events.try_recv() {
        if let CallEventKind::Referred { target } = &event.kind {
            assert_eq!(target, "sip:carol@example.com");
            referred = true;
        }
    }
    assert!(referred);
}

#[tokio::test]
async fn dispatcher_originates_attempt_for_referred_leg() {
    let h = harness();
    let dispatcher = Arc::new(Dispatcher::new(h.deps.clone()));
    dispatcher.spawn_refer_watcher();

    let (_parent, child) = bridged_pair(&h, "blind-originate").await;

    let status = send_refer(&h.signaling.dialog_at(0), "<sip:carol@example.com>").await;
    assert_eq!(status, 202);
    settle().await;
    settle().await;

    // The dispatcher dialed a fresh leg toward the target on behalf of
    // the referred peer
    let new_leg = child.peer().expect("referred peer was not re-bridged");
    assert!(new_leg.state().established);
    assert_eq!(new_leg.parent().unwrap().id(), child.id());
}

#[tokio::test]
async fn attended_transfer_splices_the_two_bridges() {
    let h = harness();
    let (r1, a) = bridged_pair(&h, "call-a").await;
    let (r2, b) = bridged_pair(&h, "call-b").await;

    let r2_dialog = r2.dialog_id();
    let refer_to = format!(
        "<sip:carol@example.com?Replaces={}%3Bto-tag%3D{}%3Bfrom-tag%3D{}>",
        "call-b",
        r2_dialog.local_tag.clone().unwrap(),
        r2_dialog.remote_tag.clone().unwrap(),
    );
    let status = send_refer(&h.signaling.dialog_at(0), &refer_to).await;
    assert_eq!(status, 202);
    settle().await;

    // The surviving legs are bridged and mixed
    assert_eq!(a.parent().unwrap().id(), b.id());
    assert!(h
        .media
        .is_mixed(a.media_channel_id().unwrap(), b.media_channel_id().unwrap()));

    // Both superseded legs ended with the attended-transfer cause
    assert!(r1.state().destroyed);
    assert!(r2.state().destroyed);
    assert_eq!(r1.cause().unwrap().reason, HangupReason::AttendedTransfer);
    assert_eq!(r2.cause().unwrap().reason, HangupReason::AttendedTransfer);

    // The transferred media was re-offered to the still-live far end
    let refreshed = h.signaling.dialog_at(1).dialog.sent();
    assert!(refreshed.iter().any(|r| r == "refresh"), "sent: {:?}", refreshed);

    // Completion notified on the requester dialog
    let sent = h.signaling.dialog_at(0).dialog.sent();
    assert!(sent.iter().any(|r| r.contains("notify refer SIP/2.0 200 OK")));

    assert_eq!(h.deps.registry.len(), 2);
}

#[tokio::test]
async fn attended_transfer_requires_known_replaced_dialog() {
    let h = harness();
    let (r1, a) = bridged_pair(&h, "call-c").await;

    let refer_to =
        "<sip:carol@example.com?Replaces=unknown%3Bto-tag%3Dx%3Bfrom-tag%3Dy>".to_string();
    let status = send_refer(&h.signaling.dialog_at(0), &refer_to).await;
    assert_eq!(status, 481);

    assert!(!r1.state().destroyed);
    assert_eq!(r1.peer().unwrap().id(), a.id());
}

#[tokio::test]
async fn attended_transfer_requires_two_legged_replaced_dialog() {
    let h = harness();
    let (r1, _a) = bridged_pair(&h, "call-d").await;

    // The replaced dialog exists but has no peer
    let lone = CallLeg::inbound(h.deps.clone(), inbound_invite("call-e", "rt-l", PCMA_OFFER));
    lone.answer(AnswerOptions::default()).await.unwrap();
    let lone_dialog = lone.dialog_id();

    let refer_to = format!(
        "<sip:carol@example.com?Replaces={}%3Bto-tag%3D{}%3Bfrom-tag%3D{}>",
        "call-e",
        lone_dialog.local_tag.clone().unwrap(),
        lone_dialog.remote_tag.clone().unwrap(),
    );
    let status = send_refer(&h.signaling.dialog_at(0), &refer_to).await;
    assert_eq!(status, 400);

    assert!(!r1.state().destroyed);
    assert!(!lone.state().destroyed);
}

#[tokio::test]
async fn malformed_replaces_is_rejected() {
    let h = harness();
    let (r1, _a) = bridged_pair(&h, "call-f").await;

    let status = send_refer(
        &h.signaling.dialog_at(0),
        "<sip:carol@example.com?Replaces=onlycallid>",
    )
    .await;
    assert_eq!(status, 400);
    assert!(!r1.state().destroyed);
}

#[tokio::test]
async fn blind_transfer_cause_survives_remote_hangup() {
    let h = harness();
    let (parent, _child) = bridged_pair(&h, "blind-cause").await;

    let status = send_refer(&h.signaling.dialog_at(0), "<sip:carol@example.com>").await;
    assert_eq!(status, 202);
    settle().await;

    // The far end drives the requester's hangup after the transfer
    h.signaling
        .dialog_at(0)
        .events
        .send(DialogEvent::Terminated { status: None })
        .await
        .unwrap();
    settle().await;

    assert!(parent.state().destroyed);
    // First writer wins: the recorded cause stays blind-transfer
    assert_eq!(parent.cause().unwrap().reason, HangupReason::BlindTransfer);
}

#[tokio::test]
async fn cause_source_corrected_once() {
    let h = harness();
    let leg = CallLeg::inbound(h.deps.clone(), inbound_invite("call-g", "rt-1", PCMA_OFFER));

    let first = leg.record_cause(HangupCause::new(
        HangupReason::BlindTransfer,
        CauseSource::Us,
    ));
    assert_eq!(first.source, CauseSource::Us);

    // Authoritative correction flips the source but never the reason
    let corrected = leg.record_cause(HangupCause::new(
        HangupReason::NormalClearing,
        CauseSource::Them,
    ));
    assert_eq!(corrected.reason, HangupReason::BlindTransfer);
    assert_eq!(corrected.source, CauseSource::Them);

    // Only once
    let stable = leg.record_cause(HangupCause::new(
        HangupReason::UserBusy,
        CauseSource::Us,
    ));
    assert_eq!(stable.reason, HangupReason::BlindTransfer);
    assert_eq!(stable.source, CauseSource::Them);
    assert_eq!(leg.cause().unwrap().reason, HangupReason::BlindTransfer);
}
