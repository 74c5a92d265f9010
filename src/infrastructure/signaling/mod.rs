//! Signaling boundary (SIP transport/transaction layer)
//!
//! Message parsing, retransmission, socket I/O and digest computation all
//! live behind these traits. The call-control layer issues dialog
//! operations and consumes per-dialog events; every call suspends the
//! issuing task rather than blocking.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::domain::shared::value_objects::{CallerIdentity, DialogId, TargetUri};

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("request rejected with status {0}")]
    Rejected(u16),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("transaction timed out")]
    Timeout,
}

/// Outbound dialog attempt
#[derive(Debug)]
pub struct InviteRequest {
    pub target: TargetUri,
    pub from: Option<CallerIdentity>,
    pub call_id: String,
    pub local_tag: String,
    /// Local SDP offer; `None` defers the offer to the answer exchange
    /// (late negotiation).
    pub offer: Option<String>,
}

/// Progress of an outbound invite, delivered in order
pub enum InviteProgress {
    Ringing,
    EarlyMedia {
        sdp: String,
    },
    Answered {
        dialog: DialogSession,
        sdp: String,
        /// Present when the invite carried no offer: the remote SDP above
        /// is an offer and the local answer must be sent back through this
        /// channel to complete the handshake.
        answer: Option<oneshot::Sender<String>>,
    },
    Failed {
        status: u16,
    },
}

/// A confirmed dialog: control handle plus its event stream
pub struct DialogSession {
    pub handle: Arc<dyn DialogHandle>,
    pub events: mpsc::Receiver<DialogEvent>,
    pub local_tag: String,
    pub remote_tag: String,
}

/// Handle on a not-yet-answered outbound attempt
#[async_trait]
pub trait AttemptHandle: Send + Sync {
    /// Abort the attempt (CANCEL)
    async fn cancel(&self) -> Result<(), SignalingError>;
}

/// In-dialog requests a leg may issue
#[derive(Debug)]
pub enum InDialogRequest {
    /// Session refresh / renegotiation (re-INVITE)
    Refresh { sdp: String },
    /// Event notification (NOTIFY)
    Notify { event: String, body: String },
}

#[derive(Debug)]
pub struct DialogResponse {
    pub status: u16,
    pub sdp: Option<String>,
}

impl DialogResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Far-end transfer request (REFER)
pub struct TransferRequest {
    pub refer_to: String,
    pub referred_by: Option<String>,
    /// Final status for the transfer request itself (202 on acceptance)
    pub responder: oneshot::Sender<u16>,
}

/// Events delivered per dialog, in emission order
pub enum DialogEvent {
    /// Far end ended the dialog
    Terminated { status: Option<u16> },
    /// Renegotiation offer (re-INVITE). The local answer SDP goes back
    /// through `answer`; `None` rejects the offer.
    ReOffer {
        sdp: String,
        answer: oneshot::Sender<Option<String>>,
    },
    /// Far end asked to transfer the call
    Transfer(TransferRequest),
}

/// A confirmed dialog's control surface
#[async_trait]
pub trait DialogHandle: Send + Sync {
    async fn send_request(&self, request: InDialogRequest) -> Result<DialogResponse, SignalingError>;

    /// End the dialog (BYE)
    async fn hangup(&self) -> Result<(), SignalingError>;
}

/// A parsed inbound invite pending a decision
#[derive(Debug)]
pub struct InboundInvite {
    /// Call-id plus the remote tag; the local tag is assigned on accept
    pub dialog_id: DialogId,
    pub from_uri: String,
    pub to_uri: String,
    pub display_name: Option<String>,
    pub offer: Option<String>,
    /// Parsed header fields of interest to upstream code
    pub headers: HashMap<String, String>,
}

/// Credential lookup used by the challenge-response step
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn password_for(&self, username: &str, realm: &str) -> Option<String>;
}

#[async_trait]
pub trait SignalingPort: Send + Sync {
    /// Start an outbound dialog attempt. Resolves with the progress stream
    /// and a cancel handle, or rejects outright with a status.
    async fn start_invite(
        &self,
        request: InviteRequest,
    ) -> Result<(mpsc::Receiver<InviteProgress>, Box<dyn AttemptHandle>), SignalingError>;

    /// Send a provisional ringing response for a pending inbound invite
    async fn ring(&self, invite: &InboundInvite) -> Result<(), SignalingError>;

    /// Accept a pending inbound invite with a local answer, completing the
    /// dialog
    async fn accept(
        &self,
        invite: &InboundInvite,
        answer: String,
        local_tag: String,
    ) -> Result<DialogSession, SignalingError>;

    /// Reject a pending inbound invite with a final status
    async fn reject(&self, invite: &InboundInvite, status: u16) -> Result<(), SignalingError>;

    /// Run one challenge-response authentication round for the invite
    async fn authenticate(
        &self,
        invite: &InboundInvite,
        credentials: &dyn CredentialSource,
    ) -> Result<CallerIdentity, SignalingError>;
}
