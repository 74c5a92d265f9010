//! Test fixtures: channel-driven fakes for the signaling and media
//! boundaries.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use trunkline::domain::call::{CallLegDeps, CallRegistry, EventBus};
use trunkline::domain::shared::value_objects::{CallerIdentity, DialogId};
use trunkline::infrastructure::media::{
    ChannelId, MediaChannel, MediaEngine, MediaError, MediaEvent, OpenChannelOptions,
};
use trunkline::infrastructure::sdp::MediaDirection;
use trunkline::infrastructure::signaling::{
    AttemptHandle, CredentialSource, DialogEvent, DialogHandle, DialogResponse, DialogSession,
    InDialogRequest, InboundInvite, InviteProgress, InviteRequest, SignalingError, SignalingPort,
};

pub const PCMA_OFFER: &str = "v=0\r\n\
o=peer 1 1 IN IP4 192.168.1.50\r\n\
s=-\r\n\
c=IN IP4 192.168.1.50\r\n\
t=0 0\r\n\
m=audio 4000 RTP/AVP 8 101\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n\
a=fmtp:101 0-16\r\n";

pub const ILBC_MODE30_OFFER: &str = "v=0\r\n\
o=peer 1 1 IN IP4 192.168.1.50\r\n\
s=-\r\n\
c=IN IP4 192.168.1.50\r\n\
t=0 0\r\n\
m=audio 4000 RTP/AVP 98 0 101\r\n\
a=rtpmap:98 iLBC/8000\r\n\
a=fmtp:98 mode=30\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n";

pub const HOLD_OFFER: &str = "v=0\r\n\
o=peer 1 2 IN IP4 192.168.1.50\r\n\
s=-\r\n\
c=IN IP4 192.168.1.50\r\n\
t=0 0\r\n\
m=audio 4000 RTP/AVP 8\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=inactive\r\n";

// ---------------------------------------------------------------------
// Media fake
// ---------------------------------------------------------------------

pub struct FakeChannel {
    id: ChannelId,
    addr: SocketAddr,
}

#[async_trait]
impl MediaChannel for FakeChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn set_remote(&self, _addr: SocketAddr, _payload_type: u8) -> Result<(), MediaError> {
        Ok(())
    }

    async fn set_direction(&self, _direction: MediaDirection) -> Result<(), MediaError> {
        Ok(())
    }

    async fn play(&self, _prompt: &str) -> Result<(), MediaError> {
        Ok(())
    }

    async fn close(&self) {}
}

#[derive(Default)]
pub struct FakeMedia {
    next_port: AtomicU16,
    /// Channel id -> mixed partner
    mixed: Mutex<HashMap<ChannelId, ChannelId>>,
    feeds: Mutex<HashMap<ChannelId, mpsc::Sender<MediaEvent>>>,
    pub opened: AtomicUsize,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU16::new(10000),
            ..Default::default()
        })
    }

    pub fn is_mixed(&self, a: ChannelId, b: ChannelId) -> bool {
        self.mixed.lock().unwrap().get(&a) == Some(&b)
    }

    /// Inject a DTMF digit into a channel's event stream
    pub async fn feed_dtmf(&self, id: ChannelId, digit: char) {
        let feed = self.feeds.lock().unwrap().get(&id).cloned();
        if let Some(feed) = feed {
            let _ = feed.send(MediaEvent::Dtmf(digit)).await;
        }
    }
}

#[async_trait]
impl MediaEngine for FakeMedia {
    async fn open_channel(
        &self,
        _options: OpenChannelOptions,
    ) -> Result<(Box<dyn MediaChannel>, mpsc::Receiver<MediaEvent>), MediaError> {
        let port = self.next_port.fetch_add(2, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);
        let id = ChannelId::new();
        let (tx, rx) = mpsc::channel(16);
        self.feeds.lock().unwrap().insert(id, tx);
        let channel = FakeChannel {
            id,
            addr: format!("127.0.0.1:{}", port).parse().unwrap(),
        };
        Ok((Box::new(channel), rx))
    }

    async fn mix(&self, a: ChannelId, b: ChannelId) -> Result<(), MediaError> {
        let mut mixed = self.mixed.lock().unwrap();
        mixed.insert(a, b);
        mixed.insert(b, a);
        Ok(())
    }

    async fn unmix(&self, id: ChannelId) -> Result<(), MediaError> {
        let mut mixed = self.mixed.lock().unwrap();
        if let Some(partner) = mixed.remove(&id) {
            mixed.remove(&partner);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Signaling fake
// ---------------------------------------------------------------------

pub struct FakeDialog {
    /// Rendered log of in-dialog requests
    pub requests: Mutex<Vec<String>>,
    pub hangups: AtomicUsize,
    /// Status returned to refresh requests
    pub refresh_status: AtomicU16,
}

impl Default for FakeDialog {
    fn default() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            hangups: AtomicUsize::new(0),
            refresh_status: AtomicU16::new(200),
        }
    }
}

impl FakeDialog {
    pub fn sent(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl DialogHandle for FakeDialog {
    async fn send_request(&self, request: InDialogRequest) -> Result<DialogResponse, SignalingError> {
        let (line, status) = match &request {
            InDialogRequest::Refresh { .. } => {
                ("refresh".to_string(), self.refresh_status.load(Ordering::SeqCst))
            }
            InDialogRequest::Notify { event, body } => (format!("notify {} {}", event, body), 200),
        };
        self.requests.lock().unwrap().push(line);
        Ok(DialogResponse { status, sdp: None })
    }

    async fn hangup(&self) -> Result<(), SignalingError> {
        self.hangups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handle a test keeps on a confirmed dialog: the fake itself plus the
/// event feed into the leg's dialog pump
pub struct DialogCtl {
    pub dialog: Arc<FakeDialog>,
    pub events: mpsc::Sender<DialogEvent>,
    pub local_tag: String,
    pub remote_tag: String,
}

pub struct FakeAttempt {
    cancels: Arc<AtomicUsize>,
}

#[async_trait]
impl AttemptHandle for FakeAttempt {
    async fn cancel(&self) -> Result<(), SignalingError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What an outbound invite should do
#[derive(Clone)]
pub enum InviteScript {
    /// Keep the attempt pending forever
    NoAnswer,
    Answer { sdp: String },
    RingThenAnswer { sdp: String },
    Fail { status: u16 },
}

pub struct FakeSignaling {
    pub script: Mutex<InviteScript>,
    pub dialogs: Mutex<Vec<Arc<DialogCtl>>>,
    pub accepts: Mutex<Vec<String>>,
    pub rejects: Mutex<Vec<u16>>,
    pub rings: AtomicUsize,
    pub cancels: Arc<AtomicUsize>,
    tag_counter: AtomicUsize,
    /// Keeps pending progress senders alive for NoAnswer scripts
    pending: Mutex<Vec<mpsc::Sender<InviteProgress>>>,
}

impl FakeSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(InviteScript::NoAnswer),
            dialogs: Mutex::new(Vec::new()),
            accepts: Mutex::new(Vec::new()),
            rejects: Mutex::new(Vec::new()),
            rings: AtomicUsize::new(0),
            cancels: Arc::new(AtomicUsize::new(0)),
            tag_counter: AtomicUsize::new(0),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn set_script(&self, script: InviteScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn last_dialog(&self) -> Arc<DialogCtl> {
        self.dialogs.lock().unwrap().last().cloned().expect("no dialog confirmed")
    }

    pub fn dialog_at(&self, index: usize) -> Arc<DialogCtl> {
        self.dialogs.lock().unwrap()[index].clone()
    }

    fn fresh_tag(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.tag_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn make_dialog(&self, local_tag: String, remote_tag: String) -> (DialogSession, Arc<DialogCtl>) {
        let dialog = Arc::new(FakeDialog::default());
        let (tx, rx) = mpsc::channel(16);
        let ctl = Arc::new(DialogCtl {
            dialog: dialog.clone(),
            events: tx,
            local_tag: local_tag.clone(),
            remote_tag: remote_tag.clone(),
        });
        self.dialogs.lock().unwrap().push(ctl.clone());
        let session = DialogSession {
            handle: dialog,
            events: rx,
            local_tag,
            remote_tag,
        };
        (session, ctl)
    }
}

#[async_trait]
impl SignalingPort for FakeSignaling {
    async fn start_invite(
        &self,
        request: InviteRequest,
    ) -> Result<(mpsc::Receiver<InviteProgress>, Box<dyn AttemptHandle>), SignalingError> {
        let (tx, rx) = mpsc::channel(8);
        let attempt = FakeAttempt {
            cancels: self.cancels.clone(),
        };
        let script = self.script.lock().unwrap().clone();
        match script {
            InviteScript::NoAnswer => {
                self.pending.lock().unwrap().push(tx);
            }
            InviteScript::Fail { status } => {
                let _ = tx.send(InviteProgress::Failed { status }).await;
            }
            InviteScript::Answer { sdp } => {
                let (session, _) =
                    self.make_dialog(request.local_tag.clone(), self.fresh_tag("remote"));
                let _ = tx
                    .send(InviteProgress::Answered {
                        dialog: session,
                        sdp,
                        answer: None,
                    })
                    .await;
            }
            InviteScript::RingThenAnswer { sdp } => {
                let (session, _) =
                    self.make_dialog(request.local_tag.clone(), self.fresh_tag("remote"));
                let _ = tx.send(InviteProgress::Ringing).await;
                let _ = tx
                    .send(InviteProgress::Answered {
                        dialog: session,
                        sdp,
                        answer: None,
                    })
                    .await;
            }
        }
        Ok((rx, Box::new(attempt)))
    }

    async fn ring(&self, _invite: &InboundInvite) -> Result<(), SignalingError> {
        self.rings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn accept(
        &self,
        invite: &InboundInvite,
        answer: String,
        local_tag: String,
    ) -> Result<DialogSession, SignalingError> {
        self.accepts.lock().unwrap().push(answer);
        let remote_tag = invite
            .dialog_id
            .remote_tag
            .clone()
            .unwrap_or_else(|| self.fresh_tag("remote"));
        let (session, _) = self.make_dialog(local_tag, remote_tag);
        Ok(session)
    }

    async fn reject(&self, _invite: &InboundInvite, status: u16) -> Result<(), SignalingError> {
        self.rejects.lock().unwrap().push(status);
        Ok(())
    }

    async fn authenticate(
        &self,
        invite: &InboundInvite,
        credentials: &dyn CredentialSource,
    ) -> Result<CallerIdentity, SignalingError> {
        let bare = invite.from_uri.trim_start_matches("sip:");
        let (user, realm) = bare.split_once('@').unwrap_or((bare, "example.com"));
        if credentials.password_for(user, realm).await.is_none() {
            return Err(SignalingError::Rejected(403));
        }
        Ok(CallerIdentity::new(user, realm))
    }
}

/// Static credential table
pub struct FakeCredentials;

#[async_trait]
impl CredentialSource for FakeCredentials {
    async fn password_for(&self, _username: &str, _realm: &str) -> Option<String> {
        Some("secret".to_string())
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

pub struct Harness {
    pub deps: CallLegDeps,
    pub signaling: Arc<FakeSignaling>,
    pub media: Arc<FakeMedia>,
}

pub fn harness() -> Harness {
    harness_with(trunkline::CallConfig::default())
}

pub fn harness_with(config: trunkline::CallConfig) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let signaling = FakeSignaling::new();
    let media = FakeMedia::new();
    let deps = CallLegDeps {
        config: Arc::new(config),
        registry: Arc::new(CallRegistry::new()),
        signaling: signaling.clone(),
        media: media.clone(),
        bus: EventBus::new(64),
    };
    Harness {
        deps,
        signaling,
        media,
    }
}

pub fn inbound_invite(call_id: &str, remote_tag: &str, offer: &str) -> InboundInvite {
    InboundInvite {
        dialog_id: DialogId::with_tags(call_id, None, Some(remote_tag.to_string())),
        from_uri: "sip:alice@example.com".to_string(),
        to_uri: "sip:bob@example.com".to_string(),
        display_name: Some("Alice".to_string()),
        offer: Some(offer.to_string()),
        headers: HashMap::new(),
    }
}

/// Give spawned pumps a moment to drain
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
