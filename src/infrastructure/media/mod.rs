//! Media engine boundary
//!
//! The call-control layer never touches RTP sockets, mixing, or DTMF
//! decoding directly; it drives a media engine through these traits and
//! reacts to the events the engine emits per channel.

use async_trait::async_trait;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::infrastructure::sdp::MediaDirection;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media engine failure: {0}")]
    Engine(String),

    #[error("media channel closed")]
    ChannelClosed,
}

/// Opaque identifier of an engine channel, used for mix/unmix requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events a channel pushes back up to its owning call leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// Out-of-band digit received
    Dtmf(char),
    /// The engine closed the channel
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct OpenChannelOptions {
    /// Pre-bind the channel to a known remote endpoint
    pub remote: Option<SocketAddr>,
    pub payload_type: Option<u8>,
}

/// One engine channel, exclusively owned by a call leg
#[async_trait]
pub trait MediaChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Local address/port the channel is bound to (advertised in SDP)
    fn local_addr(&self) -> SocketAddr;

    async fn set_remote(&self, addr: SocketAddr, payload_type: u8) -> Result<(), MediaError>;

    async fn set_direction(&self, direction: MediaDirection) -> Result<(), MediaError>;

    /// Play a prompt (e.g. hold music) into the channel
    async fn play(&self, prompt: &str) -> Result<(), MediaError>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Open a channel, yielding its control handle and event stream
    async fn open_channel(
        &self,
        options: OpenChannelOptions,
    ) -> Result<(Box<dyn MediaChannel>, mpsc::Receiver<MediaEvent>), MediaError>;

    /// Mix two channels together (bridge audio)
    async fn mix(&self, a: ChannelId, b: ChannelId) -> Result<(), MediaError>;

    /// Detach a channel from whatever it is mixed with
    async fn unmix(&self, id: ChannelId) -> Result<(), MediaError>;
}
