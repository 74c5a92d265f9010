//! SDP (Session Description Protocol) handling
//!
//! Parses and builds session descriptions and keeps the per-session
//! codec-name/payload-type table that codec negotiation runs against.

pub mod negotiator;

pub use negotiator::{Codec, CodecNegotiator};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Null connection address, used by old-style hold offers
pub const NULL_ADDRESS: &str = "0.0.0.0";

/// Process-wide session-id counter. Wraps at 2^32; this is a re-offer
/// disambiguator, not a security token.
static SESSION_ID: AtomicU32 = AtomicU32::new(1);

fn next_session_id() -> u32 {
    SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_attr(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    pub fn from_attr(attr: &str) -> Option<Self> {
        match attr {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }
}

/// Bidirectional codec-name/payload-type table. Seeded with the static
/// assignments and updated with dynamic mappings observed in a remote
/// offer's rtpmap lines.
#[derive(Debug, Clone)]
pub struct PayloadMap {
    by_name: HashMap<String, u8>,
    by_pt: HashMap<u8, String>,
    clock_rates: HashMap<String, u32>,
}

impl PayloadMap {
    pub fn with_defaults() -> Self {
        let mut map = Self {
            by_name: HashMap::new(),
            by_pt: HashMap::new(),
            clock_rates: HashMap::new(),
        };
        for (name, pt, rate) in [
            ("pcmu", 0u8, 8000u32),
            ("pcma", 8, 8000),
            ("g722", 9, 8000),
            ("g729", 18, 8000),
            // Dynamic defaults, overridden by whatever the offer announces
            ("telephone-event", 101, 8000),
            ("ilbc", 102, 8000),
        ] {
            map.learn(pt, name, rate);
        }
        map
    }

    /// Record a mapping, displacing any previous entry for either key
    pub fn learn(&mut self, pt: u8, name: &str, clock_rate: u32) {
        let name = name.to_ascii_lowercase();
        if let Some(old_pt) = self.by_name.insert(name.clone(), pt) {
            if old_pt != pt {
                self.by_pt.remove(&old_pt);
            }
        }
        if let Some(old_name) = self.by_pt.insert(pt, name.clone()) {
            if old_name != name {
                self.by_name.remove(&old_name);
            }
        }
        self.clock_rates.insert(name, clock_rate);
    }

    pub fn payload_type(&self, name: &str) -> Option<u8> {
        self.by_name.get(&name.to_ascii_lowercase()).copied()
    }

    pub fn name(&self, pt: u8) -> Option<&str> {
        self.by_pt.get(&pt).map(|s| s.as_str())
    }

    pub fn clock_rate(&self, name: &str) -> u32 {
        self.clock_rates
            .get(&name.to_ascii_lowercase())
            .copied()
            .unwrap_or(8000)
    }
}

impl Default for PayloadMap {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[derive(Debug, Clone)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    /// Payload-type list, emitted space-separated on the m= line
    pub payloads: Vec<u8>,
    /// (payload type, encoding) pairs from rtpmap lines
    pub rtpmap: Vec<(u8, String)>,
    /// (payload type, parameters) pairs from fmtp lines
    pub fmtp: Vec<(u8, String)>,
    pub direction: Option<MediaDirection>,
    /// ICE/DTLS/SSRC and other attributes carried through verbatim
    pub extra_attributes: Vec<String>,
}

impl SdpMedia {
    pub fn fmtp_for(&self, pt: u8) -> Option<&str> {
        self.fmtp
            .iter()
            .find(|(p, _)| *p == pt)
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed or locally constructed session description
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: String,
    pub media: Vec<SdpMedia>,
    payloads: PayloadMap,
    /// Codec recorded by a select-first negotiation pass
    pub selected_codec: Option<Codec>,
}

impl SdpSession {
    /// Parse a wire-format session description. The payload table starts
    /// from the static defaults and is overridden by every dynamic codec
    /// announcement the offer carries.
    pub fn parse(text: &str) -> Option<Self> {
        let mut origin: Option<SdpOrigin> = None;
        let mut session_name = String::new();
        let mut connection = String::new();
        let mut media: Vec<SdpMedia> = Vec::new();
        let mut current: Option<SdpMedia> = None;
        let mut payloads = PayloadMap::with_defaults();

        for line in text.lines() {
            let line = line.trim_end_matches('\r').trim();
            if line.len() < 2 || line.as_bytes().get(1) != Some(&b'=') {
                continue;
            }
            let (field, value) = line.split_at(2);
            let value = value.trim();

            match field {
                "o=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin = Some(SdpOrigin {
                            username: parts[0].to_string(),
                            session_id: parts[1].to_string(),
                            session_version: parts[2].to_string(),
                            address: parts[5].to_string(),
                        });
                    }
                }
                "s=" => session_name = value.to_string(),
                "c=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        let addr = parts[2].to_string();
                        // A media-level connection only matters here when
                        // it is the null address of an old-style hold
                        if current.is_none() || addr == NULL_ADDRESS {
                            connection = addr;
                        }
                    }
                }
                "m=" => {
                    if let Some(m) = current.take() {
                        media.push(m);
                    }
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 4 {
                        current = Some(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].parse().unwrap_or(0),
                            protocol: parts[2].to_string(),
                            payloads: parts[3..]
                                .iter()
                                .filter_map(|p| p.parse().ok())
                                .collect(),
                            rtpmap: Vec::new(),
                            fmtp: Vec::new(),
                            direction: None,
                            extra_attributes: Vec::new(),
                        });
                    }
                }
                "a=" => {
                    let target = current.as_mut();
                    if let Some(rest) = value.strip_prefix("rtpmap:") {
                        if let Some((pt_str, encoding)) = rest.split_once(' ') {
                            if let Ok(pt) = pt_str.parse::<u8>() {
                                let mut enc_parts = encoding.split('/');
                                let name = enc_parts.next().unwrap_or("");
                                let rate = enc_parts
                                    .next()
                                    .and_then(|r| r.parse().ok())
                                    .unwrap_or(8000);
                                payloads.learn(pt, name, rate);
                                if let Some(m) = target {
                                    m.rtpmap.push((pt, encoding.to_string()));
                                }
                            }
                        }
                    } else if let Some(rest) = value.strip_prefix("fmtp:") {
                        if let Some((pt_str, params)) = rest.split_once(' ') {
                            if let (Ok(pt), Some(m)) = (pt_str.parse::<u8>(), target) {
                                m.fmtp.push((pt, params.to_string()));
                            }
                        }
                    } else if let Some(direction) = MediaDirection::from_attr(value) {
                        if let Some(m) = target {
                            m.direction = Some(direction);
                        }
                    } else if let Some(m) = target {
                        m.extra_attributes.push(value.to_string());
                    }
                }
                _ => {}
            }
        }
        if let Some(m) = current.take() {
            media.push(m);
        }

        Some(Self {
            origin: origin?,
            session_name,
            connection,
            media,
            payloads,
            selected_codec: None,
        })
    }

    /// Construct a local audio session description
    pub fn audio_session(
        address: &str,
        port: u16,
        codecs: &[Codec],
        dtmf_payload: Option<u8>,
        direction: MediaDirection,
    ) -> Self {
        let mut payloads = PayloadMap::with_defaults();
        let mut pts: Vec<u8> = Vec::new();
        let mut rtpmap: Vec<(u8, String)> = Vec::new();
        let mut fmtp: Vec<(u8, String)> = Vec::new();

        for codec in codecs {
            payloads.learn(codec.payload_type, &codec.name, codec.clock_rate);
            pts.push(codec.payload_type);
            rtpmap.push((codec.payload_type, codec.encoding()));
        }
        if let Some(pt) = dtmf_payload {
            payloads.learn(pt, "telephone-event", 8000);
            pts.push(pt);
            rtpmap.push((pt, "telephone-event/8000".to_string()));
            fmtp.push((pt, "0-16".to_string()));
        }

        Self {
            origin: SdpOrigin {
                username: "trunkline".to_string(),
                session_id: next_session_id().to_string(),
                session_version: "1".to_string(),
                address: address.to_string(),
            },
            session_name: "call".to_string(),
            connection: address.to_string(),
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port,
                protocol: "RTP/AVP".to_string(),
                payloads: pts,
                rtpmap,
                fmtp,
                direction: Some(direction),
                extra_attributes: Vec::new(),
            }],
            payloads,
            selected_codec: None,
        }
    }

    /// Serialize to wire format. The payload list is always emitted as
    /// bare integers separated by single spaces.
    pub fn build(&self) -> String {
        let mut sdp = String::new();
        sdp.push_str("v=0\r\n");
        sdp.push_str(&format!(
            "o={} {} {} IN IP4 {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.address
        ));
        sdp.push_str(&format!("s={}\r\n", self.session_name));
        sdp.push_str(&format!("c=IN IP4 {}\r\n", self.connection));
        sdp.push_str("t=0 0\r\n");

        for media in &self.media {
            let payload_list: Vec<String> =
                media.payloads.iter().map(|p| p.to_string()).collect();
            sdp.push_str(&format!(
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                payload_list.join(" ")
            ));
            for (pt, encoding) in &media.rtpmap {
                sdp.push_str(&format!("a=rtpmap:{} {}\r\n", pt, encoding));
            }
            for (pt, params) in &media.fmtp {
                sdp.push_str(&format!("a=fmtp:{} {}\r\n", pt, params));
            }
            for attr in &media.extra_attributes {
                sdp.push_str(&format!("a={}\r\n", attr));
            }
            if let Some(direction) = media.direction {
                sdp.push_str(&format!("a={}\r\n", direction.as_attr()));
            }
        }
        sdp
    }

    pub fn audio(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    pub fn payloads(&self) -> &PayloadMap {
        &self.payloads
    }

    /// Effective audio direction; absent attribute means sendrecv
    pub fn direction(&self) -> MediaDirection {
        self.audio()
            .and_then(|m| m.direction)
            .unwrap_or(MediaDirection::SendRecv)
    }

    /// An offer is a hold request when its direction is inactive or its
    /// connection address is the null address.
    pub fn is_hold_request(&self) -> bool {
        self.direction() == MediaDirection::Inactive || self.connection == NULL_ADDRESS
    }

    /// Remote media endpoint advertised by this description
    pub fn remote_endpoint(&self) -> Option<std::net::SocketAddr> {
        let audio = self.audio()?;
        let addr: std::net::IpAddr = self.connection.parse().ok()?;
        Some(std::net::SocketAddr::new(addr, audio.port))
    }

    /// Flip the audio direction, bumping the session version
    pub fn set_direction(&mut self, direction: MediaDirection) {
        if let Some(m) = self.media.iter_mut().find(|m| m.media_type == "audio") {
            m.direction = Some(direction);
        }
        if let Ok(v) = self.origin.session_version.parse::<u64>() {
            self.origin.session_version = (v + 1).to_string();
        }
    }
}
