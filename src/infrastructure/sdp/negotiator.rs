//! Codec negotiation
//!
//! Computes the codec intersection between a remote session description
//! and a caller-supplied preference list. The caller's ordering wins.

use tracing::debug;

use super::{PayloadMap, SdpSession};

/// iLBC frame mode (ms) the media path supports
const ILBC_SUPPORTED_MODE: u32 = 20;

/// Codec information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
    /// Canonical lower-case name
    pub name: String,
    pub payload_type: u8,
    pub clock_rate: u32,
}

impl Codec {
    pub fn new(name: &str, payload_type: u8, clock_rate: u32) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            payload_type,
            clock_rate,
        }
    }

    /// Encoding name for rtpmap, e.g. `PCMA/8000`
    pub fn encoding(&self) -> String {
        let upper = match self.name.as_str() {
            "pcmu" => "PCMU",
            "pcma" => "PCMA",
            "g722" => "G722",
            "g729" => "G729",
            "ilbc" => "iLBC",
            "telephone-event" => "telephone-event",
            other => return format!("{}/{}", other, self.clock_rate),
        };
        format!("{}/{}", upper, self.clock_rate)
    }
}

/// Codec negotiator
pub struct CodecNegotiator {
    /// Audio codecs the media path can actually carry
    supported: Vec<&'static str>,
}

impl CodecNegotiator {
    pub fn new() -> Self {
        Self {
            supported: vec!["pcmu", "pcma", "g722", "g729", "ilbc"],
        }
    }

    /// Normalize a free-text candidate list into canonical codec names.
    /// Accepts comma or whitespace separated names as well as numeric
    /// payload types (resolved through the session's payload table).
    pub fn normalize_candidates(&self, candidates: &str, map: &PayloadMap) -> Vec<String> {
        let mut names = Vec::new();
        for token in candidates.split(|c: char| c == ',' || c.is_whitespace()) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let name = match token.parse::<u8>() {
                Ok(pt) => match map.name(pt) {
                    Some(name) => name.to_string(),
                    None => continue,
                },
                Err(_) => token.to_ascii_lowercase(),
            };
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Compute the codec intersection between the session's audio offer
    /// and `candidates`. Result order follows the candidate list, so the
    /// caller's preference wins ties. Returns `None` when there is no
    /// overlap; callers must treat that differently from an empty
    /// preference match on a session they could still renegotiate.
    ///
    /// With `select_first` the result is truncated to the single best
    /// match, which is also recorded as the session's selected codec.
    pub fn intersection(
        &self,
        session: &mut SdpSession,
        candidates: &str,
        select_first: bool,
    ) -> Option<Vec<Codec>> {
        let names = self.normalize_candidates(candidates, session.payloads());
        let audio = session.audio()?;

        let mut matched: Vec<Codec> = Vec::new();
        for name in &names {
            if !self.supported.contains(&name.as_str()) {
                continue;
            }
            let Some(pt) = session.payloads().payload_type(name) else {
                continue;
            };
            if !audio.payloads.contains(&pt) {
                continue;
            }
            if name == "ilbc" && !ilbc_mode_supported(audio.fmtp_for(pt)) {
                debug!("excluding ilbc: unsupported frame mode");
                continue;
            }
            if matched.iter().any(|c| c.payload_type == pt) {
                continue;
            }
            matched.push(Codec {
                name: name.clone(),
                payload_type: pt,
                clock_rate: session.payloads().clock_rate(name),
            });
        }

        if matched.is_empty() {
            return None;
        }
        if select_first {
            matched.truncate(1);
            session.selected_codec = Some(matched[0].clone());
        }
        debug!(codecs = ?matched.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), "codec intersection");
        Some(matched)
    }
}

impl Default for CodecNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

/// A variant whose fmtp signals a frame size outside the supported range
/// is excluded; an absent mode parameter is accepted.
fn ilbc_mode_supported(fmtp: Option<&str>) -> bool {
    let Some(params) = fmtp else {
        return true;
    };
    for param in params.split(';') {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("mode=") {
            return value.trim().parse::<u32>() == Ok(ILBC_SUPPORTED_MODE);
        }
    }
    true
}
