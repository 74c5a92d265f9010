//! Call-control configuration
//!
//! Typed settings with explicit override precedence: per-call options
//! override per-leg options, which override these global defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When the local offer is sent on an outbound leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationMode {
    /// Offer before the remote answer is known
    Early,
    /// Defer the offer until the remote's answer carries one
    Late,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtmfConfig {
    pub enabled: bool,
    /// Default telephone-event payload type, overridden per session by
    /// whatever the remote offer announces
    pub payload_type: u8,
}

impl Default for DtmfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            payload_type: 101,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Global codec preference list, most preferred first
    pub codec_prefs: String,
    pub negotiation: NegotiationMode,
    /// No-answer timeout for outbound legs
    pub no_answer_timeout: Duration,
    /// Session-refresh interval while established; `None` disables
    pub session_refresh_interval: Option<Duration>,
    pub auth_timeout: Duration,
    pub dtmf: DtmfConfig,
    /// Prompt played to the peer while this side holds
    pub hold_music: Option<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            codec_prefs: "pcmu pcma g722".to_string(),
            negotiation: NegotiationMode::Early,
            no_answer_timeout: Duration::from_secs(32),
            session_refresh_interval: Some(Duration::from_secs(600)),
            auth_timeout: Duration::from_secs(30),
            dtmf: DtmfConfig::default(),
            hold_music: None,
        }
    }
}

/// Per-dial overrides (outbound leg creation)
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub codec_prefs: Option<String>,
    pub negotiation: Option<NegotiationMode>,
    pub no_answer_timeout: Option<Duration>,
}

impl DialOptions {
    pub fn codec_prefs<'a>(&'a self, config: &'a CallConfig) -> &'a str {
        self.codec_prefs.as_deref().unwrap_or(&config.codec_prefs)
    }

    pub fn negotiation(&self, config: &CallConfig) -> NegotiationMode {
        self.negotiation.unwrap_or(config.negotiation)
    }

    pub fn no_answer_timeout(&self, config: &CallConfig) -> Duration {
        self.no_answer_timeout.unwrap_or(config.no_answer_timeout)
    }
}

/// Per-answer overrides
#[derive(Debug, Clone, Default)]
pub struct AnswerOptions {
    pub codec_prefs: Option<String>,
    pub dtmf: Option<bool>,
}

impl AnswerOptions {
    /// Effective preference list: answer-level override first, then a
    /// leg-level narrowed list, then the global default.
    pub fn codec_prefs<'a>(
        &'a self,
        leg_override: Option<&'a str>,
        config: &'a CallConfig,
    ) -> &'a str {
        self.codec_prefs
            .as_deref()
            .or(leg_override)
            .unwrap_or(&config.codec_prefs)
    }

    pub fn dtmf_enabled(&self, config: &CallConfig) -> bool {
        self.dtmf.unwrap_or(config.dtmf.enabled)
    }
}
