//! Shared value objects

use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

/// Identity of a signaling dialog: call-id plus the local/remote tag pair.
///
/// Tags start out unset and are filled in as the dialog is negotiated, so
/// equality checks must treat an unset stored tag as a wildcard (see
/// [`DialogId::matches`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: Option<String>,
    pub remote_tag: Option<String>,
}

impl DialogId {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: None,
            remote_tag: None,
        }
    }

    pub fn with_tags(
        call_id: impl Into<String>,
        local_tag: Option<String>,
        remote_tag: Option<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag,
            remote_tag,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.call_id.is_empty()
    }

    /// Dialog matching: call-ids must be equal and each stored tag must
    /// either match the queried tag exactly or still be unset on the stored
    /// side. This lets a lookup find a dialog whose tags are not fully
    /// known yet.
    pub fn matches(&self, query: &DialogId) -> bool {
        if self.call_id != query.call_id {
            return false;
        }
        tag_matches(&self.local_tag, &query.local_tag)
            && tag_matches(&self.remote_tag, &query.remote_tag)
    }
}

fn tag_matches(stored: &Option<String>, query: &Option<String>) -> bool {
    match stored {
        None => true,
        Some(tag) => query.as_deref() == Some(tag.as_str()),
    }
}

/// Generate a dialog tag
pub fn generate_tag() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

/// Resolved caller identity, populated after authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub username: String,
    pub realm: String,
    pub uri: String,
    pub display_name: Option<String>,
}

impl CallerIdentity {
    pub fn new(username: impl Into<String>, realm: impl Into<String>) -> Self {
        let username = username.into();
        let realm = realm.into();
        let uri = format!("sip:{}@{}", username, realm);
        Self {
            username,
            realm,
            uri,
            display_name: None,
        }
    }
}

/// A dial/transfer target URI. Construction validates that both a user and
/// a host part are present.
#[derive(Debug, Clone)]
pub struct TargetUri {
    uri: rsip::Uri,
    user: String,
    host: String,
}

impl TargetUri {
    pub fn parse(raw: &str) -> Option<Self> {
        let uri = rsip::Uri::try_from(raw).ok()?;
        let user = uri.auth.as_ref().map(|a| a.user.clone())?;
        if user.is_empty() {
            return None;
        }
        let host = uri.host_with_port.host.to_string();
        if host.is_empty() {
            return None;
        }
        Some(Self { uri, user, host })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn uri(&self) -> &rsip::Uri {
        &self.uri
    }
}

impl std::fmt::Display for TargetUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uri)
    }
}
