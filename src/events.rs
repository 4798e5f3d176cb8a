//! Inbound binding events from the identity service session topic.
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::error::Result;

/// One observed SGT binding: a tag name and the IPs the identity service
/// currently associates with it. Derived from a single topic message and
/// consumed once; never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub tag_name: String,
    pub ip_addresses: Vec<String>,
}

/// Blocking pull of one serialized message at a time. The receive is the
/// subscribe loop's only suspension point; a closed connection surfaces as a
/// fatal transport error.
#[async_trait]
pub trait EventSource {
    async fn next_message(&mut self) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct SessionEnvelope {
    #[serde(default)]
    sessions: Vec<SessionRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    cts_security_group: Option<String>,
    ip_addresses: Option<Vec<String>>,
}

/// Extract a binding from a session-topic message body. Messages without a
/// security group or IP list are ignored per the topic contract, as are
/// bodies we cannot decode at all.
pub fn parse_binding(body: &str) -> Option<Binding> {
    let envelope: SessionEnvelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "undecodable session message, ignoring");
            return None;
        }
    };
    let session = envelope.sessions.into_iter().next()?;
    match (session.cts_security_group, session.ip_addresses) {
        (Some(tag_name), Some(ip_addresses)) if !tag_name.is_empty() => Some(Binding {
            tag_name,
            ip_addresses,
        }),
        _ => None,
    }
}
