//! Interchange format for persisted DNS answers: a JSON array of
//! base64-encoded wire-format messages. Each message is preceded by a
//! human-readable `;qname class type` entry, which loaders skip.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hickory_resolver::proto::op::Message;
use hickory_resolver::proto::ProtoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("dump is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("entry is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("entry is not a DNS message: {0}")]
    Wire(#[from] ProtoError),
}

/// An ordered set of cached DNS responses.
#[derive(Debug, Default)]
pub struct CacheDump {
    pub messages: Vec<Message>,
}

impl CacheDump {
    pub fn new(messages: Vec<Message>) -> CacheDump {
        CacheDump { messages }
    }

    /// Serializes to the dump format.
    pub fn to_json(&self) -> Result<String, DumpError> {
        let mut entries: Vec<String> = Vec::with_capacity(self.messages.len() * 2);
        for msg in &self.messages {
            if let Some(q) = msg.queries().first() {
                entries.push(format!(";{} {} {}", q.name(), q.query_class(), q.query_type()));
            }
            entries.push(BASE64.encode(msg.to_vec()?));
        }
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    /// Parses the dump format, skipping `;` comment entries.
    pub fn from_json(input: &str) -> Result<CacheDump, DumpError> {
        if input.trim() == "null" {
            return Ok(CacheDump::default());
        }
        let entries: Vec<String> = serde_json::from_str(input)?;
        let mut messages = Vec::new();
        for entry in entries {
            if entry.starts_with(';') {
                continue;
            }
            let wire = BASE64.decode(entry)?;
            messages.push(Message::from_vec(&wire)?);
        }
        Ok(CacheDump { messages })
    }
}
