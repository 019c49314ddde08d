//! Command messages and their wire format.
//!
//! A command travels as one JSON object:
//!
//! ```text
//! {"body":{"session_id":"…","sequence_number":7,"command_type":"RELEASE_PAYLOAD",
//!          "issued_at_ms":1712345678901,"target_ref":3},
//!  "digest":"<hex sha256 of the serialized body>"}
//! ```
//!
//! The receiver recomputes the digest and drops frames that do not match.
//! Acks are `{"session_id":"…","sequence_number":7}`.

use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tracker::TargetId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    ReleasePayload,
    Halt,
    Resume,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReleasePayload => "RELEASE_PAYLOAD",
            Self::Halt => "HALT",
            Self::Resume => "RESUME",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub session_id: String,
    pub sequence_number: u64,
    pub command_type: CommandType,
    pub issued_at_ms: u64,
    pub target_ref: Option<TargetId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub session_id: String,
    pub sequence_number: u64,
}

impl Ack {
    pub fn acknowledges(&self, message: &CommandMessage) -> bool {
        self.session_id == message.session_id && self.sequence_number == message.sequence_number
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    body: CommandMessage,
    digest: String,
}

/// Issues strictly increasing sequence numbers for one session.
pub struct CommandSequencer {
    session_id: String,
    next_sequence: u64,
}

impl CommandSequencer {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            next_sequence: 1,
        }
    }

    /// Fresh random session id.
    pub fn random() -> Self {
        Self::new(random_session_id())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn issue(
        &mut self,
        command_type: CommandType,
        target_ref: Option<TargetId>,
        issued_at_ms: u64,
    ) -> CommandMessage {
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        CommandMessage {
            session_id: self.session_id.clone(),
            sequence_number,
            command_type,
            issued_at_ms,
            target_ref,
        }
    }
}

pub fn random_session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn body_digest(body: &CommandMessage) -> Result<String> {
    let bytes = serde_json::to_vec(body)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub fn encode_command(message: &CommandMessage) -> Result<Vec<u8>> {
    let envelope = Envelope {
        digest: body_digest(message)?,
        body: message.clone(),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub fn decode_command(frame: &[u8]) -> Result<CommandMessage> {
    let envelope: Envelope =
        serde_json::from_slice(frame).map_err(|e| anyhow!("malformed command frame: {}", e))?;
    let expected = body_digest(&envelope.body)?;
    if expected != envelope.digest {
        return Err(anyhow!(
            "command frame digest mismatch for sequence {}",
            envelope.body.sequence_number
        ));
    }
    Ok(envelope.body)
}

pub fn encode_ack(ack: &Ack) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(ack)?)
}

pub fn decode_ack(frame: &[u8]) -> Result<Ack> {
    serde_json::from_slice(frame).map_err(|e| anyhow!("malformed ack frame: {}", e))
}
