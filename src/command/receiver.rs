//! Receiving side of the command link.
//!
//! Mirrors what the flight controller is expected to do: execute each
//! sequence number once, re-acknowledge every retransmission of an executed
//! command (even after newer commands have run), and drop anything older than
//! the newest executed command that was never seen. A new session id resets
//! the sequence baseline.

use std::collections::BTreeSet;

use crate::command::message::{Ack, CommandMessage};

/// How far behind the newest executed sequence number a retransmission is
/// still recognised and re-acked.
pub const DEDUP_WINDOW: u64 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// First delivery; the command was executed.
    Executed,
    /// Retransmission of an executed command; acknowledged again, not re-executed.
    Duplicate,
    /// Older than the newest executed command and never executed; dropped
    /// without an ack.
    Stale,
}

#[derive(Default)]
pub struct CommandReceiver {
    session_id: Option<String>,
    last_sequence: Option<u64>,
    executed_sequences: BTreeSet<u64>,
    executed: Vec<CommandMessage>,
    duplicates: u64,
    stale: u64,
}

impl CommandReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, message: CommandMessage) -> (ReceiveOutcome, Option<Ack>) {
        if self.session_id.as_deref() != Some(message.session_id.as_str()) {
            self.session_id = Some(message.session_id.clone());
            self.last_sequence = None;
            self.executed_sequences.clear();
        }
        let ack = Ack {
            session_id: message.session_id.clone(),
            sequence_number: message.sequence_number,
        };
        if self.executed_sequences.contains(&message.sequence_number) {
            self.duplicates += 1;
            return (ReceiveOutcome::Duplicate, Some(ack));
        }
        match self.last_sequence {
            Some(last) if message.sequence_number < last => {
                self.stale += 1;
                (ReceiveOutcome::Stale, None)
            }
            _ => {
                let sequence = message.sequence_number;
                self.last_sequence = Some(sequence);
                self.executed_sequences.insert(sequence);
                let floor = sequence.saturating_sub(DEDUP_WINDOW);
                self.executed_sequences = self.executed_sequences.split_off(&floor);
                self.executed.push(message);
                (ReceiveOutcome::Executed, Some(ack))
            }
        }
    }

    pub fn executed(&self) -> &[CommandMessage] {
        &self.executed
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn stale(&self) -> u64 {
        self.stale
    }
}
