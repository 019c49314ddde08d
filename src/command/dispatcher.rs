//! Command dispatch with acknowledgement and bounded retry.
//!
//! Every transmission of one command carries the same sequence number, so a
//! receiver that already executed it only re-acks. `retry_count` is the total
//! number of transmissions; after the last ack wait expires the caller gets a
//! `CommandDeliveryError` and must keep its state unchanged.

use std::fmt;
use std::time::{Duration, Instant};

use crate::command::link::DroneLink;
use crate::command::message::{encode_command, CommandMessage, CommandSequencer, CommandType};
use crate::tracker::TargetId;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(250);
pub const DEFAULT_RETRY_COUNT: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub ack_timeout: Duration,
    pub retry_count: u32,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub sequence_number: u64,
    pub command_type: CommandType,
    pub attempts: u32,
    pub round_trip: Duration,
}

/// A command was not acknowledged within the retry budget.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandDeliveryError {
    pub command_type: CommandType,
    pub sequence_number: u64,
    pub target_ref: Option<TargetId>,
    pub attempts: u32,
    /// Last transport error, if any attempt failed before the ack wait.
    pub last_error: Option<String>,
}

impl fmt::Display for CommandDeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "COMMAND_DELIVERY_FAILED: {} seq={} not acknowledged after {} attempt(s)",
            self.command_type.as_str(),
            self.sequence_number,
            self.attempts
        )?;
        if let Some(target) = self.target_ref {
            write!(f, " (target {})", target)?;
        }
        if let Some(err) = &self.last_error {
            write!(f, ": {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandDeliveryError {}

pub type DispatchResult = Result<DispatchReceipt, CommandDeliveryError>;

pub struct CommandDispatcher {
    link: Box<dyn DroneLink>,
    policy: DispatchPolicy,
    sequencer: CommandSequencer,
}

impl CommandDispatcher {
    pub fn new(
        link: Box<dyn DroneLink>,
        policy: DispatchPolicy,
        sequencer: CommandSequencer,
    ) -> Self {
        Self {
            link,
            policy,
            sequencer,
        }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    pub fn session_id(&self) -> &str {
        self.sequencer.session_id()
    }

    pub fn link_name(&self) -> &'static str {
        self.link.name()
    }

    /// Allocate the next sequence number for a command.
    pub fn issue(
        &mut self,
        command_type: CommandType,
        target_ref: Option<TargetId>,
    ) -> CommandMessage {
        self.sequencer.issue(command_type, target_ref, crate::now_ms())
    }

    /// Issue and deliver in one step.
    pub fn send(
        &mut self,
        command_type: CommandType,
        target_ref: Option<TargetId>,
    ) -> DispatchResult {
        let message = self.issue(command_type, target_ref);
        self.dispatch(&message)
    }

    /// Deliver `message`, retransmitting unchanged until acked or out of attempts.
    pub fn dispatch(&mut self, message: &CommandMessage) -> DispatchResult {
        let max_attempts = self.policy.retry_count.max(1);
        let frame = match encode_command(message) {
            Ok(frame) => frame,
            Err(e) => return Err(self.delivery_error(message, 0, Some(e.to_string()))),
        };

        let started = Instant::now();
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                log::warn!(
                    "retrying {} seq={} (attempt {}/{})",
                    message.command_type.as_str(),
                    message.sequence_number,
                    attempt,
                    max_attempts
                );
            }
            if let Err(e) = self.link.send(&frame) {
                log::warn!("{} link send failed: {}", self.link.name(), e);
                last_error = Some(e.to_string());
                continue;
            }
            let deadline = Instant::now() + self.policy.ack_timeout;
            match self.link.await_ack(message, deadline) {
                Ok(Some(_)) => {
                    let receipt = DispatchReceipt {
                        sequence_number: message.sequence_number,
                        command_type: message.command_type,
                        attempts: attempt,
                        round_trip: started.elapsed(),
                    };
                    log::debug!(
                        "{} seq={} acked after {} attempt(s)",
                        message.command_type.as_str(),
                        message.sequence_number,
                        attempt
                    );
                    return Ok(receipt);
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("{} link ack wait failed: {}", self.link.name(), e);
                    last_error = Some(e.to_string());
                }
            }
        }

        let err = self.delivery_error(message, max_attempts, last_error);
        log::error!("{}", err);
        Err(err)
    }

    pub fn close(&mut self) -> anyhow::Result<()> {
        self.link.close()
    }

    fn delivery_error(
        &self,
        message: &CommandMessage,
        attempts: u32,
        last_error: Option<String>,
    ) -> CommandDeliveryError {
        CommandDeliveryError {
            command_type: message.command_type,
            sequence_number: message.sequence_number,
            target_ref: message.target_ref,
            attempts,
            last_error,
        }
    }
}
