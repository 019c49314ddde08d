use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::command::message::{decode_ack, decode_command, encode_ack, Ack, CommandMessage};
use crate::command::receiver::{CommandReceiver, ReceiveOutcome};

/// Transport to the drone's command channel.
///
/// # Blocking contract
///
/// `await_ack` is the only blocking call in a frame tick and must return by
/// `deadline`, with `Ok(None)` when no matching ack arrived. Acks for other
/// sequence numbers or sessions are discarded.
pub trait DroneLink: Send {
    /// Link identifier for logs.
    fn name(&self) -> &'static str;

    /// Transmit one encoded command frame.
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Wait for the ack of `message` until `deadline`.
    fn await_ack(&mut self, message: &CommandMessage, deadline: Instant) -> Result<Option<Ack>>;

    /// Release transport resources.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkKind {
    Loopback,
    Udp,
    Mqtt,
}

impl LinkKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "loopback" => Ok(Self::Loopback),
            "udp" => Ok(Self::Udp),
            "mqtt" => Ok(Self::Mqtt),
            other => Err(anyhow!(
                "unknown link kind '{}' (expected loopback, udp or mqtt)",
                other
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loopback => "loopback",
            Self::Udp => "udp",
            Self::Mqtt => "mqtt",
        }
    }
}

/// Split `host:port`. IPv6 hosts must be bracketed.
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let addr = addr.trim();
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("unterminated IPv6 address in '{}'", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing port in '{}'", addr))?;
        (host, port)
    } else {
        addr.rsplit_once(':')
            .ok_or_else(|| anyhow!("missing port in '{}'", addr))?
    };
    if host.is_empty() {
        return Err(anyhow!("missing host in '{}'", addr));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("invalid port in '{}'", addr))?;
    Ok((host.to_string(), port))
}

/// Faults injected into a loopback link.
#[derive(Clone, Debug, Default)]
pub struct LoopbackFaults {
    /// Swallow this many acks before answering again.
    pub drop_next_acks: u32,
    /// Swallow every ack.
    pub silent: bool,
    /// Fail this many sends at the transport level.
    pub fail_next_sends: u32,
}

/// In-process drone: decodes frames, applies the receiver contract, and acks.
///
/// Used for bench runs and tests. Acks are available immediately, so a missing
/// ack can never arrive later and `await_ack` returns without sleeping.
pub struct LoopbackLink {
    receiver: Arc<Mutex<CommandReceiver>>,
    faults: Arc<Mutex<LoopbackFaults>>,
    pending_acks: VecDeque<Vec<u8>>,
}

/// Inspection and fault-injection handle for a `LoopbackLink`.
#[derive(Clone)]
pub struct LoopbackHandle {
    receiver: Arc<Mutex<CommandReceiver>>,
    faults: Arc<Mutex<LoopbackFaults>>,
}

impl LoopbackLink {
    pub fn new() -> Self {
        Self {
            receiver: Arc::new(Mutex::new(CommandReceiver::new())),
            faults: Arc::new(Mutex::new(LoopbackFaults::default())),
            pending_acks: VecDeque::new(),
        }
    }

    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            receiver: self.receiver.clone(),
            faults: self.faults.clone(),
        }
    }
}

impl Default for LoopbackLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHandle {
    pub fn executed(&self) -> Result<Vec<CommandMessage>> {
        let guard = self
            .receiver
            .lock()
            .map_err(|_| anyhow!("loopback receiver lock poisoned"))?;
        Ok(guard.executed().to_vec())
    }

    pub fn duplicates(&self) -> Result<u64> {
        let guard = self
            .receiver
            .lock()
            .map_err(|_| anyhow!("loopback receiver lock poisoned"))?;
        Ok(guard.duplicates())
    }

    pub fn set_faults(&self, faults: LoopbackFaults) -> Result<()> {
        let mut guard = self
            .faults
            .lock()
            .map_err(|_| anyhow!("loopback fault lock poisoned"))?;
        *guard = faults;
        Ok(())
    }
}

impl DroneLink for LoopbackLink {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        {
            let mut faults = self
                .faults
                .lock()
                .map_err(|_| anyhow!("loopback fault lock poisoned"))?;
            if faults.fail_next_sends > 0 {
                faults.fail_next_sends -= 1;
                return Err(anyhow!("loopback transport refused frame"));
            }
        }

        let message = decode_command(frame)?;
        let (outcome, ack) = {
            let mut receiver = self
                .receiver
                .lock()
                .map_err(|_| anyhow!("loopback receiver lock poisoned"))?;
            receiver.accept(message)
        };
        if outcome == ReceiveOutcome::Stale {
            log::debug!("loopback dropped stale command");
        }

        let Some(ack) = ack else {
            return Ok(());
        };
        let mut faults = self
            .faults
            .lock()
            .map_err(|_| anyhow!("loopback fault lock poisoned"))?;
        if faults.silent {
            return Ok(());
        }
        if faults.drop_next_acks > 0 {
            faults.drop_next_acks -= 1;
            return Ok(());
        }
        self.pending_acks.push_back(encode_ack(&ack)?);
        Ok(())
    }

    fn await_ack(&mut self, message: &CommandMessage, _deadline: Instant) -> Result<Option<Ack>> {
        while let Some(frame) = self.pending_acks.pop_front() {
            let ack = decode_ack(&frame)?;
            if ack.acknowledges(message) {
                return Ok(Some(ack));
            }
        }
        Ok(None)
    }
}
