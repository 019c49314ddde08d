use anyhow::{anyhow, Result};
use std::io::ErrorKind;
use std::net::{ToSocketAddrs, UdpSocket};
use std::time::Instant;

use crate::command::link::DroneLink;
use crate::command::message::{decode_ack, Ack, CommandMessage};

const MAX_ACK_FRAME: usize = 1024;

/// Datagram command channel (radio modem bridges and SITL simulators).
///
/// One command per datagram; the drone answers with an ack datagram.
pub struct UdpLink {
    socket: UdpSocket,
    peer: String,
}

impl UdpLink {
    pub fn connect(addr: &str) -> Result<Self> {
        let peer = addr
            .to_socket_addrs()
            .map_err(|e| anyhow!("cannot resolve drone link address {}: {}", addr, e))?
            .next()
            .ok_or_else(|| anyhow!("drone link address {} resolved to nothing", addr))?;
        let bind = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(peer)?;
        log::info!("udp link to {} bound on {}", peer, socket.local_addr()?);
        Ok(Self {
            socket,
            peer: peer.to_string(),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl DroneLink for UdpLink {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let sent = self.socket.send(frame)?;
        if sent != frame.len() {
            return Err(anyhow!(
                "udp link sent {} of {} bytes",
                sent,
                frame.len()
            ));
        }
        Ok(())
    }

    fn await_ack(&mut self, message: &CommandMessage, deadline: Instant) -> Result<Option<Ack>> {
        let mut buf = [0u8; MAX_ACK_FRAME];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(deadline - now))?;
            match self.socket.recv(&mut buf) {
                Ok(len) => match decode_ack(&buf[..len]) {
                    Ok(ack) if ack.acknowledges(message) => return Ok(Some(ack)),
                    Ok(ack) => log::debug!(
                        "udp link ignoring ack for sequence {}",
                        ack.sequence_number
                    ),
                    Err(e) => log::warn!("udp link dropped frame: {}", e),
                },
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) => return Err(anyhow!("udp link receive failed: {}", e)),
            }
        }
    }
}
