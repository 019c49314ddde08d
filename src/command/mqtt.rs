use anyhow::{anyhow, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::command::link::{split_host_port, DroneLink};
use crate::command::message::{decode_ack, Ack, CommandMessage};

/// Command channel through an MQTT broker bridged to the flight controller.
///
/// Commands go to `{prefix}/command`, acks come back on `{prefix}/ack`. Both
/// use QoS 1. The ack subscription is renewed on every (re)connect; a broker
/// outage shows up as ack timeouts until the connection comes back.
pub struct MqttLink {
    client: Client,
    command_topic: String,
    acks: Receiver<Vec<u8>>,
    closing: Arc<AtomicBool>,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

impl MqttLink {
    pub fn connect(addr: &str, topic_prefix: &str, client_id: &str) -> Result<Self> {
        let (host, port) = split_host_port(addr)?;
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);

        let (client, connection) = Client::new(options, 10);
        let prefix = topic_prefix.trim_end_matches('/');
        let command_topic = format!("{}/command", prefix);
        let ack_topic = format!("{}/ack", prefix);

        let (tx, rx) = mpsc::channel();
        let closing = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection(
            connection,
            client.clone(),
            ack_topic.clone(),
            tx,
            closing.clone(),
        );
        log::info!(
            "mqtt link to {} (commands on {}, acks on {})",
            addr,
            command_topic,
            ack_topic
        );
        Ok(Self {
            client,
            command_topic,
            acks: rx,
            closing,
            connection_handle: Some(handle),
        })
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }
}

/// What the connection thread does after one event.
#[derive(Debug, PartialEq, Eq)]
enum Forward {
    Continue,
    /// Connection dropped; wait, then poll again so rumqttc reconnects.
    Backoff,
    Stop,
}

fn spawn_connection(
    mut connection: Connection,
    client: Client,
    ack_topic: String,
    tx: Sender<Vec<u8>>,
    closing: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for event in connection.iter() {
            let step = match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    if let Err(e) = client.try_subscribe(ack_topic.as_str(), QoS::AtLeastOnce) {
                        log::error!("mqtt subscribe to {} failed: {}", ack_topic, e);
                    }
                    Forward::Continue
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    forward_publish(&publish.topic, &publish.payload, &ack_topic, &tx)
                }
                Ok(_) => Forward::Continue,
                Err(e) => connection_lost(&e, &closing),
            };
            match step {
                Forward::Continue => {}
                Forward::Backoff => std::thread::sleep(RECONNECT_DELAY),
                Forward::Stop => break,
            }
        }
    })
}

fn forward_publish(
    topic: &[u8],
    payload: &[u8],
    ack_topic: &str,
    tx: &Sender<Vec<u8>>,
) -> Forward {
    let topic = match std::str::from_utf8(topic) {
        Ok(topic) => topic,
        Err(e) => {
            log::warn!("skipping publish with invalid topic: {}", e);
            return Forward::Continue;
        }
    };
    if topic != ack_topic {
        return Forward::Continue;
    }
    match tx.send(payload.to_vec()) {
        Ok(()) => Forward::Continue,
        Err(_) => Forward::Stop,
    }
}

fn connection_lost(err: &impl Display, closing: &AtomicBool) -> Forward {
    if closing.load(Ordering::SeqCst) {
        return Forward::Stop;
    }
    log::error!("mqtt connection error: {}. Reconnecting...", err);
    Forward::Backoff
}

impl DroneLink for MqttLink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.client
            .publish(
                self.command_topic.as_str(),
                QoS::AtLeastOnce,
                false,
                frame.to_vec(),
            )
            .map_err(|e| anyhow!("mqtt publish failed: {}", e))
    }

    fn await_ack(&mut self, message: &CommandMessage, deadline: Instant) -> Result<Option<Ack>> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.acks.recv_timeout(remaining) {
                Ok(payload) => match decode_ack(&payload) {
                    Ok(ack) if ack.acknowledges(message) => return Ok(Some(ack)),
                    Ok(_) => {}
                    Err(e) => log::warn!("mqtt link dropped ack: {}", e),
                },
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("mqtt connection closed"))
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.client.disconnect()?;
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}
