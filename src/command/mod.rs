//! Drone command channel: wire format, links, and acknowledged dispatch.

mod dispatcher;
mod link;
mod message;
mod mqtt;
mod receiver;
mod udp;

pub use dispatcher::{
    CommandDeliveryError, CommandDispatcher, DispatchPolicy, DispatchReceipt, DispatchResult,
    DEFAULT_ACK_TIMEOUT, DEFAULT_RETRY_COUNT,
};
pub use link::{split_host_port, DroneLink, LinkKind, LoopbackFaults, LoopbackHandle, LoopbackLink};
pub use message::{
    decode_ack, decode_command, encode_ack, encode_command, random_session_id, Ack,
    CommandMessage, CommandSequencer, CommandType,
};
pub use mqtt::MqttLink;
pub use receiver::{CommandReceiver, ReceiveOutcome, DEDUP_WINDOW};
pub use udp::UdpLink;
