use std::net::UdpSocket;
use std::thread;
use std::time::{Duration, Instant};

use dropzone_kernel::command::{
    decode_command, encode_ack, Ack, CommandDispatcher, CommandReceiver, CommandSequencer,
    CommandType, DispatchPolicy, LoopbackFaults, LoopbackLink, ReceiveOutcome, UdpLink,
};

fn policy(ack_timeout_ms: u64) -> DispatchPolicy {
    DispatchPolicy {
        ack_timeout: Duration::from_millis(ack_timeout_ms),
        retry_count: 3,
    }
}

/// Fake flight controller on a UDP socket. Ignores the first `drop_first`
/// datagrams, answers the rest through a `CommandReceiver`, and reports what
/// it saw once `expected` datagrams have arrived.
fn spawn_drone(
    drop_first: usize,
    expected: usize,
) -> (String, thread::JoinHandle<Vec<(u64, ReceiveOutcome)>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind drone");
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("drone timeout");
    let addr = socket.local_addr().expect("drone addr").to_string();
    let handle = thread::spawn(move || {
        let mut receiver = CommandReceiver::new();
        let mut seen = Vec::new();
        let mut buf = [0u8; 2048];
        for index in 0..expected {
            let Ok((len, peer)) = socket.recv_from(&mut buf) else {
                break;
            };
            let message = decode_command(&buf[..len]).expect("valid command frame");
            if index < drop_first {
                seen.push((message.sequence_number, ReceiveOutcome::Stale));
                continue;
            }
            // A stray ack for another sequence arrives first and must be ignored.
            let stray = Ack {
                session_id: message.session_id.clone(),
                sequence_number: message.sequence_number + 100,
            };
            socket
                .send_to(&encode_ack(&stray).unwrap(), peer)
                .expect("send stray ack");
            let sequence = message.sequence_number;
            let (outcome, ack) = receiver.accept(message);
            seen.push((sequence, outcome));
            if let Some(ack) = ack {
                socket
                    .send_to(&encode_ack(&ack).unwrap(), peer)
                    .expect("send ack");
            }
        }
        seen
    });
    (addr, handle)
}

#[test]
fn udp_dispatch_retries_with_same_sequence_number() {
    let (addr, drone) = spawn_drone(1, 2);
    let link = UdpLink::connect(&addr).expect("connect");
    let mut dispatcher =
        CommandDispatcher::new(Box::new(link), policy(200), CommandSequencer::new("udp-test"));

    let receipt = dispatcher
        .send(CommandType::ReleasePayload, Some(3))
        .expect("delivered");
    assert_eq!(receipt.attempts, 2);

    let seen = drone.join().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, seen[1].0);
    assert_eq!(seen[1].1, ReceiveOutcome::Executed);
}

#[test]
fn udp_silent_drone_fails_within_bounded_time() {
    let silent = UdpSocket::bind("127.0.0.1:0").expect("bind");
    let addr = silent.local_addr().unwrap().to_string();
    let link = UdpLink::connect(&addr).expect("connect");
    let mut dispatcher =
        CommandDispatcher::new(Box::new(link), policy(30), CommandSequencer::new("udp-test"));

    let started = Instant::now();
    let err = dispatcher.send(CommandType::Halt, None).unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.attempts, 3);
    assert_eq!(err.command_type, CommandType::Halt);
    assert!(elapsed >= Duration::from_millis(90));
    assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    drop(silent);
}

#[test]
fn sequence_numbers_increase_across_dispatches() {
    let link = LoopbackLink::new();
    let handle = link.handle();
    let mut dispatcher =
        CommandDispatcher::new(Box::new(link), policy(5), CommandSequencer::new("loop"));

    let halt = dispatcher.send(CommandType::Halt, None).unwrap();
    handle
        .set_faults(LoopbackFaults {
            drop_next_acks: 1,
            ..LoopbackFaults::default()
        })
        .unwrap();
    let resume = dispatcher.send(CommandType::Resume, None).unwrap();
    let release = dispatcher.send(CommandType::ReleasePayload, Some(1)).unwrap();

    assert!(halt.sequence_number < resume.sequence_number);
    assert!(resume.sequence_number < release.sequence_number);
    assert_eq!(resume.attempts, 2);

    let executed = handle.executed().unwrap();
    assert_eq!(executed.len(), 3);
    assert!(executed.iter().all(|m| m.session_id == "loop"));
    assert_eq!(handle.duplicates().unwrap(), 1);
}
