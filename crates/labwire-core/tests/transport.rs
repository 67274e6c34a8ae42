//! Request/response behaviour of the HCI transport against a scripted device

use byteorder::{ByteOrder, LittleEndian};
use labwire_core::config::TransportConfig;
use labwire_core::protocol::hci::{command_complete, Status};
use labwire_core::protocol::{
    memory_pair, CommandPacket, DeviceHandle, HciTransport, ProtocolError, RawTransport,
    TransportState,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn config(queue_timeout_ms: u64) -> TransportConfig {
    TransportConfig {
        read_timeout_us: 1000,
        queue_timeout_ms,
        response_timeout_ms: 300,
        ..TransportConfig::hci("bench", 115_200)
    }
}

/// `RUST_LOG=labwire_core=debug cargo test` shows the TX/RX traffic
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open(queue_timeout_ms: u64) -> (HciTransport, DeviceHandle) {
    init_logging();
    let transport = HciTransport::hci(config(queue_timeout_ms));
    let (channel, device) = memory_pair("bench");
    transport.open_with_channel(Box::new(channel)).unwrap();
    (transport, device)
}

fn wait_until(mut cond: impl FnMut() -> bool, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn opcode_of(command: &[u8]) -> u16 {
    LittleEndian::read_u16(&command[1..3])
}

#[test]
fn test_matching_response_returns_payload() {
    let (transport, device) = open(100);
    device.set_responder(|_| command_complete(0x0003, Status::Success, &[0x01, 0x02]).unwrap());

    let result = transport
        .send_command_wait_response(&CommandPacket::empty(0x0003), Duration::from_secs(1), 1)
        .unwrap();
    assert_eq!(result, Some(vec![0x01, 0x02]));
    assert_eq!(device.writes(), vec![vec![0x01, 0x03, 0x00, 0x00]]);
}

#[test]
fn test_other_opcode_fails_the_attempt() {
    let (transport, device) = open(100);
    device.set_responder(|_| command_complete(0x0004, Status::Success, &[]).unwrap());

    let start = Instant::now();
    let result = transport
        .send_command_wait_response(&CommandPacket::empty(0x0003), Duration::from_secs(2), 1)
        .unwrap();
    assert_eq!(result, None);
    assert_eq!(device.write_count(), 1);
    // The mismatching frame ends the attempt without waiting out the timeout
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_retry_exhaustion_writes_exactly_tries_times() {
    let (transport, device) = open(100);
    device.set_responder(|cmd| command_complete(opcode_of(cmd) + 1, Status::Success, &[]).unwrap());

    let result = transport
        .send_command_wait_response(&CommandPacket::empty(0x0003), Duration::from_millis(200), 3)
        .unwrap();
    assert_eq!(result, None);
    assert_eq!(device.write_count(), 3);
}

#[test]
fn test_retry_exhaustion_on_silence() {
    let (transport, device) = open(100);
    let result = transport
        .send_command_wait_response(&CommandPacket::empty(0x0003), Duration::from_millis(30), 3)
        .unwrap();
    assert_eq!(result, None);
    assert_eq!(device.write_count(), 3);
}

#[test]
fn test_second_try_can_succeed() {
    let (transport, device) = open(100);
    let mut calls = 0;
    device.set_responder(move |_| {
        calls += 1;
        if calls == 1 {
            Vec::new()
        } else {
            command_complete(0x0003, Status::Success, &[0x42]).unwrap()
        }
    });
    let result = transport
        .send_command_wait_response(&CommandPacket::empty(0x0003), Duration::from_millis(50), 3)
        .unwrap();
    assert_eq!(result, Some(vec![0x42]));
    assert_eq!(device.write_count(), 2);
}

#[test]
fn test_stale_frame_is_cleared_before_send() {
    // Long window so the monitor does not remove the stale frame first
    let (transport, device) = open(60_000);
    device.inject(&command_complete(0x0003, Status::Success, &[0xAA]).unwrap());
    assert!(wait_until(
        || transport.pending_frames().unwrap() == 1,
        Duration::from_secs(2)
    ));

    device.set_responder(|_| command_complete(0x0003, Status::Success, &[0x55]).unwrap());
    let result = transport
        .send_command_wait_response(&CommandPacket::empty(0x0003), Duration::from_secs(1), 1)
        .unwrap();
    assert_eq!(result, Some(vec![0x55]));
    assert_eq!(transport.counters().discarded_frames, 1);
}

#[test]
fn test_no_eviction_while_request_in_flight() {
    let (transport, device) = open(20);
    device.set_reply_delay(Duration::from_millis(150));
    device.set_responder(|_| {
        let mut reply = command_complete(0x0003, Status::Success, &[0x01]).unwrap();
        reply.extend(command_complete(0x0C03, Status::Success, &[]).unwrap());
        reply
    });

    let result = transport
        .send_command_wait_response(&CommandPacket::empty(0x0003), Duration::from_secs(1), 1)
        .unwrap();
    assert_eq!(result, Some(vec![0x01]));
    // The trailing frame outlived the 20 ms window while the request ran
    assert_eq!(transport.counters().discarded_frames, 0);
    assert!(wait_until(
        || transport.counters().discarded_frames == 1,
        Duration::from_secs(2)
    ));
    assert_eq!(transport.pending_frames().unwrap(), 0);
}

#[test]
fn test_monitor_evicts_and_rearms() {
    let (transport, device) = open(30);
    device.inject(&command_complete(0x0C03, Status::Success, &[]).unwrap());
    assert!(wait_until(
        || transport.counters().discarded_frames == 1,
        Duration::from_secs(2)
    ));

    device.inject(&command_complete(0x0C03, Status::Success, &[]).unwrap());
    assert!(wait_until(
        || transport.counters().discarded_frames == 2,
        Duration::from_secs(2)
    ));
    assert_eq!(transport.pending_frames().unwrap(), 0);
}

#[test]
fn test_raw_monitor_off_until_enabled() {
    let transport = RawTransport::raw(TransportConfig {
        read_timeout_us: 1000,
        queue_timeout_ms: 20,
        ..TransportConfig::raw("bench", 3_000_000)
    });
    let (channel, device) = memory_pair("bench");
    transport.open_with_channel(Box::new(channel)).unwrap();

    device.inject(b"ok\r\n");
    assert!(wait_until(
        || transport.pending_frames().unwrap() == 4,
        Duration::from_secs(2)
    ));
    thread::sleep(Duration::from_millis(80));
    assert_eq!(transport.pending_frames().unwrap(), 4);

    transport.enable_queue_monitor(true);
    assert!(wait_until(
        || transport.pending_frames().unwrap() == 0,
        Duration::from_secs(2)
    ));
    assert_eq!(transport.counters().discarded_frames, 4);
}

#[test]
fn test_corrupt_byte_before_response_is_recovered() {
    let (transport, device) = open(100);
    device.set_responder(|_| {
        let mut reply = vec![0x7E];
        reply.extend(command_complete(0x0003, Status::Success, &[0x09]).unwrap());
        reply
    });
    let result = transport
        .send_command_wait_response(&CommandPacket::empty(0x0003), Duration::from_secs(1), 1)
        .unwrap();
    assert_eq!(result, Some(vec![0x09]));
    assert_eq!(transport.counters().discarded_bytes, 1);
}

#[test]
fn test_close_during_request_returns_closed() {
    let (transport, _device) = open(100);
    let transport = Arc::new(transport);

    let requester = {
        let transport = transport.clone();
        thread::spawn(move || {
            let start = Instant::now();
            let result = transport.send_command_wait_response(
                &CommandPacket::empty(0x0003),
                Duration::from_secs(10),
                1,
            );
            (result, start.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(50));
    transport.close();
    let (result, elapsed) = requester.join().unwrap();
    assert!(matches!(result, Err(ProtocolError::Closed)));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(transport.state(), TransportState::Closed);
}

#[test]
fn test_no_writes_after_close_returns() {
    let (transport, device) = open(100);
    let transport = Arc::new(transport);
    let request = |transport: Arc<HciTransport>| {
        thread::spawn(move || {
            transport.send_command_wait_response(
                &CommandPacket::empty(0x0003),
                Duration::from_secs(2),
                1,
            )
        })
    };

    let first = request(transport.clone());
    assert!(wait_until(|| device.write_count() == 1, Duration::from_secs(2)));
    // queued behind the first on the request lock
    let second = request(transport.clone());
    thread::sleep(Duration::from_millis(60));

    transport.close();
    let writes_at_close = device.write_count();
    assert!(matches!(first.join().unwrap(), Err(ProtocolError::Closed)));
    assert!(matches!(second.join().unwrap(), Err(ProtocolError::Closed)));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(device.write_count(), writes_at_close);
    assert_eq!(writes_at_close, 1);
}

#[test]
fn test_close_accounts_for_queued_frames() {
    let (transport, device) = open(10_000);
    device.inject(&command_complete(0x0C03, Status::Success, &[]).unwrap());
    assert!(wait_until(
        || transport.pending_frames().unwrap_or(0) == 1,
        Duration::from_secs(2)
    ));
    transport.close();
    assert_eq!(transport.counters().discarded_frames, 1);
}

#[test]
fn test_requests_from_two_threads_are_serialized() {
    let (transport, device) = open(100);
    device.set_reply_delay(Duration::from_millis(20));
    device.set_responder(|cmd| {
        let op = opcode_of(cmd);
        command_complete(op, Status::Success, &op.to_le_bytes()).unwrap()
    });
    let transport = Arc::new(transport);

    let handles: Vec<_> = [0x0C03u16, 0xFC2E]
        .into_iter()
        .map(|op| {
            let transport = transport.clone();
            thread::spawn(move || {
                (0..5)
                    .map(|_| {
                        transport.send_command_wait_response(
                            &CommandPacket::empty(op),
                            Duration::from_secs(1),
                            1,
                        )
                    })
                    .all(|r| matches!(r, Ok(Some(p)) if p == op.to_le_bytes()))
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap());
    }
    assert_eq!(device.write_count(), 10);
}

#[test]
fn test_reopen_after_close() {
    let (transport, _device) = open(100);
    transport.close();
    assert!(matches!(
        transport.send_command_wait_response(&CommandPacket::empty(0x0003), Duration::ZERO, 1),
        Err(ProtocolError::NotOpen)
    ));

    let (channel, device) = memory_pair("bench");
    transport.open_with_channel(Box::new(channel)).unwrap();
    device.set_responder(|_| command_complete(0x0C03, Status::Success, &[]).unwrap());
    transport.reset().unwrap();
}
