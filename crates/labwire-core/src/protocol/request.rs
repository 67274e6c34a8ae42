//! Command/response exchange
//!
//! One command is in flight per transport at a time. Each attempt pauses the
//! queue monitor, clears the inbox, writes the command and then lets the first
//! frame to arrive decide the attempt: a frame for another opcode, or one with
//! a failure status, is logged and the attempt counts as failed.

use std::time::Duration;
use tracing::{debug, warn};

use super::decoder::{hex, FrameDecoder, WireFrame};
use super::hci::CommandPacket;
use super::transport::{MonitorPause, Transport};
use super::ProtocolError;

/// A frame that can answer a command
pub trait CommandResponse {
    /// Opcode of the command this frame completes, if it completes one
    fn response_opcode(&self) -> Option<u16>;

    /// Whether the device reported success
    fn is_success(&self) -> bool;

    /// Response bytes after the fixed header
    fn return_payload(&self) -> &[u8];
}

/// Whether `frame` is the successful response to a command with `opcode`
pub fn correlates<F: CommandResponse>(frame: &F, opcode: u16) -> bool {
    frame.response_opcode() == Some(opcode) && frame.is_success()
}

/// How a command exchange ended
enum Outcome {
    Response(Vec<u8>),
    /// At least one attempt got a frame, but never the right one
    Rejected,
    /// Nothing arrived in any attempt
    Silent,
}

impl<D> Transport<D>
where
    D: FrameDecoder + Clone,
    D::Frame: CommandResponse,
{
    fn exchange(
        &self,
        command: &CommandPacket,
        timeout: Duration,
        tries: u32,
    ) -> Result<Outcome, ProtocolError> {
        let session = self.session()?;
        let _exchange = session
            .request_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // Closed while queued behind another request
        if session.inbox.is_closed() {
            return Err(ProtocolError::Closed);
        }
        let bytes = command.encode();
        let opcode = command.opcode();
        let mut outcome = Outcome::Silent;

        for attempt in 1..=tries {
            let _paused = MonitorPause::new(&session.monitor);
            session.clear_inbox(self.counters_ref());
            session.write(&bytes, self.counters_ref())?;

            match session.inbox.pop_timeout(timeout)? {
                None => {
                    debug!(
                        opcode = format_args!("{:#06x}", opcode),
                        attempt, "no response within {:?}", timeout
                    );
                }
                Some(frame) if correlates(&frame, opcode) => {
                    return Ok(Outcome::Response(frame.return_payload().to_vec()));
                }
                Some(frame) => {
                    warn!(
                        opcode = format_args!("{:#06x}", opcode),
                        attempt,
                        "Invalid response {:?}: {}",
                        frame,
                        hex(frame.raw())
                    );
                    outcome = Outcome::Rejected;
                }
            }
        }

        Ok(outcome)
    }

    /// Send `command` and wait for its response, up to `tries` attempts.
    ///
    /// Returns `Ok(Some(payload))` on success and `Ok(None)` once every
    /// attempt timed out or got a non-matching frame. Fails with
    /// [`ProtocolError::NotOpen`] before any I/O if the transport is closed, and
    /// with [`ProtocolError::Closed`] if it is closed mid-wait.
    pub fn send_command_wait_response(
        &self,
        command: &CommandPacket,
        timeout: Duration,
        tries: u32,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        match self.exchange(command, timeout, tries)? {
            Outcome::Response(payload) => Ok(Some(payload)),
            Outcome::Rejected | Outcome::Silent => Ok(None),
        }
    }

    /// Like [`Transport::send_command_wait_response`] but treats exhaustion as
    /// an error: [`ProtocolError::Timeout`] if the device never answered,
    /// [`ProtocolError::CommandFailed`] if it answered wrongly
    pub fn expect_response(
        &self,
        command: &CommandPacket,
        timeout: Duration,
        tries: u32,
    ) -> Result<Vec<u8>, ProtocolError> {
        match self.exchange(command, timeout, tries)? {
            Outcome::Response(payload) => Ok(payload),
            Outcome::Rejected => Err(ProtocolError::CommandFailed {
                opcode: command.opcode(),
            }),
            Outcome::Silent => Err(ProtocolError::Timeout),
        }
    }

    /// Send with the configured default timeout and tries
    pub fn send_command(&self, command: &CommandPacket) -> Result<Vec<u8>, ProtocolError> {
        let config = self.config();
        self.expect_response(command, config.response_timeout(), config.tries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::protocol::hci::{command_complete, Status};
    use crate::protocol::monitor::MonitorState;
    use crate::protocol::stream::{memory_pair, DeviceHandle};
    use crate::protocol::HciTransport;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn open_hci() -> (HciTransport, DeviceHandle) {
        let transport = HciTransport::hci(TransportConfig {
            read_timeout_us: 1000,
            ..TransportConfig::hci("mem", 115_200)
        });
        let (channel, device) = memory_pair("mem");
        transport.open_with_channel(Box::new(channel)).unwrap();
        (transport, device)
    }

    #[test]
    fn test_not_open() {
        let transport = HciTransport::hci(TransportConfig::default());
        let cmd = CommandPacket::empty(0x0003);
        assert!(matches!(
            transport.send_command_wait_response(&cmd, Duration::from_millis(10), 1),
            Err(ProtocolError::NotOpen)
        ));
    }

    #[test]
    fn test_failure_status_is_not_success() {
        let (transport, device) = open_hci();
        device.set_responder(|_| command_complete(0x0003, Status::HardwareFailure, &[]).unwrap());
        let cmd = CommandPacket::empty(0x0003);
        let result = transport
            .send_command_wait_response(&cmd, Duration::from_millis(200), 2)
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(device.write_count(), 2);
    }

    #[test]
    fn test_expect_response_on_silence_is_timeout() {
        let (transport, _device) = open_hci();
        let cmd = CommandPacket::empty(0x0003);
        assert!(matches!(
            transport.expect_response(&cmd, Duration::from_millis(20), 2),
            Err(ProtocolError::Timeout)
        ));
    }

    #[test]
    fn test_expect_response_on_rejection_is_command_failed() {
        let (transport, device) = open_hci();
        device.set_responder(|_| command_complete(0x0003, Status::CommandDisallowed, &[]).unwrap());
        let cmd = CommandPacket::empty(0x0003);
        assert!(matches!(
            transport.expect_response(&cmd, Duration::from_millis(200), 1),
            Err(ProtocolError::CommandFailed { opcode: 0x0003 })
        ));
    }

    #[test]
    fn test_success_without_payload() {
        let (transport, device) = open_hci();
        device.set_responder(|_| command_complete(0x0C03, Status::Success, &[]).unwrap());
        let payload = transport
            .send_command(&CommandPacket::empty(0x0C03))
            .unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_unbounded_timeout() {
        let (transport, device) = open_hci();
        device.set_responder(|_| command_complete(0x0003, Status::Success, &[0x07]).unwrap());
        let result = transport
            .send_command_wait_response(&CommandPacket::empty(0x0003), Duration::MAX, 1)
            .unwrap();
        assert_eq!(result, Some(vec![0x07]));
    }

    #[test]
    fn test_monitor_suspended_for_whole_request() {
        // hci preset: 100 ms queue window, monitor enabled
        let (transport, device) = open_hci();
        let transport = Arc::new(transport);
        let session = transport.session().unwrap();

        let requester = {
            let transport = transport.clone();
            thread::spawn(move || {
                transport.send_command_wait_response(
                    &CommandPacket::empty(0x0003),
                    Duration::from_millis(400),
                    1,
                )
            })
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while device.write_count() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(device.write_count(), 1);

        // twice the queue window
        let watch_until = Instant::now() + Duration::from_millis(200);
        while Instant::now() < watch_until {
            assert_eq!(session.monitor.state(), MonitorState::Suspended);
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(requester.join().unwrap().unwrap(), None);
        assert!(matches!(session.monitor.state(), MonitorState::Armed(_)));
    }
}
