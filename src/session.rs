//! Protocol state of a single pump.
//!
//! A [`PumpSession`] is a small state machine driven by the
//! [`Scheduler`](crate::scheduler::Scheduler):
//!
//! ```text
//! Idle -> AwaitingResponse -> (Updated | TimedOut | Rejected) -> Idle
//! ```
//!
//! The session itself never touches the bus. It is told which request was
//! sent and which response (if any) arrived, and updates its telemetry
//! snapshot and failure counter accordingly.

use crate::frame::{Address, Command, Frame};
use log::{debug, info, warn};

/// Run state byte reported by a running pump.
const RUN_STATE_RUNNING: u8 = 0x0a;

/// Run state byte reported by a stopped pump.
const RUN_STATE_STOPPED: u8 = 0x04;

/// Telemetry values reported by a pump.
///
/// Each field is independently optional, since responses
/// do not necessarily contain every value.
#[derive(PartialEq, Eq, Default, Copy, Clone, Debug)]
pub struct Telemetry {
    /// Power draw in watts.
    pub power_watts: Option<u16>,
    /// Motor speed in revolutions per minute.
    pub rpm: Option<u16>,
    /// Whether the motor is running.
    pub running: Option<bool>,
}

impl Telemetry {
    /// Overwrites fields that are set in `other`, leaving the rest unchanged.
    pub fn merge(&mut self, other: &Telemetry) {
        self.power_watts = other.power_watts.or(self.power_watts);
        self.rpm = other.rpm.or(self.rpm);
        self.running = other.running.or(self.running);
    }

    /// Returns whether no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Extracts telemetry values from a pump response.
    #[must_use]
    pub fn from_response(frame: &Frame) -> Self {
        let payload = frame.payload();
        let word = |idx: usize| {
            payload
                .get(idx..idx + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
        };

        match frame.command() {
            Command::Status => Self {
                running: payload.first().and_then(|&state| parse_run_state(state)),
                power_watts: word(3),
                rpm: word(5),
            },
            Command::Run => Self {
                running: payload.first().and_then(|&state| parse_run_state(state)),
                ..Self::default()
            },
            _ => Self::default(),
        }
    }
}

fn parse_run_state(state: u8) -> Option<bool> {
    match state {
        RUN_STATE_RUNNING => Some(true),
        RUN_STATE_STOPPED => Some(false),
        _ => {
            warn!("Received unknown run state {state:#04x}");

            None
        }
    }
}

/// Current state of a [`PumpSession`].
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum SessionState {
    /// No request is outstanding.
    Idle,
    /// A request was sent and its response is awaited.
    AwaitingResponse,
}

/// Result of a completed exchange.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Outcome {
    /// The response was accepted and the telemetry snapshot merged.
    Updated,
    /// No response arrived in time.
    TimedOut,
    /// The pump refused the request.
    Rejected,
}

/// Protocol state machine for one pump address.
#[derive(Debug)]
pub struct PumpSession {
    address: Address,
    state: SessionState,
    request: Option<Command>,
    telemetry: Telemetry,
    failures: u8,
    threshold: u8,
    unreachable: bool,
}

impl PumpSession {
    /// Constructs a new idle session.
    ///
    /// The pump is marked unreachable once `threshold` consecutive
    /// exchanges have timed out.
    #[must_use]
    pub fn new(address: Address, threshold: u8) -> Self {
        Self {
            address,
            state: SessionState::Idle,
            request: None,
            telemetry: Telemetry::default(),
            failures: 0,
            threshold: threshold.max(1),
            unreachable: false,
        }
    }

    /// Returns the pump's address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the latest telemetry snapshot.
    #[must_use]
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Returns the number of consecutive exchanges that timed out.
    #[must_use]
    pub fn failures(&self) -> u8 {
        self.failures
    }

    /// Returns whether the pump currently answers requests.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        !self.unreachable
    }

    /// Records that `request` was handed to the bus.
    pub fn begin(&mut self, request: &Frame) {
        debug_assert_eq!(
            self.state,
            SessionState::Idle,
            "request already outstanding"
        );
        debug!(
            "Pump {}: sending {} request",
            self.address,
            request.command()
        );

        self.state = SessionState::AwaitingResponse;
        self.request = Some(request.command());
    }

    /// Returns whether `frame` can be the response to an outstanding request.
    #[must_use]
    pub fn accepts(&self, frame: &Frame) -> bool {
        self.state == SessionState::AwaitingResponse
            && frame.source() == self.address
            && frame.destination() == Address::CONTROLLER
    }

    /// Completes the outstanding exchange with the received response, if any.
    pub fn complete(&mut self, response: Option<&Frame>) -> Outcome {
        let request = self.request.take();

        self.state = SessionState::Idle;

        let Some(frame) = response else {
            self.failures = self.failures.saturating_add(1);

            if !self.unreachable && self.failures >= self.threshold {
                info!(
                    "Pump {} unreachable after {} timeouts",
                    self.address, self.failures
                );
                self.unreachable = true;
            }

            return Outcome::TimedOut;
        };

        if self.unreachable {
            info!("Pump {} reachable again", self.address);
        }

        self.failures = 0;
        self.unreachable = false;

        if frame.command() == Command::Error || Some(frame.command()) != request {
            warn!(
                "Pump {} rejected {:?} request: {} {:02x?}",
                self.address,
                request,
                frame.command(),
                frame.payload()
            );

            return Outcome::Rejected;
        }

        log_acknowledgement(self.address, frame);
        self.telemetry.merge(&Telemetry::from_response(frame));

        Outcome::Updated
    }

    /// Returns to idle after a transport fault.
    ///
    /// The failure counter is left untouched.
    pub fn abort(&mut self) {
        self.request = None;
        self.state = SessionState::Idle;
    }
}

fn log_acknowledgement(address: Address, frame: &Frame) {
    let payload = frame.payload();

    match (frame.command(), payload) {
        (Command::RemoteControl, [0x00, ..]) => info!("Pump {address} is under local control"),
        (Command::RemoteControl, [0xff, ..]) => info!("Pump {address} is under remote control"),
        (Command::LocalProgram, [prog, ..]) => {
            info!("Pump {address} goes to local program {prog}");
        }
        (Command::WriteRegister, _) => info!("Pump {address} register written: {payload:02x?}"),
        (Command::Status, _) => debug!("Pump {address} status: {payload:02x?}"),
        (cmd, _) => debug!("Pump {address} acknowledged {cmd}: {payload:02x?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_logger;
    use alloc::{vec, vec::Vec};

    const PUMP: Address = Address(0x60);

    fn response(cmd: Command, payload: Vec<u8>) -> Frame {
        Frame::new(Address::CONTROLLER, PUMP, cmd, payload).unwrap()
    }

    fn status(running: u8, watts: u16, rpm: u16) -> Frame {
        let [w0, w1] = watts.to_be_bytes();
        let [r0, r1] = rpm.to_be_bytes();

        response(
            Command::Status,
            vec![
                running, 0x00, 0x02, w0, w1, r0, r1, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x0f,
                0x1e,
            ],
        )
    }

    #[test]
    fn poll_updates_telemetry() {
        init_logger();

        let mut sess = PumpSession::new(PUMP, 3);

        sess.begin(&Frame::request(PUMP, Command::Status));

        assert_eq!(
            sess.state(),
            SessionState::AwaitingResponse,
            "session should await response"
        );

        let outcome = sess.complete(Some(&status(0x0a, 300, 1600)));

        assert_eq!(outcome, Outcome::Updated, "outcome should be updated");
        assert_eq!(sess.state(), SessionState::Idle, "session should be idle");
        assert_eq!(
            *sess.telemetry(),
            Telemetry {
                power_watts: Some(300),
                rpm: Some(1600),
                running: Some(true),
            },
            "telemetry should be correct"
        );
    }

    #[test]
    fn merge_keeps_absent_fields() {
        init_logger();

        let mut sess = PumpSession::new(PUMP, 3);

        sess.begin(&Frame::request(PUMP, Command::Status));
        sess.complete(Some(&status(0x0a, 300, 1600)));

        // Short status payload only contains the run state
        sess.begin(&Frame::request(PUMP, Command::Status));
        sess.complete(Some(&response(Command::Status, vec![0x04])));

        assert_eq!(
            *sess.telemetry(),
            Telemetry {
                power_watts: Some(300),
                rpm: Some(1600),
                running: Some(false),
            },
            "absent fields should be unchanged"
        );
    }

    #[test]
    fn unknown_run_state() {
        init_logger();

        let telemetry = Telemetry::from_response(&status(0x0b, 100, 1000));

        assert_eq!(telemetry.running, None, "run state should be unset");
        assert_eq!(telemetry.power_watts, Some(100), "power should be correct");
    }

    #[test]
    fn run_echo_updates_running() {
        init_logger();

        let mut sess = PumpSession::new(PUMP, 3);
        let req = Frame::new(PUMP, Address::CONTROLLER, Command::Run, vec![0x04]).unwrap();

        sess.begin(&req);

        assert_eq!(
            sess.complete(Some(&response(Command::Run, vec![0x04]))),
            Outcome::Updated,
            "outcome should be updated"
        );
        assert_eq!(
            sess.telemetry().running,
            Some(false),
            "running should be updated from echo"
        );
    }

    #[test]
    fn rejected_on_nak_or_mismatched_echo() {
        init_logger();

        let mut sess = PumpSession::new(PUMP, 3);
        let req = Frame::new(PUMP, Address::CONTROLLER, Command::LocalProgram, vec![0x03]).unwrap();

        sess.begin(&req);

        assert_eq!(
            sess.complete(Some(&response(Command::Error, vec![0x01]))),
            Outcome::Rejected,
            "NAK should be rejected"
        );

        sess.begin(&req);

        assert_eq!(
            sess.complete(Some(&response(Command::Status, vec![0x0a]))),
            Outcome::Rejected,
            "mismatched echo should be rejected"
        );
        assert!(sess.telemetry().is_empty(), "telemetry should be unchanged");
        assert_eq!(sess.state(), SessionState::Idle, "session should be idle");
    }

    #[test]
    fn unreachable_after_threshold() {
        init_logger();

        let mut sess = PumpSession::new(PUMP, 3);

        for i in 1..=3 {
            assert!(sess.is_reachable(), "pump should still be reachable");

            sess.begin(&Frame::request(PUMP, Command::Status));

            assert_eq!(sess.complete(None), Outcome::TimedOut, "outcome should be timeout");
            assert_eq!(sess.failures(), i, "failure count should increase");
        }

        assert!(!sess.is_reachable(), "pump should be unreachable");

        sess.begin(&Frame::request(PUMP, Command::Status));
        sess.complete(Some(&status(0x04, 0, 0)));

        assert!(sess.is_reachable(), "pump should be reachable again");
        assert_eq!(sess.failures(), 0, "failure count should be cleared");
    }

    #[test]
    fn nak_clears_unreachable() {
        init_logger();

        let mut sess = PumpSession::new(PUMP, 3);
        let req = Frame::new(PUMP, Address::CONTROLLER, Command::Run, vec![0x0a]).unwrap();

        for _ in 0..3 {
            sess.begin(&req);
            sess.complete(None);
        }

        assert!(!sess.is_reachable(), "pump should be unreachable");

        sess.begin(&req);

        assert_eq!(
            sess.complete(Some(&response(Command::Error, vec![0x01]))),
            Outcome::Rejected,
            "NAK should be rejected"
        );
        assert!(sess.is_reachable(), "NAK should show pump is reachable");
        assert_eq!(sess.failures(), 0, "failure count should be cleared");
    }

    #[test]
    fn accepts_only_own_responses() {
        init_logger();

        let mut sess = PumpSession::new(PUMP, 3);
        let own = status(0x0a, 1, 1);
        let other = Frame::new(Address::CONTROLLER, Address(0x61), Command::Status, vec![])
            .unwrap();
        let request = Frame::request(PUMP, Command::Status);

        assert!(!sess.accepts(&own), "idle session should accept nothing");

        sess.begin(&request);

        assert!(sess.accepts(&own), "own response should be accepted");
        assert!(!sess.accepts(&other), "other pump should be ignored");
        assert!(!sess.accepts(&request), "own request echo should be ignored");

        sess.abort();

        assert_eq!(sess.state(), SessionState::Idle, "session should be idle");
        assert_eq!(sess.failures(), 0, "abort should not count as failure");
    }
}
