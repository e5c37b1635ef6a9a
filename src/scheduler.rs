//! Arbitration of bus access between polls and control commands.
//!
//! The [`Scheduler`] owns the [`Bus`] and one [`PumpSession`] per configured
//! address. Every [`Scheduler::tick`] performs at most one exchange:
//!
//! 1. Pending commands are dispatched first, oldest first.
//! 2. Otherwise the pump with the earliest overdue poll is queried for its status.
//! 3. Otherwise the scheduler is idle until the next poll is due.
//!
//! A poll that times out is not retried before its next interval.
//! A command that times out is retried once right away, then reported as failed.

use crate::{
    Error, Read, Result, Write,
    bus::{Bus, Clock},
    control::{self, Control},
    frame::{Address, Command, Frame},
    queue::{CommandId, CommandQueue, Controller, PendingCommand},
    session::{Outcome, PumpSession, SessionState},
    telemetry::{CommandReport, CommandResult, TelemetrySink},
};
use alloc::{rc::Rc, vec::Vec};
use core::{cell::RefCell, time::Duration};
use log::{debug, warn};

/// Scheduler configuration.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct Config {
    /// Interval between status polls of each pump.
    pub poll_interval: Duration,
    /// Time to wait for a response after a request.
    pub response_timeout: Duration,
    /// Minimum bus silence before transmitting.
    pub inter_frame_gap: Duration,
    /// Consecutive timeouts after which a pump is considered unreachable.
    pub unreachable_threshold: u8,
    /// Time after which a command that could not be dispatched is dropped.
    pub command_ttl: Duration,
    /// Whether a new command replaces queued commands for the same setting.
    pub supersede: bool,
    /// Maximum sleep between ticks of [`Scheduler::run`] while idle.
    pub idle_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            response_timeout: Duration::from_millis(500),
            inter_frame_gap: Duration::from_millis(100),
            unreachable_threshold: 3,
            command_ttl: Duration::from_secs(30),
            supersede: true,
            idle_interval: Duration::from_millis(20),
        }
    }
}

/// Result of a single [`Scheduler::tick`].
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Tick {
    /// Nothing was due. Contains the time until the next poll.
    Idle(Duration),
    /// An exchange with a pump was performed.
    Exchanged {
        /// Pump the request was sent to.
        address: Address,
        /// Command that was dispatched, or `None` for a status poll.
        command: Option<CommandId>,
        /// Outcome of the exchange.
        outcome: Outcome,
    },
}

#[derive(Debug)]
struct Pump {
    session: PumpSession,
    next_poll: Duration,
}

/// Request selected for the next exchange.
#[derive(Debug)]
struct Dispatch {
    index: usize,
    frame: Frame,
    command: Option<CommandId>,
}

/// Exchange recorded as in flight on the bus.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
struct InFlight {
    address: Address,
    command: Option<CommandId>,
}

/// Serializes all bus traffic for a set of pumps.
#[derive(Debug)]
pub struct Scheduler<P, C> {
    bus: Bus<P, C>,
    config: Config,
    pumps: Vec<Pump>,
    queue: Rc<RefCell<CommandQueue>>,
    sink: TelemetrySink,
    in_flight: Option<InFlight>,
}

impl<P: Read + Write, C: Clock + Clone> Scheduler<P, C> {
    /// Constructs a scheduler for the pumps at `addresses`.
    ///
    /// All pumps are due for a poll right away.
    ///
    /// # Errors
    ///
    /// - [`control::Error::DuplicateAddress`] if an address is listed twice.
    pub fn new(port: P, clock: C, addresses: &[Address], config: Config) -> control::Result<Self> {
        for (idx, addr) in addresses.iter().enumerate() {
            if addresses[..idx].contains(addr) {
                return Err(control::Error::DuplicateAddress(*addr));
            }
        }

        let now = clock.now();

        Ok(Self {
            bus: Bus::new(port, clock, config.inter_frame_gap),
            pumps: addresses
                .iter()
                .map(|&addr| Pump {
                    session: PumpSession::new(addr, config.unreachable_threshold),
                    next_poll: now,
                })
                .collect(),
            queue: Rc::new(RefCell::new(CommandQueue::new(addresses, config.supersede))),
            sink: TelemetrySink::new(),
            in_flight: None,
            config,
        })
    }

    /// Returns the telemetry sink for registering observers.
    pub fn telemetry(&mut self) -> &mut TelemetrySink {
        &mut self.sink
    }

    /// Returns the underlying bus.
    pub fn bus(&mut self) -> &mut Bus<P, C> {
        &mut self.bus
    }

    /// Returns the session of the pump at `address`.
    pub fn session(&self, address: Address) -> Option<&PumpSession> {
        self.pumps
            .iter()
            .map(|pump| &pump.session)
            .find(|sess| sess.address() == address)
    }

    /// Returns the sessions of all configured pumps.
    pub fn sessions(&self) -> impl Iterator<Item = &PumpSession> {
        self.pumps.iter().map(|pump| &pump.session)
    }

    /// Returns the address of the pump an exchange is currently performed with.
    pub fn in_flight(&self) -> Option<Address> {
        self.in_flight.map(|exch| exch.address)
    }

    /// Returns a handle for requesting state changes of the pump at `address`.
    ///
    /// # Errors
    ///
    /// - [`control::Error::UnknownAddress`] if the address is not configured.
    pub fn register_switch_controller(&self, address: Address) -> control::Result<Controller<C>> {
        self.session(address)
            .ok_or(control::Error::UnknownAddress(address))?;

        Ok(Controller::new(
            address,
            self.queue.clone(),
            self.bus.clock().clone(),
        ))
    }

    /// Enqueues a control command for the pump at `address`.
    pub fn request(&self, address: Address, control: Control) -> control::Result<CommandId> {
        self.queue
            .borrow_mut()
            .push(address, control, self.bus.clock().now())
    }

    /// Enqueues a command starting or stopping the pump at `address`.
    pub fn request_set_running(&self, address: Address, running: bool) -> control::Result<CommandId> {
        self.request(address, Control::SetRunning(running))
    }

    /// Enqueues a command selecting a local program of the pump at `address`.
    pub fn request_set_program(&self, address: Address, program: u8) -> control::Result<CommandId> {
        self.request(address, Control::SetProgram(program))
    }

    /// Withdraws a queued command.
    ///
    /// Has no effect if the command was already dispatched.
    pub fn withdraw(&self, id: CommandId) -> bool {
        self.queue.borrow_mut().withdraw(id)
    }

    /// Runs the scheduler until a transport fault occurs.
    pub async fn run(&mut self) -> Result<(), P::Error> {
        loop {
            if let Tick::Idle(wait) = self.tick().await? {
                self.bus
                    .clock()
                    .sleep(wait.min(self.config.idle_interval))
                    .await;
            }
        }
    }

    /// Performs at most one exchange on the bus.
    ///
    /// If a previous tick was dropped before it completed, its session is
    /// returned to idle first and its command is reported as
    /// [`CommandResult::Faulted`].
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] or [`Error::UnexpectedEof`] if the transport failed.
    ///   The affected session is returned to idle and a dispatched command
    ///   is reported as [`CommandResult::Faulted`].
    pub async fn tick(&mut self) -> Result<Tick, P::Error> {
        let now = self.bus.clock().now();

        self.recover();
        self.report_dropped(now);

        let Some(dispatch) = self.next_dispatch(now) else {
            return Ok(Tick::Idle(self.until_next_poll(now)));
        };

        let address = self.pumps[dispatch.index].session.address();
        let attempts = if dispatch.command.is_some() { 2 } else { 1 };
        let res = self
            .exchange(dispatch.index, &dispatch.frame, attempts)
            .await;

        self.in_flight = None;

        match res {
            Ok(outcome) => {
                self.finish(dispatch.index, dispatch.command, outcome);

                Ok(Tick::Exchanged {
                    address,
                    command: dispatch.command,
                    outcome,
                })
            }
            Err(err) => {
                self.pumps[dispatch.index].session.abort();

                if let Some(id) = dispatch.command {
                    self.sink.report(CommandReport {
                        id,
                        address,
                        result: CommandResult::Faulted,
                    });
                }

                Err(err)
            }
        }
    }

    /// Selects the next request and marks its pump as in flight.
    fn next_dispatch(&mut self, now: Duration) -> Option<Dispatch> {
        if self.in_flight.is_some() {
            return None;
        }

        let dispatch = loop {
            let next = self.queue.borrow_mut().pop_oldest();
            let Some(cmd) = next else {
                break self.next_poll(now)?;
            };

            match self.index(cmd.address) {
                Some(index) => {
                    debug!("Dispatching command {} to pump {}", cmd.id, cmd.address);

                    break Dispatch {
                        index,
                        frame: cmd.frame,
                        command: Some(cmd.id),
                    };
                }
                None => warn!("Dropping command {} for unknown pump {}", cmd.id, cmd.address),
            }
        };

        self.in_flight = Some(InFlight {
            address: self.pumps[dispatch.index].session.address(),
            command: dispatch.command,
        });

        Some(dispatch)
    }

    /// Returns to idle after a tick was cancelled in the middle of an exchange.
    fn recover(&mut self) {
        let Some(InFlight { address, command }) = self.in_flight.take() else {
            return;
        };

        warn!("Exchange with pump {address} was cancelled");

        for pump in &mut self.pumps {
            if pump.session.state() == SessionState::AwaitingResponse {
                pump.session.abort();
            }
        }

        if let Some(id) = command {
            self.sink.report(CommandReport {
                id,
                address,
                result: CommandResult::Faulted,
            });
        }
    }

    fn next_poll(&mut self, now: Duration) -> Option<Dispatch> {
        let interval = self.config.poll_interval;
        let (index, pump) = self
            .pumps
            .iter_mut()
            .enumerate()
            .filter(|(_, pump)| pump.next_poll <= now)
            .min_by_key(|(_, pump)| pump.next_poll)?;
        let address = pump.session.address();

        debug!("Polling pump {address}");
        pump.next_poll = now.saturating_add(interval);

        Some(Dispatch {
            index,
            frame: Frame::request(address, Command::Status),
            command: None,
        })
    }

    fn until_next_poll(&self, now: Duration) -> Duration {
        self.pumps
            .iter()
            .map(|pump| pump.next_poll)
            .min()
            .map_or(self.config.poll_interval, |due| due.saturating_sub(now))
    }

    fn index(&self, address: Address) -> Option<usize> {
        self.pumps
            .iter()
            .position(|pump| pump.session.address() == address)
    }

    /// Sends a request and waits for its response, retrying on timeout.
    ///
    /// The bus stays exclusively borrowed for all attempts.
    async fn exchange(
        &mut self,
        index: usize,
        frame: &Frame,
        attempts: u8,
    ) -> Result<Outcome, P::Error> {
        let raw = frame.encode();
        let mut outcome = Outcome::TimedOut;

        for attempt in 1..=attempts {
            if attempt > 1 {
                debug!(
                    "Retrying {} request for pump {}",
                    frame.command(),
                    frame.destination()
                );
            }

            self.pumps[index].session.begin(frame);
            self.bus.send(&raw).await?;

            let response = self.await_response(index).await?;

            outcome = self.pumps[index].session.complete(response.as_ref());

            if outcome != Outcome::TimedOut {
                break;
            }
        }

        Ok(outcome)
    }

    /// Waits for a response of the pump, skipping unrelated and corrupted frames.
    async fn await_response(&mut self, index: usize) -> Result<Option<Frame>, P::Error> {
        let deadline = self
            .bus
            .clock()
            .now()
            .saturating_add(self.config.response_timeout);

        loop {
            let remaining = deadline.saturating_sub(self.bus.clock().now());

            if remaining.is_zero() {
                return Ok(None);
            }

            match self.bus.receive_frame(remaining).await {
                Ok(frame) if self.pumps[index].session.accepts(&frame) => return Ok(Some(frame)),
                Ok(frame) => debug!(
                    "Ignoring {} frame from {} to {}",
                    frame.command(),
                    frame.source(),
                    frame.destination()
                ),
                Err(Error::Decode(err)) => warn!("Discarding frame: {err}"),
                Err(Error::Timeout) => return Ok(None),
                Err(err) => return Err(err),
            }
        }
    }

    /// Publishes the results of a completed exchange.
    fn finish(&mut self, index: usize, command: Option<CommandId>, outcome: Outcome) {
        let session = &self.pumps[index].session;
        let address = session.address();
        let telemetry = *session.telemetry();
        let reachable = session.is_reachable();

        if outcome == Outcome::Updated {
            let changed = self.sink.publish(address, &telemetry);

            if !changed.is_empty() {
                debug!("Pump {address} telemetry changed: {changed:?}");
            }
        }

        // Reachability is only known after an answer or after the threshold
        if outcome != Outcome::TimedOut || !reachable {
            self.sink.publish_reachability(address, reachable);
        }

        if let Some(id) = command {
            let result = match outcome {
                Outcome::Updated => CommandResult::Completed,
                Outcome::Rejected => CommandResult::Rejected,
                Outcome::TimedOut => CommandResult::Failed,
            };

            self.sink.report(CommandReport {
                id,
                address,
                result,
            });
        }
    }

    /// Reports commands that were superseded or expired while queued.
    fn report_dropped(&mut self, now: Duration) {
        let (superseded, expired) = {
            let mut queue = self.queue.borrow_mut();

            (
                queue.take_superseded(),
                queue.expire(now, self.config.command_ttl),
            )
        };
        let dropped = superseded
            .into_iter()
            .map(|cmd| (cmd, CommandResult::Superseded))
            .chain(expired.into_iter().map(|cmd| (cmd, CommandResult::Expired)));

        for (PendingCommand { id, address, .. }, result) in dropped {
            self.sink.report(CommandReport {
                id,
                address,
                result,
            });
        }
    }
}
