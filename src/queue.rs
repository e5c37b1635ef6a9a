//! Pending control commands.
//!
//! The [`CommandQueue`] keeps a FIFO of [`PendingCommand`]s per configured
//! address. It is shared between the scheduler and the [`Controller`]
//! handles given to control surfaces, so commands can be requested and
//! withdrawn while the scheduler is waiting on the bus.

use crate::{
    bus::Clock,
    control::{Control, Error, Result},
    frame::{Address, Frame},
};
use alloc::{collections::vec_deque::VecDeque, rc::Rc, vec::Vec};
use core::{
    cell::RefCell,
    fmt::{Display, Formatter},
    time::Duration,
};
use log::debug;

/// Identifier of an enqueued command.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Debug)]
pub struct CommandId(u32);

impl Display for CommandId {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A control command waiting for bus access.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct PendingCommand {
    /// Identifier returned to the requester.
    pub id: CommandId,
    /// Target pump.
    pub address: Address,
    /// Requested state change.
    pub control: Control,
    /// Request frame sent to the pump.
    pub frame: Frame,
    /// Time at which the command was enqueued.
    pub created_at: Duration,
}

/// Per-address FIFO queues of pending commands.
#[derive(Debug)]
pub struct CommandQueue {
    queues: Vec<(Address, VecDeque<PendingCommand>)>,
    supersede: bool,
    next_id: u32,
    superseded: Vec<PendingCommand>,
}

impl CommandQueue {
    /// Constructs an empty queue for the given addresses.
    ///
    /// With `supersede` enabled, a new command withdraws queued commands
    /// for the same address that it makes obsolete.
    #[must_use]
    pub fn new(addresses: &[Address], supersede: bool) -> Self {
        Self {
            queues: addresses
                .iter()
                .map(|&addr| (addr, VecDeque::new()))
                .collect(),
            supersede,
            next_id: 0,
            superseded: Vec::new(),
        }
    }

    /// Enqueues a control command for `address`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownAddress`] if the address is not configured.
    /// - [`Error::InvalidArgument`] if the control has invalid arguments.
    pub fn push(&mut self, address: Address, control: Control, now: Duration) -> Result<CommandId> {
        let frame = control.to_frame(address)?;
        let queue = self
            .queues
            .iter_mut()
            .find_map(|(addr, queue)| (*addr == address).then_some(queue))
            .ok_or(Error::UnknownAddress(address))?;

        if self.supersede {
            let (stale, kept) = queue
                .drain(..)
                .partition::<Vec<_>, _>(|cmd| control.supersedes(&cmd.control));

            queue.extend(kept);

            for cmd in &stale {
                debug!("Command {} superseded by {control:?}", cmd.id);
            }

            self.superseded.extend(stale);
        }

        let id = CommandId(self.next_id);

        self.next_id = self.next_id.wrapping_add(1);
        queue.push_back(PendingCommand {
            id,
            address,
            control,
            frame,
            created_at: now,
        });

        debug!("Command {id} queued for pump {address}: {control:?}");

        Ok(id)
    }

    /// Removes a command that has not been dispatched yet.
    ///
    /// Returns `false` if the command is no longer queued.
    pub fn withdraw(&mut self, id: CommandId) -> bool {
        for (_, queue) in &mut self.queues {
            if let Some(pos) = queue.iter().position(|cmd| cmd.id == id) {
                queue.remove(pos);
                debug!("Command {id} withdrawn");

                return true;
            }
        }

        false
    }

    /// Removes and returns the command whose queue head was enqueued first.
    pub fn pop_oldest(&mut self) -> Option<PendingCommand> {
        let (_, queue) = self
            .queues
            .iter_mut()
            .filter(|(_, queue)| !queue.is_empty())
            .min_by_key(|(_, queue)| queue.front().map(|cmd| (cmd.created_at, cmd.id)))?;

        queue.pop_front()
    }

    /// Removes and returns all commands older than `ttl`.
    pub fn expire(&mut self, now: Duration, ttl: Duration) -> Vec<PendingCommand> {
        let mut expired = Vec::new();

        for (_, queue) in &mut self.queues {
            while queue
                .front()
                .is_some_and(|cmd| now.saturating_sub(cmd.created_at) > ttl)
            {
                expired.extend(queue.pop_front());
            }
        }

        expired
    }

    /// Returns and clears the commands superseded since the last call.
    pub fn take_superseded(&mut self) -> Vec<PendingCommand> {
        core::mem::take(&mut self.superseded)
    }

    /// Returns the number of queued commands for `address`.
    #[must_use]
    pub fn pending(&self, address: Address) -> usize {
        self.queues
            .iter()
            .find(|(addr, _)| *addr == address)
            .map_or(0, |(_, queue)| queue.len())
    }

    /// Returns whether no commands are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|(_, queue)| queue.is_empty())
    }
}

/// Handle for requesting state changes of one pump.
///
/// Obtained from
/// [`Scheduler::register_switch_controller`](crate::scheduler::Scheduler::register_switch_controller).
/// All requests return immediately; results are reported to
/// command observers registered on the
/// [`TelemetrySink`](crate::telemetry::TelemetrySink).
#[derive(Clone, Debug)]
pub struct Controller<C> {
    address: Address,
    queue: Rc<RefCell<CommandQueue>>,
    clock: C,
}

impl<C: Clock> Controller<C> {
    pub(crate) fn new(address: Address, queue: Rc<RefCell<CommandQueue>>, clock: C) -> Self {
        Self {
            address,
            queue,
            clock,
        }
    }

    /// Returns the address of the controlled pump.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Requests an arbitrary state change.
    pub fn request(&self, control: Control) -> Result<CommandId> {
        self.queue
            .borrow_mut()
            .push(self.address, control, self.clock.now())
    }

    /// Requests the motor to start or stop.
    pub fn set_running(&self, running: bool) -> Result<CommandId> {
        self.request(Control::SetRunning(running))
    }

    /// Requests a local program.
    pub fn set_program(&self, program: u8) -> Result<CommandId> {
        self.request(Control::SetProgram(program))
    }

    /// Withdraws a queued command.
    ///
    /// Has no effect if the command was already dispatched.
    pub fn withdraw(&self, id: CommandId) -> bool {
        self.queue.borrow_mut().withdraw(id)
    }
}
