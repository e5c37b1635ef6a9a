//! Change-detected publication of pump telemetry.
//!
//! The host platform registers typed observers per pump address once at
//! startup. After every accepted response the scheduler hands the pump's
//! snapshot to [`TelemetrySink::publish`], which only notifies observers of
//! values that actually changed since they were last published.

use crate::{
    frame::Address,
    queue::CommandId,
    session::Telemetry,
};
use alloc::{boxed::Box, collections::btree_map::BTreeMap, vec::Vec};
use core::fmt::Debug;
use log::info;

/// Final result of a control command.
#[derive(strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "snake_case")]
pub enum CommandResult {
    /// The pump acknowledged the command.
    Completed,
    /// The pump refused the command.
    Rejected,
    /// The pump did not answer, even after a retry.
    Failed,
    /// The command waited too long for bus access.
    Expired,
    /// A newer command for the same setting replaced it.
    Superseded,
    /// The exchange was interrupted by a transport fault or cancellation.
    Faulted,
}

/// Result of a command, reported to command observers.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct CommandReport {
    /// Identifier returned when the command was requested.
    pub id: CommandId,
    /// Target pump.
    pub address: Address,
    /// Final result.
    pub result: CommandResult,
}

type Callback<T> = Box<dyn FnMut(T)>;

struct Slot<T> {
    address: Address,
    callback: Callback<T>,
}

impl<T> Debug for Slot<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Slot")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

fn notify<T: Copy>(slots: &mut [Slot<T>], address: Address, val: T) {
    for slot in slots.iter_mut().filter(|slot| slot.address == address) {
        (slot.callback)(val);
    }
}

/// Last values published for one address.
#[derive(Default, Debug)]
struct Published {
    telemetry: Telemetry,
    reachable: Option<bool>,
}

/// Registry of observers with change detection.
#[derive(Default, Debug)]
pub struct TelemetrySink {
    power: Vec<Slot<u16>>,
    rpm: Vec<Slot<u16>>,
    running: Vec<Slot<bool>>,
    reachable: Vec<Slot<bool>>,
    commands: Vec<Slot<CommandReport>>,
    published: BTreeMap<Address, Published>,
}

impl TelemetrySink {
    /// Constructs a sink without observers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer for the power draw (in watts) of a pump.
    pub fn register_power_observer(&mut self, address: Address, callback: impl FnMut(u16) + 'static) {
        self.power.push(Slot {
            address,
            callback: Box::new(callback),
        });
    }

    /// Registers an observer for the motor speed (in rpm) of a pump.
    pub fn register_rpm_observer(&mut self, address: Address, callback: impl FnMut(u16) + 'static) {
        self.rpm.push(Slot {
            address,
            callback: Box::new(callback),
        });
    }

    /// Registers an observer for the running state of a pump.
    pub fn register_running_observer(
        &mut self,
        address: Address,
        callback: impl FnMut(bool) + 'static,
    ) {
        self.running.push(Slot {
            address,
            callback: Box::new(callback),
        });
    }

    /// Registers an observer for the reachability of a pump.
    ///
    /// Called with `false` once the pump stops answering and
    /// with `true` when it answers (again).
    pub fn register_reachability_observer(
        &mut self,
        address: Address,
        callback: impl FnMut(bool) + 'static,
    ) {
        self.reachable.push(Slot {
            address,
            callback: Box::new(callback),
        });
    }

    /// Registers an observer for the results of commands sent to a pump.
    pub fn register_command_observer(
        &mut self,
        address: Address,
        callback: impl FnMut(CommandReport) + 'static,
    ) {
        self.commands.push(Slot {
            address,
            callback: Box::new(callback),
        });
    }

    /// Publishes a telemetry snapshot of a pump.
    ///
    /// Observers are only notified for fields that are set and differ from
    /// the last published value. Returns the changed fields.
    pub fn publish(&mut self, address: Address, snapshot: &Telemetry) -> Telemetry {
        let last = &mut self.published.entry(address).or_default().telemetry;
        let changed = Telemetry {
            power_watts: snapshot.power_watts.filter(|&v| last.power_watts != Some(v)),
            rpm: snapshot.rpm.filter(|&v| last.rpm != Some(v)),
            running: snapshot.running.filter(|&v| last.running != Some(v)),
        };

        last.merge(&changed);

        if let Some(watts) = changed.power_watts {
            notify(&mut self.power, address, watts);
        }

        if let Some(rpm) = changed.rpm {
            notify(&mut self.rpm, address, rpm);
        }

        if let Some(running) = changed.running {
            notify(&mut self.running, address, running);
        }

        changed
    }

    /// Publishes the reachability of a pump.
    ///
    /// Returns whether observers were notified.
    pub fn publish_reachability(&mut self, address: Address, reachable: bool) -> bool {
        let last = &mut self.published.entry(address).or_default().reachable;

        if *last == Some(reachable) {
            return false;
        }

        *last = Some(reachable);
        notify(&mut self.reachable, address, reachable);

        true
    }

    /// Reports the final result of a command.
    pub fn report(&mut self, report: CommandReport) {
        info!(
            "Command {} for pump {}: {}",
            report.id, report.address, report.result
        );
        notify(&mut self.commands, report.address, report);
    }
}
