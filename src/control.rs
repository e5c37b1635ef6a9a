//! Control commands accepted by pumps.
//!
//! A [`Control`] describes a requested state change. It is turned into a
//! request [`Frame`] when enqueued, so invalid arguments are reported to the
//! caller right away instead of failing on the bus later.

use crate::frame::{Address, Command, Frame};
use alloc::{vec, vec::Vec};
use core::fmt::{Display, Formatter};

/// A specialized [`Result`] type for configuration and control requests.
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for configuration and control requests.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Error {
    /// The provided argument is out of range.
    InvalidArgument,
    /// The address is not configured.
    UnknownAddress(Address),
    /// The address was configured more than once.
    DuplicateAddress(Address),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::UnknownAddress(addr) => write!(f, "unknown address: {addr}"),
            Self::DuplicateAddress(addr) => write!(f, "duplicate address: {addr}"),
        }
    }
}

impl core::error::Error for Error {}

/// Requested pump state change.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Control {
    /// Starts or stops the motor.
    SetRunning(bool),
    /// Selects a local program.
    SetProgram(u8),
    /// Selects an external program (1 to 4), or stops external control with 0.
    SetExternalProgram(u8),
    /// Takes over (`true`) or releases (`false`) control from the pump's panel.
    SetRemoteControl(bool),
    /// Sets the target speed in rpm.
    SetSpeed(u16),
    /// Sets the target flow in tenths of m³/h.
    SetFlow(u8),
    /// Stores a speed value for an external program (1 to 4).
    SaveProgramValue {
        /// External program number.
        program: u8,
        /// Value to store.
        value: u16,
    },
}

impl Control {
    /// Returns the command code and payload sent for this control.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if a program number is out of range.
    pub fn encode(&self) -> Result<(Command, Vec<u8>)> {
        match *self {
            Self::SetRunning(true) => Ok((Command::Run, vec![0x0a])),
            Self::SetRunning(false) => Ok((Command::Run, vec![0x04])),
            Self::SetProgram(prog) => {
                let prog = prog.checked_add(1).ok_or(Error::InvalidArgument)?;

                Ok((Command::LocalProgram, vec![prog]))
            }
            Self::SetExternalProgram(prog @ 0..=4) => {
                Ok((Command::WriteRegister, vec![0x03, 0x21, 0x00, prog * 8]))
            }
            Self::SetRemoteControl(true) => Ok((Command::RemoteControl, vec![0xff])),
            Self::SetRemoteControl(false) => Ok((Command::RemoteControl, vec![0x00])),
            Self::SetSpeed(rpm) => {
                let [hi, lo] = rpm.to_be_bytes();

                Ok((Command::SetSpeed, vec![0x02, 0xc4, hi, lo]))
            }
            Self::SetFlow(flow) => Ok((Command::SetFlow, vec![0x02, 0xc4, 0x00, flow])),
            Self::SaveProgramValue {
                program: program @ 1..=4,
                value,
            } => {
                let [hi, lo] = value.to_be_bytes();

                Ok((Command::WriteRegister, vec![0x03, 0x26 + program, hi, lo]))
            }
            Self::SetExternalProgram(_) | Self::SaveProgramValue { .. } => {
                Err(Error::InvalidArgument)
            }
        }
    }

    /// Builds the request frame sent to the pump at `address`.
    pub fn to_frame(&self, address: Address) -> Result<Frame> {
        let (cmd, payload) = self.encode()?;

        Frame::new(address, Address::CONTROLLER, cmd, payload).ok_or(Error::InvalidArgument)
    }

    /// Returns whether this control makes a queued `other` control obsolete.
    #[must_use]
    pub fn supersedes(&self, other: &Control) -> bool {
        match (self, other) {
            (Self::SetRunning(_), Self::SetRunning(_))
            | (Self::SetProgram(_), Self::SetProgram(_))
            | (Self::SetExternalProgram(_), Self::SetExternalProgram(_))
            | (Self::SetRemoteControl(_), Self::SetRemoteControl(_))
            | (Self::SetSpeed(_) | Self::SetFlow(_), Self::SetSpeed(_) | Self::SetFlow(_)) => true,
            (
                Self::SaveProgramValue { program: a, .. },
                Self::SaveProgramValue { program: b, .. },
            ) => a == b,
            _ => false,
        }
    }
}
