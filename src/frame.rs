//! Frame codec for the pump bus.
//!
//! Every message on the bus is a [`Frame`] with the following layout:
//!
//! | Offset     | Length | Content                                      |
//! |------------|--------|----------------------------------------------|
//! | 0          | 3      | Preamble `ff 00 ff`                          |
//! | 3          | 1      | Start of header `a5`                         |
//! | 4          | 1      | Protocol version (`00`)                      |
//! | 5          | 1      | Destination address                          |
//! | 6          | 1      | Source address                               |
//! | 7          | 1      | Command code                                 |
//! | 8          | 1      | Payload length `n`                           |
//! | 9          | `n`    | Payload                                      |
//! | 9 + `n`    | 2      | Checksum (big-endian)                        |
//!
//! The checksum is the 16-bit wrapping sum of all bytes from the
//! start-of-header byte up to and including the last payload byte.

use alloc::vec::Vec;
use core::{
    fmt::{Display, Formatter},
    num::Wrapping,
};
use strum::FromRepr;

/// Constant bytes every frame starts with, including the start-of-header byte.
pub const PREAMBLE: [u8; 4] = [0xff, 0x00, 0xff, 0xa5];

/// Maximum payload length representable by the length byte.
pub const MAX_PAYLOAD_LEN: usize = 0xff;

const VERSION: u8 = 0x00;
const HEADER_LEN: usize = 9;
const CHECKSUM_LEN: usize = 2;

// Checksum coverage starts at the start-of-header byte
const CHECKSUM_START: usize = 3;

/// Bus address of a node.
///
/// Pumps occupy the range `0x60..=0x6f`, while the driver itself
/// transmits as a remote controller with [`Address::CONTROLLER`].
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone, Debug)]
pub struct Address(pub u8);

impl Address {
    /// Address used by the driver when talking to pumps.
    pub const CONTROLLER: Self = Self(0x10);

    /// Returns the address of the `n`-th pump (1 to 16).
    #[must_use]
    pub const fn pump(n: u8) -> Option<Self> {
        match n {
            1..=16 => Some(Self(0x5f + n)),
            _ => None,
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Command code carried in the frame header.
#[derive(FromRepr, strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum Command {
    /// Writes a pump register (external programs, stored program values).
    WriteRegister = 0x01,
    /// Switches between local and remote control.
    RemoteControl = 0x04,
    /// Selects a local program.
    LocalProgram = 0x05,
    /// Starts or stops the motor.
    Run = 0x06,
    /// Requests or reports pump status.
    Status = 0x07,
    /// Sets the target flow.
    SetFlow = 0x09,
    /// Sets the target speed.
    SetSpeed = 0x0a,
    /// Protocol-level negative acknowledgement.
    Error = 0xff,
}

/// Error returned when raw bytes cannot be decoded into a [`Frame`].
///
/// None of these errors are fatal; the frame is discarded.
#[non_exhaustive]
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum DecodeError {
    /// The bytes do not start with [`PREAMBLE`].
    InvalidPreamble,
    /// Fewer bytes are available than the header or payload length requires.
    Truncated,
    /// The transmitted checksum does not match the computed one.
    ChecksumMismatch {
        /// Checksum computed over the received bytes.
        expected: u16,
        /// Checksum transmitted in the frame.
        actual: u16,
    },
    /// The command code is not recognized.
    UnknownCommand(u8),
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidPreamble => write!(f, "invalid preamble"),
            Self::Truncated => write!(f, "truncated frame"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: got {actual:#06x}, expected {expected:#06x}")
            }
            Self::UnknownCommand(code) => write!(f, "unknown command: {code:#04x}"),
        }
    }
}

impl core::error::Error for DecodeError {}

/// A decoded protocol frame.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Frame {
    destination: Address,
    source: Address,
    command: Command,
    payload: Vec<u8>,
}

impl Frame {
    /// Constructs a new frame.
    ///
    /// Returns `None` if the payload is longer than [`MAX_PAYLOAD_LEN`].
    #[must_use]
    pub fn new(
        destination: Address,
        source: Address,
        command: Command,
        payload: Vec<u8>,
    ) -> Option<Self> {
        (payload.len() <= MAX_PAYLOAD_LEN).then_some(Self {
            destination,
            source,
            command,
            payload,
        })
    }

    /// Constructs a request without payload sent by the controller.
    #[must_use]
    pub fn request(destination: Address, command: Command) -> Self {
        Self {
            destination,
            source: Address::CONTROLLER,
            command,
            payload: Vec::new(),
        }
    }

    /// Returns the destination address.
    #[must_use]
    pub fn destination(&self) -> Address {
        self.destination
    }

    /// Returns the source address.
    #[must_use]
    pub fn source(&self) -> Address {
        self.source
    }

    /// Returns the command code.
    #[must_use]
    pub fn command(&self) -> Command {
        self.command
    }

    /// Returns the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Serializes the frame into its wire representation.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len() + CHECKSUM_LEN);

        buf.extend_from_slice(&PREAMBLE);
        buf.extend_from_slice(&[
            VERSION,
            self.destination.0,
            self.source.0,
            self.command as u8,
            // Length is bounded by the constructors
            self.payload.len() as u8,
        ]);
        buf.extend_from_slice(&self.payload);

        let checksum = compute_checksum(&buf[CHECKSUM_START..]);

        buf.extend_from_slice(&checksum.to_be_bytes());

        buf
    }

    /// Parses a frame from its wire representation.
    ///
    /// Bytes past the declared frame length are ignored.
    ///
    /// # Errors
    ///
    /// - [`DecodeError::InvalidPreamble`] if the bytes do not start with [`PREAMBLE`].
    /// - [`DecodeError::Truncated`] if the frame is incomplete.
    /// - [`DecodeError::ChecksumMismatch`] if the checksum is incorrect.
    /// - [`DecodeError::UnknownCommand`] if the command code is not recognized.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let prefix = raw.len().min(PREAMBLE.len());

        if raw[..prefix] != PREAMBLE[..prefix] {
            return Err(DecodeError::InvalidPreamble);
        }

        let len = frame_len(raw).ok_or(DecodeError::Truncated)?;

        if raw.len() < len {
            return Err(DecodeError::Truncated);
        }

        let body = &raw[CHECKSUM_START..len - CHECKSUM_LEN];
        let expected = compute_checksum(body);
        let actual = u16::from_be_bytes([raw[len - 2], raw[len - 1]]);

        if expected != actual {
            return Err(DecodeError::ChecksumMismatch { expected, actual });
        }

        let command = Command::from_repr(raw[7]).ok_or(DecodeError::UnknownCommand(raw[7]))?;

        Ok(Self {
            destination: Address(raw[5]),
            source: Address(raw[6]),
            command,
            payload: raw[HEADER_LEN..len - CHECKSUM_LEN].to_vec(),
        })
    }
}

/// Progress of incrementally received frame bytes.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Scan {
    /// The bytes cannot be the beginning of a frame.
    Invalid,
    /// The bytes are a valid prefix, but more are needed.
    Incomplete,
    /// The bytes contain a complete frame of the given length.
    Complete(usize),
}

/// Checks how far a partially received buffer is from a complete frame.
///
/// Only the framing is verified, the checksum is left to [`Frame::decode`].
#[must_use]
pub fn scan(buf: &[u8]) -> Scan {
    let prefix = buf.len().min(PREAMBLE.len());

    if buf[..prefix] != PREAMBLE[..prefix] {
        return Scan::Invalid;
    }

    match frame_len(buf) {
        Some(len) if buf.len() >= len => Scan::Complete(len),
        _ => Scan::Incomplete,
    }
}

/// Returns the total frame length once the length byte is available.
fn frame_len(buf: &[u8]) -> Option<usize> {
    buf.get(HEADER_LEN - 1)
        .map(|&len| HEADER_LEN + usize::from(len) + CHECKSUM_LEN)
}

fn compute_checksum(data: &[u8]) -> u16 {
    data.iter()
        .map(|&x| Wrapping(u16::from(x)))
        .sum::<Wrapping<_>>()
        .0
}
