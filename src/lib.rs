//! Poll and control Pentair IntelliFlo pool pumps over their RS-485 bus protocol.
//!
//! # Overview
//!
//! The `intelliflo` crate implements the proprietary Pentair pump bus protocol.
//! It offers an asynchronous, platform-agnostic driver that polls one or more
//! pumps for telemetry and arbitrates control commands on the shared bus.
//!
//! The crate is layered as follows:
//!
//! - [`frame`] encodes and decodes checksummed bus frames.
//! - [`bus`] owns the serial port and enforces inter-frame silence and timeouts.
//! - [`session`] tracks the protocol state and telemetry of a single pump.
//! - [`control`] describes the control commands a pump accepts.
//! - [`scheduler`] serializes polls and commands for all configured pumps.
//! - [`telemetry`] publishes changed values to registered observers.
//!
//! # Getting started
//!
//! IntelliFlo pumps are connected to an RS-485 bus, typically through a
//! USB–RS-485 adapter or a transceiver attached to a microcontroller UART,
//! configured as follows:
//!
//! - **Baud rate:** 9600
//! - **Parity:** None
//! - **Data bits:** 8
//! - **Stop bits:** 1
//!
//! If you enable the `native-serial` feature, you can obtain a compatible
//! serial port instance and clock using [`serial::open`] and [`serial::TokioClock`]:
//!
//! ```no_run
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> intelliflo::Result<(), intelliflo::serial::PortError> {
//! use intelliflo::{
//!     frame::Address,
//!     scheduler::{Config, Scheduler},
//!     serial::{self, TokioClock},
//! };
//!
//! let port = serial::open("/dev/ttyUSB0")?;
//! let pump = Address::pump(1).unwrap();
//! let mut sched = Scheduler::new(port, TokioClock::new(), &[pump], Config::default()).unwrap();
//!
//! sched
//!     .telemetry()
//!     .register_power_observer(pump, |watts| println!("Power: {watts} W"));
//! sched
//!     .telemetry()
//!     .register_rpm_observer(pump, |rpm| println!("Speed: {rpm} rpm"));
//!
//! let switch = sched.register_switch_controller(pump).unwrap();
//!
//! switch.set_running(true).unwrap();
//! sched.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! On a microcontroller, any UART implementing the [`embedded_io_async`]
//! [`Read`] and [`Write`] traits can be used together with a [`bus::Clock`]
//! implementation backed by the platform's timer.
//!
//! # Protocol details
//!
//! All nodes share a half-duplex bus. The driver acts as a remote controller
//! with address `0x10`, pumps answer from addresses `0x60` to `0x6f`.
//! Only one request is outstanding on the bus at any time and a short
//! period of silence is kept before every transmission.

#![no_std]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

extern crate alloc;

pub mod bus;
pub mod control;
pub mod frame;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod telemetry;

#[cfg(feature = "native-serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "native-serial")))]
pub mod serial;

pub use embedded_io_async;

use core::fmt::{Display, Formatter};
use embedded_io_async::{Read, ReadExactError, Write};
use frame::DecodeError;

/// A specialized [`Result`] type for bus operations.
///
/// Uses [`Error<E>`] as the error variant, which can include port-specific errors.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// Error type for bus operations.
///
/// The generic parameter `E` allows the error type to carry a port-specific error.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug)]
pub enum Error<E> {
    /// No complete frame arrived within the timeout.
    Timeout,
    /// A received frame could not be decoded.
    Decode(DecodeError),
    /// The port encountered an unexpected end-of-file.
    UnexpectedEof,
    /// A port-specific input/output error.
    Io(E),
}

impl<E> Error<E> {
    /// Returns whether the error is a transport fault rather than an expected bus condition.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::UnexpectedEof | Self::Io(_))
    }
}

impl<E: core::error::Error> Display for Error<E> {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out"),
            Self::Decode(err) => write!(f, "decode error: {err}"),
            Self::UnexpectedEof => write!(f, "unexpected end-of-file"),
            Self::Io(err) => write!(f, "input/output error: {err}"),
        }
    }
}

impl<E: core::error::Error> core::error::Error for Error<E> {}

impl<E> From<E> for Error<E> {
    fn from(err: E) -> Self {
        Self::Io(err)
    }
}

impl<E> From<ReadExactError<E>> for Error<E> {
    fn from(err: ReadExactError<E>) -> Self {
        match err {
            ReadExactError::UnexpectedEof => Self::UnexpectedEof,
            ReadExactError::Other(err) => Self::Io(err),
        }
    }
}
