//! Native asynchronous serial port and clock support for [`Scheduler`](crate::scheduler::Scheduler).
//!
//! Uses the [`serial2-tokio`](https://crates.io/crates/serial2-tokio) crate
//! and the [`tokio`](https://crates.io/crates/tokio) timer.

extern crate std;

use crate::{Error, bus::Clock};
use alloc::boxed::Box;
use core::time::Duration;
use embedded_io_adapters::tokio_1::FromTokio;
use embedded_io_async::ErrorType;
use serial2_tokio::{CharSize, Parity, SerialPort, Settings, StopBits};
use tokio::time::{self, Instant};

/// Serial port type implementing [`Read`](embedded_io_async::Read)
/// and [`Write`](embedded_io_async::Write).
pub type Port = FromTokio<SerialPort>;

/// Port-specific error type to be used as `E` for the generic [`Error<E>`] type.
pub type PortError = <Port as ErrorType>::Error;

/// Opens a native serial port at the given path.
///
/// The port is configured for 9600 baud, 8 data bits, no parity and one stop bit.
/// Returns a [`Port`] that can be passed to [`Scheduler::new`](crate::scheduler::Scheduler::new).
pub fn open(path: &str) -> Result<Port, Error<std::io::Error>> {
    let port = SerialPort::open(path, |mut settings: Settings| {
        settings.set_raw();
        settings.set_baud_rate(9600)?;
        settings.set_char_size(CharSize::Bits8);
        settings.set_parity(Parity::None);
        settings.set_stop_bits(StopBits::One);

        Ok(settings)
    })?;

    port.discard_buffers()?;

    Ok(FromTokio::new(port))
}

/// [`Clock`] backed by the tokio timer.
#[derive(Copy, Clone, Debug)]
pub struct TokioClock {
    start: Instant,
}

impl TokioClock {
    /// Constructs a clock whose epoch is the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait(?Send)]
impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn sleep(&self, dur: Duration) {
        time::sleep(dur).await;
    }
}
