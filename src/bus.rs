//! Serial bus transport.
//!
//! The [`Bus`] exclusively owns the serial port. Holding a mutable
//! reference to it is the right to perform an exchange on the shared medium,
//! so no two requests can ever be interleaved.

use crate::{
    Error, Read, Result, Write,
    frame::{self, Frame, Scan},
};
use alloc::{boxed::Box, vec::Vec};
use core::time::Duration;
use embassy_futures::select::{Either, select};
use log::trace;

/// Monotonic time source used for timeouts and bus silence.
///
/// Implementations exist for the native tokio runtime
/// ([`serial::TokioClock`](crate::serial::TokioClock)) and can be
/// provided for any embedded timer.
#[async_trait::async_trait(?Send)]
pub trait Clock {
    /// Returns the time elapsed since an arbitrary, fixed epoch.
    fn now(&self) -> Duration;

    /// Suspends the caller for the given duration.
    async fn sleep(&self, dur: Duration);
}

/// Half-duplex bus transport.
#[derive(Debug)]
pub struct Bus<P, C> {
    port: P,
    clock: C,
    gap: Duration,
    last_activity: Option<Duration>,
}

impl<P: Read + Write, C: Clock> Bus<P, C> {
    /// Constructs a new bus transport.
    ///
    /// `gap` is the minimum silence kept on the bus before transmitting.
    pub fn new(port: P, clock: C, gap: Duration) -> Self {
        Self {
            port,
            clock,
            gap,
            last_activity: None,
        }
    }

    /// Returns the clock used by the transport.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Returns a mutable reference to the underlying port.
    pub fn port(&mut self) -> &mut P {
        &mut self.port
    }

    /// Transmits raw bytes on the bus.
    ///
    /// Waits until the bus has been silent for at least the configured gap,
    /// counting from the last byte sent or received.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), P::Error> {
        if let Some(last) = self.last_activity {
            let idle = self.clock.now().saturating_sub(last);

            if idle < self.gap {
                self.clock.sleep(self.gap - idle).await;
            }
        }

        trace!("Write to bus: {data:02x?}");
        self.port.write_all(data).await?;
        self.port.flush().await?;
        self.last_activity = Some(self.clock.now());

        Ok(())
    }

    /// Receives the raw bytes of the next frame on the bus.
    ///
    /// Garbage preceding the preamble is skipped. The checksum is not verified.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no complete frame arrived in time.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, P::Error> {
        let read = read_frame(&mut self.port, &self.clock, &mut self.last_activity);

        match select(read, self.clock.sleep(timeout)).await {
            Either::First(res) => res,
            Either::Second(()) => Err(Error::Timeout),
        }
    }

    /// Receives and decodes the next frame on the bus.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no complete frame arrived in time.
    /// - [`Error::Decode`] if the received frame is invalid.
    pub async fn receive_frame(&mut self, timeout: Duration) -> Result<Frame, P::Error> {
        let raw = self.receive(timeout).await?;

        Frame::decode(&raw).map_err(Error::Decode)
    }
}

/// Reads bytes until a complete frame has been collected.
async fn read_frame<P: Read, C: Clock>(
    port: &mut P,
    clock: &C,
    last_activity: &mut Option<Duration>,
) -> Result<Vec<u8>, P::Error> {
    let mut buf = Vec::new();

    loop {
        let mut byte = [0x00];

        port.read_exact(&mut byte).await?;
        *last_activity = Some(clock.now());
        buf.push(byte[0]);

        match frame::scan(&buf) {
            Scan::Complete(_) => {
                trace!("Read from bus: {buf:02x?}");

                return Ok(buf);
            }
            Scan::Incomplete => {}
            Scan::Invalid => {
                // Later bytes may still start a new preamble
                let skip = (1..=buf.len())
                    .find(|&n| frame::scan(&buf[n..]) != Scan::Invalid)
                    .unwrap_or(buf.len());

                trace!("Skipping bytes: {:02x?}", &buf[..skip]);
                buf.drain(..skip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::{Address, Command, DecodeError},
        tests::{MockClock, MockPort, init_logger},
    };
    use alloc::vec;
    use embedded_io_async::ErrorKind;

    const TIMEOUT: Duration = Duration::from_millis(500);
    const GAP: Duration = Duration::from_millis(100);

    fn status_response() -> Vec<u8> {
        Frame::new(
            Address::CONTROLLER,
            Address(0x60),
            Command::Status,
            vec![0x0a, 0x00, 0x02, 0x01, 0x2c, 0x06, 0x40],
        )
        .unwrap()
        .encode()
    }

    #[tokio::test]
    async fn send_waits_for_silence() -> Result<(), ErrorKind> {
        init_logger();

        let clock = MockClock::default();
        let mut bus = Bus::new(MockPort::default(), clock.clone(), GAP);

        bus.send(&[0x01]).await?;

        assert_eq!(clock.now(), Duration::ZERO, "first send should not wait");

        clock.advance(Duration::from_millis(30));
        bus.send(&[0x02]).await?;

        assert_eq!(
            clock.now(),
            Duration::from_millis(100),
            "second send should wait for remaining gap"
        );

        clock.advance(Duration::from_secs(1));
        bus.send(&[0x03]).await?;

        assert_eq!(
            clock.now(),
            Duration::from_millis(1100),
            "send after silence should not wait"
        );
        assert_eq!(
            bus.port().sent,
            [vec![0x01], vec![0x02], vec![0x03]],
            "sent bytes should be correct"
        );

        Ok(())
    }

    #[tokio::test]
    async fn receive_refreshes_silence() -> Result<(), ErrorKind> {
        init_logger();

        let clock = MockClock::default();
        let mut bus = Bus::new(MockPort::default(), clock.clone(), GAP);

        clock.advance(Duration::from_secs(1));
        bus.port().inject(&status_response());
        bus.receive(TIMEOUT).await?;
        bus.send(&[0x01]).await?;

        assert_eq!(
            clock.now(),
            Duration::from_millis(1100),
            "send should wait for gap after received frame"
        );

        Ok(())
    }

    #[tokio::test]
    async fn receive_frame() -> Result<(), ErrorKind> {
        init_logger();

        let mut bus = Bus::new(MockPort::default(), MockClock::default(), GAP);

        bus.port().inject(&status_response());

        let frame = bus.receive_frame(TIMEOUT).await?;

        assert_eq!(frame.command(), Command::Status, "command should be correct");
        assert_eq!(
            frame.payload(),
            [0x0a, 0x00, 0x02, 0x01, 0x2c, 0x06, 0x40],
            "payload should be correct"
        );

        Ok(())
    }

    #[tokio::test]
    async fn receive_resynchronizes() -> Result<(), ErrorKind> {
        init_logger();

        let mut bus = Bus::new(MockPort::default(), MockClock::default(), GAP);
        let resp = status_response();

        // Line noise and a doubled leading preamble byte
        bus.port().inject(&[0x00, 0x12, 0xff, 0xa5, 0xff]);
        bus.port().inject(&resp);

        assert_eq!(
            bus.receive(TIMEOUT).await?,
            resp,
            "frame should be found after garbage"
        );

        Ok(())
    }

    #[tokio::test]
    async fn receive_after_partial_preamble() -> Result<(), ErrorKind> {
        init_logger();

        let mut bus = Bus::new(MockPort::default(), MockClock::default(), GAP);
        let resp = status_response();

        // Truncated frame start overlapping the real preamble
        bus.port().inject(&[0xff, 0x00]);
        bus.port().inject(&resp);

        assert_eq!(
            bus.receive(TIMEOUT).await?,
            resp,
            "frame should be found after partial preamble"
        );

        Ok(())
    }

    #[tokio::test]
    async fn error_timeout() -> Result<(), ErrorKind> {
        init_logger();

        let clock = MockClock::default();
        let mut bus = Bus::new(MockPort::default(), clock.clone(), GAP);

        // Partial frame only
        bus.port().inject(&status_response()[..6]);

        assert_eq!(
            bus.receive(TIMEOUT).await,
            Err(Error::Timeout),
            "result should be timeout error"
        );
        assert_eq!(clock.now(), TIMEOUT, "timeout should elapse");

        Ok(())
    }

    #[tokio::test]
    async fn error_decode() -> Result<(), ErrorKind> {
        init_logger();

        let mut bus = Bus::new(MockPort::default(), MockClock::default(), GAP);
        let mut resp = status_response();
        let last = resp.len() - 1;

        resp[last] ^= 0x01;
        bus.port().inject(&resp);

        assert!(
            matches!(
                bus.receive_frame(TIMEOUT).await,
                Err(Error::Decode(DecodeError::ChecksumMismatch { .. }))
            ),
            "result should be checksum mismatch error"
        );

        Ok(())
    }

    #[tokio::test]
    async fn error_io() -> Result<(), ErrorKind> {
        init_logger();

        let mut bus = Bus::new(MockPort::default(), MockClock::default(), GAP);

        bus.port().fail = true;

        assert_eq!(
            bus.send(&[0x00]).await,
            Err(Error::Io(ErrorKind::BrokenPipe)),
            "result should be input/output error"
        );

        Ok(())
    }
}
