use crate::Result;

/// Parity bit setting on the serial line.
///
/// The handshake always starts without parity; the STC12 and later
/// bootloaders expect even parity once their protocol is selected, and
/// the STC89A variant switches mid-session after the baud test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
}

/// Serial line abstraction the programming core runs on.
///
/// Implementations exist for PC serial ports and for embedded UARTs; the
/// core only requires byte-stream semantics (8 data bits, 1 stop bit, LSB
/// first) plus a millisecond clock for deadlines.
///
/// A failed call maps to [`Error::Timeout`](crate::Error::Timeout) when the
/// deadline elapsed without a byte, and to
/// [`Error::Protocol`](crate::Error::Protocol) for any other transport
/// fault.
pub trait Transport {
    /// Reconfigure the line speed.
    fn set_baudrate(&mut self, baudrate: u32) -> Result<()>;
    /// Reconfigure the parity bit.
    fn set_parity(&mut self, parity: Parity) -> Result<()>;
    /// Send bytes, returning the count actually written.
    fn write(&mut self, data: &[u8], timeout_ms: u32) -> Result<usize>;
    /// Receive up to `buf.len()` bytes.
    ///
    /// Returns as soon as at least one byte is available; a short read is
    /// normal when the timeout elapses with data already accumulated. No
    /// byte at all within `timeout_ms` is an `Err(Timeout)`.
    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize>;
    /// Discard anything already buffered in the receive direction.
    fn flush(&mut self);
    /// Block for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);
    /// Monotonic millisecond tick, wrapping arithmetic allowed.
    fn tick_ms(&mut self) -> u32;
}
