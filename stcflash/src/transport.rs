//! PC serial port backend for the programming core.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use stc_isp::{Error, Parity, Transport};

/// [`Transport`] over a host serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    opened: Instant,
}

impl SerialTransport {
    pub fn open(path: &str, baudrate: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(path, baudrate)
            .timeout(Duration::from_millis(100))
            .open()?;
        Ok(Self {
            port,
            opened: Instant::now(),
        })
    }
}

impl Transport for SerialTransport {
    fn set_baudrate(&mut self, baudrate: u32) -> Result<(), Error> {
        self.port.set_baud_rate(baudrate).map_err(|_| Error::Protocol)
    }

    fn set_parity(&mut self, parity: Parity) -> Result<(), Error> {
        let parity = match parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
        };
        self.port.set_parity(parity).map_err(|_| Error::Protocol)
    }

    fn write(&mut self, data: &[u8], timeout_ms: u32) -> Result<usize, Error> {
        self.port
            .set_timeout(Duration::from_millis(timeout_ms as u64))
            .map_err(|_| Error::Protocol)?;
        self.port.write_all(data).map_err(|_| Error::Timeout)?;
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Error> {
        self.port
            .set_timeout(Duration::from_millis(timeout_ms.max(1) as u64))
            .map_err(|_| Error::Protocol)?;
        match self.port.read(buf) {
            Ok(0) => Err(Error::Timeout),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(Error::Timeout),
            Err(_) => Err(Error::Protocol),
        }
    }

    fn flush(&mut self) {
        let _ = self.port.clear(ClearBuffer::Input);
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }

    fn tick_ms(&mut self) -> u32 {
        self.opened.elapsed().as_millis() as u32
    }
}
