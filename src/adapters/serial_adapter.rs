use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, trace};

use super::Transport;
use crate::config::{SerialSettings, TimeoutSettings};
use crate::error::{FrelonError, Result};

/// Internal port read timeout; reads loop on it until the caller's deadline.
const PORT_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Serial adapter for the camera RS-232 control line
///
/// Wraps the serialport crate and reads replies byte by byte until the line
/// feed that ends every camera answer.
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyS0", "COM3")
    port_name: String,

    /// Default reply timeout
    timeout: Duration,

    port: Box<dyn SerialPort>,
}

impl SerialAdapter {
    /// Open the port described by `serial`.
    pub fn open(serial: &SerialSettings, timeouts: &TimeoutSettings) -> Result<Self> {
        let port = serialport::new(&serial.port, serial.baud_rate)
            .timeout(PORT_POLL_TIMEOUT)
            .open()?;

        debug!("Serial port '{}' opened at {} baud", serial.port, serial.baud_rate);
        Ok(Self {
            port_name: serial.port.clone(),
            timeout: timeouts.normal,
            port,
        })
    }

    /// Device path.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl Transport for SerialAdapter {
    fn write(&mut self, data: &[u8], no_wait: bool) -> Result<()> {
        self.port.write_all(data)?;
        if !no_wait {
            self.port.flush()?;
        }
        trace!("Sent {} byte(s) on '{}'", data.len(), self.port_name);
        Ok(())
    }

    fn read_line(&mut self, max_len: usize, timeout: Duration) -> Result<String> {
        let mut line = Vec::new();
        let mut buffer = [0u8; 1];
        let start = Instant::now();

        loop {
            if start.elapsed() > timeout {
                return Err(FrelonError::Timeout(timeout));
            }

            match self.port.read(&mut buffer) {
                Ok(1) => {
                    line.push(buffer[0]);
                    if buffer[0] == b'\n' || line.len() >= max_len {
                        break;
                    }
                }
                Ok(_) => {
                    return Err(FrelonError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "Unexpected EOF from serial port",
                    )));
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    // Port timeout is shorter than our overall timeout
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    fn flush(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn available_bytes(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(FrelonError::InvalidValue("serial timeout must be non-zero".into()));
        }
        self.timeout = timeout;
        Ok(())
    }
}
