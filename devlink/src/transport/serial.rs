//! Serial VCP transport using the `serialport` crate.

use std::io::{ErrorKind, Read, Write};

use log::{debug, trace};
use serialport::ClearBuffer;

use crate::error::{Error, Result};
use crate::transport::{DataBits, FlowControl, Parity, SerialConfig, StopBits, Transport, TransportKind};

/// Serial port transport.
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    config: SerialConfig,
    healthy: bool,
}

impl SerialTransport {
    /// Create a closed transport for `config`.
    pub fn new(config: SerialConfig) -> Self {
        Self {
            port: None,
            config,
            healthy: false,
        }
    }

    /// The configuration this transport opens with.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("{} is not open", self.config.port_name)))
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        self.port.take();

        let mut port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .timeout(self.config.timeout)
            .data_bits(self.config.data_bits.into())
            .parity(self.config.parity.into())
            .stop_bits(self.config.stop_bits.into())
            .flow_control(self.config.flow_control.into())
            .open()?;
        port.clear(ClearBuffer::All)?;

        debug!(
            "Opened {} at {} baud",
            self.config.port_name, self.config.baud_rate
        );
        self.port = Some(port);
        self.healthy = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            trace!("Closed {}", self.config.port_name);
        }
        self.healthy = false;
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.port_mut()?.read(buf);
        match result {
            Ok(0) => {
                // A zero-length read without timeout means the device went away.
                self.healthy = false;
                Err(Error::LinkLost { sequence: None })
            },
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.healthy = false;
                Err(Error::Io(e))
            },
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        let result = port
            .write_all(data)
            .and_then(|()| port.flush());
        if let Err(e) = result {
            self.healthy = false;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy && self.port.is_some()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn name(&self) -> &str {
        &self.config.port_name
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
            FlowControl::Software => Self::Software,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_transport_rejects_io() {
        let mut transport = SerialTransport::new(SerialConfig::new("/dev/does-not-exist", 115200));
        assert!(!transport.is_healthy());
        assert!(transport.write(b"x").is_err());
        let mut buf = [0u8; 4];
        assert!(transport.read(&mut buf).is_err());
    }

    #[test]
    fn test_open_missing_port_fails() {
        let mut transport = SerialTransport::new(SerialConfig::new("/dev/does-not-exist", 115200));
        assert!(transport.open().is_err());
        assert_eq!(transport.kind(), TransportKind::Serial);
        assert_eq!(transport.name(), "/dev/does-not-exist");
    }

    #[test]
    fn test_serial_type_conversions() {
        assert_eq!(serialport::Parity::from(Parity::Even), serialport::Parity::Even);
        assert_eq!(serialport::StopBits::from(StopBits::Two), serialport::StopBits::Two);
        assert_eq!(
            serialport::FlowControl::from(FlowControl::Hardware),
            serialport::FlowControl::Hardware
        );
    }
}
