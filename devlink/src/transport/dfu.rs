//! USB DFU transport using `nusb` blocking control transfers.
//!
//! The device tunnels the same byte stream the serial VCP carries through its
//! DFU class interface: host-to-device bytes travel in `DFU_DNLOAD` blocks and
//! device-to-host bytes are polled with `DFU_UPLOAD`. `DFU_GETSTATUS` serves
//! as the health probe.

use std::time::Duration;

use log::{debug, trace, warn};
use nusb::transfer::{Control, ControlType, Recipient, TransferError};

use crate::error::{Error, Result};
use crate::transport::{DfuConfig, Transport, TransportKind};

/// DFU class request: download block.
pub const DFU_DNLOAD: u8 = 1;
/// DFU class request: upload block.
pub const DFU_UPLOAD: u8 = 2;
/// DFU class request: get status.
pub const DFU_GETSTATUS: u8 = 3;

/// Largest block moved per control transfer.
const TRANSFER_SIZE: usize = 64;

/// Back-off when an upload returned nothing.
const IDLE_POLL: Duration = Duration::from_millis(5);

/// USB DFU transport.
pub struct DfuTransport {
    config: DfuConfig,
    interface: Option<nusb::Interface>,
    name: String,
    block: u16,
    healthy: bool,
}

impl DfuTransport {
    /// Create a closed transport for `config`.
    pub fn new(config: DfuConfig) -> Self {
        let name = format!("usb:{:04x}:{:04x}", config.vid, config.pid);
        Self {
            config,
            interface: None,
            name,
            block: 0,
            healthy: false,
        }
    }

    fn control(&self, request: u8, value: u16) -> Control {
        Control {
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: u16::from(self.config.interface),
        }
    }

    fn interface(&self) -> Result<&nusb::Interface> {
        self.interface
            .as_ref()
            .ok_or_else(|| Error::Transport(format!("{} is not open", self.name)))
    }

    fn fail(&mut self, err: &TransferError) -> Error {
        self.healthy = false;
        match err {
            TransferError::Disconnected => Error::LinkLost { sequence: None },
            other => Error::Transport(format!("{}: {other}", self.name)),
        }
    }

    /// Query `DFU_GETSTATUS`; returns the bStatus byte.
    fn status(&mut self) -> Result<u8> {
        let mut status = [0u8; 6];
        let control = self.control(DFU_GETSTATUS, 0);
        let result = self
            .interface()?
            .control_in_blocking(control, &mut status, self.config.timeout);
        match result {
            Ok(n) if n >= 1 => Ok(status[0]),
            Ok(_) => Err(Error::Transport("short DFU status".to_string())),
            Err(e) => Err(self.fail(&e)),
        }
    }
}

impl Transport for DfuTransport {
    fn open(&mut self) -> Result<()> {
        self.interface.take();

        let info = nusb::list_devices()?
            .find(|d| d.vendor_id() == self.config.vid && d.product_id() == self.config.pid)
            .ok_or_else(|| Error::Transport(format!("{} not found", self.name)))?;
        debug!(
            "Found DFU device on bus {} addr {}",
            info.bus_number(),
            info.device_address()
        );

        let device = info.open()?;
        let interface = device.detach_and_claim_interface(self.config.interface)?;
        self.interface = Some(interface);
        self.block = 0;
        self.healthy = true;

        let status = self.status()?;
        if status != 0 {
            warn!("DFU device reports status {status:#04x} after open");
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.interface.take().is_some() {
            trace!("Released {}", self.name);
        }
        self.healthy = false;
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = buf.len().min(TRANSFER_SIZE);
        let control = self.control(DFU_UPLOAD, self.block);
        let result = self
            .interface()?
            .control_in_blocking(control, &mut buf[..len], self.config.timeout);
        match result {
            Ok(0) | Err(TransferError::Cancelled) => {
                std::thread::sleep(IDLE_POLL);
                Ok(0)
            },
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail(&e)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(TRANSFER_SIZE) {
            let control = self.control(DFU_DNLOAD, self.block);
            let result = self
                .interface()?
                .control_out_blocking(control, chunk, self.config.timeout);
            if let Err(e) = result {
                return Err(self.fail(&e));
            }
            self.block = self.block.wrapping_add(1);
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.healthy && self.interface.is_some()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::UsbDfu
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_selector() {
        let transport = DfuTransport::new(DfuConfig::new(0x0483, 0xDF11));
        assert_eq!(transport.name(), "usb:0483:df11");
        assert_eq!(transport.kind(), TransportKind::UsbDfu);
        assert!(!transport.is_healthy());
    }

    #[test]
    fn test_closed_transport_rejects_io() {
        let mut transport = DfuTransport::new(DfuConfig::new(0x0483, 0xDF11));
        assert!(transport.write(b"x").is_err());
    }
}
