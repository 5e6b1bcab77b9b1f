//! Serial port link implementation

use super::{ConnectionFault, FaultKind, LinkOpener, SerialLink};
use crate::core::port::{PortConfig, SerialFlowControl, SerialParity};
use serde::Serialize;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use std::io::{self, Read};
use std::time::Duration;

/// Open serial port owned by one session
pub struct SerialPortLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink for SerialPortLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn bytes_to_read(&self) -> io::Result<u32> {
        self.port.bytes_to_read().map_err(io::Error::from)
    }

    fn clear_input(&self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Opens real serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortOpener;

impl LinkOpener for SerialPortOpener {
    fn open(
        &self,
        config: &PortConfig,
        timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, ConnectionFault> {
        let data_bits = match config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match config.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(timeout)
            .open()
            .map_err(|e| {
                let kind = match e.kind() {
                    serialport::ErrorKind::NoDevice => FaultKind::PortNotFound,
                    serialport::ErrorKind::InvalidInput => FaultKind::InvalidSettings,
                    serialport::ErrorKind::Io(io::ErrorKind::NotFound) => FaultKind::PortNotFound,
                    serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                        FaultKind::PermissionDenied
                    }
                    _ => FaultKind::LinkLost,
                };
                ConnectionFault::new(kind, &config.port, e.to_string())
            })?;

        Ok(Box::new(SerialPortLink { port }))
    }
}

/// Serial port present on this host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortListing {
    /// Platform port name
    pub name: String,
    /// Adapter description
    pub description: String,
}

/// List available serial ports
pub fn available_ports() -> io::Result<Vec<PortListing>> {
    let ports = serialport::available_ports().map_err(io::Error::from)?;
    Ok(ports
        .into_iter()
        .map(|info| PortListing {
            description: describe(&info.port_type),
            name: info.port_name,
        })
        .collect())
}

fn describe(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => {
            let product = usb.product.as_deref().unwrap_or("USB serial");
            format!("{} ({:04x}:{:04x})", product, usb.vid, usb.pid)
        }
        SerialPortType::PciPort => "PCI".to_string(),
        SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        SerialPortType::Unknown => "Unknown".to_string(),
    }
}
