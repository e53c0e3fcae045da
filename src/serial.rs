//! Serial-port transport for real servo adapters.
//!
//! Ports are opened through [`tokio-serial`](https://crates.io/crates/tokio-serial)
//! and enumerated through `serialport`, which works on Linux, macOS and
//! Windows.
//!
//! # Example
//!
//! ```no_run
//! use bambot::serial::{list_ports, PortType};
//!
//! for port in list_ports()? {
//!     if let PortType::Usb { vid, pid, .. } = &port.port_type {
//!         println!("{} - USB {:04x}:{:04x}", port.name, vid, pid);
//!     }
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::io;

use anyhow::Result;
use tokio_serial::SerialPortBuilderExt;

use crate::error::TransportError;
use crate::transport::{BoxedTransport, PortRequest, TransportProvider};

/// Serial line settings. Servo buses run 8N1.
#[derive(Clone, Debug)]
pub struct SerialConfig {
    /// Port name (e.g., "/dev/ttyUSB0" on Linux, "COM3" on Windows)
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl SerialConfig {
    /// 8 data bits, no parity, 1 stop bit.
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<Parity> for tokio_serial::Parity {
    fn from(p: Parity) -> Self {
        match p {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(sb: StopBits) -> Self {
        match sb {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

/// Information about a detected serial port.
///
/// Returned by [`list_ports`].
#[derive(Clone, Debug)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" on Linux, "COM3" on Windows)
    pub name: String,
    pub port_type: PortType,
}

/// Type of serial port hardware.
#[derive(Clone, Debug)]
pub enum PortType {
    /// USB serial adapter (what servo driver boards show up as)
    Usb {
        vid: u16,
        pid: u16,
        manufacturer: Option<String>,
        product: Option<String>,
    },
    Pci,
    Bluetooth,
    Unknown,
}

/// List available serial ports on the system.
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| SerialPortInfo {
            name: p.port_name,
            port_type: match p.port_type {
                serialport::SerialPortType::UsbPort(info) => PortType::Usb {
                    vid: info.vid,
                    pid: info.pid,
                    manufacturer: info.manufacturer,
                    product: info.product,
                },
                serialport::SerialPortType::PciPort => PortType::Pci,
                serialport::SerialPortType::BluetoothPort => PortType::Bluetooth,
                serialport::SerialPortType::Unknown => PortType::Unknown,
            },
        })
        .collect())
}

/// Pick the first port satisfying `request`'s USB filters.
pub fn select_port(ports: &[SerialPortInfo], request: &PortRequest) -> Option<String> {
    ports.iter().find_map(|p| match &p.port_type {
        PortType::Usb { vid, pid, .. } if request.matches_usb(*vid, *pid) => Some(p.name.clone()),
        _ => None,
    })
}

fn map_serial_error(e: tokio_serial::Error) -> TransportError {
    match e.kind {
        tokio_serial::ErrorKind::NoDevice => TransportError::DeviceNotFound,
        tokio_serial::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            TransportError::PermissionDenied
        }
        tokio_serial::ErrorKind::Io(io::ErrorKind::NotFound) => TransportError::DeviceNotFound,
        tokio_serial::ErrorKind::Io(kind) => TransportError::Io(io::Error::new(kind, e.description)),
        _ => TransportError::Io(io::Error::new(io::ErrorKind::Other, e.description)),
    }
}

/// Opens servo adapters as async serial streams.
#[derive(Clone, Debug, Default)]
pub struct SerialProvider {
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl SerialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(&self, request: &PortRequest) -> Result<SerialConfig, TransportError> {
        let port = match &request.path {
            Some(path) => path.clone(),
            None => {
                let ports = list_ports().map_err(|e| {
                    TransportError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
                })?;
                select_port(&ports, request).ok_or(TransportError::DeviceNotFound)?
            }
        };
        let mut config = SerialConfig::new(&port, request.baud_rate);
        config.parity = self.parity;
        config.stop_bits = self.stop_bits;
        Ok(config)
    }
}

impl TransportProvider for SerialProvider {
    fn open(&self, request: &PortRequest) -> Result<BoxedTransport, TransportError> {
        let config = self.resolve(request)?;
        tracing::info!("Opening serial port {} at {} baud", config.port, config.baud_rate);

        let port = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .open_native_async()
            .map_err(map_serial_error)?;
        Ok(Box::new(port))
    }
}
