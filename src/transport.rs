//! Byte transports the servo-bus client runs over.
//!
//! A [`TransportProvider`] turns a [`PortRequest`] into an open
//! [`BoxedTransport`]. Real hardware goes through
//! [`SerialProvider`](crate::serial::SerialProvider) (feature `serial`);
//! tests and `sim` runs use [`SimProvider`].

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::bus::sim::VirtualServoBus;
use crate::error::TransportError;

/// Any async byte stream usable as a servo bus.
pub trait BusTransport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BusTransport for T {}

pub type BoxedTransport = Box<dyn BusTransport>;

/// USB identity a port must match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsbFilter {
    pub vid: u16,
    pub pid: Option<u16>,
}

/// Which device to open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortRequest {
    /// Explicit device path; wins over filters.
    pub path: Option<String>,
    pub filters: Vec<UsbFilter>,
    pub baud_rate: u32,
}

impl PortRequest {
    pub fn path(path: &str, baud_rate: u32) -> Self {
        Self {
            path: Some(path.to_string()),
            filters: Vec::new(),
            baud_rate,
        }
    }

    pub fn usb(filters: Vec<UsbFilter>, baud_rate: u32) -> Self {
        Self {
            path: None,
            filters,
            baud_rate,
        }
    }

    pub fn matches_usb(&self, vid: u16, pid: u16) -> bool {
        self.filters.is_empty()
            || self
                .filters
                .iter()
                .any(|f| f.vid == vid && f.pid.map_or(true, |p| p == pid))
    }
}

pub trait TransportProvider: Send + Sync {
    fn open(&self, request: &PortRequest) -> Result<BoxedTransport, TransportError>;
}

/// Opens connections to a [`VirtualServoBus`].
#[derive(Debug)]
pub struct SimProvider {
    bus: VirtualServoBus,
    plugged: AtomicBool,
}

impl SimProvider {
    pub fn new(bus: VirtualServoBus) -> Self {
        Self {
            bus,
            plugged: AtomicBool::new(true),
        }
    }

    pub fn bus(&self) -> &VirtualServoBus {
        &self.bus
    }

    /// Simulate unplugging the adapter: open connections drop and further
    /// opens fail with [`TransportError::DeviceNotFound`].
    pub fn unplug(&self) {
        self.plugged.store(false, Ordering::SeqCst);
        self.bus.sever();
    }

    pub fn plug(&self) {
        self.plugged.store(true, Ordering::SeqCst);
    }
}

impl TransportProvider for SimProvider {
    fn open(&self, _request: &PortRequest) -> Result<BoxedTransport, TransportError> {
        if !self.plugged.load(Ordering::SeqCst) {
            return Err(TransportError::DeviceNotFound);
        }
        Ok(Box::new(self.bus.connect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_filter_matching() {
        let any = PortRequest::usb(Vec::new(), 1_000_000);
        assert!(any.matches_usb(0x1a86, 0x7523));

        let ch340 = PortRequest::usb(
            vec![UsbFilter {
                vid: 0x1a86,
                pid: Some(0x7523),
            }],
            1_000_000,
        );
        assert!(ch340.matches_usb(0x1a86, 0x7523));
        assert!(!ch340.matches_usb(0x1a86, 0x55d3));

        let vendor = PortRequest::usb(vec![UsbFilter { vid: 0x1a86, pid: None }], 1_000_000);
        assert!(vendor.matches_usb(0x1a86, 0x55d3));
    }

    #[tokio::test]
    async fn test_unplugged_sim_is_not_found() {
        let provider = SimProvider::new(VirtualServoBus::new(Default::default(), [1]));
        let request = PortRequest::path("sim", 1_000_000);
        assert!(provider.open(&request).is_ok());

        provider.unplug();
        assert!(matches!(provider.open(&request), Err(TransportError::DeviceNotFound)));
        provider.plug();
        assert!(provider.open(&request).is_ok());
    }
}
