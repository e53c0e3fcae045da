//! Servo-bus protocol: framing, servo families, the request/response client
//! and an in-process simulated bus.
//!
//! # Example
//!
//! ```no_run
//! use bambot::bus::{sim::VirtualServoBus, ServoBusClient, ServoFamily};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let bus = VirtualServoBus::new(ServoFamily::Sts, 1..=6);
//! let mut client = ServoBusClient::new(bus.connect(), ServoFamily::Sts, Duration::from_millis(30));
//! client.write_torque_enable(1, true).await?;
//! client.write_position(1, 90.0, 0).await?;
//! println!("servo 1 at {:.1} deg", client.read_position(1).await?);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod family;
pub mod frame;
pub mod sim;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use client::{ServoBusClient, SyncWriteOutcome};
pub use family::{ServoFamily, SyncEntry};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub family: ServoFamily,
    /// Deadline for one response frame.
    pub response_timeout_ms: u64,
    /// Interval between pushes of changed targets to the follower.
    pub push_interval_ms: u64,
    /// Raw goal speed sent with position writes, 0 for the servo default.
    pub speed_hint: u16,
    pub baud_rate: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            family: ServoFamily::Sts,
            response_timeout_ms: 30,
            push_interval_ms: 50,
            speed_hint: 0,
            baud_rate: 1_000_000,
        }
    }
}

impl BusConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms.max(1))
    }
}
