//! Joint-command arbitration, motion integration and servo-bus control for
//! hobby robot arms.
//!
//! Many input sources (keyboard, gamepad, timed key sequences, a hand-moved
//! leader arm, dataset replay) drive one robot at the same time. This crate
//! turns their intents into a single consistent stream of joint targets and
//! pushes those targets to Feetech STS/SCS servos.
//!
//! # Pipeline
//!
//! ```text
//! sources -> InputArbiter -> CompoundMotionResolver -> JointIntegrator -> snapshot
//!                                                                          |
//!                        leader RobotLink <- poll          push -> follower RobotLink
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use bambot::{robots, Teleop, TeleopConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let robot = robots::preset("so-arm100")?;
//! let mut teleop = Teleop::new(&robot, TeleopConfig::default())?;
//!
//! let mut keyboard = teleop.keyboard("keyboard");
//! let cancel = CancellationToken::new();
//! let handle = teleop.spawn(None, None, cancel.clone());
//!
//! keyboard.key_down("q"); // rotate the base
//! tokio::time::sleep(std::time::Duration::from_millis(500)).await;
//! keyboard.key_up("q");
//!
//! cancel.cancel();
//! handle.join().await?;
//! ```
//!
//! # Feature Flags
//!
//! - `serial` - Local serial ports through `tokio-serial` and the
//!   `bambot-teleop` binary

pub mod arbiter;
pub mod bus;
pub mod compound;
pub mod config;
pub mod connection;
pub mod dataset;
pub mod error;
pub mod expr;
pub mod input;
pub mod integrator;
pub mod intent;
pub mod joint;
pub mod robots;
#[cfg(feature = "serial")]
pub mod serial;
pub mod teleop;
pub mod transport;

pub use arbiter::{ArbiterConfig, HoldPolicy, InputArbiter, TickReport};
pub use bus::{BusConfig, ServoBusClient, ServoFamily, SyncEntry, SyncWriteOutcome};
pub use compound::CompoundMotionResolver;
pub use config::{ConfigStore, JsonFileConfigStore, MemoryConfigStore, TeleopConfig};
pub use connection::{ConnectionState, LinkRole, RobotLink};
pub use dataset::{Dataset, DatasetStore, JsonDirStore, Recorder};
pub use error::{BusError, ConfigError, DatasetError, TransportError};
pub use integrator::{IntegratorConfig, JointIntegrator, JointState};
pub use intent::{IntentEvent, IntentKind, IntentSender, SourceId};
pub use joint::{Joint, JointKind, JointLimit, JointRegistry, ServoId};
pub use teleop::{Teleop, TeleopHandle};
pub use transport::{PortRequest, SimProvider, TransportProvider, UsbFilter};

#[cfg(feature = "serial")]
pub use serial::{list_ports, SerialPortInfo, SerialProvider};
