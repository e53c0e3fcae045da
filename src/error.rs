//! Error types for configuration, transport and servo-bus operations.

use thiserror::Error;

use crate::joint::ServoId;

/// Errors detected while loading robot, joint or compound-movement configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A servo id is referenced that no registered joint carries.
    #[error("unknown servo id {0}")]
    UnknownServo(ServoId),

    /// Two model joints were mapped onto the same servo id.
    #[error("servo id {0} is assigned to more than one joint")]
    DuplicateServo(ServoId),

    /// A compound movement targets a joint whose kinematic type cannot take it.
    #[error("joint {0} is continuous and cannot take part in a compound movement")]
    KindMismatch(ServoId),

    /// A formula string could not be parsed.
    #[error("malformed formula {formula:?}: {reason}")]
    MalformedFormula { formula: String, reason: String },

    /// A formula references a variable outside its allowed set.
    #[error("formula {formula:?} uses unknown variable {variable:?}")]
    UnknownVariable { formula: String, variable: String },

    /// A dependent joint is itself the primary of a compound movement.
    #[error("compound movement {movement:?}: dependent joint {joint} is also a primary joint")]
    CyclicCompound { movement: String, joint: ServoId },

    /// A key sequence string could not be parsed.
    #[error("invalid key sequence step {0:?}")]
    InvalidKeySequence(String),

    /// A named robot preset does not exist.
    #[error("unknown robot {0:?}")]
    UnknownRobot(String),

    /// A named keyboard layout does not exist.
    #[error("unknown keyboard layout {0:?}")]
    UnknownLayout(String),

    /// A setting holds a value the runtime cannot work with.
    #[error("invalid setting {field}: {reason}")]
    InvalidSetting {
        field: &'static str,
        reason: &'static str,
    },

    /// The configuration document could not be decoded.
    #[error("invalid configuration: {0}")]
    Decode(#[from] serde_json::Error),

    /// The configuration file could not be read or written.
    #[error("configuration i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while acquiring or using a serial transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The operating system refused access to the device.
    #[error("permission denied")]
    PermissionDenied,

    /// No device matched the request.
    #[error("device not found")]
    DeviceNotFound,

    /// The link is already open (or opening).
    #[error("link already open")]
    AlreadyOpen,

    /// Any other I/O failure.
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures local to a single servo-bus request.
#[derive(Debug, Error)]
pub enum BusError {
    /// No complete response frame arrived before the deadline.
    #[error("response timeout")]
    Timeout,

    /// A response frame failed its checksum or could not be framed.
    #[error("corrupt response frame")]
    Corrupt,

    /// The servo answered with a non-zero status byte.
    #[error("servo {id} reported status {status:#04x}")]
    Nack { id: ServoId, status: u8 },

    /// The request cannot be encoded (broadcast read, oversized payload, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// The link has no open transport.
    #[error("link not connected")]
    NotConnected,

    /// The underlying transport failed; the link should be torn down.
    #[error("bus i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    /// Copy of this error; `std::io::Error` itself is not `Clone`.
    pub fn duplicate(&self) -> Self {
        match self {
            BusError::Timeout => BusError::Timeout,
            BusError::Corrupt => BusError::Corrupt,
            BusError::Nack { id, status } => BusError::Nack {
                id: *id,
                status: *status,
            },
            BusError::InvalidRequest(reason) => BusError::InvalidRequest(reason),
            BusError::NotConnected => BusError::NotConnected,
            BusError::Io(e) => BusError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }

    /// Whether this failure means the transport itself is gone.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, BusError::Io(_))
    }
}

/// Failures of the dataset persistence collaborator.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset {0:?} not found")]
    NotFound(String),

    #[error("invalid dataset id {0:?}")]
    InvalidId(String),

    #[error("invalid dataset document: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("dataset i/o: {0}")]
    Io(#[from] std::io::Error),
}
