//! Intent events: the single currency every input source speaks.
//!
//! Sources never touch joint state. They push [`IntentEvent`]s through an
//! [`IntentSender`] into the channel drained by the
//! [`InputArbiter`](crate::arbiter::InputArbiter) once per tick.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::compound::MovementId;
use crate::joint::ServoId;

/// Name of an input source ("keyboard", "gamepad", "leader", ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(Arc<str>);

impl SourceId {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IntentKind {
    /// Set a revolute joint to an exact angle.
    AbsoluteAngle(f64),
    /// Set a continuous joint to an exact speed.
    AbsoluteSpeed(f64),
    /// Nudge a continuous joint's speed.
    SpeedDelta(f64),
    /// Start (or update) a hold with a signed magnitude per millisecond.
    ///
    /// A zero magnitude is a release. `movement` names the compound movement
    /// the hold was triggered through, if any.
    Hold {
        magnitude: f64,
        movement: Option<MovementId>,
    },
    /// End the source's hold on this joint.
    Release,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IntentEvent {
    pub source: SourceId,
    pub servo_id: ServoId,
    pub kind: IntentKind,
    pub timestamp: Instant,
}

/// Messages accepted by the arbiter channel.
#[derive(Clone, Debug, PartialEq)]
pub enum ArbiterInput {
    Intent(IntentEvent),
    /// Drop every claim the source holds (source stopped or disconnected).
    ReleaseSource(SourceId),
}

/// Cloneable handle a source uses to submit intents under its own name.
#[derive(Clone, Debug)]
pub struct IntentSender {
    source: SourceId,
    tx: mpsc::UnboundedSender<ArbiterInput>,
}

impl IntentSender {
    pub(crate) fn new(source: SourceId, tx: mpsc::UnboundedSender<ArbiterInput>) -> Self {
        Self { source, tx }
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    /// Submit an intent. Returns `false` once the arbiter is gone.
    pub fn send(&self, servo_id: ServoId, kind: IntentKind) -> bool {
        self.tx
            .send(ArbiterInput::Intent(IntentEvent {
                source: self.source.clone(),
                servo_id,
                kind,
                timestamp: Instant::now(),
            }))
            .is_ok()
    }

    pub fn hold(&self, servo_id: ServoId, magnitude: f64) -> bool {
        self.send(
            servo_id,
            IntentKind::Hold {
                magnitude,
                movement: None,
            },
        )
    }

    pub fn hold_compound(&self, primary: ServoId, movement: MovementId, magnitude: f64) -> bool {
        self.send(
            primary,
            IntentKind::Hold {
                magnitude,
                movement: Some(movement),
            },
        )
    }

    pub fn release(&self, servo_id: ServoId) -> bool {
        self.send(servo_id, IntentKind::Release)
    }

    pub fn set_angle(&self, servo_id: ServoId, degrees: f64) -> bool {
        self.send(servo_id, IntentKind::AbsoluteAngle(degrees))
    }

    pub fn set_speed(&self, servo_id: ServoId, speed: f64) -> bool {
        self.send(servo_id, IntentKind::AbsoluteSpeed(speed))
    }

    /// Drop all of this source's claims.
    pub fn release_all(&self) -> bool {
        self.tx
            .send(ArbiterInput::ReleaseSource(self.source.clone()))
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
