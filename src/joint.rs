//! Static joint metadata discovered from the loaded robot model.
//!
//! The registry is replaced as a whole on every model load. Iteration order
//! is the discovery order of the model graph and every other component
//! (integrator snapshots, dataset columns, bus batches) relies on it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Wire-protocol address of a servo, stable for the lifetime of a robot.
pub type ServoId = u8;

/// How a joint is commanded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JointKind {
    /// Position controlled, absolute angle clamped to the joint limit.
    Revolute,
    /// Velocity controlled, unbounded angle.
    Continuous,
}

/// Angle limits in degrees. Either side may be missing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JointLimit {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl JointLimit {
    pub fn new(lower: Option<f64>, upper: Option<f64>) -> Self {
        Self { lower, upper }
    }

    /// Clamp `degrees` into the limit, leaving a missing side unbounded.
    pub fn clamp(&self, degrees: f64) -> f64 {
        let mut value = degrees;
        if let Some(lower) = self.lower {
            value = value.max(lower);
        }
        if let Some(upper) = self.upper {
            value = value.min(upper);
        }
        value
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Joint {
    pub servo_id: ServoId,
    pub name: String,
    pub kind: JointKind,
    pub limit: JointLimit,
}

/// A joint as reported by the model collaborator, before servo ids are assigned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelJoint {
    pub name: String,
    pub kind: JointKind,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl ModelJoint {
    pub fn new(name: &str, kind: JointKind, lower: Option<f64>, upper: Option<f64>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            lower,
            upper,
        }
    }

    /// Build from URDF-style limits expressed in radians.
    pub fn from_radians(name: &str, kind: JointKind, lower: Option<f64>, upper: Option<f64>) -> Self {
        Self::new(
            name,
            kind,
            lower.map(f64::to_degrees),
            upper.map(f64::to_degrees),
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct JointRegistry {
    joints: Vec<Joint>,
    index: HashMap<ServoId, usize>,
}

impl JointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from model joints, mapping names onto servo ids.
    ///
    /// Model joints without an entry in `name_ids` (fixed links, passive
    /// joints) are skipped.
    pub fn from_model(
        model: &[ModelJoint],
        name_ids: &HashMap<String, ServoId>,
    ) -> Result<Self, ConfigError> {
        let joints = model
            .iter()
            .filter_map(|mj| {
                let Some(&servo_id) = name_ids.get(&mj.name) else {
                    tracing::debug!("Model joint {} has no servo id, skipping", mj.name);
                    return None;
                };
                Some(Joint {
                    servo_id,
                    name: mj.name.clone(),
                    kind: mj.kind,
                    limit: JointLimit::new(mj.lower, mj.upper),
                })
            })
            .collect();

        let mut registry = Self::new();
        registry.register(joints)?;
        Ok(registry)
    }

    /// Replace the whole joint set.
    ///
    /// The new set is validated before anything is swapped in, so a failed
    /// call leaves the previous set intact.
    pub fn register(&mut self, joints: Vec<Joint>) -> Result<(), ConfigError> {
        let mut index = HashMap::with_capacity(joints.len());
        for (i, joint) in joints.iter().enumerate() {
            if index.insert(joint.servo_id, i).is_some() {
                return Err(ConfigError::DuplicateServo(joint.servo_id));
            }
        }

        tracing::info!("Registered {} joints", joints.len());
        self.joints = joints;
        self.index = index;
        Ok(())
    }

    pub fn get(&self, servo_id: ServoId) -> Option<&Joint> {
        self.index.get(&servo_id).map(|&i| &self.joints[i])
    }

    pub fn by_name(&self, name: &str) -> Option<&Joint> {
        self.joints.iter().find(|j| j.name == name)
    }

    /// All joints in discovery order.
    pub fn all(&self) -> &[Joint] {
        &self.joints
    }

    /// Position of a servo in discovery order (its dataset column).
    pub fn position(&self, servo_id: ServoId) -> Option<usize> {
        self.index.get(&servo_id).copied()
    }

    pub fn ids_of_kind(&self, kind: JointKind) -> Vec<ServoId> {
        self.joints
            .iter()
            .filter(|j| j.kind == kind)
            .map(|j| j.servo_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }
}
