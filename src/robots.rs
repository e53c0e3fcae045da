//! Built-in robot presets.
//!
//! A [`RobotConfig`] carries everything the control layer needs about one
//! robot model: its joints, servo ids, initial pose, keyboard layout and
//! compound movements. Presets are plain serde data, so a robot can also be
//! loaded from JSON with [`RobotConfig::from_json`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::compound::{CompoundMotionResolver, CompoundMovementConfig, DependentConfig};
use crate::error::ConfigError;
use crate::input::keyboard::KeyboardMap;
use crate::joint::{JointKind, JointRegistry, ModelJoint, ServoId};

pub const PRESETS: &[&str] = &["so-arm100", "bambot-b0"];

/// Keyboard layouts accepted by [`RobotConfig::with_layout`].
pub const LAYOUTS: &[&str] = &["default", "wasd"];

/// WASD layout by joint name: `(joint, decrease_key, increase_key)`.
const WASD_KEYS: [(&str, &str, &str); 6] = [
    ("Rotation", "q", "d"),
    ("Pitch", "s", "w"),
    ("Elbow", "x", "z"),
    ("Wrist_Pitch", "v", "c"),
    ("Wrist_Roll", "2", "1"),
    ("Jaw", "4", "3"),
];

/// Servo-space angle every arm joint starts at.
pub const HOME_DEGREES: f64 = 180.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotConfig {
    pub name: String,
    pub joints: Vec<ModelJoint>,
    pub joint_name_id_map: BTreeMap<String, ServoId>,
    /// Initial angles by joint name; joints not listed start at 0.
    #[serde(default)]
    pub initial_angles: BTreeMap<String, f64>,
    #[serde(default)]
    pub keyboard_controls: KeyboardMap,
    #[serde(default)]
    pub compound_movements: Vec<CompoundMovementConfig>,
}

impl RobotConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn registry(&self) -> Result<JointRegistry, ConfigError> {
        let ids: HashMap<String, ServoId> = self
            .joint_name_id_map
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect();
        JointRegistry::from_model(&self.joints, &ids)
    }

    pub fn resolver(&self, registry: &JointRegistry) -> Result<CompoundMotionResolver, ConfigError> {
        CompoundMotionResolver::new(&self.compound_movements, registry)
    }

    /// Swap the keyboard layout for a named one. `"default"` keeps the
    /// preset's own map.
    ///
    /// The `"wasd"` layout binds joints by name, so only joints the robot
    /// actually has get keys.
    pub fn with_layout(mut self, layout: &str) -> Result<Self, ConfigError> {
        match layout {
            "default" => {}
            "wasd" => {
                self.keyboard_controls = WASD_KEYS
                    .iter()
                    .filter_map(|(joint, dec, inc)| {
                        let id = *self.joint_name_id_map.get(*joint)?;
                        Some((id, vec![dec.to_string(), inc.to_string()]))
                    })
                    .collect();
            }
            other => return Err(ConfigError::UnknownLayout(other.to_string())),
        }
        Ok(self)
    }

    /// Initial angles keyed by servo id.
    pub fn initial_degrees(&self) -> HashMap<ServoId, f64> {
        self.initial_angles
            .iter()
            .filter_map(|(name, deg)| self.joint_name_id_map.get(name).map(|id| (*id, *deg)))
            .collect()
    }
}

/// Look up a built-in preset by name.
pub fn preset(name: &str) -> Result<RobotConfig, ConfigError> {
    match name {
        "so-arm100" => Ok(so_arm100()),
        "bambot-b0" => Ok(bambot_b0()),
        other => Err(ConfigError::UnknownRobot(other.to_string())),
    }
}

const ARM_JOINTS: [&str; 6] = ["Rotation", "Pitch", "Elbow", "Wrist_Pitch", "Wrist_Roll", "Jaw"];

fn arm_joint(name: &str) -> ModelJoint {
    ModelJoint::new(name, JointKind::Revolute, Some(0.0), Some(360.0))
}

fn keys(pairs: &[(ServoId, &str, &str)]) -> KeyboardMap {
    pairs
        .iter()
        .map(|(id, dec, inc)| (*id, vec![dec.to_string(), inc.to_string()]))
        .collect()
}

fn so_arm100() -> RobotConfig {
    let joints: Vec<ModelJoint> = ARM_JOINTS.iter().map(|n| arm_joint(n)).collect();
    let joint_name_id_map = ARM_JOINTS
        .iter()
        .zip(1..)
        .map(|(n, id)| (n.to_string(), id))
        .collect();
    let initial_angles = ARM_JOINTS
        .iter()
        .map(|n| (n.to_string(), HOME_DEGREES))
        .collect();

    RobotConfig {
        name: "so-arm100".into(),
        joints,
        joint_name_id_map,
        initial_angles,
        keyboard_controls: keys(&[
            (1, "1", "q"),
            (2, "2", "w"),
            (3, "3", "e"),
            (4, "4", "r"),
            (5, "5", "t"),
            (6, "6", "y"),
        ]),
        compound_movements: vec![
            CompoundMovementConfig {
                name: "Jaw down & up".into(),
                keys: vec!["8".into(), "i".into()],
                primary_joint: 2,
                primary_formula: Some("primary < 100 ? 1 : -1".into()),
                dependents: vec![
                    DependentConfig {
                        joint: 3,
                        formula: "primary < 100 ? -1.9 * deltaPrimary : 0.4 * deltaPrimary".into(),
                    },
                    DependentConfig {
                        joint: 4,
                        formula: "primary < 100 ? (primary < 10 ? 0 : 0.51 * deltaPrimary) : -0.4 * deltaPrimary"
                            .into(),
                    },
                ],
            },
            CompoundMovementConfig {
                name: "Jaw backward & forward".into(),
                keys: vec!["o".into(), "u".into()],
                primary_joint: 2,
                primary_formula: Some("1".into()),
                dependents: vec![DependentConfig {
                    joint: 3,
                    formula: "-0.9 * deltaPrimary".into(),
                }],
            },
        ],
    }
}

fn bambot_b0() -> RobotConfig {
    let mut joints = Vec::new();
    let mut joint_name_id_map = BTreeMap::new();
    let mut initial_angles = BTreeMap::new();

    for (side, base) in [("R", 1), ("L", 7)] {
        for (i, n) in ARM_JOINTS.iter().enumerate() {
            let name = format!("{side}_{n}");
            joints.push(arm_joint(&name));
            joint_name_id_map.insert(name.clone(), base + i as ServoId);
            initial_angles.insert(name, HOME_DEGREES);
        }
    }
    for (name, id) in [("left_wheel", 13), ("back_wheel", 14), ("right_wheel", 15)] {
        joints.push(ModelJoint::new(name, JointKind::Continuous, None, None));
        joint_name_id_map.insert(name.to_string(), id);
    }

    RobotConfig {
        name: "bambot-b0".into(),
        joints,
        joint_name_id_map,
        initial_angles,
        keyboard_controls: keys(&[
            (1, "1", "q"),
            (2, "2", "w"),
            (3, "3", "e"),
            (4, "4", "r"),
            (5, "5", "t"),
            (6, "6", "y"),
            (7, "a", "z"),
            (8, "s", "x"),
            (9, "d", "c"),
            (10, "f", "v"),
            (11, "g", "b"),
            (12, "h", "n"),
        ]),
        compound_movements: Vec::new(),
    }
}
