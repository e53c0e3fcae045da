//! Coupled motion between joints.
//!
//! A compound movement drives one primary joint and derives deltas for
//! dependent joints from formulas over the current angles, modelling
//! mechanical linkages such as keeping the jaw level while the shoulder
//! pitches.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::expr::{Bindings, Formula, DEPENDENT_VARS, PRIMARY_VARS};
use crate::integrator::AngleSnapshot;
use crate::joint::{JointKind, JointRegistry, ServoId};

/// Index of a movement inside its resolver.
pub type MovementId = usize;

/// Serialized form of a compound movement, as found in robot presets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompoundMovementConfig {
    pub name: String,
    /// `[negative_key, positive_key]`.
    pub keys: Vec<String>,
    pub primary_joint: ServoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_formula: Option<String>,
    pub dependents: Vec<DependentConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DependentConfig {
    pub joint: ServoId,
    pub formula: String,
}

#[derive(Clone, Debug)]
pub struct Dependent {
    pub joint: ServoId,
    pub formula: Formula,
}

#[derive(Clone, Debug)]
pub struct CompoundMovement {
    pub name: String,
    pub keys: Vec<String>,
    pub primary: ServoId,
    pub primary_formula: Option<Formula>,
    pub dependents: Vec<Dependent>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JointDelta {
    pub servo_id: ServoId,
    pub delta: f64,
}

#[derive(Clone, Debug, Default)]
pub struct CompoundMotionResolver {
    movements: Vec<CompoundMovement>,
}

impl CompoundMotionResolver {
    /// Parse and validate movements against the registered joints.
    ///
    /// Every joint must exist and be revolute, and no dependent may also be
    /// the primary of any movement, which keeps one tick's derivations free
    /// of chains and cycles.
    pub fn new(
        configs: &[CompoundMovementConfig],
        registry: &JointRegistry,
    ) -> Result<Self, ConfigError> {
        let check_joint = |id: ServoId| -> Result<(), ConfigError> {
            match registry.get(id) {
                None => Err(ConfigError::UnknownServo(id)),
                Some(j) if j.kind != JointKind::Revolute => Err(ConfigError::KindMismatch(id)),
                Some(_) => Ok(()),
            }
        };

        let primaries: Vec<ServoId> = configs.iter().map(|c| c.primary_joint).collect();
        let mut movements = Vec::with_capacity(configs.len());

        for config in configs {
            check_joint(config.primary_joint)?;

            let primary_formula = config
                .primary_formula
                .as_deref()
                .map(|src| Formula::parse(src, PRIMARY_VARS))
                .transpose()?;

            let mut dependents = Vec::with_capacity(config.dependents.len());
            for dep in &config.dependents {
                check_joint(dep.joint)?;
                if primaries.contains(&dep.joint) {
                    return Err(ConfigError::CyclicCompound {
                        movement: config.name.clone(),
                        joint: dep.joint,
                    });
                }
                dependents.push(Dependent {
                    joint: dep.joint,
                    formula: Formula::parse(&dep.formula, DEPENDENT_VARS)?,
                });
            }

            movements.push(CompoundMovement {
                name: config.name.clone(),
                keys: config.keys.clone(),
                primary: config.primary_joint,
                primary_formula,
                dependents,
            });
        }

        tracing::debug!("Loaded {} compound movements", movements.len());
        Ok(Self { movements })
    }

    pub fn movements(&self) -> &[CompoundMovement] {
        &self.movements
    }

    pub fn movement(&self, id: MovementId) -> Option<&CompoundMovement> {
        self.movements.get(id)
    }

    /// Find the movement bound to `key` and the direction that key drives.
    pub fn movement_for_key(&self, key: &str) -> Option<(MovementId, f64)> {
        self.movements.iter().enumerate().find_map(|(id, m)| {
            m.keys
                .iter()
                .position(|k| k.eq_ignore_ascii_case(key))
                .map(|i| (id, if i == 0 { -1.0 } else { 1.0 }))
        })
    }

    /// Resolve a primary delta through the first movement driving `primary`.
    ///
    /// Without a matching movement the primary delta is returned unchanged.
    pub fn resolve(
        &self,
        primary: ServoId,
        primary_delta: f64,
        angles: &AngleSnapshot,
    ) -> Vec<JointDelta> {
        match self.movements.iter().position(|m| m.primary == primary) {
            Some(id) => self.resolve_movement(id, primary_delta, angles),
            None => vec![JointDelta {
                servo_id: primary,
                delta: primary_delta,
            }],
        }
    }

    /// Resolve a delta through a specific movement.
    ///
    /// All formulas read `angles`, the state before this tick's update, so
    /// dependents never see a partially moved primary.
    pub fn resolve_movement(
        &self,
        id: MovementId,
        primary_delta: f64,
        angles: &AngleSnapshot,
    ) -> Vec<JointDelta> {
        let Some(movement) = self.movements.get(id) else {
            return Vec::new();
        };

        let primary_angle = angles.get(&movement.primary).copied().unwrap_or(0.0);
        let sign = movement
            .primary_formula
            .as_ref()
            .map(|f| {
                f.eval(&Bindings {
                    primary: primary_angle,
                    ..Bindings::default()
                })
            })
            .unwrap_or(1.0);
        let delta_primary = finite_or_zero(sign * primary_delta);

        let mut deltas = Vec::with_capacity(movement.dependents.len() + 1);
        deltas.push(JointDelta {
            servo_id: movement.primary,
            delta: delta_primary,
        });

        for dep in &movement.dependents {
            let bindings = Bindings {
                primary: primary_angle,
                dependent: angles.get(&dep.joint).copied().unwrap_or(0.0),
                delta_primary,
            };
            deltas.push(JointDelta {
                servo_id: dep.joint,
                delta: finite_or_zero(dep.formula.eval(&bindings)),
            });
        }

        deltas
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::joint::{Joint, JointLimit};

    fn registry() -> JointRegistry {
        let mut registry = JointRegistry::new();
        let mut joints: Vec<Joint> = (1..=6)
            .map(|id| Joint {
                servo_id: id,
                name: format!("j{id}"),
                kind: JointKind::Revolute,
                limit: JointLimit::default(),
            })
            .collect();
        joints.push(Joint {
            servo_id: 13,
            name: "wheel".into(),
            kind: JointKind::Continuous,
            limit: JointLimit::default(),
        });
        registry.register(joints).unwrap();
        registry
    }

    fn jaw_down_up() -> CompoundMovementConfig {
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
                    formula: "primary < 100 ? (primary < 10 ? 0 : 0.51 * deltaPrimary) : -0.4 * deltaPrimary".into(),
                },
            ],
        }
    }

    fn angles(primary: f64) -> AngleSnapshot {
        [(2, primary), (3, 180.0), (4, 180.0)].into_iter().collect()
    }

    #[test]
    fn test_resolve_applies_direction_and_dependents() {
        let resolver = CompoundMotionResolver::new(&[jaw_down_up()], &registry()).unwrap();
        let deltas = resolver.resolve(2, 5.0, &angles(80.0));

        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas[0], JointDelta { servo_id: 2, delta: 5.0 });
        assert_eq!(deltas[1].servo_id, 3);
        assert!((deltas[1].delta + 9.5).abs() < 1e-12);
        assert!((deltas[2].delta - 2.55).abs() < 1e-12);

        // Above 100 degrees the primary direction flips.
        let deltas = resolver.resolve(2, 5.0, &angles(150.0));
        assert_eq!(deltas[0].delta, -5.0);
        assert!((deltas[1].delta + 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let resolver = CompoundMotionResolver::new(&[jaw_down_up()], &registry()).unwrap();
        let snapshot = angles(42.0);
        let first = resolver.resolve(2, 1.25, &snapshot);
        for _ in 0..10 {
            assert_eq!(resolver.resolve(2, 1.25, &snapshot), first);
        }
    }

    #[test]
    fn test_unmatched_primary_passes_through() {
        let resolver = CompoundMotionResolver::new(&[jaw_down_up()], &registry()).unwrap();
        let deltas = resolver.resolve(1, 0.75, &angles(80.0));
        assert_eq!(deltas, vec![JointDelta { servo_id: 1, delta: 0.75 }]);
    }

    #[test]
    fn test_movement_for_key() {
        let resolver = CompoundMotionResolver::new(&[jaw_down_up()], &registry()).unwrap();
        assert_eq!(resolver.movement_for_key("8"), Some((0, -1.0)));
        assert_eq!(resolver.movement_for_key("I"), Some((0, 1.0)));
        assert_eq!(resolver.movement_for_key("q"), None);
    }

    #[test]
    fn test_dependent_that_is_a_primary_is_rejected() {
        let mut chained = jaw_down_up();
        chained.name = "chained".into();
        chained.primary_joint = 3;
        chained.dependents = vec![DependentConfig {
            joint: 5,
            formula: "deltaPrimary".into(),
        }];

        let err = CompoundMotionResolver::new(&[jaw_down_up(), chained], &registry()).unwrap_err();
        assert!(matches!(err, ConfigError::CyclicCompound { joint: 3, .. }));
    }

    #[test]
    fn test_invalid_joints_and_formulas_are_rejected() {
        let mut unknown = jaw_down_up();
        unknown.dependents[0].joint = 42;
        assert!(matches!(
            CompoundMotionResolver::new(&[unknown], &registry()),
            Err(ConfigError::UnknownServo(42))
        ));

        let mut wheel = jaw_down_up();
        wheel.dependents[0].joint = 13;
        assert!(matches!(
            CompoundMotionResolver::new(&[wheel], &registry()),
            Err(ConfigError::KindMismatch(13))
        ));

        let mut bad_formula = jaw_down_up();
        bad_formula.primary_formula = Some("dependent > 3 ? 1 : -1".into());
        assert!(matches!(
            CompoundMotionResolver::new(&[bad_formula], &registry()),
            Err(ConfigError::UnknownVariable { .. })
        ));
    }
}
