//! Per-joint command state and its time integration.
//!
//! [`JointIntegrator`] is the only writer of [`JointState`]. Revolute joints
//! hold the last absolute angle they were given; continuous joints carry a
//! signed speed that [`JointIntegrator::tick`] integrates into their angle
//! with an explicit Euler step.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::joint::{JointKind, JointLimit, JointRegistry, ServoId};

/// Divisor applied to `speed * elapsed_ms` when advancing continuous joints.
pub const DEFAULT_SCALE_FACTOR: f64 = 500.0;

/// Default magnitude clamp for continuous-joint speeds.
pub const DEFAULT_MAX_SPEED: f64 = 100.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorConfig {
    pub scale_factor: f64,
    /// `None` leaves speeds unclamped.
    pub max_speed: Option<f64>,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            max_speed: Some(DEFAULT_MAX_SPEED),
        }
    }
}

/// Commanded state of one joint.
#[derive(Clone, Debug, PartialEq)]
pub struct JointState {
    pub servo_id: ServoId,
    pub kind: JointKind,
    /// Target angle (revolute) or integrated angle (continuous).
    pub degrees: f64,
    /// Signed speed; always zero for revolute joints.
    pub speed: f64,
    /// Integrator clock at the last write, in milliseconds.
    pub updated_at_ms: f64,
}

impl JointState {
    /// The value a dataset column or bus write carries for this joint.
    pub fn command_value(&self) -> f64 {
        match self.kind {
            JointKind::Revolute => self.degrees,
            JointKind::Continuous => self.speed,
        }
    }
}

/// Current joint angles keyed by servo id, taken before a tick is applied.
pub type AngleSnapshot = HashMap<ServoId, f64>;

#[derive(Debug)]
pub struct JointIntegrator {
    config: IntegratorConfig,
    states: Vec<JointState>,
    limits: Vec<JointLimit>,
    index: HashMap<ServoId, usize>,
    clock_ms: f64,
}

impl JointIntegrator {
    /// Create state for every registered joint.
    ///
    /// Revolute joints start at their entry in `initial_degrees` (clamped),
    /// or 0 when absent.
    pub fn new(
        registry: &JointRegistry,
        config: IntegratorConfig,
        initial_degrees: &HashMap<ServoId, f64>,
    ) -> Self {
        let mut states = Vec::with_capacity(registry.len());
        let mut limits = Vec::with_capacity(registry.len());
        let mut index = HashMap::with_capacity(registry.len());

        for (i, joint) in registry.all().iter().enumerate() {
            let degrees = match joint.kind {
                JointKind::Revolute => joint
                    .limit
                    .clamp(initial_degrees.get(&joint.servo_id).copied().unwrap_or(0.0)),
                JointKind::Continuous => 0.0,
            };
            states.push(JointState {
                servo_id: joint.servo_id,
                kind: joint.kind,
                degrees,
                speed: 0.0,
                updated_at_ms: 0.0,
            });
            limits.push(joint.limit);
            index.insert(joint.servo_id, i);
        }

        Self {
            config,
            states,
            limits,
            index,
            clock_ms: 0.0,
        }
    }

    pub fn config(&self) -> &IntegratorConfig {
        &self.config
    }

    /// Set a revolute joint's absolute target, clamped to its limit.
    ///
    /// Returns `false` (and changes nothing) for unknown or continuous joints.
    pub fn set_absolute(&mut self, servo_id: ServoId, degrees: f64) -> bool {
        let Some(&i) = self.index.get(&servo_id) else {
            return false;
        };
        if self.states[i].kind != JointKind::Revolute || !degrees.is_finite() {
            return false;
        }

        let clamped = self.limits[i].clamp(degrees);
        let state = &mut self.states[i];
        state.degrees = clamped;
        state.updated_at_ms = self.clock_ms;
        true
    }

    /// Set a continuous joint's signed speed.
    ///
    /// Returns `false` (and changes nothing) for unknown or revolute joints.
    pub fn set_speed(&mut self, servo_id: ServoId, speed: f64) -> bool {
        let Some(&i) = self.index.get(&servo_id) else {
            return false;
        };
        if self.states[i].kind != JointKind::Continuous || !speed.is_finite() {
            return false;
        }

        let speed = match self.config.max_speed {
            Some(max) if max >= 0.0 => speed.clamp(-max, max),
            _ => speed,
        };
        let state = &mut self.states[i];
        state.speed = speed;
        state.updated_at_ms = self.clock_ms;
        true
    }

    /// Advance every continuous joint by `speed * elapsed_ms / scale_factor`.
    pub fn tick(&mut self, elapsed_ms: f64) {
        if elapsed_ms <= 0.0 {
            return;
        }
        self.clock_ms += elapsed_ms;

        for state in self.states.iter_mut() {
            if state.kind == JointKind::Continuous && state.speed != 0.0 {
                state.degrees += state.speed * elapsed_ms / self.config.scale_factor;
                state.updated_at_ms = self.clock_ms;
            }
        }
    }

    pub fn state(&self, servo_id: ServoId) -> Option<&JointState> {
        self.index.get(&servo_id).map(|&i| &self.states[i])
    }

    pub fn degrees(&self, servo_id: ServoId) -> Option<f64> {
        self.state(servo_id).map(|s| s.degrees)
    }

    /// Copy of every joint state in registry order.
    pub fn snapshot(&self) -> Vec<JointState> {
        self.states.clone()
    }

    pub fn angles(&self) -> AngleSnapshot {
        self.states.iter().map(|s| (s.servo_id, s.degrees)).collect()
    }

    pub fn clock_ms(&self) -> f64 {
        self.clock_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::joint::Joint;

    fn registry() -> JointRegistry {
        let mut registry = JointRegistry::new();
        registry
            .register(vec![
                Joint {
                    servo_id: 2,
                    name: "Pitch".into(),
                    kind: JointKind::Revolute,
                    limit: JointLimit::new(Some(0.0), Some(270.0)),
                },
                Joint {
                    servo_id: 5,
                    name: "Wrist_Roll".into(),
                    kind: JointKind::Revolute,
                    limit: JointLimit::new(None, Some(300.0)),
                },
                Joint {
                    servo_id: 13,
                    name: "left_wheel".into(),
                    kind: JointKind::Continuous,
                    limit: JointLimit::default(),
                },
            ])
            .unwrap();
        registry
    }

    fn integrator() -> JointIntegrator {
        let initial = [(2, 180.0)].into_iter().collect();
        JointIntegrator::new(&registry(), IntegratorConfig::default(), &initial)
    }

    #[test]
    fn test_set_absolute_clamps_to_limits() {
        let mut integrator = integrator();
        assert_eq!(integrator.degrees(2), Some(180.0));

        assert!(integrator.set_absolute(2, 400.0));
        assert_eq!(integrator.degrees(2), Some(270.0));

        assert!(integrator.set_absolute(2, -50.0));
        assert_eq!(integrator.degrees(2), Some(0.0));
    }

    #[test]
    fn test_set_absolute_missing_lower_bound_is_unclamped() {
        let mut integrator = integrator();
        integrator.set_absolute(5, -720.0);
        assert_eq!(integrator.degrees(5), Some(-720.0));
    }

    #[test]
    fn test_clamp_holds_for_any_sequence() {
        let mut integrator = integrator();
        for value in [-1e9, 12.5, 269.99, 1e9, f64::NAN, -0.01, 135.0] {
            integrator.set_absolute(2, value);
            let degrees = integrator.degrees(2).unwrap();
            assert!((0.0..=270.0).contains(&degrees), "{degrees} out of range");
        }
    }

    #[test]
    fn test_mismatched_and_unknown_joints_are_noops() {
        let mut integrator = integrator();
        assert!(!integrator.set_absolute(13, 45.0));
        assert!(!integrator.set_speed(2, 10.0));
        assert!(!integrator.set_absolute(99, 10.0));
        assert_eq!(integrator.state(13).unwrap().degrees, 0.0);
        assert_eq!(integrator.degrees(2), Some(180.0));
    }

    #[test]
    fn test_tick_integrates_continuous_speed() {
        let mut integrator = integrator();
        integrator.set_speed(13, 50.0);
        integrator.tick(1000.0);
        assert!((integrator.state(13).unwrap().degrees - 100.0).abs() < 1e-9);
        // Revolute joints are not advanced.
        assert_eq!(integrator.degrees(2), Some(180.0));
        assert_eq!(integrator.clock_ms(), 1000.0);
    }

    #[test]
    fn test_speed_clamp_is_configurable() {
        let mut clamped = integrator();
        clamped.set_speed(13, -5000.0);
        assert_eq!(clamped.state(13).unwrap().speed, -DEFAULT_MAX_SPEED);

        let config = IntegratorConfig {
            max_speed: None,
            ..IntegratorConfig::default()
        };
        let mut unclamped = JointIntegrator::new(&registry(), config, &HashMap::new());
        unclamped.set_speed(13, -5000.0);
        assert_eq!(unclamped.state(13).unwrap().speed, -5000.0);
    }

    #[test]
    fn test_unusable_speed_clamp_does_not_panic() {
        for max in [-10.0, f64::NAN] {
            let config = IntegratorConfig {
                max_speed: Some(max),
                ..IntegratorConfig::default()
            };
            let mut integrator = JointIntegrator::new(&registry(), config, &HashMap::new());
            assert!(integrator.set_speed(13, 40.0));
            assert_eq!(integrator.state(13).unwrap().speed, 40.0);
        }
    }

    #[test]
    fn test_snapshot_is_in_registry_order() {
        let integrator = integrator();
        let ids: Vec<_> = integrator.snapshot().iter().map(|s| s.servo_id).collect();
        assert_eq!(ids, vec![2, 5, 13]);
        assert_eq!(integrator.snapshot()[0].command_value(), 180.0);
    }
}
