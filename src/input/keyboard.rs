//! Hold-to-move keyboard source.
//!
//! Each joint has a `[decrease, increase]` key pair; compound movements add
//! their own key pairs. A key-down starts a hold of magnitude ±1 and the
//! matching key-up ends it. Auto-repeat key-downs are ignored.

use std::collections::{BTreeMap, HashMap};

use crate::compound::{CompoundMotionResolver, MovementId};
use crate::intent::{IntentKind, IntentSender};
use crate::joint::ServoId;

/// `servo_id -> [decrease_key, increase_key]`.
pub type KeyboardMap = BTreeMap<ServoId, Vec<String>>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KeyAction {
    Joint {
        servo_id: ServoId,
        direction: f64,
    },
    Compound {
        primary: ServoId,
        movement: MovementId,
        direction: f64,
    },
}

impl KeyAction {
    pub fn servo_id(&self) -> ServoId {
        match self {
            KeyAction::Joint { servo_id, .. } => *servo_id,
            KeyAction::Compound { primary, .. } => *primary,
        }
    }

    fn intent(&self) -> IntentKind {
        match *self {
            KeyAction::Joint { direction, .. } => IntentKind::Hold {
                magnitude: direction,
                movement: None,
            },
            KeyAction::Compound {
                movement,
                direction,
                ..
            } => IntentKind::Hold {
                magnitude: direction,
                movement: Some(movement),
            },
        }
    }
}

/// Key to action lookup. Keys are matched case-insensitively.
#[derive(Clone, Debug, Default)]
pub struct KeyBindings {
    actions: HashMap<String, KeyAction>,
}

impl KeyBindings {
    /// Compound-movement keys win over plain joint keys.
    pub fn new(map: &KeyboardMap, resolver: &CompoundMotionResolver) -> Self {
        let mut actions = HashMap::new();
        for (&servo_id, keys) in map {
            for (i, key) in keys.iter().take(2).enumerate() {
                let direction = if i == 0 { -1.0 } else { 1.0 };
                actions.insert(key.to_lowercase(), KeyAction::Joint { servo_id, direction });
            }
        }
        for (movement, m) in resolver.movements().iter().enumerate() {
            for (i, key) in m.keys.iter().take(2).enumerate() {
                let direction = if i == 0 { -1.0 } else { 1.0 };
                actions.insert(
                    key.to_lowercase(),
                    KeyAction::Compound {
                        primary: m.primary,
                        movement,
                        direction,
                    },
                );
            }
        }
        Self { actions }
    }

    pub fn lookup(&self, key: &str) -> Option<KeyAction> {
        self.actions.get(&key.to_lowercase()).copied()
    }

    pub fn is_bound(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }
}

#[derive(Debug)]
pub struct KeyboardSource {
    bindings: KeyBindings,
    sender: IntentSender,
    pressed: Vec<(String, KeyAction)>,
}

impl KeyboardSource {
    pub fn new(bindings: KeyBindings, sender: IntentSender) -> Self {
        Self {
            bindings,
            sender,
            pressed: Vec::new(),
        }
    }

    pub fn bindings(&self) -> &KeyBindings {
        &self.bindings
    }

    /// Handle a key-down edge. Returns `false` for unbound keys and repeats.
    pub fn key_down(&mut self, key: &str) -> bool {
        let key = key.to_lowercase();
        if self.pressed.iter().any(|(k, _)| *k == key) {
            return false;
        }
        let Some(action) = self.bindings.lookup(&key) else {
            return false;
        };
        self.sender.send(action.servo_id(), action.intent());
        self.pressed.push((key, action));
        true
    }

    /// Handle a key-up edge. If another pressed key still drives the same
    /// joint, its hold takes over.
    pub fn key_up(&mut self, key: &str) {
        let key = key.to_lowercase();
        let Some(pos) = self.pressed.iter().position(|(k, _)| *k == key) else {
            return;
        };
        let (_, action) = self.pressed.remove(pos);
        let servo_id = action.servo_id();

        match self.pressed.iter().rev().find(|(_, a)| a.servo_id() == servo_id) {
            Some((_, other)) => {
                self.sender.send(servo_id, other.intent());
            }
            None => {
                self.sender.release(servo_id);
            }
        }
    }

    /// Release everything, e.g. when the window loses focus.
    pub fn release_all(&mut self) {
        self.pressed.clear();
        self.sender.release_all();
    }

    pub fn pressed_keys(&self) -> Vec<&str> {
        self.pressed.iter().map(|(k, _)| k.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{ArbiterConfig, InputArbiter};
    use crate::integrator::{IntegratorConfig, JointIntegrator};
    use crate::robots;

    fn setup() -> (InputArbiter, JointIntegrator, KeyboardSource) {
        let robot = robots::preset("so-arm100").unwrap();
        let registry = robot.registry().unwrap();
        let resolver = robot.resolver(&registry).unwrap();
        let bindings = KeyBindings::new(&robot.keyboard_controls, &resolver);
        let integrator =
            JointIntegrator::new(&registry, IntegratorConfig::default(), &robot.initial_degrees());
        let config = ArbiterConfig {
            sensitivity: 1.0,
            ..ArbiterConfig::default()
        };
        let mut arbiter = InputArbiter::new(registry, resolver, config);
        let keyboard = KeyboardSource::new(bindings, arbiter.register_source("keyboard"));
        (arbiter, integrator, keyboard)
    }

    #[test]
    fn test_bindings_cover_joints_and_compounds() {
        let (_, _, keyboard) = setup();
        let bindings = keyboard.bindings();
        assert_eq!(
            bindings.lookup("Q"),
            Some(KeyAction::Joint {
                servo_id: 1,
                direction: 1.0
            })
        );
        assert_eq!(
            bindings.lookup("8"),
            Some(KeyAction::Compound {
                primary: 2,
                movement: 0,
                direction: -1.0
            })
        );
        assert!(!bindings.is_bound("z"));
    }

    #[test]
    fn test_wasd_layout_bindings() {
        let robot = robots::preset("so-arm100").unwrap().with_layout("wasd").unwrap();
        let resolver = robot.resolver(&robot.registry().unwrap()).unwrap();
        let bindings = KeyBindings::new(&robot.keyboard_controls, &resolver);

        assert_eq!(
            bindings.lookup("w"),
            Some(KeyAction::Joint {
                servo_id: 2,
                direction: 1.0
            })
        );
        assert_eq!(
            bindings.lookup("q"),
            Some(KeyAction::Joint {
                servo_id: 1,
                direction: -1.0
            })
        );
        assert!(bindings.is_bound("i"));
        assert!(!bindings.is_bound("e"));
    }

    #[test]
    fn test_hold_and_release() {
        let (mut arbiter, mut integrator, mut keyboard) = setup();

        assert!(keyboard.key_down("q"));
        assert!(!keyboard.key_down("q"));
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.degrees(1), Some(190.0));

        keyboard.key_up("q");
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.degrees(1), Some(190.0));
    }

    #[test]
    fn test_opposite_key_takes_over_on_release() {
        let (mut arbiter, mut integrator, mut keyboard) = setup();

        keyboard.key_down("1");
        keyboard.key_down("q");
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.degrees(1), Some(190.0));

        keyboard.key_up("q");
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.degrees(1), Some(180.0));
    }

    #[test]
    fn test_release_all_clears_claims() {
        let (mut arbiter, mut integrator, mut keyboard) = setup();
        keyboard.key_down("w");
        keyboard.key_down("e");
        arbiter.tick(&mut integrator, 1.0);
        assert_eq!(arbiter.claims("keyboard"), vec![2, 3]);

        keyboard.release_all();
        arbiter.tick(&mut integrator, 1.0);
        assert!(arbiter.claims("keyboard").is_empty());
        assert!(keyboard.pressed_keys().is_empty());
    }
}
