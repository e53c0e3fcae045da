//! Polled gamepad source.
//!
//! The embedding application samples the pad and publishes
//! [`GamepadSnapshot`]s; [`GamepadSource::poll`] turns each snapshot into
//! holds. Sticks and triggers drive joints proportionally, face buttons act
//! as keyboard keys through their own [`KeyboardSource`], the d-pad triggers
//! pose actions and the bumpers scale speed.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::keyboard::KeyboardSource;
use crate::intent::IntentSender;
use crate::joint::ServoId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedModifier {
    pub slow: f64,
    pub normal: f64,
    pub fast: f64,
}

impl Default for SpeedModifier {
    fn default() -> Self {
        Self {
            slow: 0.3,
            normal: 1.0,
            fast: 1.8,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GamepadConfig {
    pub sensitivity: f64,
    pub dead_zone: f64,
    pub update_rate_ms: u64,
    pub speed_modifier: SpeedModifier,
}

impl Default for GamepadConfig {
    fn default() -> Self {
        Self {
            sensitivity: 1.0,
            dead_zone: 0.15,
            update_rate_ms: 50,
            speed_modifier: SpeedModifier::default(),
        }
    }
}

/// Axis values in `[-1, 1]` (triggers `[0, 1]`), screen convention: stick up
/// is negative Y.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GamepadSnapshot {
    pub left_stick: (f64, f64),
    pub right_stick: (f64, f64),
    pub left_trigger: f64,
    pub right_trigger: f64,
    pub buttons: BTreeSet<Button>,
}

impl GamepadSnapshot {
    pub fn axis(&self, axis: Axis) -> f64 {
        match axis {
            Axis::LeftStickX => self.left_stick.0,
            Axis::LeftStickY => self.left_stick.1,
            Axis::RightStickX => self.right_stick.0,
            Axis::RightStickY => self.right_stick.1,
            Axis::LeftTrigger => self.left_trigger,
            Axis::RightTrigger => self.right_trigger,
        }
    }

    pub fn pressed(&self, button: Button) -> bool {
        self.buttons.contains(&button)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Axis {
    LeftStickX,
    LeftStickY,
    RightStickX,
    RightStickY,
    LeftTrigger,
    RightTrigger,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Button {
    A,
    B,
    X,
    Y,
    LeftBumper,
    RightBumper,
    DPadUp,
    DPadDown,
    DPadLeft,
    DPadRight,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisBinding {
    pub axis: Axis,
    pub servo_id: ServoId,
    /// Multiplier applied after the dead zone; negative inverts.
    pub scale: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ButtonAction {
    /// Behave like a keyboard key.
    Key(String),
    /// Move every arm joint to its home angle.
    Home,
    /// Drop every hold.
    Reset,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GamepadMapping {
    pub axes: Vec<AxisBinding>,
    pub buttons: Vec<(Button, ButtonAction)>,
    pub slow: Option<Button>,
    pub fast: Option<Button>,
}

impl Default for GamepadMapping {
    fn default() -> Self {
        let axis = |axis, servo_id, scale| AxisBinding {
            axis,
            servo_id,
            scale,
        };
        Self {
            axes: vec![
                axis(Axis::LeftStickX, 1, 1.0),
                axis(Axis::LeftStickY, 2, -1.0),
                axis(Axis::RightStickX, 5, 1.0),
                axis(Axis::RightStickY, 4, -1.0),
                axis(Axis::LeftTrigger, 3, -1.0),
                axis(Axis::RightTrigger, 3, 1.0),
            ],
            buttons: vec![
                (Button::A, ButtonAction::Key("6".into())),
                (Button::B, ButtonAction::Key("y".into())),
                (Button::X, ButtonAction::Key("i".into())),
                (Button::Y, ButtonAction::Key("u".into())),
                (Button::DPadUp, ButtonAction::Home),
                (Button::DPadDown, ButtonAction::Reset),
            ],
            slow: Some(Button::LeftBumper),
            fast: Some(Button::RightBumper),
        }
    }
}

/// Renormalise so the output starts at 0 right outside the dead zone.
pub fn apply_dead_zone(value: f64, dead_zone: f64) -> f64 {
    if !value.is_finite() || value.abs() <= dead_zone || dead_zone >= 1.0 {
        return 0.0;
    }
    let v = value.clamp(-1.0, 1.0);
    v.signum() * (v.abs() - dead_zone) / (1.0 - dead_zone)
}

pub struct GamepadSource {
    config: GamepadConfig,
    mapping: GamepadMapping,
    sender: IntentSender,
    buttons: KeyboardSource,
    home: Vec<(ServoId, f64)>,
    held: BTreeSet<ServoId>,
    previous: BTreeSet<Button>,
    connected: bool,
}

impl GamepadSource {
    /// `sender` carries axis holds; `buttons` is a keyboard source registered
    /// under its own name so button holds and stick holds never share claims.
    pub fn new(
        config: GamepadConfig,
        mapping: GamepadMapping,
        sender: IntentSender,
        buttons: KeyboardSource,
        home: Vec<(ServoId, f64)>,
    ) -> Self {
        Self {
            config,
            mapping,
            sender,
            buttons,
            home,
            held: BTreeSet::new(),
            previous: BTreeSet::new(),
            connected: false,
        }
    }

    fn speed_modifier(&self, snapshot: &GamepadSnapshot) -> f64 {
        let m = &self.config.speed_modifier;
        if self.mapping.slow.is_some_and(|b| snapshot.pressed(b)) {
            m.slow
        } else if self.mapping.fast.is_some_and(|b| snapshot.pressed(b)) {
            m.fast
        } else {
            m.normal
        }
    }

    /// Process one sample. `None` means no pad is connected.
    pub fn poll(&mut self, snapshot: Option<&GamepadSnapshot>) {
        let Some(snapshot) = snapshot else {
            if self.connected {
                tracing::info!("Gamepad disconnected, releasing holds");
                self.connected = false;
            }
            if !self.held.is_empty() || !self.previous.is_empty() {
                self.held.clear();
                self.previous.clear();
                self.sender.release_all();
                self.buttons.release_all();
            }
            return;
        };
        if !self.connected {
            tracing::info!("Gamepad connected");
            self.connected = true;
        }

        let modifier = self.speed_modifier(snapshot);
        let mut magnitudes: BTreeMap<ServoId, f64> = BTreeMap::new();
        for binding in &self.mapping.axes {
            let value = apply_dead_zone(snapshot.axis(binding.axis), self.config.dead_zone);
            *magnitudes.entry(binding.servo_id).or_default() += value * binding.scale;
        }

        for (servo_id, value) in magnitudes {
            if value != 0.0 {
                self.sender
                    .hold(servo_id, value * self.config.sensitivity * modifier);
                self.held.insert(servo_id);
            } else if self.held.remove(&servo_id) {
                self.sender.release(servo_id);
            }
        }

        for (button, action) in &self.mapping.buttons {
            let now = snapshot.pressed(*button);
            let before = self.previous.contains(button);
            match (action, before, now) {
                (ButtonAction::Key(key), false, true) => {
                    self.buttons.key_down(key);
                }
                (ButtonAction::Key(key), true, false) => self.buttons.key_up(key),
                (ButtonAction::Home, false, true) => {
                    for &(servo_id, degrees) in &self.home {
                        self.sender.set_angle(servo_id, degrees);
                    }
                }
                (ButtonAction::Reset, false, true) => {
                    self.held.clear();
                    self.sender.release_all();
                    self.buttons.release_all();
                }
                _ => {}
            }
        }
        self.previous = snapshot.buttons.clone();
    }

    /// Sample `snapshots` every `update_rate_ms` until cancelled.
    pub async fn run(
        mut self,
        mut snapshots: watch::Receiver<Option<GamepadSnapshot>>,
        cancel: CancellationToken,
    ) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.update_rate_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let snapshot = snapshots.borrow_and_update().clone();
                    self.poll(snapshot.as_ref());
                }
            }
        }
        self.poll(None);
    }
}
