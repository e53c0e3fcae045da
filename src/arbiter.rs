//! Arbitration of concurrent input sources into one update per joint per tick.
//!
//! Every source registers under a name and receives an
//! [`IntentSender`]. Holds persist as claims owned by the source until it
//! releases them; exact-value intents only live for the tick they arrive in.
//!
//! Per joint and per tick the precedence is:
//!
//! 1. an exact value (`AbsoluteAngle` / `AbsoluteSpeed`), last one received wins;
//! 2. a direct hold on the joint, combined per [`HoldPolicy`]; on a
//!    continuous joint, `SpeedDelta` intents compete with holds under the
//!    same policy;
//! 3. deltas derived from compound movements.
//!
//! Every derived value reads the joint angles as they were before the tick.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::compound::{CompoundMotionResolver, MovementId};
use crate::integrator::JointIntegrator;
use crate::intent::{ArbiterInput, IntentEvent, IntentKind, IntentSender, SourceId};
use crate::joint::{JointKind, JointRegistry, ServoId};

/// Degrees per millisecond produced by a unit hold.
pub const DEFAULT_SENSITIVITY: f64 = 0.05;

/// Speed commanded to a continuous joint by a unit hold.
pub const DEFAULT_CONTINUOUS_SPEED: f64 = 50.0;

/// How two simultaneous holds on the same joint combine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldPolicy {
    /// The source registered last wins. A hold and a speed delta from the
    /// same source both apply.
    #[default]
    LastRegisteredWins,
    /// Magnitudes are summed, then bounded by the largest single magnitude.
    /// Speed deltas from every source are added on top.
    SumBounded,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub sensitivity: f64,
    pub continuous_speed: f64,
    pub hold_policy: HoldPolicy,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            sensitivity: DEFAULT_SENSITIVITY,
            continuous_speed: DEFAULT_CONTINUOUS_SPEED,
            hold_policy: HoldPolicy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    /// The source holds at least one joint.
    Active,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Hold {
    magnitude: f64,
    movement: Option<MovementId>,
}

#[derive(Debug)]
struct SourceEntry {
    id: SourceId,
    holds: BTreeMap<ServoId, Hold>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Explicit {
    Angle(f64),
    Speed(f64),
}

/// A value written to the integrator during a tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Command {
    Degrees(f64),
    Speed(f64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AppliedCommand {
    pub servo_id: ServoId,
    pub command: Command,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TickReport {
    pub applied: Vec<AppliedCommand>,
    /// Intents discarded as configuration errors.
    pub dropped: usize,
}

impl TickReport {
    pub fn command_for(&self, servo_id: ServoId) -> Option<Command> {
        self.applied
            .iter()
            .rev()
            .find(|c| c.servo_id == servo_id)
            .map(|c| c.command)
    }
}

#[derive(Debug)]
pub struct InputArbiter {
    config: ArbiterConfig,
    registry: JointRegistry,
    resolver: CompoundMotionResolver,
    tx: mpsc::UnboundedSender<ArbiterInput>,
    rx: mpsc::UnboundedReceiver<ArbiterInput>,
    sources: Vec<SourceEntry>,
    hold_driven: BTreeSet<ServoId>,
}

impl InputArbiter {
    pub fn new(
        registry: JointRegistry,
        resolver: CompoundMotionResolver,
        config: ArbiterConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry,
            resolver,
            tx,
            rx,
            sources: Vec::new(),
            hold_driven: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn registry(&self) -> &JointRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &CompoundMotionResolver {
        &self.resolver
    }

    /// Register a named source and return its sender.
    ///
    /// Registration order is the arbitration order for
    /// [`HoldPolicy::LastRegisteredWins`]. Registering an existing name hands
    /// out another sender for the same source.
    pub fn register_source(&mut self, name: &str) -> IntentSender {
        let id = SourceId::new(name);
        if !self.sources.iter().any(|s| s.id == id) {
            tracing::debug!("Registered input source {}", id);
            self.sources.push(SourceEntry {
                id: id.clone(),
                holds: BTreeMap::new(),
            });
        }
        IntentSender::new(id, self.tx.clone())
    }

    pub fn source_state(&self, name: &str) -> Option<SourceState> {
        self.sources.iter().find(|s| s.id.as_str() == name).map(|s| {
            if s.holds.is_empty() {
                SourceState::Idle
            } else {
                SourceState::Active
            }
        })
    }

    /// Joints currently held by a source.
    pub fn claims(&self, name: &str) -> Vec<ServoId> {
        self.sources
            .iter()
            .find(|s| s.id.as_str() == name)
            .map(|s| s.holds.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Drain pending intents, resolve them and apply the result.
    pub fn tick(&mut self, integrator: &mut JointIntegrator, dt_ms: f64) -> TickReport {
        let angles = integrator.angles();
        let mut report = TickReport::default();
        let mut explicit: BTreeMap<ServoId, Explicit> = BTreeMap::new();
        let mut nudges: BTreeMap<ServoId, BTreeMap<usize, f64>> = BTreeMap::new();

        while let Ok(input) = self.rx.try_recv() {
            match input {
                ArbiterInput::ReleaseSource(id) => self.release_source(&id),
                ArbiterInput::Intent(event) => {
                    if !self.accept(event, &mut explicit, &mut nudges) {
                        report.dropped += 1;
                    }
                }
            }
        }

        let dt = dt_ms.max(0.0);
        let (direct, derived) = self.collect_holds(dt, &angles);

        for joint in self.registry.all() {
            let id = joint.servo_id;
            let command = match joint.kind {
                JointKind::Revolute => {
                    let current = angles.get(&id).copied().unwrap_or(0.0);
                    if let Some(Explicit::Angle(v)) = explicit.get(&id) {
                        Some(Command::Degrees(*v))
                    } else if let Some((m, _)) = direct.get(&id) {
                        Some(Command::Degrees(current + m * self.config.sensitivity * dt))
                    } else {
                        derived.get(&id).map(|d| Command::Degrees(current + d))
                    }
                }
                JointKind::Continuous => {
                    if let Some(Explicit::Speed(v)) = explicit.get(&id) {
                        self.hold_driven.remove(&id);
                        Some(Command::Speed(*v))
                    } else {
                        let hold = direct.get(&id).copied();
                        let stopped = match hold {
                            Some(_) => {
                                self.hold_driven.insert(id);
                                false
                            }
                            None => self.hold_driven.remove(&id),
                        };
                        // The last hold went away: the wheel stops before any delta.
                        let current = if stopped {
                            0.0
                        } else {
                            integrator.state(id).map(|s| s.speed).unwrap_or(0.0)
                        };
                        match self.continuous_speed(current, hold, nudges.get(&id)) {
                            Some(v) => Some(Command::Speed(v)),
                            None if stopped => Some(Command::Speed(0.0)),
                            None => None,
                        }
                    }
                }
            };

            let Some(command) = command else { continue };
            let applied = match command {
                Command::Degrees(v) => integrator.set_absolute(id, v),
                Command::Speed(v) => integrator.set_speed(id, v),
            };
            if applied {
                report.applied.push(AppliedCommand {
                    servo_id: id,
                    command,
                });
            }
        }

        if report.dropped > 0 {
            tracing::debug!("Dropped {} invalid intents this tick", report.dropped);
        }
        report
    }

    fn release_source(&mut self, id: &SourceId) {
        if let Some(entry) = self.sources.iter_mut().find(|s| &s.id == id) {
            if !entry.holds.is_empty() {
                tracing::debug!("Source {} released {} joints", id, entry.holds.len());
            }
            entry.holds.clear();
        }
    }

    /// Speed for a continuous joint from its direct hold `(magnitude, rank)`
    /// and the speed deltas received this tick, keyed by source rank.
    fn continuous_speed(
        &self,
        current: f64,
        hold: Option<(f64, usize)>,
        deltas: Option<&BTreeMap<usize, f64>>,
    ) -> Option<f64> {
        let held = hold.map(|(m, rank)| (m * self.config.continuous_speed, rank));
        match self.config.hold_policy {
            HoldPolicy::LastRegisteredWins => {
                let last = deltas
                    .and_then(|d| d.iter().next_back())
                    .map(|(&rank, &d)| (rank, d));
                match (held, last) {
                    (Some((speed, hold_rank)), Some((rank, d))) if rank == hold_rank => Some(speed + d),
                    (Some((_, hold_rank)), Some((rank, d))) if rank > hold_rank => Some(current + d),
                    (Some((speed, _)), _) => Some(speed),
                    (None, Some((_, d))) => Some(current + d),
                    (None, None) => None,
                }
            }
            HoldPolicy::SumBounded => {
                let delta = deltas.map(|d| d.values().sum::<f64>());
                match (held, delta) {
                    (Some((speed, _)), d) => Some(speed + d.unwrap_or(0.0)),
                    (None, Some(d)) => Some(current + d),
                    (None, None) => None,
                }
            }
        }
    }

    /// Validate one intent and record it. Returns `false` when dropped.
    fn accept(
        &mut self,
        event: IntentEvent,
        explicit: &mut BTreeMap<ServoId, Explicit>,
        nudges: &mut BTreeMap<ServoId, BTreeMap<usize, f64>>,
    ) -> bool {
        let Some(joint) = self.registry.get(event.servo_id) else {
            tracing::trace!("{} sent intent for unknown servo {}", event.source, event.servo_id);
            return false;
        };
        let id = event.servo_id;

        match (event.kind, joint.kind) {
            (IntentKind::AbsoluteAngle(v), JointKind::Revolute) if v.is_finite() => {
                explicit.insert(id, Explicit::Angle(v));
            }
            (IntentKind::AbsoluteSpeed(v), JointKind::Continuous) if v.is_finite() => {
                explicit.insert(id, Explicit::Speed(v));
            }
            (IntentKind::SpeedDelta(d), JointKind::Continuous) if d.is_finite() => {
                let Some(rank) = self.sources.iter().position(|s| s.id == event.source) else {
                    return false;
                };
                *nudges.entry(id).or_default().entry(rank).or_default() += d;
            }
            (IntentKind::Hold { magnitude, movement }, kind) => {
                if movement.is_some() && kind != JointKind::Revolute {
                    return false;
                }
                if let Some(mid) = movement {
                    if self.resolver.movement(mid).map(|m| m.primary) != Some(id) {
                        return false;
                    }
                }
                let Some(entry) = self.sources.iter_mut().find(|s| s.id == event.source) else {
                    return false;
                };
                if magnitude == 0.0 || !magnitude.is_finite() {
                    entry.holds.remove(&id);
                } else {
                    entry.holds.insert(id, Hold { magnitude, movement });
                }
            }
            (IntentKind::Release, _) => {
                if let Some(entry) = self.sources.iter_mut().find(|s| s.id == event.source) {
                    entry.holds.remove(&id);
                }
            }
            _ => return false,
        }
        true
    }

    /// Split active holds into direct magnitudes and compound-derived deltas.
    /// Direct magnitudes carry the rank of the last source contributing.
    fn collect_holds(
        &self,
        dt: f64,
        angles: &crate::integrator::AngleSnapshot,
    ) -> (BTreeMap<ServoId, (f64, usize)>, BTreeMap<ServoId, f64>) {
        let mut direct: BTreeMap<ServoId, (f64, usize)> = BTreeMap::new();
        let mut bound: BTreeMap<ServoId, f64> = BTreeMap::new();
        let mut derived: BTreeMap<ServoId, f64> = BTreeMap::new();

        for (rank, source) in self.sources.iter().enumerate() {
            for (&id, hold) in &source.holds {
                match hold.movement {
                    None => match self.config.hold_policy {
                        HoldPolicy::LastRegisteredWins => {
                            direct.insert(id, (hold.magnitude, rank));
                        }
                        HoldPolicy::SumBounded => {
                            let entry = direct.entry(id).or_insert((0.0, rank));
                            *entry = (entry.0 + hold.magnitude, rank);
                            let b = bound.entry(id).or_default();
                            *b = b.max(hold.magnitude.abs());
                        }
                    },
                    Some(movement) => {
                        let delta = hold.magnitude * self.config.sensitivity * dt;
                        for jd in self.resolver.resolve_movement(movement, delta, angles) {
                            *derived.entry(jd.servo_id).or_default() += jd.delta;
                        }
                    }
                }
            }
        }

        for (id, b) in bound {
            if let Some((m, _)) = direct.get_mut(&id) {
                *m = m.clamp(-b, b);
            }
        }

        (direct, derived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compound::{CompoundMovementConfig, DependentConfig};
    use crate::integrator::IntegratorConfig;
    use crate::joint::{Joint, JointLimit};
    use std::collections::HashMap;

    fn registry() -> JointRegistry {
        let mut joints: Vec<Joint> = (1..=6)
            .map(|id| Joint {
                servo_id: id,
                name: format!("j{id}"),
                kind: JointKind::Revolute,
                limit: JointLimit::new(Some(0.0), Some(360.0)),
            })
            .collect();
        joints.push(Joint {
            servo_id: 13,
            name: "left_wheel".into(),
            kind: JointKind::Continuous,
            limit: JointLimit::default(),
        });
        let mut registry = JointRegistry::new();
        registry.register(joints).unwrap();
        registry
    }

    fn compound() -> Vec<CompoundMovementConfig> {
        vec![CompoundMovementConfig {
            name: "Jaw backward & forward".into(),
            keys: vec!["o".into(), "u".into()],
            primary_joint: 2,
            primary_formula: Some("1".into()),
            dependents: vec![DependentConfig {
                joint: 3,
                formula: "-0.9 * deltaPrimary".into(),
            }],
        }]
    }

    fn setup(config: ArbiterConfig) -> (InputArbiter, JointIntegrator) {
        let registry = registry();
        let resolver = CompoundMotionResolver::new(&compound(), &registry).unwrap();
        let initial: HashMap<ServoId, f64> = (1..=6).map(|id| (id, 180.0)).collect();
        let integrator = JointIntegrator::new(&registry, IntegratorConfig::default(), &initial);
        (InputArbiter::new(registry, resolver, config), integrator)
    }

    fn unit_config() -> ArbiterConfig {
        ArbiterConfig {
            sensitivity: 1.0,
            ..ArbiterConfig::default()
        }
    }

    #[test]
    fn test_absolute_set_beats_hold() {
        let (mut arbiter, mut integrator) = setup(unit_config());
        let keyboard = arbiter.register_source("keyboard");
        let replay = arbiter.register_source("replay");

        keyboard.hold(1, 0.2);
        replay.set_angle(1, 45.0);
        let report = arbiter.tick(&mut integrator, 16.0);

        assert_eq!(integrator.degrees(1), Some(45.0));
        assert_eq!(report.command_for(1), Some(Command::Degrees(45.0)));
    }

    #[test]
    fn test_different_joints_both_apply() {
        let (mut arbiter, mut integrator) = setup(unit_config());
        let keyboard = arbiter.register_source("keyboard");
        let leader = arbiter.register_source("leader");

        keyboard.hold(1, 0.5);
        leader.set_angle(4, 90.0);
        arbiter.tick(&mut integrator, 10.0);

        assert_eq!(integrator.degrees(1), Some(185.0));
        assert_eq!(integrator.degrees(4), Some(90.0));
    }

    #[test]
    fn test_release_stops_motion() {
        let (mut arbiter, mut integrator) = setup(unit_config());
        let keyboard = arbiter.register_source("keyboard");

        keyboard.hold(5, -1.0);
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.degrees(5), Some(170.0));
        assert_eq!(arbiter.source_state("keyboard"), Some(SourceState::Active));

        keyboard.release(5);
        for _ in 0..5 {
            let report = arbiter.tick(&mut integrator, 10.0);
            integrator.tick(10.0);
            assert!(report.applied.is_empty());
        }
        assert_eq!(integrator.degrees(5), Some(170.0));
        assert_eq!(arbiter.source_state("keyboard"), Some(SourceState::Idle));
    }

    #[test]
    fn test_release_source_clears_every_claim() {
        let (mut arbiter, mut integrator) = setup(unit_config());
        let gamepad = arbiter.register_source("gamepad");

        gamepad.hold(1, 1.0);
        gamepad.hold(2, 1.0);
        gamepad.hold(13, 1.0);
        arbiter.tick(&mut integrator, 1.0);
        assert_eq!(arbiter.claims("gamepad"), vec![1, 2, 13]);
        assert_eq!(integrator.state(13).unwrap().speed, DEFAULT_CONTINUOUS_SPEED);

        gamepad.release_all();
        arbiter.tick(&mut integrator, 1.0);
        assert!(arbiter.claims("gamepad").is_empty());
        assert_eq!(integrator.state(13).unwrap().speed, 0.0);
        assert_eq!(integrator.degrees(1), Some(181.0));
    }

    #[test]
    fn test_invalid_intents_are_isolated() {
        let (mut arbiter, mut integrator) = setup(unit_config());
        let replay = arbiter.register_source("replay");

        replay.set_angle(99, 10.0);
        replay.set_angle(13, 10.0);
        replay.set_speed(2, 10.0);
        replay.set_angle(3, 100.0);
        let report = arbiter.tick(&mut integrator, 10.0);

        assert_eq!(report.dropped, 3);
        assert_eq!(integrator.degrees(3), Some(100.0));
        assert_eq!(integrator.degrees(2), Some(180.0));
    }

    #[test]
    fn test_compound_hold_moves_dependents() {
        let (mut arbiter, mut integrator) = setup(unit_config());
        let keyboard = arbiter.register_source("keyboard");

        keyboard.hold_compound(2, 0, 1.0);
        arbiter.tick(&mut integrator, 10.0);

        assert_eq!(integrator.degrees(2), Some(190.0));
        assert!((integrator.degrees(3).unwrap() - 171.0).abs() < 1e-9);
    }

    #[test]
    fn test_direct_intent_overrides_derived_delta() {
        let (mut arbiter, mut integrator) = setup(unit_config());
        let keyboard = arbiter.register_source("keyboard");
        let gamepad = arbiter.register_source("gamepad");

        keyboard.hold_compound(2, 0, 1.0);
        gamepad.hold(3, 0.5);
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.degrees(2), Some(190.0));
        assert_eq!(integrator.degrees(3), Some(185.0));

        let leader = arbiter.register_source("leader");
        leader.set_angle(3, 120.0);
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.degrees(3), Some(120.0));
    }

    #[test]
    fn test_compound_hold_with_wrong_primary_is_dropped() {
        let (mut arbiter, mut integrator) = setup(unit_config());
        let keyboard = arbiter.register_source("keyboard");

        keyboard.hold_compound(4, 0, 1.0);
        let report = arbiter.tick(&mut integrator, 10.0);
        assert_eq!(report.dropped, 1);
        assert!(arbiter.claims("keyboard").is_empty());
    }

    #[test]
    fn test_last_registered_hold_wins() {
        let (mut arbiter, mut integrator) = setup(unit_config());
        let keyboard = arbiter.register_source("keyboard");
        let gamepad = arbiter.register_source("gamepad");

        gamepad.hold(1, -0.5);
        keyboard.hold(1, 1.0);
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.degrees(1), Some(175.0));
    }

    #[test]
    fn test_last_registered_speed_delta_beats_hold() {
        let (mut arbiter, mut integrator) = setup(unit_config());
        let keyboard = arbiter.register_source("keyboard");
        let gamepad = arbiter.register_source("gamepad");

        keyboard.hold(13, 1.0);
        gamepad.send(13, IntentKind::SpeedDelta(5.0));
        gamepad.send(13, IntentKind::SpeedDelta(5.0));
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.state(13).unwrap().speed, 10.0);

        // Without a competing delta the hold drives the wheel again.
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.state(13).unwrap().speed, DEFAULT_CONTINUOUS_SPEED);
    }

    #[test]
    fn test_last_registered_hold_beats_speed_delta() {
        let (mut arbiter, mut integrator) = setup(unit_config());
        let keyboard = arbiter.register_source("keyboard");
        let gamepad = arbiter.register_source("gamepad");
        let replay = arbiter.register_source("replay");

        keyboard.send(13, IntentKind::SpeedDelta(5.0));
        replay.send(13, IntentKind::SpeedDelta(7.0));
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.state(13).unwrap().speed, 7.0);

        keyboard.send(13, IntentKind::SpeedDelta(5.0));
        gamepad.hold(13, 1.0);
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.state(13).unwrap().speed, DEFAULT_CONTINUOUS_SPEED);

        // A delta from the holding source itself adds to its hold.
        gamepad.send(13, IntentKind::SpeedDelta(5.0));
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.state(13).unwrap().speed, DEFAULT_CONTINUOUS_SPEED + 5.0);
    }

    #[test]
    fn test_sum_bounded_adds_speed_deltas() {
        let config = ArbiterConfig {
            hold_policy: HoldPolicy::SumBounded,
            ..unit_config()
        };
        let (mut arbiter, mut integrator) = setup(config);
        let keyboard = arbiter.register_source("keyboard");
        let gamepad = arbiter.register_source("gamepad");

        keyboard.hold(13, 1.0);
        gamepad.send(13, IntentKind::SpeedDelta(5.0));
        keyboard.send(13, IntentKind::SpeedDelta(2.0));
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.state(13).unwrap().speed, DEFAULT_CONTINUOUS_SPEED + 7.0);
    }

    #[test]
    fn test_sum_bounded_policy() {
        let config = ArbiterConfig {
            hold_policy: HoldPolicy::SumBounded,
            ..unit_config()
        };
        let (mut arbiter, mut integrator) = setup(config);
        let keyboard = arbiter.register_source("keyboard");
        let gamepad = arbiter.register_source("gamepad");

        keyboard.hold(1, 1.0);
        gamepad.hold(1, 1.0);
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.degrees(1), Some(190.0));

        gamepad.hold(1, -1.0);
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.degrees(1), Some(190.0));
    }

    #[test]
    fn test_replayed_speed_survives_without_holds() {
        let (mut arbiter, mut integrator) = setup(unit_config());
        let replay = arbiter.register_source("replay");
        let keyboard = arbiter.register_source("keyboard");

        replay.set_speed(13, 30.0);
        arbiter.tick(&mut integrator, 10.0);
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.state(13).unwrap().speed, 30.0);

        keyboard.send(13, IntentKind::SpeedDelta(5.0));
        arbiter.tick(&mut integrator, 10.0);
        assert_eq!(integrator.state(13).unwrap().speed, 35.0);
    }
}
