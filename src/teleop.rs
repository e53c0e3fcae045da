//! Teleoperation runtime.
//!
//! [`Teleop`] assembles the control pipeline for one robot. Input sources
//! are created from it before [`Teleop::spawn`]; afterwards two tasks run:
//!
//! - the tick task owns the arbiter and integrator, applies intents every
//!   `tick_interval_ms` and publishes the joint snapshot on a `watch`
//!   channel;
//! - the push task reads that snapshot every `push_interval_ms` and sends
//!   targets that changed since the last successful push to the follower.
//!
//! Both stop when the cancellation token fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::arbiter::InputArbiter;
use crate::bus::SyncEntry;
use crate::config::TeleopConfig;
use crate::connection::RobotLink;
use crate::dataset::Recorder;
use crate::input::gamepad::{GamepadMapping, GamepadSource};
use crate::input::key_sequence::KeySequencePlayer;
use crate::input::keyboard::{KeyBindings, KeyboardSource};
use crate::input::leader::LeaderMirror;
use crate::input::replay::ReplayPlayer;
use crate::integrator::{JointIntegrator, JointState};
use crate::intent::IntentSender;
use crate::joint::{JointKind, JointRegistry, ServoId};
use crate::robots::RobotConfig;

pub struct Teleop {
    config: TeleopConfig,
    registry: JointRegistry,
    bindings: KeyBindings,
    home: Vec<(ServoId, f64)>,
    arbiter: InputArbiter,
    integrator: JointIntegrator,
}

impl Teleop {
    pub fn new(robot: &RobotConfig, config: TeleopConfig) -> Result<Self> {
        config.validate()?;
        let registry = robot.registry()?;
        let resolver = robot.resolver(&registry)?;
        let bindings = KeyBindings::new(&robot.keyboard_controls, &resolver);

        let initial = robot.initial_degrees();
        let integrator = JointIntegrator::new(&registry, config.integrator.clone(), &initial);
        let home = registry
            .ids_of_kind(JointKind::Revolute)
            .into_iter()
            .filter_map(|id| integrator.degrees(id).map(|deg| (id, deg)))
            .collect();
        let arbiter = InputArbiter::new(registry.clone(), resolver, config.arbiter.clone());

        tracing::info!(
            "Teleop for {}: {} joints, {} compound movements",
            robot.name,
            registry.len(),
            arbiter.resolver().movements().len()
        );
        Ok(Self {
            config,
            registry,
            bindings,
            home,
            arbiter,
            integrator,
        })
    }

    pub fn config(&self) -> &TeleopConfig {
        &self.config
    }

    pub fn registry(&self) -> &JointRegistry {
        &self.registry
    }

    pub fn register_source(&mut self, name: &str) -> IntentSender {
        self.arbiter.register_source(name)
    }

    pub fn keyboard(&mut self, name: &str) -> KeyboardSource {
        let sender = self.arbiter.register_source(name);
        KeyboardSource::new(self.bindings.clone(), sender)
    }

    /// Timed key presses for the voice and chat command surface.
    pub fn key_sequence_player(&mut self, name: &str) -> KeySequencePlayer {
        let keyboard = self.keyboard(name);
        KeySequencePlayer::new(keyboard, self.config.key_sequence.clone())
    }

    /// Gamepad with the default mapping. Sticks and buttons register as
    /// `gamepad` and `gamepad-buttons`.
    pub fn gamepad(&mut self) -> GamepadSource {
        let sender = self.arbiter.register_source("gamepad");
        let buttons = self.keyboard("gamepad-buttons");
        GamepadSource::new(
            self.config.gamepad.clone(),
            GamepadMapping::default(),
            sender,
            buttons,
            self.home.clone(),
        )
    }

    pub fn replay_player(&mut self) -> ReplayPlayer {
        let sender = self.arbiter.register_source("replay");
        ReplayPlayer::new(sender, self.registry.clone())
    }

    /// Mirror every revolute joint of `link` onto this robot.
    pub fn leader_mirror(&mut self, link: Arc<RobotLink>) -> LeaderMirror {
        let sender = self.arbiter.register_source("leader");
        LeaderMirror::new(
            link,
            sender,
            self.registry.ids_of_kind(JointKind::Revolute),
            &self.config.leader,
        )
    }

    pub fn recorder(&self) -> Recorder {
        Recorder::new(&self.registry, self.config.recording.interval_ms)
    }

    /// Start the tick task and, with a follower, the push task.
    pub fn spawn(
        self,
        follower: Option<Arc<RobotLink>>,
        recorder: Option<Recorder>,
        cancel: CancellationToken,
    ) -> TeleopHandle {
        let (snapshot_tx, snapshots) = watch::channel(self.integrator.snapshot());
        let tick_interval = Duration::from_millis(self.config.tick_interval_ms.max(1));

        let push = follower.map(|link| {
            tokio::spawn(push_loop(
                link,
                snapshots.clone(),
                self.config.bus.push_interval(),
                self.config.bus.speed_hint,
                cancel.clone(),
            ))
        });
        let runtime = tokio::spawn(tick_loop(
            self.arbiter,
            self.integrator,
            snapshot_tx,
            recorder,
            tick_interval,
            cancel,
        ));

        TeleopHandle {
            snapshots,
            runtime,
            push,
        }
    }
}

pub struct TeleopHandle {
    snapshots: watch::Receiver<Vec<JointState>>,
    runtime: JoinHandle<Option<Recorder>>,
    push: Option<JoinHandle<()>>,
}

impl TeleopHandle {
    /// Joint states as of the last completed tick.
    pub fn snapshots(&self) -> watch::Receiver<Vec<JointState>> {
        self.snapshots.clone()
    }

    /// Wait for both tasks to stop. Returns the recorder if one was running.
    pub async fn join(self) -> Result<Option<Recorder>> {
        let recorder = self.runtime.await?;
        if let Some(push) = self.push {
            push.await?;
        }
        Ok(recorder)
    }
}

async fn tick_loop(
    mut arbiter: InputArbiter,
    mut integrator: JointIntegrator,
    snapshot_tx: watch::Sender<Vec<JointState>>,
    mut recorder: Option<Recorder>,
    period: Duration,
    cancel: CancellationToken,
) -> Option<Recorder> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let now = Instant::now();
        let dt_ms = now.duration_since(last).as_secs_f64() * 1000.0;
        last = now;

        let report = arbiter.tick(&mut integrator, dt_ms);
        if report.dropped > 0 {
            tracing::debug!("Dropped {} intents this tick", report.dropped);
        }
        integrator.tick(dt_ms);

        let snapshot = integrator.snapshot();
        if let Some(recorder) = recorder.as_mut() {
            recorder.sample(&snapshot, integrator.clock_ms());
        }
        snapshot_tx.send_replace(snapshot);
    }

    tracing::debug!("Teleop tick loop stopped");
    recorder
}

/// Sync entries for joints whose command value differs from `sent`.
fn changed_entries(
    snapshot: &[JointState],
    sent: &HashMap<ServoId, f64>,
    speed_hint: u16,
) -> Vec<(SyncEntry, f64)> {
    snapshot
        .iter()
        .filter(|s| sent.get(&s.servo_id) != Some(&s.command_value()))
        .map(|s| {
            let entry = match s.kind {
                JointKind::Revolute => SyncEntry::Position {
                    servo_id: s.servo_id,
                    degrees: s.degrees,
                    speed_hint,
                },
                JointKind::Continuous => SyncEntry::Speed {
                    servo_id: s.servo_id,
                    speed: s.speed,
                },
            };
            (entry, s.command_value())
        })
        .collect()
}

async fn push_loop(
    link: Arc<RobotLink>,
    mut snapshots: watch::Receiver<Vec<JointState>>,
    period: Duration,
    speed_hint: u16,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sent: HashMap<ServoId, f64> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if !link.is_connected() {
            // Push everything again after a reconnect.
            sent.clear();
            continue;
        }

        let changed = changed_entries(&snapshots.borrow_and_update(), &sent, speed_hint);
        if changed.is_empty() {
            continue;
        }
        let entries: Vec<SyncEntry> = changed.iter().map(|(e, _)| *e).collect();

        match link.sync_write(&entries).await {
            Ok(outcome) => {
                for (entry, value) in &changed {
                    if outcome.written.contains(&entry.servo_id()) {
                        sent.insert(entry.servo_id(), *value);
                    }
                }
                for (id, e) in &outcome.failed {
                    tracing::debug!("Push to servo {} failed: {}", id, e);
                }
            }
            Err(e) => tracing::debug!("Push skipped: {}", e),
        }
    }
    tracing::debug!("Teleop push loop stopped");
}
