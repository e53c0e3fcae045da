//! Dataset playback as an input source.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::dataset::Dataset;
use crate::intent::IntentSender;
use crate::joint::{JointKind, JointRegistry, ServoId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub frames_played: usize,
    pub cancelled: bool,
}

#[derive(Debug)]
pub struct ReplayPlayer {
    sender: IntentSender,
    registry: JointRegistry,
}

impl ReplayPlayer {
    pub fn new(sender: IntentSender, registry: JointRegistry) -> Self {
        Self { sender, registry }
    }

    /// Columns of `dataset` that match a registered joint of the same kind.
    fn columns(&self, dataset: &Dataset) -> Vec<(usize, ServoId, JointKind)> {
        dataset
            .joints
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match self.registry.get(c.servo_id) {
                Some(j) if j.kind == c.kind => Some((i, c.servo_id, c.kind)),
                _ => {
                    tracing::debug!("Replay: skipping column for servo {}", c.servo_id);
                    None
                }
            })
            .collect()
    }

    /// Emit one frame every recording interval. Wheels are stopped when
    /// playback ends or is cancelled.
    pub async fn play(&self, dataset: &Dataset, cancel: &CancellationToken) -> ReplayOutcome {
        let columns = self.columns(dataset);
        let mut interval =
            tokio::time::interval(Duration::from_millis(dataset.recording_interval_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Replaying {:?}: {} frames, {} joints",
            dataset.name,
            dataset.frame_count(),
            columns.len()
        );

        let mut outcome = ReplayOutcome {
            frames_played: 0,
            cancelled: false,
        };
        for frame in &dataset.frames {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                _ = interval.tick() => {}
            }
            for &(i, servo_id, kind) in &columns {
                let Some(&value) = frame.get(i) else { continue };
                match kind {
                    JointKind::Revolute => self.sender.set_angle(servo_id, value),
                    JointKind::Continuous => self.sender.set_speed(servo_id, value),
                };
            }
            outcome.frames_played += 1;
        }

        for &(_, servo_id, kind) in &columns {
            if kind == JointKind::Continuous {
                self.sender.set_speed(servo_id, 0.0);
            }
        }
        outcome
    }
}
