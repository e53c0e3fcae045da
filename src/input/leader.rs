//! Leader-arm mirroring.
//!
//! The leader link keeps torque off so the arm can be moved by hand. Every
//! poll reads each revolute servo's present position (one sync-read on STS
//! buses) and submits it as an absolute angle, so the follower copies the
//! leader's pose.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::connection::RobotLink;
use crate::intent::IntentSender;
use crate::joint::ServoId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    pub poll_interval_ms: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 20,
        }
    }
}

pub struct LeaderMirror {
    link: Arc<RobotLink>,
    sender: IntentSender,
    servo_ids: Vec<ServoId>,
    interval: Duration,
}

impl LeaderMirror {
    /// `servo_ids` should list the revolute joints to mirror.
    pub fn new(
        link: Arc<RobotLink>,
        sender: IntentSender,
        servo_ids: Vec<ServoId>,
        config: &LeaderConfig,
    ) -> Self {
        Self {
            link,
            sender,
            servo_ids,
            interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    /// Read every servo once and forward the angles that came back.
    ///
    /// Returns `false` when the link is gone.
    pub async fn poll_once(&self) -> bool {
        let results = match self.link.read_positions(&self.servo_ids).await {
            Ok(results) => results,
            Err(e) => {
                tracing::debug!("Leader poll failed: {}", e);
                return false;
            }
        };
        for (id, result) in results {
            match result {
                Ok(degrees) => {
                    self.sender.set_angle(id, degrees);
                }
                Err(e) => tracing::debug!("Leader servo {} read failed: {}", id, e),
            }
        }
        true
    }

    /// Poll until cancelled or the leader link drops. Returns the number of
    /// completed polls.
    pub async fn run(self, cancel: CancellationToken) -> usize {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut polls = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !self.poll_once().await {
                        tracing::warn!("Leader link lost, mirroring stopped");
                        break;
                    }
                    polls += 1;
                }
            }
        }
        self.sender.release_all();
        polls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{ArbiterConfig, InputArbiter};
    use crate::bus::sim::VirtualServoBus;
    use crate::bus::{BusConfig, ServoFamily};
    use crate::compound::CompoundMotionResolver;
    use crate::connection::LinkRole;
    use crate::integrator::{IntegratorConfig, JointIntegrator};
    use crate::robots;
    use crate::transport::{PortRequest, SimProvider};

    async fn setup() -> (Arc<SimProvider>, Arc<RobotLink>, InputArbiter, JointIntegrator) {
        let robot = robots::preset("so-arm100").unwrap();
        let registry = robot.registry().unwrap();
        let integrator =
            JointIntegrator::new(&registry, IntegratorConfig::default(), &robot.initial_degrees());
        let arbiter = InputArbiter::new(
            registry,
            CompoundMotionResolver::default(),
            ArbiterConfig::default(),
        );

        let provider = Arc::new(SimProvider::new(VirtualServoBus::new(ServoFamily::Sts, 1..=6)));
        let link = Arc::new(RobotLink::new(
            LinkRole::Leader,
            provider.clone(),
            BusConfig::default(),
            (1..=6).collect(),
        ));
        link.connect(&PortRequest::path("sim", 1_000_000)).await.unwrap();
        (provider, link, arbiter, integrator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_mirrors_hand_moved_pose() {
        let (provider, link, mut arbiter, mut integrator) = setup().await;
        let mirror = LeaderMirror::new(
            link,
            arbiter.register_source("leader"),
            (1..=6).collect(),
            &LeaderConfig::default(),
        );

        provider.bus().set_present_degrees(2, 90.0);
        provider.bus().set_present_degrees(6, 45.0);
        assert!(mirror.poll_once().await);
        assert_eq!(provider.bus().sync_reads(), 1);

        arbiter.tick(&mut integrator, 20.0);
        assert_eq!(integrator.degrees(2), Some(90.0));
        assert_eq!(integrator.degrees(6), Some(45.0));
        assert_eq!(integrator.degrees(1), Some(180.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_servo_does_not_block_the_others() {
        let (provider, link, mut arbiter, mut integrator) = setup().await;
        let mirror = LeaderMirror::new(
            link,
            arbiter.register_source("leader"),
            (1..=6).collect(),
            &LeaderConfig::default(),
        );

        provider.bus().set_silent(3, true);
        provider.bus().set_present_degrees(3, 10.0);
        provider.bus().set_present_degrees(4, 135.0);
        assert!(mirror.poll_once().await);

        arbiter.tick(&mut integrator, 20.0);
        assert_eq!(integrator.degrees(3), Some(180.0));
        assert_eq!(integrator.degrees(4), Some(135.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_link_drops() {
        let (provider, link, mut arbiter, _integrator) = setup().await;
        let mirror = LeaderMirror::new(
            link.clone(),
            arbiter.register_source("leader"),
            (1..=6).collect(),
            &LeaderConfig::default(),
        );

        let handle = tokio::spawn(mirror.run(CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        provider.unplug();

        let polls = handle.await.unwrap();
        assert!(polls >= 2);
        assert!(!link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let (_provider, link, mut arbiter, _integrator) = setup().await;
        let mirror = LeaderMirror::new(
            link.clone(),
            arbiter.register_source("leader"),
            vec![1],
            &LeaderConfig::default(),
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(mirror.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert!(handle.await.unwrap() >= 1);
        assert!(link.is_connected());
    }
}
