//! Timed key presses for voice and chat commands.
//!
//! A command such as "rotate left a bit, then open the jaw" arrives as a list
//! of [`KeyStep`]s. [`KeySequencePlayer`] presses each key for its duration
//! through a [`KeyboardSource`], so the result is indistinguishable from a
//! person holding the key down. Arms move roughly 0.15 degrees per 3 ms of
//! hold, which makes 1000 ms about 50 degrees.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::keyboard::KeyboardSource;
use crate::error::ConfigError;

/// Hold time used when a step does not name one.
pub const DEFAULT_HOLD_MS: u64 = 1000;

/// Delay before each key-down so the previous release lands first.
pub const SETTLE_MS: u64 = 10;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySequenceConfig {
    pub min_hold_ms: u64,
    pub max_hold_ms: u64,
    pub default_pause_ms: u64,
}

impl Default for KeySequenceConfig {
    fn default() -> Self {
        Self {
            min_hold_ms: 100,
            max_hold_ms: 5000,
            default_pause_ms: 100,
        }
    }
}

impl KeySequenceConfig {
    pub fn clamp_hold(&self, duration_ms: Option<u64>) -> u64 {
        duration_ms
            .unwrap_or(DEFAULT_HOLD_MS)
            .clamp(self.min_hold_ms, self.max_hold_ms.max(self.min_hold_ms))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStep {
    pub key: String,
    #[serde(default, rename = "duration")]
    pub duration_ms: Option<u64>,
    #[serde(default, rename = "pauseAfter")]
    pub pause_after_ms: Option<u64>,
}

impl KeyStep {
    pub fn new(key: &str, duration_ms: u64) -> Self {
        Self {
            key: key.to_string(),
            duration_ms: Some(duration_ms),
            pause_after_ms: None,
        }
    }
}

/// Parse `"q:1000,w:500+200,e"`: key, optional `:hold_ms`, optional
/// `+pause_ms`.
pub fn parse_sequence(text: &str) -> Result<Vec<KeyStep>, ConfigError> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|step| {
            let invalid = || ConfigError::InvalidKeySequence(step.to_string());
            let (rest, pause) = match step.split_once('+') {
                Some((rest, pause)) => (rest, Some(pause.trim().parse::<u64>().map_err(|_| invalid())?)),
                None => (step, None),
            };
            let (key, duration) = match rest.split_once(':') {
                Some((key, ms)) => (key.trim(), Some(ms.trim().parse::<u64>().map_err(|_| invalid())?)),
                None => (rest.trim(), None),
            };
            if key.is_empty() {
                return Err(invalid());
            }
            Ok(KeyStep {
                key: key.to_string(),
                duration_ms: duration,
                pause_after_ms: pause,
            })
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepResult {
    Completed { key: String, held_ms: u64 },
    UnknownKey(String),
    Cancelled { key: String },
}

#[derive(Debug)]
pub struct KeySequencePlayer {
    keyboard: KeyboardSource,
    config: KeySequenceConfig,
}

impl KeySequencePlayer {
    pub fn new(keyboard: KeyboardSource, config: KeySequenceConfig) -> Self {
        Self { keyboard, config }
    }

    /// Hold `key` for `duration_ms` (clamped). The key is always released,
    /// also when cancelled mid-hold.
    pub async fn press(
        &mut self,
        key: &str,
        duration_ms: Option<u64>,
        cancel: &CancellationToken,
    ) -> StepResult {
        if !self.keyboard.bindings().is_bound(key) {
            tracing::warn!("Key sequence: no binding for {:?}", key);
            return StepResult::UnknownKey(key.to_string());
        }
        let held_ms = self.config.clamp_hold(duration_ms);

        tokio::select! {
            _ = cancel.cancelled() => return StepResult::Cancelled { key: key.to_string() },
            _ = tokio::time::sleep(Duration::from_millis(SETTLE_MS)) => {}
        }

        self.keyboard.key_down(key);
        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(Duration::from_millis(held_ms)) => false,
        };
        self.keyboard.key_up(key);

        if cancelled {
            StepResult::Cancelled {
                key: key.to_string(),
            }
        } else {
            tracing::debug!("Key sequence: held {} for {} ms", key, held_ms);
            StepResult::Completed {
                key: key.to_string(),
                held_ms,
            }
        }
    }

    /// Play steps in order, stopping at the first cancellation.
    pub async fn run(&mut self, steps: &[KeyStep], cancel: &CancellationToken) -> Vec<StepResult> {
        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            let result = self.press(&step.key, step.duration_ms, cancel).await;
            let stop = matches!(result, StepResult::Cancelled { .. });
            results.push(result);
            if stop {
                break;
            }

            let pause = step.pause_after_ms.unwrap_or(self.config.default_pause_ms);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(pause)) => {}
            }
        }
        results
    }

    pub fn into_keyboard(self) -> KeyboardSource {
        self.keyboard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{ArbiterConfig, InputArbiter};
    use crate::input::keyboard::KeyBindings;
    use crate::robots;

    fn setup() -> (InputArbiter, KeySequencePlayer) {
        let robot = robots::preset("so-arm100").unwrap();
        let registry = robot.registry().unwrap();
        let resolver = robot.resolver(&registry).unwrap();
        let bindings = KeyBindings::new(&robot.keyboard_controls, &resolver);
        let mut arbiter = InputArbiter::new(registry, resolver, ArbiterConfig::default());
        let keyboard = KeyboardSource::new(bindings, arbiter.register_source("llm"));
        (arbiter, KeySequencePlayer::new(keyboard, KeySequenceConfig::default()))
    }

    #[test]
    fn test_parse_sequence() {
        let steps = parse_sequence("q:1000, w:500+200 ,e").unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0], KeyStep::new("q", 1000));
        assert_eq!(steps[1].pause_after_ms, Some(200));
        assert_eq!(steps[2].duration_ms, None);

        assert!(matches!(
            parse_sequence("q:abc"),
            Err(ConfigError::InvalidKeySequence(_))
        ));
        assert!(parse_sequence(":100").is_err());
    }

    #[test]
    fn test_steps_deserialize_from_tool_calls() {
        let steps: Vec<KeyStep> =
            serde_json::from_str(r#"[{"key":"q","duration":300,"pauseAfter":50},{"key":"w"}]"#)
                .unwrap();
        assert_eq!(steps[0].pause_after_ms, Some(50));
        assert_eq!(steps[1].duration_ms, None);
    }

    #[test]
    fn test_hold_is_clamped() {
        let config = KeySequenceConfig::default();
        assert_eq!(config.clamp_hold(None), DEFAULT_HOLD_MS);
        assert_eq!(config.clamp_hold(Some(20_000)), 5000);
        assert_eq!(config.clamp_hold(Some(5)), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_each_step() {
        let (_arbiter, mut player) = setup();
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();

        let steps = vec![KeyStep::new("q", 300), KeyStep::new("z", 300), KeyStep::new("w", 9000)];
        let results = player.run(&steps, &cancel).await;

        assert_eq!(
            results,
            vec![
                StepResult::Completed {
                    key: "q".into(),
                    held_ms: 300
                },
                StepResult::UnknownKey("z".into()),
                StepResult::Completed {
                    key: "w".into(),
                    held_ms: 5000
                },
            ]
        );
        // settle + hold + default pause, twice, plus the pause after "z".
        assert_eq!(start.elapsed(), Duration::from_millis(10 + 300 + 100 + 100 + 10 + 5000 + 100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_the_held_key() {
        let (mut arbiter, mut player) = setup();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let steps = vec![KeyStep::new("q", 1000), KeyStep::new("w", 1000)];
        let results = player.run(&steps, &cancel).await;
        assert_eq!(results, vec![StepResult::Cancelled { key: "q".into() }]);

        let robot = robots::preset("so-arm100").unwrap();
        let registry = robot.registry().unwrap();
        let mut integrator = crate::integrator::JointIntegrator::new(
            &registry,
            Default::default(),
            &robot.initial_degrees(),
        );
        arbiter.tick(&mut integrator, 10.0);
        assert!(arbiter.claims("llm").is_empty());
    }
}
