use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use mprtp_control::config::{ControlConfig, ControlConfigInput};
use mprtp_control::SubflowId;
use mprtp_wire::report::MAX_BLOCKS;

/// A whole simulated session, as read from TOML.
///
/// ```toml
/// seed = 7
/// duration_s = 30
///
/// [[paths]]
/// id = 1
/// capacity_kbit = 2000
/// base_delay_ms = 30
///
/// [control.rate]
/// beta = 0.2
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub seed: u64,
    pub duration_s: u64,
    pub step_ms: u64,
    pub packet_size: usize,
    /// Every n-th packet starts a keyframe burst of `keyframe_packets`.
    pub keyframe_interval: u64,
    pub keyframe_packets: u64,
    pub initial_target_kbit: u64,
    /// Upper bound on the media rate, whatever the targets add up to.
    pub media_max_kbit: Option<u64>,
    /// Receiver to sender delay of feedback reports.
    pub feedback_delay_ms: u64,
    /// Packets older than this at arrival are counted as discarded.
    pub playout_deadline_ms: u64,
    /// Re-join a passive subflow after this long. `None` leaves it detached.
    pub rejoin_after_ms: Option<u64>,
    pub paths: Vec<PathConfig>,
    pub control: ControlConfigInput,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            duration_s: 30,
            step_ms: 1,
            packet_size: 1200,
            keyframe_interval: 300,
            keyframe_packets: 10,
            initial_target_kbit: 1000,
            media_max_kbit: None,
            feedback_delay_ms: 20,
            playout_deadline_ms: 400,
            rejoin_after_ms: Some(2000),
            paths: vec![
                PathConfig {
                    id: 1,
                    capacity_kbit: 3000,
                    base_delay_ms: 25,
                    ..PathConfig::default()
                },
                PathConfig {
                    id: 2,
                    capacity_kbit: 1500,
                    base_delay_ms: 60,
                    jitter_ms: 5,
                    loss_percent: 0.5,
                    ..PathConfig::default()
                },
            ],
            control: ControlConfigInput::default(),
        }
    }
}

/// One bottleneck link.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub id: SubflowId,
    pub capacity_kbit: u64,
    /// Random-walk bounds of the capacity; both default to `capacity_kbit`.
    pub min_capacity_kbit: Option<u64>,
    pub max_capacity_kbit: Option<u64>,
    /// Largest capacity change per simulated second.
    pub capacity_step_kbit: u64,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
    pub loss_percent: f64,
    /// Tail-drop once the standing queue exceeds this delay.
    pub queue_limit_ms: u64,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            id: 0,
            capacity_kbit: 2000,
            min_capacity_kbit: None,
            max_capacity_kbit: None,
            capacity_step_kbit: 0,
            base_delay_ms: 30,
            jitter_ms: 0,
            loss_percent: 0.0,
            queue_limit_ms: 300,
        }
    }
}

impl PathConfig {
    pub fn capacity_bounds_kbit(&self) -> (u64, u64) {
        let min = self.min_capacity_kbit.unwrap_or(self.capacity_kbit);
        let max = self.max_capacity_kbit.unwrap_or(self.capacity_kbit);
        (min, max.max(min))
    }
}

impl ScenarioConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: ScenarioConfig = toml::from_str(input).context("invalid scenario TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            bail!("scenario has no paths");
        }
        if self.paths.len() > MAX_BLOCKS {
            bail!("at most {} paths fit one feedback report, got {}", MAX_BLOCKS, self.paths.len());
        }
        let mut ids: Vec<SubflowId> = self.paths.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.paths.len() {
            bail!("path ids must be unique");
        }
        if self.step_ms == 0 || self.packet_size == 0 {
            bail!("step_ms and packet_size must be positive");
        }
        for path in &self.paths {
            let (min, _) = path.capacity_bounds_kbit();
            if path.capacity_kbit == 0 || min == 0 {
                bail!("path {} has zero capacity", path.id);
            }
            if !(0.0..=100.0).contains(&path.loss_percent) {
                bail!("path {} loss_percent out of range: {}", path.id, path.loss_percent);
            }
        }
        Ok(())
    }

    pub fn control_config(&self) -> Result<ControlConfig> {
        self.control.clone().resolve().map_err(anyhow::Error::msg)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_s)
    }

    pub fn step(&self) -> Duration {
        Duration::from_millis(self.step_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_paths_and_control() {
        let config = ScenarioConfig::from_toml_str(
            r#"
seed = 9
duration_s = 5

[[paths]]
id = 3
capacity_kbit = 800
loss_percent = 1.5

[[paths]]
id = 4
capacity_kbit = 4000
min_capacity_kbit = 2000
max_capacity_kbit = 6000
capacity_step_kbit = 250

[control.rate]
beta = 0.25
"#,
        )
        .unwrap();
        assert_eq!(config.seed, 9);
        assert_eq!(config.paths.len(), 2);
        assert_eq!(config.paths[0].queue_limit_ms, 300);
        assert_eq!(config.paths[1].capacity_bounds_kbit(), (2000, 6000));
        assert_eq!(config.control_config().unwrap().rate.beta, 0.25);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err =
            ScenarioConfig::from_toml_str("[[paths]]\nid = 1\n[[paths]]\nid = 1\n").unwrap_err();
        assert!(err.to_string().contains("unique"));
    }

    #[test]
    fn rejects_empty_scenario() {
        assert!(ScenarioConfig::from_toml_str("paths = []\n").is_err());
    }

    #[test]
    fn invalid_control_section_surfaces() {
        let config = ScenarioConfig::from_toml_str("[control.rate]\nbeta = 1.5\n").unwrap();
        assert!(config.control_config().is_err());
    }
}
