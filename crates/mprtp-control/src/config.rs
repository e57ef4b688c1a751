use std::time::Duration;

use serde::Deserialize;

use crate::state::SubflowState;

pub const CONFIG_VERSION: u32 = 1;

/// Upper bound on correlation blocks in the cascade.
pub const MAX_CORRELATION_BLOCKS: usize = 8;
/// Upper bound on allocator tree depth; slot masks are 128 bits wide.
pub const MAX_TREE_DEPTH: u8 = 7;

// ─── Raw TOML Input ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControlConfigInput {
    pub version: u32,
    pub rate: RateConfigInput,
    pub analyzer: AnalyzerConfigInput,
    pub allocator: AllocatorConfigInput,
    pub scheduler: SchedulerConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateConfigInput {
    pub min_bitrate: Option<u64>,
    pub max_bitrate: Option<u64>,
    pub beta: Option<f64>,
    pub gamma: Option<f64>,
    pub ramp_up_min: Option<u64>,
    pub ramp_up_max: Option<u64>,
    pub loss_threshold: Option<f64>,
    pub holdoff_min_ms: Option<u64>,
    pub holdoff_max_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfigInput {
    pub windows: Option<Vec<usize>>,
    pub thresholds: Option<Vec<f64>>,
    pub congestion_threshold: Option<f64>,
    pub stability_band: Option<f64>,
    pub resolution_us: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AllocatorConfigInput {
    pub depth: Option<u8>,
    pub rebuild_margin_ratio: Option<f64>,
    pub rebuild_margin_abs: Option<u64>,
    pub keyframe_min_state: Option<SubflowState>,
    pub pacing_gain: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfigInput {
    pub tick_interval_ms: Option<u64>,
    pub report_interval_ms: Option<u64>,
    pub late_timeout_ms: Option<u64>,
    pub feedback_channel_capacity: Option<usize>,
}

// ─── Resolved Config ────────────────────────────────────────────────────────

/// Bitrate controller parameters. Bitrates are in bits per second.
#[derive(Debug, Clone, PartialEq)]
pub struct RateConfig {
    pub min_bitrate: u64,
    pub max_bitrate: u64,
    /// Multiplicative decrease on distortion.
    pub beta: f64,
    /// Relative increase per settled tick.
    pub gamma: f64,
    pub ramp_up_min: u64,
    pub ramp_up_max: u64,
    /// Interval loss fraction above which a report raises `Lost`.
    pub loss_threshold: f64,
    pub holdoff_min: Duration,
    pub holdoff_max: Duration,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            min_bitrate: 100_000,
            max_bitrate: 20_000_000,
            beta: 0.15,
            gamma: 0.03,
            ramp_up_min: 10_000,
            ramp_up_max: 500_000,
            loss_threshold: 0.02,
            holdoff_min: Duration::from_millis(300),
            holdoff_max: Duration::from_secs(2),
        }
    }
}

/// One timescale of the correlation cascade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockConfig {
    pub window: usize,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerConfig {
    /// Finest timescale first.
    pub blocks: Vec<BlockConfig>,
    pub congestion_threshold: f64,
    pub stability_band: f64,
    /// Quantization step applied to delay samples.
    pub resolution: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        let windows = [8, 4, 4, 8];
        let thresholds = [0.025, 0.05, 0.1, 0.2];
        Self {
            blocks: windows
                .iter()
                .zip(thresholds)
                .map(|(&window, threshold)| BlockConfig { window, threshold })
                .collect(),
            congestion_threshold: 0.1,
            stability_band: 0.1,
            resolution: Duration::from_micros(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorConfig {
    pub depth: u8,
    pub rebuild_margin_ratio: f64,
    pub rebuild_margin_abs: u64,
    /// Keyframes prefer subflows at or above this state.
    pub keyframe_min_state: SubflowState,
    /// `None` disables pacing.
    pub pacing_gain: Option<f64>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            depth: MAX_TREE_DEPTH,
            rebuild_margin_ratio: 0.05,
            rebuild_margin_abs: 50_000,
            keyframe_min_state: SubflowState::NonCongested,
            pacing_gain: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub report_interval: Duration,
    pub late_timeout: Duration,
    pub feedback_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            report_interval: Duration::from_millis(200),
            late_timeout: Duration::from_millis(600),
            feedback_channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlConfig {
    pub version: u32,
    pub rate: RateConfig,
    pub analyzer: AnalyzerConfig,
    pub allocator: AllocatorConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            rate: RateConfig::default(),
            analyzer: AnalyzerConfig::default(),
            allocator: AllocatorConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

// ─── Resolution ─────────────────────────────────────────────────────────────

fn fraction(name: &str, value: f64) -> Result<f64, String> {
    if !(0.0..1.0).contains(&value) {
        return Err(format!("{} must be in [0, 1), got {}", name, value));
    }
    Ok(value)
}

impl RateConfigInput {
    fn resolve(self) -> Result<RateConfig, String> {
        let d = RateConfig::default();
        let min_bitrate = self.min_bitrate.unwrap_or(d.min_bitrate).max(1);
        let max_bitrate = self.max_bitrate.unwrap_or(d.max_bitrate);
        if min_bitrate > max_bitrate {
            return Err(format!(
                "rate.min_bitrate ({}) exceeds rate.max_bitrate ({})",
                min_bitrate, max_bitrate
            ));
        }
        let ramp_up_min = self.ramp_up_min.unwrap_or(d.ramp_up_min);
        let ramp_up_max = self.ramp_up_max.unwrap_or(d.ramp_up_max).max(ramp_up_min);
        let holdoff_min = self.holdoff_min_ms.map(Duration::from_millis).unwrap_or(d.holdoff_min);
        let holdoff_max = self
            .holdoff_max_ms
            .map(Duration::from_millis)
            .unwrap_or(d.holdoff_max)
            .max(holdoff_min);
        Ok(RateConfig {
            min_bitrate,
            max_bitrate,
            beta: fraction("rate.beta", self.beta.unwrap_or(d.beta))?,
            gamma: fraction("rate.gamma", self.gamma.unwrap_or(d.gamma))?,
            ramp_up_min,
            ramp_up_max,
            loss_threshold: fraction(
                "rate.loss_threshold",
                self.loss_threshold.unwrap_or(d.loss_threshold),
            )?,
            holdoff_min,
            holdoff_max,
        })
    }
}

impl AnalyzerConfigInput {
    fn resolve(self) -> Result<AnalyzerConfig, String> {
        let d = AnalyzerConfig::default();
        let thresholds = self
            .thresholds
            .unwrap_or_else(|| d.blocks.iter().map(|b| b.threshold).collect());
        if thresholds.is_empty() || thresholds.len() > MAX_CORRELATION_BLOCKS {
            return Err(format!(
                "analyzer.thresholds must list 1..={} blocks, got {}",
                MAX_CORRELATION_BLOCKS,
                thresholds.len()
            ));
        }
        // A single window length applies to every block.
        let windows = match self.windows {
            Some(w) if w.len() == 1 => vec![w[0]; thresholds.len()],
            Some(w) => w,
            None => {
                let mut w: Vec<usize> = d.blocks.iter().map(|b| b.window).collect();
                w.resize(thresholds.len(), 4);
                w
            }
        };
        if windows.len() != thresholds.len() {
            return Err(format!(
                "analyzer.windows has {} entries but analyzer.thresholds has {}",
                windows.len(),
                thresholds.len()
            ));
        }
        let blocks = windows
            .into_iter()
            .zip(thresholds)
            .map(|(window, threshold)| BlockConfig {
                window: window.max(2),
                threshold,
            })
            .collect();
        let resolution_us = self
            .resolution_us
            .unwrap_or(d.resolution.as_micros() as u64)
            .max(1);
        Ok(AnalyzerConfig {
            blocks,
            congestion_threshold: self.congestion_threshold.unwrap_or(d.congestion_threshold),
            stability_band: self.stability_band.unwrap_or(d.stability_band).abs(),
            resolution: Duration::from_micros(resolution_us),
        })
    }
}

impl AllocatorConfigInput {
    fn resolve(self) -> Result<AllocatorConfig, String> {
        let d = AllocatorConfig::default();
        let pacing_gain = match self.pacing_gain {
            Some(g) if g <= 0.0 || !g.is_finite() => {
                return Err(format!("allocator.pacing_gain must be positive, got {}", g));
            }
            other => other,
        };
        Ok(AllocatorConfig {
            depth: self.depth.unwrap_or(d.depth).clamp(1, MAX_TREE_DEPTH),
            rebuild_margin_ratio: self
                .rebuild_margin_ratio
                .unwrap_or(d.rebuild_margin_ratio)
                .max(0.0),
            rebuild_margin_abs: self.rebuild_margin_abs.unwrap_or(d.rebuild_margin_abs),
            keyframe_min_state: self.keyframe_min_state.unwrap_or(d.keyframe_min_state),
            pacing_gain,
        })
    }
}

impl SchedulerConfigInput {
    fn resolve(self) -> SchedulerConfig {
        let d = SchedulerConfig::default();
        let report_interval = self
            .report_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(d.report_interval);
        SchedulerConfig {
            tick_interval: self
                .tick_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(d.tick_interval)
                .max(Duration::from_millis(1)),
            report_interval,
            // Three report intervals unless set explicitly.
            late_timeout: self
                .late_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(report_interval * 3),
            feedback_channel_capacity: self
                .feedback_channel_capacity
                .unwrap_or(d.feedback_channel_capacity)
                .max(1),
        }
    }
}

impl ControlConfigInput {
    pub fn resolve(self) -> Result<ControlConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }
        Ok(ControlConfig {
            version,
            rate: self.rate.resolve()?,
            analyzer: self.analyzer.resolve()?,
            allocator: self.allocator.resolve()?,
            scheduler: self.scheduler.resolve(),
        })
    }
}

impl ControlConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(ControlConfig::default());
        }
        let parsed: ControlConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }
}
