//! # Delay Trend Analyzer
//!
//! A cascade of correlation blocks estimates the lag-one autocorrelation of
//! one-way delay at several timescales. A queue that keeps growing shows up
//! as a positive coefficient long before loss does.
//!
//! ```text
//!   sample ──▶ block 0 (every sample)
//!                 │ pair sums
//!                 ▼
//!              block 1 (every 2nd sample)
//!                 │ pair sums
//!                 ▼
//!              block 2 (every 4th sample) ──▶ ...
//! ```
//!
//! Per execution a block folds its newest input `u` and the lagged input `d`
//! into running window sums:
//!
//! ```text
//!   M1  = M0
//!   M0  = M0 + u − ring_M[i]
//!   G01 = G01 + u·d − ring_G[i]
//!   g   = N·G01 / (M0·M1) − 1
//! ```
//!
//! A flat delay gives `g ≈ 0`; a ramp gives `g ≈ (N−1)·slope/mean > 0`.
//!
//! Dispatch uses a single counter: `X = (c XOR (c−1)) + 1` is `2^(k+1)` when
//! `c` has `k` trailing zeros, so two dispatches per sample run block 0 once
//! and block `k` once every `2^k` samples.

use std::time::Duration;

use crate::config::{AnalyzerConfig, BlockConfig};

/// Smoothing factor of the per-block deviation.
const DEVIATION_ALPHA: f64 = 0.125;

/// Consecutive valid inputs before a block emits valid pair sums: two for
/// the upper pair, three for the lagged pair.
const PAIR_WARMUP: usize = 3;

/// Cap on one sample in resolution units. Pair sums grow by one bit per
/// level, so inputs stay far below `i64::MAX` and window sums of products
/// fit in `i128`.
const MAX_SAMPLE_UNITS: i64 = u32::MAX as i64;

// ─── Correlation Block ──────────────────────────────────────────────────────

/// One timescale of the cascade.
#[derive(Debug, Clone)]
pub struct CorrelationBlock {
    window: usize,
    threshold: f64,
    ring_m: Vec<i128>,
    ring_g: Vec<i128>,
    index: usize,
    m0: i128,
    m1: i128,
    g01: i128,
    // Input latches: newest input, previous input, and three lagged inputs.
    iu0: i64,
    iu1: i64,
    id1: i64,
    id2: i64,
    id3: i64,
    g: f64,
    deviation: f64,
    valid_inputs: usize,
    /// Validity of the pair sums latched by the finer block.
    pending: bool,
    executions: u64,
}

/// Pair sums handed to the next coarser block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PairSums {
    upper: i64,
    lagged: i64,
    valid: bool,
}

impl CorrelationBlock {
    pub fn new(config: BlockConfig) -> Self {
        let window = config.window.max(2);
        Self {
            window,
            threshold: config.threshold,
            ring_m: vec![0; window],
            ring_g: vec![0; window],
            index: 0,
            m0: 0,
            m1: 0,
            g01: 0,
            iu0: 0,
            iu1: 0,
            id1: 0,
            id2: 0,
            id3: 0,
            g: 0.0,
            deviation: 0.0,
            valid_inputs: 0,
            pending: false,
            executions: 0,
        }
    }

    /// Feed one input directly, with the previous input as the lagged one.
    /// Used when a block runs on its own rather than inside a cascade.
    pub fn push(&mut self, x: i64) {
        let valid = self.executions > 0;
        self.iu0 = x;
        self.execute(valid);
        self.id1 = x;
    }

    fn execute(&mut self, valid: bool) -> PairSums {
        if valid {
            self.valid_inputs = self.valid_inputs.saturating_add(1);
        } else {
            self.valid_inputs = 0;
        }
        self.executions += 1;

        let i = self.index;
        self.m1 = self.m0;
        let u = self.iu0 as i128;
        self.m0 += u - self.ring_m[i];
        self.ring_m[i] = u;
        let product = u * self.id1 as i128;
        self.g01 += product - self.ring_g[i];
        self.ring_g[i] = product;
        self.index = (i + 1) % self.window;

        if self.m0 == 0 {
            self.g = 0.0;
        } else if self.m1 != 0 {
            let n = self.window as f64;
            let g = n * self.g01 as f64 / (self.m0 as f64 * self.m1 as f64) - 1.0;
            self.deviation += DEVIATION_ALPHA * ((g - self.g).abs() - self.deviation);
            self.g = g;
        }

        let out = PairSums {
            upper: self.iu0.saturating_add(self.iu1),
            lagged: self.id2.saturating_add(self.id3),
            valid: self.valid_inputs >= PAIR_WARMUP,
        };
        self.iu1 = self.iu0;
        self.id3 = self.id2;
        self.id2 = self.id1;
        out
    }

    /// Latest correlation coefficient.
    pub fn g(&self) -> f64 {
        self.g
    }

    /// Smoothed absolute change of `g` between executions.
    pub fn deviation(&self) -> f64 {
        self.deviation
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    /// The window and its predecessor hold only valid inputs, so `g` is
    /// meaningful.
    pub fn is_filled(&self) -> bool {
        self.valid_inputs > self.window
    }

    /// Sum of the inputs currently in the window.
    pub fn window_sum(&self) -> i128 {
        self.m0
    }
}

// ─── Analyzer ───────────────────────────────────────────────────────────────

/// Combined verdict of all blocks.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrendOutput {
    /// `max_k (g_k − θ_k)` over filled blocks, 0 if none is filled.
    pub trend: f64,
    pub distortion: bool,
    pub congestion: bool,
    pub stability: bool,
}

#[derive(Debug, Clone)]
pub struct DelayTrendAnalyzer {
    blocks: Vec<CorrelationBlock>,
    counter: u32,
    resolution_us: u64,
    congestion_threshold: f64,
    stability_band: f64,
    inputs: u64,
}

impl DelayTrendAnalyzer {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            blocks: config.blocks.iter().copied().map(CorrelationBlock::new).collect(),
            counter: 1,
            resolution_us: (config.resolution.as_micros() as u64).max(1),
            congestion_threshold: config.congestion_threshold,
            stability_band: config.stability_band,
            inputs: 0,
        }
    }

    /// Add one delay sample. A zero delay carries no information and is
    /// skipped; returns whether the sample was used.
    pub fn add_sample(&mut self, delay: Duration) -> bool {
        if delay.is_zero() {
            return false;
        }
        let units = (delay.as_micros() / self.resolution_us as u128).max(1);
        self.push_input(i64::try_from(units).map_or(MAX_SAMPLE_UNITS, |u| u.min(MAX_SAMPLE_UNITS)));
        true
    }

    /// Push an explicit zero so a silent subflow's windows drain.
    pub fn age(&mut self) {
        self.push_input(0);
    }

    fn push_input(&mut self, x: i64) {
        let lag_valid = self.inputs > 0;
        if let Some(first) = self.blocks.first_mut() {
            first.iu0 = x;
        }
        self.dispatch(lag_valid);
        self.dispatch(lag_valid);
        if let Some(first) = self.blocks.first_mut() {
            first.id1 = x;
        }
        self.inputs += 1;
    }

    fn dispatch(&mut self, lag_valid: bool) {
        let c = self.counter;
        self.counter = c.wrapping_add(1);
        let x = (c ^ c.wrapping_sub(1)).wrapping_add(1);
        let idx = x.trailing_zeros().wrapping_sub(1) as usize;
        if idx >= self.blocks.len() {
            return;
        }
        // Block 0 sees a valid lag once a sample has been latched; coarser
        // blocks get validity along with their pair sums.
        let valid = if idx == 0 { lag_valid } else { self.blocks[idx].pending };
        let out = self.blocks[idx].execute(valid);
        if let Some(next) = self.blocks.get_mut(idx + 1) {
            next.iu0 = out.upper;
            next.id1 = out.lagged;
            next.pending = out.valid;
        }
    }

    pub fn output(&self) -> TrendOutput {
        let trend = self
            .blocks
            .iter()
            .filter(|b| b.is_filled())
            .map(|b| b.g - b.threshold)
            .reduce(f64::max)
            .unwrap_or(0.0);
        let finest_filled = self.blocks.first().is_some_and(CorrelationBlock::is_filled);
        let within_band = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_filled())
            .all(|(k, b)| b.g.abs() <= self.stability_band / (1u64 << k) as f64);
        TrendOutput {
            trend,
            distortion: trend > 0.0,
            congestion: trend > self.congestion_threshold,
            stability: finest_filled && within_band,
        }
    }

    pub fn blocks(&self) -> &[CorrelationBlock] {
        &self.blocks
    }

    /// Inputs pushed so far, zeros from aging included.
    pub fn inputs(&self) -> u64 {
        self.inputs
    }

    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            *block = CorrelationBlock::new(BlockConfig {
                window: block.window,
                threshold: block.threshold,
            });
        }
        self.counter = 1;
        self.inputs = 0;
    }
}
