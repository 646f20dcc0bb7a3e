//! Quant engine: rolling spot-price history, per-minute volatility, and
//! fair-value probability for the UP/DOWN outcome tokens.

use std::collections::VecDeque;

use crate::models::TokenKind;

/// Ring capacity for price history.
pub const PRICE_HISTORY_CAPACITY: usize = 60;

/// Volatility returned while the ring holds fewer than `MIN_VOL_SAMPLES`.
pub const DEFAULT_VOLATILITY: f64 = 10.0;

/// Floor applied to the measured volatility so a flat tape cannot produce
/// overconfident fair values.
pub const MIN_VOLATILITY: f64 = 5.0;

const MIN_VOL_SAMPLES: usize = 5;

/// One observed (price, timestamp) sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub price: f64,
    /// Unix millis.
    pub ts_ms: i64,
}

/// Bounded FIFO ring of the most recent price samples.
#[derive(Debug, Clone, Default)]
pub struct PriceHistory {
    samples: VecDeque<PricePoint>,
}

impl PriceHistory {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(PRICE_HISTORY_CAPACITY),
        }
    }

    pub fn push(&mut self, price: f64, ts_ms: i64) {
        if !(price.is_finite() && price > 0.0) {
            return;
        }
        if self.samples.len() == PRICE_HISTORY_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(PricePoint { price, ts_ms });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn latest(&self) -> Option<PricePoint> {
        self.samples.back().copied()
    }

    /// Per-minute volatility of the sampled series.
    ///
    /// Population standard deviation of the tick-to-tick first differences,
    /// scaled by the square root of the measured ticks-per-minute. Floored at
    /// `MIN_VOLATILITY`; `DEFAULT_VOLATILITY` until enough samples exist.
    pub fn volatility_per_minute(&self) -> f64 {
        let n = self.samples.len();
        if n < MIN_VOL_SAMPLES {
            return DEFAULT_VOLATILITY;
        }

        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return DEFAULT_VOLATILITY;
        };
        let span_s = (last.ts_ms - first.ts_ms) as f64 / 1000.0;
        if !(span_s > 0.0) {
            return DEFAULT_VOLATILITY;
        }

        let diffs: Vec<f64> = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .map(|(a, b)| b.price - a.price)
            .collect();

        let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
        let var = diffs.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / diffs.len() as f64;
        let sigma_tick = var.sqrt();

        let ticks_per_minute = (n as f64 / span_s) * 60.0;
        let vol = sigma_tick * ticks_per_minute.sqrt();

        vol.max(MIN_VOLATILITY)
    }
}

/// Standard normal CDF via the Abramowitz–Stegun 26.2.17 rational
/// approximation (|error| < 7.5e-8), symmetric around zero.
pub fn norm_cdf(z: f64) -> f64 {
    const P: f64 = 0.231_641_9;
    const B1: f64 = 0.319_381_530;
    const B2: f64 = -0.356_563_782;
    const B3: f64 = 1.781_477_937;
    const B4: f64 = -1.821_255_978;
    const B5: f64 = 1.330_274_429;

    if z < 0.0 {
        return 1.0 - norm_cdf(-z);
    }

    let t = 1.0 / (1.0 + P * z);
    let poly = t * (B1 + t * (B2 + t * (B3 + t * (B4 + t * B5))));
    let pdf = (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt();
    1.0 - pdf * poly
}

/// Modelled probability that `direction` resolves in the money.
///
/// At or past expiry the value is binary. Before expiry it is the normal CDF
/// of the strike distance over the expected move, kept strictly inside (0, 1).
pub fn fair_value(
    direction: TokenKind,
    spot: f64,
    strike: f64,
    t_remaining_s: f64,
    vol_per_minute: f64,
) -> f64 {
    if t_remaining_s <= 0.0 {
        let in_the_money = match direction {
            TokenKind::Up => spot > strike,
            TokenKind::Down => spot < strike,
        };
        return if in_the_money { 1.0 } else { 0.0 };
    }

    let distance = match direction {
        TokenKind::Up => spot - strike,
        TokenKind::Down => strike - spot,
    };

    let expected_move = vol_per_minute * (t_remaining_s / 60.0).max(0.01).sqrt();
    let z = distance / expected_move;
    norm_cdf(z).clamp(1e-9, 1.0 - 1e-9)
}
