//! DCQCN-style congestion control for the RC transport (§4.5.6).
//!
//! The original ships no congestion controller — `congestion.cpp` is an
//! empty constructor stub. This is accordingly an original design,
//! modeled on the DCQCN rate/CNP exchange described in SPEC_FULL.md rather
//! than ported from any existing source.

use std::collections::HashMap;

use tracing::debug;

/// Minimum send rate a QP is ever throttled to, as a fraction of `max_rate_mbps`.
const MIN_RATE_FRACTION: f64 = 0.01;

#[derive(Debug, Clone, Copy)]
pub struct CongestionConfig {
    pub max_rate_mbps: u32,
    /// Multiplicative decrease applied to the current rate on each CNP.
    pub decrease_factor: f64,
    /// Additive increase applied to the rate, in Mbps, on each recovery tick.
    pub rate_increase_mbps: u32,
    /// Consecutive recovery ticks with no CNP before the rate is allowed to
    /// climb back toward `max_rate_mbps`.
    pub recovery_ticks_required: u32,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            max_rate_mbps: 100_000,
            decrease_factor: 0.5,
            rate_increase_mbps: 1_000,
            recovery_ticks_required: 5,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CongestionStats {
    pub cnps_received: u64,
    pub rate_decreases: u64,
    pub rate_increases: u64,
}

struct QpCongestionState {
    current_rate_mbps: f64,
    recovery_ticks: u32,
}

/// Per-QP DCQCN-style rate state, keyed by QP number.
pub struct CongestionManager {
    config: CongestionConfig,
    qp_state: HashMap<u32, QpCongestionState>,
    stats: CongestionStats,
}

impl CongestionManager {
    pub fn new(config: CongestionConfig) -> Self {
        Self { config, qp_state: HashMap::new(), stats: CongestionStats::default() }
    }

    pub fn stats(&self) -> CongestionStats {
        self.stats
    }

    fn state_for(&mut self, qp_number: u32) -> &mut QpCongestionState {
        self.qp_state.entry(qp_number).or_insert_with(|| QpCongestionState {
            current_rate_mbps: self.config.max_rate_mbps as f64,
            recovery_ticks: 0,
        })
    }

    /// Current allowed send rate for a QP, in Mbps. QPs with no recorded
    /// congestion state send at the configured maximum rate.
    pub fn current_rate_mbps(&self, qp_number: u32) -> u32 {
        self.qp_state
            .get(&qp_number)
            .map(|s| s.current_rate_mbps as u32)
            .unwrap_or(self.config.max_rate_mbps)
    }

    /// Apply a received congestion notification packet: halve the rate and
    /// reset the recovery counter.
    pub fn on_cnp_received(&mut self, qp_number: u32) {
        self.stats.cnps_received += 1;
        let decrease_factor = self.config.decrease_factor;
        let min_rate = self.config.max_rate_mbps as f64 * MIN_RATE_FRACTION;
        let state = self.state_for(qp_number);
        state.current_rate_mbps = (state.current_rate_mbps * decrease_factor).max(min_rate);
        state.recovery_ticks = 0;
        self.stats.rate_decreases += 1;
        debug!(qp_number, rate = state.current_rate_mbps, "CNP received, rate decreased");
    }

    /// Advance recovery for all known QPs by one tick. Call this on a fixed
    /// schedule (e.g. once per control-plane tick); a QP that has gone
    /// `recovery_ticks_required` ticks without a CNP climbs back toward the
    /// configured maximum.
    pub fn tick(&mut self) {
        let max_rate = self.config.max_rate_mbps as f64;
        let increase = self.config.rate_increase_mbps as f64;
        let required = self.config.recovery_ticks_required;
        let mut increased = 0u64;

        for state in self.qp_state.values_mut() {
            if state.current_rate_mbps >= max_rate {
                continue;
            }
            state.recovery_ticks += 1;
            if state.recovery_ticks >= required {
                state.current_rate_mbps = (state.current_rate_mbps + increase).min(max_rate);
                state.recovery_ticks = 0;
                increased += 1;
            }
        }
        self.stats.rate_increases += increased;
    }

    pub fn clear_qp(&mut self, qp_number: u32) {
        self.qp_state.remove(&qp_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_qp_starts_at_max_rate() {
        let manager = CongestionManager::new(CongestionConfig::default());
        assert_eq!(manager.current_rate_mbps(5), 100_000);
    }

    #[test]
    fn cnp_halves_the_rate() {
        let mut manager = CongestionManager::new(CongestionConfig::default());
        manager.on_cnp_received(1);
        assert_eq!(manager.current_rate_mbps(1), 50_000);
    }

    #[test]
    fn rate_climbs_back_after_sustained_recovery() {
        let config = CongestionConfig { recovery_ticks_required: 2, ..CongestionConfig::default() };
        let mut manager = CongestionManager::new(config);
        manager.on_cnp_received(1);
        assert_eq!(manager.current_rate_mbps(1), 50_000);

        manager.tick();
        assert_eq!(manager.current_rate_mbps(1), 50_000); // recovery_ticks == 1, not yet
        manager.tick();
        assert_eq!(manager.current_rate_mbps(1), 51_000); // recovery_ticks hit threshold
    }

    #[test]
    fn rate_never_drops_below_minimum_floor() {
        let mut manager = CongestionManager::new(CongestionConfig::default());
        for _ in 0..64 {
            manager.on_cnp_received(1);
        }
        assert!(manager.current_rate_mbps(1) >= 1_000);
    }
}
