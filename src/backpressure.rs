//! Congestion classification, head-of-line blocking detection, and the EEE
//! low-power-idle state machine (§4.6).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CongestionLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub queue_capacity: u32,
    pub congestion_threshold: u32,
    pub critical_threshold: u32,
    pub hol_timeout_quanta: u32,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self { queue_capacity: 1024, congestion_threshold: 768, critical_threshold: 921, hol_timeout_quanta: 1000 }
    }
}

#[derive(Debug, Default)]
pub struct BackpressureStats {
    pub congestion_events: AtomicU64,
    pub critical_events: AtomicU64,
    pub hol_blocking_events: AtomicU64,
}

pub struct BackpressureMonitor {
    config: BackpressureConfig,
    stats: BackpressureStats,
    last_level: CongestionLevel,
    previous_depth: u32,
    quanta_since_drain: u32,
    hol_blocked: bool,
}

impl BackpressureMonitor {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            stats: BackpressureStats::default(),
            last_level: CongestionLevel::None,
            previous_depth: 0,
            quanta_since_drain: 0,
            hol_blocked: false,
        }
    }

    /// Strictest-match-first against the configured threshold fields, not
    /// simple capacity percentages: `Critical` at `critical_threshold`,
    /// `High` at `congestion_threshold`, then `Medium`/`Low` at half/quarter
    /// of `queue_capacity`. Once the threshold fields are configured away
    /// from their 50%/75% defaults this no longer reduces to clean bands —
    /// the thresholds are authoritative, not the percentages.
    pub fn congestion_level(&mut self, depth: u32) -> CongestionLevel {
        let level = if depth >= self.config.critical_threshold {
            CongestionLevel::Critical
        } else if depth >= self.config.congestion_threshold {
            CongestionLevel::High
        } else if depth >= self.config.queue_capacity / 2 {
            CongestionLevel::Medium
        } else if depth >= self.config.queue_capacity / 4 {
            CongestionLevel::Low
        } else {
            CongestionLevel::None
        };

        if level != CongestionLevel::None && level != self.last_level {
            self.stats.congestion_events.fetch_add(1, Ordering::Relaxed);
        }
        if level == CongestionLevel::Critical {
            self.stats.critical_events.fetch_add(1, Ordering::Relaxed);
        }
        self.last_level = level;
        level
    }

    pub fn recommended_pause_time(level: CongestionLevel) -> u16 {
        match level {
            CongestionLevel::None => 0,
            CongestionLevel::Low => 50,
            CongestionLevel::Medium => 200,
            CongestionLevel::High => 500,
            CongestionLevel::Critical => 1000,
        }
    }

    /// Called once per scheduling tick with the queue's current depth.
    /// Stall quanta accumulate while the depth holds steady or climbs
    /// (`current_depth ≥ previous_depth && current_depth > 0`); crossing
    /// `hol_timeout_quanta` latches the block. Any observed drain (a
    /// strictly lower depth than last tick) clears both the accumulator and
    /// the latch.
    pub fn on_tick(&mut self, current_depth: u32) -> bool {
        if current_depth < self.previous_depth {
            self.quanta_since_drain = 0;
            self.hol_blocked = false;
        } else if current_depth >= self.previous_depth && current_depth > 0 {
            self.quanta_since_drain += 1;
            if self.quanta_since_drain >= self.config.hol_timeout_quanta && !self.hol_blocked {
                self.hol_blocked = true;
                self.stats.hol_blocking_events.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.previous_depth = current_depth;
        self.hol_blocked
    }

    pub fn is_hol_blocked(&self) -> bool {
        self.hol_blocked
    }

    pub fn stats(&self) -> &BackpressureStats {
        &self.stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EeeState {
    Active,
    SleepTransit,
    Lpi,
    WakeTransit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct EeeConfig {
    pub idle_threshold_cycles: u32,
    pub sleep_transit_cycles: u32,
    pub wake_transit_cycles: u32,
}

impl Default for EeeConfig {
    fn default() -> Self {
        Self { idle_threshold_cycles: 64, sleep_transit_cycles: 4, wake_transit_cycles: 4 }
    }
}

pub struct EeeManager {
    config: EeeConfig,
    state: EeeState,
    idle_cycles: u32,
    transit_cycles: u32,
    lpi_cycles: u64,
    active_cycles: u64,
}

impl EeeManager {
    pub fn new(config: EeeConfig) -> Self {
        Self {
            config,
            state: EeeState::Active,
            idle_cycles: 0,
            transit_cycles: 0,
            lpi_cycles: 0,
            active_cycles: 0,
        }
    }

    pub fn is_in_lpi(&self) -> bool {
        self.state == EeeState::Lpi
    }

    pub fn on_idle_period(&mut self) {
        if self.state == EeeState::Active {
            self.idle_cycles += 1;
            if self.idle_cycles >= self.config.idle_threshold_cycles {
                self.state = EeeState::SleepTransit;
                self.transit_cycles = 0;
            }
        }
    }

    pub fn on_traffic_activity(&mut self) {
        self.idle_cycles = 0;
        match self.state {
            EeeState::Active => {}
            EeeState::SleepTransit => self.state = EeeState::Active,
            EeeState::Lpi => {
                self.state = EeeState::WakeTransit;
                self.transit_cycles = 0;
            }
            EeeState::WakeTransit => {}
        }
    }

    pub fn tick(&mut self) {
        match self.state {
            EeeState::Active => self.active_cycles += 1,
            EeeState::SleepTransit => {
                self.transit_cycles += 1;
                if self.transit_cycles >= self.config.sleep_transit_cycles {
                    self.state = EeeState::Lpi;
                }
            }
            EeeState::Lpi => self.lpi_cycles += 1,
            EeeState::WakeTransit => {
                self.transit_cycles += 1;
                if self.transit_cycles >= self.config.wake_transit_cycles {
                    self.state = EeeState::Active;
                    self.active_cycles += 1;
                }
            }
        }
    }

    pub fn power_savings_percent(&self) -> f64 {
        let total = self.lpi_cycles + self.active_cycles;
        if total == 0 {
            return 0.0;
        }
        (self.lpi_cycles as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> BackpressureMonitor {
        BackpressureMonitor::new(BackpressureConfig {
            queue_capacity: 1024,
            congestion_threshold: 768,
            critical_threshold: 900,
            hol_timeout_quanta: 3,
        })
    }

    #[test]
    fn s5_critical_takes_precedence_over_lower_bands() {
        let mut m = monitor();
        assert_eq!(m.congestion_level(950), CongestionLevel::Critical);
    }

    #[test]
    fn five_level_taxonomy_matches_configured_bands() {
        let mut m = monitor();
        assert_eq!(m.congestion_level(100), CongestionLevel::None);
        assert_eq!(m.congestion_level(300), CongestionLevel::Low);
        assert_eq!(m.congestion_level(600), CongestionLevel::Medium);
        assert_eq!(m.congestion_level(800), CongestionLevel::High);
        assert_eq!(m.congestion_level(950), CongestionLevel::Critical);
    }

    #[test]
    fn congestion_events_are_edge_triggered() {
        let mut m = monitor();
        assert_eq!(m.congestion_level(600), CongestionLevel::Medium);
        assert_eq!(m.congestion_level(600), CongestionLevel::Medium);
        assert_eq!(m.stats().congestion_events.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn critical_events_are_level_triggered_every_tick() {
        let mut m = monitor();
        m.congestion_level(950);
        m.congestion_level(950);
        assert_eq!(m.stats().critical_events.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn hol_blocking_latches_after_threshold_and_clears_on_drain() {
        let mut m = monitor();
        assert!(!m.on_tick(40));
        assert!(!m.on_tick(40));
        assert!(m.on_tick(40));
        assert!(m.is_hol_blocked());
        assert!(!m.on_tick(10));
        assert!(!m.is_hol_blocked());
    }

    #[test]
    fn eee_transitions_active_to_lpi_and_back() {
        let mut eee = EeeManager::new(EeeConfig {
            idle_threshold_cycles: 2,
            sleep_transit_cycles: 2,
            wake_transit_cycles: 2,
        });
        assert!(!eee.is_in_lpi());
        eee.on_idle_period();
        eee.on_idle_period();
        eee.tick();
        eee.tick();
        assert!(eee.is_in_lpi());

        eee.on_traffic_activity();
        eee.tick();
        eee.tick();
        assert!(!eee.is_in_lpi());
    }

    #[test]
    fn power_savings_percent_reflects_lpi_fraction() {
        let mut eee = EeeManager::new(EeeConfig {
            idle_threshold_cycles: 1,
            sleep_transit_cycles: 1,
            wake_transit_cycles: 1,
        });
        eee.on_idle_period();
        eee.tick();
        for _ in 0..3 {
            eee.tick();
        }
        assert!(eee.power_savings_percent() > 0.0);
    }
}
