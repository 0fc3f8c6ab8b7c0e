//! Retransmission timeout tracking for outstanding send-queue operations
//! (§4.5.6).
//!
//! Like congestion control, the original ships no reliability manager of
//! its own; `RdmaQueuePair::pending_operations`/`retire_oldest_pending`
//! exist precisely so a manager like this one can drive retransmission
//! against them. Original design, not a port.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::rdma::{PendingOperation, RdmaQueuePair, SendWqe};

#[derive(Debug, Clone, Copy)]
pub struct ReliabilityConfig {
    pub timeout_ticks: u32,
    pub max_retries: u32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self { timeout_ticks: 16, max_retries: 3 }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReliabilityStats {
    pub acks_applied: u64,
    pub timeouts: u64,
    pub retransmits: u64,
    pub operations_abandoned: u64,
}

struct TimerState {
    ticks_since_progress: u32,
    retry_count: u32,
}

/// One action the caller must take in response to a `tick()`.
#[derive(Debug)]
pub enum ReliabilityAction {
    Retransmit { wqe: SendWqe },
    Abandon { wr_id: u64 },
}

pub struct ReliabilityManager {
    config: ReliabilityConfig,
    timers: HashMap<u32, TimerState>,
    stats: ReliabilityStats,
}

impl ReliabilityManager {
    pub fn new(config: ReliabilityConfig) -> Self {
        Self { config, timers: HashMap::new(), stats: ReliabilityStats::default() }
    }

    pub fn stats(&self) -> ReliabilityStats {
        self.stats
    }

    fn timer_for(&mut self, qp_number: u32) -> &mut TimerState {
        self.timers.entry(qp_number).or_insert_with(|| TimerState { ticks_since_progress: 0, retry_count: 0 })
    }

    /// Called whenever an ACK retires at least one pending operation on a
    /// QP — resets its retransmit timer and retry count.
    pub fn on_ack_progress(&mut self, qp: &RdmaQueuePair) {
        self.stats.acks_applied += 1;
        let timer = self.timer_for(qp.qp_number());
        timer.ticks_since_progress = 0;
        timer.retry_count = 0;
    }

    /// Advance the retransmit timer for a QP by one tick and return any
    /// action the caller should take. A QP with no pending operations
    /// never times out.
    pub fn tick(&mut self, qp: &mut RdmaQueuePair) -> Option<ReliabilityAction> {
        if qp.pending_operations().is_empty() {
            self.timers.remove(&qp.qp_number());
            return None;
        }

        let timeout_ticks = self.config.timeout_ticks;
        let max_retries = self.config.max_retries;
        let qp_number = qp.qp_number();
        let timer = self.timer_for(qp_number);
        timer.ticks_since_progress += 1;

        if timer.ticks_since_progress < timeout_ticks {
            return None;
        }

        self.stats.timeouts += 1;

        if timer.retry_count >= max_retries {
            let abandoned = qp.retire_oldest_pending()?;
            self.stats.operations_abandoned += 1;
            warn!(qp_number, wr_id = abandoned.wqe.wr_id, "retransmit retries exhausted, abandoning operation");
            self.timers.remove(&qp_number);
            return Some(ReliabilityAction::Abandon { wr_id: abandoned.wqe.wr_id });
        }

        timer.retry_count += 1;
        timer.ticks_since_progress = 0;
        let retry_count = timer.retry_count;

        let oldest: &PendingOperation = qp.pending_operations().first()?;
        let wqe = oldest.wqe.clone();
        self.stats.retransmits += 1;
        debug!(qp_number, wr_id = wqe.wr_id, retry_count, "retransmitting timed-out operation");
        Some(ReliabilityAction::Retransmit { wqe })
    }

    pub fn clear_qp(&mut self, qp_number: u32) {
        self.timers.remove(&qp_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::psn::PSN_MASK;
    use crate::rdma::{QpState, RdmaQueuePairConfig, RdmaSglEntry, WqeOpcode};

    fn qp_with_pending() -> RdmaQueuePair {
        let mut qp =
            RdmaQueuePair::new(RdmaQueuePairConfig { qp_number: 1, dest_qp_number: 2, pd_handle: 0, mtu_bytes: 256 });
        qp.set_state(QpState::ReadyToSend);
        let wqe = SendWqe {
            wr_id: 1,
            opcode: WqeOpcode::Send,
            sgl: vec![RdmaSglEntry { address: 0, length: 8 }],
            local_lkey: 1,
            total_length: 8,
            remote_address: 0,
            rkey: 0,
            solicited: false,
            immediate_data: 0,
        };
        qp.next_send_psn();
        qp.add_pending_operation(wqe, 1);
        qp
    }

    #[test]
    fn no_pending_operations_never_times_out() {
        let mut manager = ReliabilityManager::new(ReliabilityConfig::default());
        let mut qp =
            RdmaQueuePair::new(RdmaQueuePairConfig { qp_number: 9, dest_qp_number: 1, pd_handle: 0, mtu_bytes: 256 });
        for _ in 0..100 {
            assert!(manager.tick(&mut qp).is_none());
        }
    }

    #[test]
    fn timeout_triggers_retransmit_then_eventually_abandons() {
        let config = ReliabilityConfig { timeout_ticks: 2, max_retries: 1 };
        let mut manager = ReliabilityManager::new(config);
        let mut qp = qp_with_pending();

        assert!(manager.tick(&mut qp).is_none());
        let action = manager.tick(&mut qp).unwrap();
        assert!(matches!(action, ReliabilityAction::Retransmit { .. }));

        assert!(manager.tick(&mut qp).is_none());
        let action = manager.tick(&mut qp).unwrap();
        assert!(matches!(action, ReliabilityAction::Abandon { wr_id: 1 }));
        assert!(qp.pending_operations().is_empty());
    }

    #[test]
    fn ack_progress_resets_the_timer() {
        let config = ReliabilityConfig { timeout_ticks: 3, max_retries: 2 };
        let mut manager = ReliabilityManager::new(config);
        let mut qp = qp_with_pending();

        manager.tick(&mut qp);
        manager.tick(&mut qp);
        manager.on_ack_progress(&qp);
        assert!(manager.tick(&mut qp).is_none());
        assert!(manager.tick(&mut qp).is_none());
    }

    #[test]
    fn psn_mask_matches_24_bit_space() {
        assert_eq!(PSN_MASK, 0x00FF_FFFF);
    }
}
