//! RoCEv2 Reliable Connection transport engine (§4.5).

pub mod congestion;
pub mod engine;
pub mod packet;
pub mod psn;
pub mod read;
pub mod reliability;
pub mod send_recv;
pub mod write;

use std::collections::VecDeque;

pub use packet::AethSyndrome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqeOpcode {
    Send,
    SendImm,
    RdmaWrite,
    RdmaWriteImm,
    RdmaRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqeStatus {
    Success,
    LocalAccessError,
    RemoteAccessError,
    RemoteOperationError,
    RnrRetryExceeded,
    FlushError,
    SequenceError,
}

#[derive(Debug, Clone, Copy)]
pub struct RdmaSglEntry {
    pub address: u64,
    pub length: u32,
}

#[derive(Debug, Clone)]
pub struct SendWqe {
    pub wr_id: u64,
    pub opcode: WqeOpcode,
    pub sgl: Vec<RdmaSglEntry>,
    pub local_lkey: u32,
    pub total_length: u32,
    pub remote_address: u64,
    pub rkey: u32,
    pub solicited: bool,
    pub immediate_data: u32,
}

#[derive(Debug, Clone)]
pub struct RecvWqe {
    pub wr_id: u64,
    pub sgl: Vec<RdmaSglEntry>,
}

#[derive(Debug, Clone, Copy)]
pub struct RdmaCqe {
    pub wr_id: u64,
    pub status: WqeStatus,
    pub opcode: WqeOpcode,
    pub qp_number: u32,
    pub bytes_completed: u32,
    pub has_immediate: bool,
    pub immediate_data: u32,
    pub is_send: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Sqe,
    Error,
}

/// Tracks a posted send-queue operation until all of its packets have been
/// acknowledged, for the (currently minimal) reliability manager to retire
/// or retransmit against.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub wqe: SendWqe,
    pub packets_outstanding: u32,
    pub first_psn: u32,
}

impl PendingOperation {
    /// PSN of the last packet this operation produced. The originator may
    /// not retire the operation until an ACK covers at least this PSN.
    pub fn final_psn(&self) -> u32 {
        (self.first_psn + self.packets_outstanding - 1) & psn::PSN_MASK
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RdmaQueuePairConfig {
    pub qp_number: u32,
    pub dest_qp_number: u32,
    pub pd_handle: u32,
    pub mtu_bytes: u32,
}

pub struct RdmaQueuePair {
    config: RdmaQueuePairConfig,
    state: QpState,
    send_psn: u32,
    expected_recv_psn: u32,
    recv_queue: VecDeque<RecvWqe>,
    pending_operations: Vec<PendingOperation>,
    packets_sent: u64,
    bytes_sent: u64,
    packets_received: u64,
    bytes_received: u64,
}

impl RdmaQueuePair {
    pub fn new(config: RdmaQueuePairConfig) -> Self {
        Self {
            config,
            state: QpState::Reset,
            send_psn: 0,
            expected_recv_psn: 0,
            recv_queue: VecDeque::new(),
            pending_operations: Vec::new(),
            packets_sent: 0,
            bytes_sent: 0,
            packets_received: 0,
            bytes_received: 0,
        }
    }

    pub fn set_state(&mut self, state: QpState) {
        self.state = state;
    }

    pub fn state(&self) -> QpState {
        self.state
    }

    pub fn can_receive(&self) -> bool {
        matches!(self.state, QpState::ReadyToReceive | QpState::ReadyToSend)
    }

    pub fn qp_number(&self) -> u32 {
        self.config.qp_number
    }

    pub fn dest_qp_number(&self) -> u32 {
        self.config.dest_qp_number
    }

    pub fn pd_handle(&self) -> u32 {
        self.config.pd_handle
    }

    pub fn mtu_bytes(&self) -> u32 {
        self.config.mtu_bytes
    }

    pub fn next_send_psn(&mut self) -> u32 {
        let psn = self.send_psn;
        self.send_psn = psn::advance_psn(psn);
        psn
    }

    pub fn expected_recv_psn(&self) -> u32 {
        self.expected_recv_psn
    }

    pub fn advance_recv_psn(&mut self) {
        self.expected_recv_psn = psn::advance_psn(self.expected_recv_psn);
    }

    pub fn post_recv(&mut self, wqe: RecvWqe) {
        self.recv_queue.push_back(wqe);
    }

    pub fn consume_recv(&mut self) -> Option<RecvWqe> {
        self.recv_queue.pop_front()
    }

    pub fn add_pending_operation(&mut self, wqe: SendWqe, num_packets: u32) {
        let first_psn = self.send_psn.wrapping_sub(num_packets) & psn::PSN_MASK;
        self.pending_operations.push(PendingOperation { wqe, packets_outstanding: num_packets, first_psn });
    }

    pub fn pending_operations(&self) -> &[PendingOperation] {
        &self.pending_operations
    }

    pub fn retire_oldest_pending(&mut self) -> Option<PendingOperation> {
        if self.pending_operations.is_empty() {
            None
        } else {
            Some(self.pending_operations.remove(0))
        }
    }

    pub fn record_packet_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_packet_received(&mut self, bytes: usize) {
        self.packets_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qp() -> RdmaQueuePair {
        let mut qp = RdmaQueuePair::new(RdmaQueuePairConfig {
            qp_number: 1,
            dest_qp_number: 2,
            pd_handle: 0,
            mtu_bytes: 256,
        });
        qp.set_state(QpState::ReadyToSend);
        qp
    }

    #[test]
    fn send_psn_increments_monotonically() {
        let mut qp = qp();
        assert_eq!(qp.next_send_psn(), 0);
        assert_eq!(qp.next_send_psn(), 1);
        assert_eq!(qp.next_send_psn(), 2);
    }

    #[test]
    fn recv_queue_is_fifo() {
        let mut qp = qp();
        qp.post_recv(RecvWqe { wr_id: 1, sgl: vec![] });
        qp.post_recv(RecvWqe { wr_id: 2, sgl: vec![] });
        assert_eq!(qp.consume_recv().unwrap().wr_id, 1);
        assert_eq!(qp.consume_recv().unwrap().wr_id, 2);
        assert!(qp.consume_recv().is_none());
    }

    #[test]
    fn reset_qp_cannot_receive() {
        let mut qp = RdmaQueuePair::new(RdmaQueuePairConfig {
            qp_number: 1,
            dest_qp_number: 2,
            pd_handle: 0,
            mtu_bytes: 256,
        });
        assert!(!qp.can_receive());
        qp.set_state(QpState::ReadyToReceive);
        assert!(qp.can_receive());
    }
}
