//! Top-level RoCEv2 RC engine: owns the QP table, the three opcode
//! processors, and the congestion/reliability managers, and dispatches
//! WQEs and incoming packets between them (§4.5).
//!
//! The original's `RdmaEngine` constructor wires exactly these pieces
//! together but never implements dispatch — every method beyond
//! construction was left to future work. This module completes that
//! wiring into real send/receive/poll logic, grounded on the same
//! collaborators the constructor already named.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::hostmem::HostMemory;
use crate::mr::MemoryRegionTable;
use crate::rdma::congestion::{CongestionConfig, CongestionManager};
use crate::rdma::packet::{AethSyndrome, RdmaOpcode, RdmaPacketParser};
use crate::rdma::read::ReadProcessor;
use crate::rdma::reliability::{ReliabilityAction, ReliabilityConfig, ReliabilityManager};
use crate::rdma::send_recv::SendRecvProcessor;
use crate::rdma::write::WriteProcessor;
use crate::rdma::{
    QpState, RdmaCqe, RdmaQueuePair, RdmaQueuePairConfig, RecvWqe, SendWqe, WqeOpcode, WqeStatus,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct RdmaEngineConfig {
    pub dcqcn_config: CongestionConfig,
    pub reliability_config: ReliabilityConfig,
}

/// The engine owns its own `HostMemory` and `MemoryRegionTable` handles via
/// borrow rather than by value, so the same host memory backing the
/// Ethernet data plane is shared with RDMA.
pub struct RdmaEngine {
    config: RdmaEngineConfig,
    qps: HashMap<u32, RdmaQueuePair>,
    send_recv: SendRecvProcessor,
    write: WriteProcessor,
    read: ReadProcessor,
    congestion: CongestionManager,
    reliability: ReliabilityManager,
    cq: VecDeque<RdmaCqe>,
    outbound: VecDeque<Vec<u8>>,
}

impl RdmaEngine {
    pub fn new(config: RdmaEngineConfig) -> Self {
        Self {
            qps: HashMap::new(),
            send_recv: SendRecvProcessor::new(),
            write: WriteProcessor::new(),
            read: ReadProcessor::new(),
            congestion: CongestionManager::new(config.dcqcn_config),
            reliability: ReliabilityManager::new(config.reliability_config),
            cq: VecDeque::new(),
            outbound: VecDeque::new(),
            config,
        }
    }

    pub fn config(&self) -> RdmaEngineConfig {
        self.config
    }

    pub fn create_qp(&mut self, qp_config: RdmaQueuePairConfig) {
        self.qps.insert(qp_config.qp_number, RdmaQueuePair::new(qp_config));
    }

    pub fn destroy_qp(&mut self, qp_number: u32) {
        self.qps.remove(&qp_number);
        self.send_recv.clear_recv_state(qp_number);
        self.write.clear_write_state(qp_number);
        self.read.clear_read_state(qp_number);
        self.congestion.clear_qp(qp_number);
        self.reliability.clear_qp(qp_number);
    }

    pub fn set_qp_state(&mut self, qp_number: u32, state: QpState) {
        if let Some(qp) = self.qps.get_mut(&qp_number) {
            qp.set_state(state);
        }
    }

    pub fn qp(&self, qp_number: u32) -> Option<&RdmaQueuePair> {
        self.qps.get(&qp_number)
    }

    pub fn post_recv(&mut self, qp_number: u32, wqe: RecvWqe) {
        if let Some(qp) = self.qps.get_mut(&qp_number) {
            qp.post_recv(wqe);
        }
    }

    /// Drain the queued outbound wire packets produced by the most recent
    /// `post_send`/`process_incoming_packet` call.
    pub fn take_outbound_packets(&mut self) -> Vec<Vec<u8>> {
        self.outbound.drain(..).collect()
    }

    pub fn poll_cq(&mut self) -> Option<RdmaCqe> {
        self.cq.pop_front()
    }

    /// Submit a work request for transmission, routing it to the processor
    /// that matches its opcode.
    pub fn post_send(
        &mut self,
        qp_number: u32,
        host_memory: &HostMemory,
        mr_table: &MemoryRegionTable,
        wqe: SendWqe,
    ) {
        let Some(qp) = self.qps.get_mut(&qp_number) else { return };
        if qp.state() != QpState::ReadyToSend {
            return;
        }

        let packets = match wqe.opcode {
            WqeOpcode::Send | WqeOpcode::SendImm => {
                self.send_recv.generate_send_packets(qp, host_memory, mr_table, &wqe)
            }
            WqeOpcode::RdmaWrite | WqeOpcode::RdmaWriteImm => {
                self.write.generate_write_packets(qp, host_memory, mr_table, &wqe)
            }
            WqeOpcode::RdmaRead => self.read.generate_read_request(qp, &wqe),
        };

        debug!(qp_number, opcode = ?wqe.opcode, packets = packets.len(), "post_send dispatched");
        self.outbound.extend(packets);
    }

    /// Feed one received wire packet into the engine. Routes by opcode to
    /// the matching processor, queues any response/ack packets for
    /// transmission, and pushes completions onto the CQ.
    pub fn process_incoming_packet(
        &mut self,
        qp_number: u32,
        host_memory: &mut HostMemory,
        mr_table: &MemoryRegionTable,
        bytes: &[u8],
    ) {
        let Some(parser) = RdmaPacketParser::parse(bytes) else { return };
        let Some(qp) = self.qps.get_mut(&qp_number) else { return };
        let bth = parser.bth();

        match bth.opcode {
            RdmaOpcode::RcSendFirst
            | RdmaOpcode::RcSendMiddle
            | RdmaOpcode::RcSendLast
            | RdmaOpcode::RcSendLastImm
            | RdmaOpcode::RcSendOnly
            | RdmaOpcode::RcSendOnlyImm => {
                let result = self.send_recv.process_recv_packet(qp, host_memory, &parser);
                if result.needs_ack {
                    let syndrome = result.syndrome.unwrap_or(AethSyndrome::Ack);
                    self.outbound.push_back(SendRecvProcessor::generate_ack(qp, result.ack_psn, syndrome, 0));
                }
                if let Some(cqe) = result.cqe {
                    self.cq.push_back(cqe);
                }
            }
            RdmaOpcode::RcWriteFirst
            | RdmaOpcode::RcWriteMiddle
            | RdmaOpcode::RcWriteLast
            | RdmaOpcode::RcWriteLastImm
            | RdmaOpcode::RcWriteOnly
            | RdmaOpcode::RcWriteOnlyImm => {
                let result = self.write.process_write_packet(qp, host_memory, mr_table, &parser);
                if result.needs_ack {
                    let syndrome = result.syndrome.unwrap_or(AethSyndrome::Ack);
                    self.outbound.push_back(SendRecvProcessor::generate_ack(qp, result.ack_psn, syndrome, 0));
                }
                if let Some(cqe) = result.recv_cqe {
                    self.cq.push_back(cqe);
                }
            }
            RdmaOpcode::RcReadRequest => {
                let result = self.read.process_read_request(qp, host_memory, mr_table, &parser);
                if result.needs_nak {
                    let syndrome = result.syndrome.unwrap_or(AethSyndrome::RemoteOperationError);
                    self.outbound.push_back(SendRecvProcessor::generate_ack(qp, result.nak_psn, syndrome, 0));
                } else {
                    self.outbound.extend(result.response_packets);
                }
            }
            RdmaOpcode::RcReadResponseFirst
            | RdmaOpcode::RcReadResponseMiddle
            | RdmaOpcode::RcReadResponseLast
            | RdmaOpcode::RcReadResponseOnly => {
                let result = self.read.process_read_response(qp, host_memory, mr_table, &parser);
                if let Some(cqe) = result.cqe {
                    self.cq.push_back(cqe);
                }
            }
            RdmaOpcode::RcAck => {
                let aeth = parser.aeth();
                if aeth.syndrome == AethSyndrome::Ack {
                    while let Some(pending) = qp.pending_operations().first() {
                        let final_psn = pending.final_psn();
                        if crate::rdma::psn::psn_less_than(final_psn, bth.psn) || final_psn == bth.psn {
                            qp.retire_oldest_pending();
                        } else {
                            break;
                        }
                    }
                    self.reliability.on_ack_progress(qp);
                } else {
                    let status = match aeth.syndrome {
                        AethSyndrome::RnrNak => WqeStatus::RnrRetryExceeded,
                        AethSyndrome::PsnSeqError => WqeStatus::SequenceError,
                        AethSyndrome::InvalidRequest | AethSyndrome::RemoteOperationError => {
                            WqeStatus::RemoteOperationError
                        }
                        AethSyndrome::RemoteAccessError => WqeStatus::RemoteAccessError,
                        AethSyndrome::Ack => unreachable!("handled above"),
                    };
                    if let Some(retired) = qp.retire_oldest_pending() {
                        self.cq.push_back(RdmaCqe {
                            wr_id: retired.wqe.wr_id,
                            status,
                            opcode: WqeOpcode::Send,
                            qp_number,
                            bytes_completed: 0,
                            has_immediate: false,
                            immediate_data: 0,
                            is_send: true,
                        });
                    }
                    // The NAK only speaks to the op it named; everything queued
                    // behind it is squashed rather than left to race a retry.
                    while let Some(retired) = qp.retire_oldest_pending() {
                        self.cq.push_back(RdmaCqe {
                            wr_id: retired.wqe.wr_id,
                            status: WqeStatus::FlushError,
                            opcode: WqeOpcode::Send,
                            qp_number,
                            bytes_completed: 0,
                            has_immediate: false,
                            immediate_data: 0,
                            is_send: true,
                        });
                    }
                }
            }
        }
    }

    /// Drive retransmission timers for every known QP by one tick,
    /// re-emitting any packets the reliability manager decides to retry.
    pub fn tick_reliability(&mut self, host_memory: &HostMemory, mr_table: &MemoryRegionTable) {
        let qp_numbers: Vec<u32> = self.qps.keys().copied().collect();
        for qp_number in qp_numbers {
            let Some(qp) = self.qps.get_mut(&qp_number) else { continue };
            let Some(action) = self.reliability.tick(qp) else { continue };
            match action {
                ReliabilityAction::Retransmit { wqe } => {
                    let packets = match wqe.opcode {
                        WqeOpcode::Send | WqeOpcode::SendImm => {
                            self.send_recv.generate_send_packets(qp, host_memory, mr_table, &wqe)
                        }
                        WqeOpcode::RdmaWrite | WqeOpcode::RdmaWriteImm => {
                            self.write.generate_write_packets(qp, host_memory, mr_table, &wqe)
                        }
                        WqeOpcode::RdmaRead => self.read.generate_read_request(qp, &wqe),
                    };
                    self.outbound.extend(packets);
                }
                ReliabilityAction::Abandon { wr_id } => {
                    self.cq.push_back(RdmaCqe {
                        wr_id,
                        status: WqeStatus::RnrRetryExceeded,
                        opcode: WqeOpcode::Send,
                        qp_number,
                        bytes_completed: 0,
                        has_immediate: false,
                        immediate_data: 0,
                        is_send: true,
                    });
                }
            }
        }
        self.congestion.tick();
    }
}
