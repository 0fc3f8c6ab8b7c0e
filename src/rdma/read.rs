//! RC RDMA READ request/response generation and processing (§4.5.4).

use std::collections::HashMap;

use crate::hostmem::HostMemory;
use crate::mr::{AccessFlags, MemoryRegionTable};
use crate::rdma::packet::{
    opcode_is_first, opcode_is_last, opcode_is_only, AethSyndrome, RdmaOpcode, RdmaPacketBuilder,
    RdmaPacketParser,
};
use crate::rdma::psn::advance_psn;
use crate::rdma::{RdmaCqe, RdmaQueuePair, RdmaSglEntry, SendWqe, WqeOpcode, WqeStatus};
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct ReadStats {
    pub reads_started: u64,
    pub read_requests_generated: u64,
    pub read_responses_generated: u64,
    pub read_responses_processed: u64,
    pub reads_completed: u64,
    pub bytes_read: u64,
    pub sequence_errors: u64,
    pub rkey_errors: u64,
    pub access_errors: u64,
}

/// Per-outstanding-read state on the originator. `expected_psn` tracks the
/// incoming response stream and is seeded with the request's own PSN, not
/// `start_psn + 1` — the response stream is an independent PSN space from
/// the request stream, numbered by the responder from that same starting
/// value.
struct ReadRequestState {
    wr_id: u64,
    local_lkey: u32,
    bytes_received: u32,
    expected_psn: u32,
    sgl: Vec<RdmaSglEntry>,
    current_sge_idx: usize,
    sge_offset: usize,
    in_progress: bool,
}

#[derive(Debug, Default)]
pub struct ReadRequestResult {
    pub success: bool,
    pub needs_nak: bool,
    pub nak_psn: u32,
    pub syndrome: Option<AethSyndrome>,
    pub response_packets: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct ReadResponseResult {
    pub success: bool,
    pub is_read_complete: bool,
    pub cqe: Option<RdmaCqe>,
}

pub struct ReadProcessor {
    request_states: HashMap<u32, ReadRequestState>,
    stats: ReadStats,
}

impl Default for ReadProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadProcessor {
    pub fn new() -> Self {
        Self { request_states: HashMap::new(), stats: ReadStats::default() }
    }

    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.request_states.clear();
        self.stats = ReadStats::default();
    }

    pub fn clear_read_state(&mut self, qp_number: u32) {
        self.request_states.remove(&qp_number);
    }

    pub fn generate_read_request(&mut self, qp: &mut RdmaQueuePair, wqe: &SendWqe) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        if wqe.opcode != WqeOpcode::RdmaRead {
            return packets;
        }

        self.stats.reads_started += 1;
        debug!(
            qp = qp.qp_number(),
            remote_addr = wqe.remote_address,
            rkey = wqe.rkey,
            len = wqe.total_length,
            "read request"
        );

        let request_psn = qp.next_send_psn();

        self.request_states.insert(
            qp.qp_number(),
            ReadRequestState {
                wr_id: wqe.wr_id,
                local_lkey: wqe.local_lkey,
                bytes_received: 0,
                expected_psn: request_psn,
                sgl: wqe.sgl.clone(),
                current_sge_idx: 0,
                sge_offset: 0,
                in_progress: true,
            },
        );

        let packet = RdmaPacketBuilder::new()
            .set_opcode(RdmaOpcode::RcReadRequest)
            .set_dest_qp(qp.dest_qp_number())
            .set_psn(request_psn)
            .set_ack_request(false)
            .set_remote_address(wqe.remote_address)
            .set_rkey(wqe.rkey)
            .set_dma_length(wqe.total_length)
            .build();

        qp.record_packet_sent(packet.len());
        self.stats.read_requests_generated += 1;
        qp.add_pending_operation(wqe.clone(), 1);
        packets.push(packet);
        packets
    }

    /// Unlike send/recv's `write_to_sgl`, this revalidates the lkey against
    /// every chunk it writes rather than once at post time. This mirrors the
    /// original's read-completion path, which re-checks local access rights
    /// per packet since read data lands over a longer, unacknowledged window
    /// than a send.
    fn write_to_sgl(
        host_memory: &mut HostMemory,
        mr_table: &MemoryRegionTable,
        sgl: &[RdmaSglEntry],
        data: &[u8],
        sge_idx: &mut usize,
        sge_offset: &mut usize,
        lkey: u32,
        pd_handle: u32,
    ) -> usize {
        let mut total_written = 0;
        let mut data_offset = 0;

        while data_offset < data.len() && *sge_idx < sgl.len() {
            let entry = sgl[*sge_idx];
            let available = entry.length as usize - *sge_offset;
            let to_write = available.min(data.len() - data_offset);
            let dest_addr = entry.address + *sge_offset as u64;

            if mr_table
                .validate_lkey(lkey, pd_handle, dest_addr, to_write as u64, AccessFlags::LOCAL_WRITE)
                .is_err()
            {
                return total_written;
            }

            let result = host_memory.write(dest_addr, &data[data_offset..data_offset + to_write]);
            if !result.is_ok() {
                return total_written;
            }

            total_written += to_write;
            data_offset += to_write;
            *sge_offset += to_write;

            if *sge_offset >= entry.length as usize {
                *sge_idx += 1;
                *sge_offset = 0;
            }
        }

        total_written
    }

    fn read_from_remote(
        host_memory: &HostMemory,
        mr_table: &MemoryRegionTable,
        address: u64,
        rkey: u32,
        length: u32,
    ) -> Option<Vec<u8>> {
        if mr_table.validate_rkey(rkey, address, length as u64, AccessFlags::REMOTE_READ).is_err() {
            return None;
        }
        let mut data = vec![0u8; length as usize];
        if !host_memory.read(address, &mut data).is_ok() {
            return None;
        }
        Some(data)
    }

    fn get_read_response_opcode(is_first: bool, is_last: bool) -> RdmaOpcode {
        if is_first && is_last {
            RdmaOpcode::RcReadResponseOnly
        } else if is_first {
            RdmaOpcode::RcReadResponseFirst
        } else if is_last {
            RdmaOpcode::RcReadResponseLast
        } else {
            RdmaOpcode::RcReadResponseMiddle
        }
    }

    fn generate_read_responses(
        &mut self,
        qp: &mut RdmaQueuePair,
        host_memory: &HostMemory,
        mr_table: &MemoryRegionTable,
        address: u64,
        rkey: u32,
        length: u32,
    ) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        let Some(data) = Self::read_from_remote(host_memory, mr_table, address, rkey, length) else {
            return packets;
        };
        if data.len() as u32 != length {
            return packets;
        }

        let mtu = qp.mtu_bytes();
        let num_packets = if length == 0 { 1 } else { length.div_ceil(mtu) };

        if length == 0 {
            let packet = RdmaPacketBuilder::new()
                .set_opcode(RdmaOpcode::RcReadResponseOnly)
                .set_dest_qp(qp.dest_qp_number())
                .set_psn(qp.next_send_psn())
                .set_ack_request(false)
                .set_syndrome(AethSyndrome::Ack)
                .set_msn(0)
                .build();
            qp.record_packet_sent(packet.len());
            self.stats.read_responses_generated += 1;
            packets.push(packet);
            return packets;
        }

        let mut offset = 0usize;
        for pkt_idx in 0..num_packets {
            let is_first = pkt_idx == 0;
            let is_last = pkt_idx == num_packets - 1;
            let payload_size = (mtu as usize).min(data.len() - offset);
            let payload = &data[offset..offset + payload_size];

            let pad_count = if is_last {
                let aligned = (payload_size + 3) & !3;
                (aligned - payload_size) as u8
            } else {
                0
            };

            let opcode = Self::get_read_response_opcode(is_first, is_last);
            let mut builder = RdmaPacketBuilder::new()
                .set_opcode(opcode)
                .set_dest_qp(qp.dest_qp_number())
                .set_psn(qp.next_send_psn())
                .set_pad_count(pad_count)
                .set_ack_request(false)
                .set_payload(payload);

            if is_first {
                builder = builder.set_syndrome(AethSyndrome::Ack).set_msn(0);
            }

            let packet = builder.build();
            qp.record_packet_sent(packet.len());
            self.stats.read_responses_generated += 1;
            packets.push(packet);

            offset += payload_size;
        }

        packets
    }

    pub fn process_read_request(
        &mut self,
        qp: &mut RdmaQueuePair,
        host_memory: &HostMemory,
        mr_table: &MemoryRegionTable,
        parser: &RdmaPacketParser,
    ) -> ReadRequestResult {
        let mut result = ReadRequestResult::default();
        let bth = parser.bth();

        if bth.opcode != RdmaOpcode::RcReadRequest {
            return result;
        }
        if !qp.can_receive() {
            result.syndrome = Some(AethSyndrome::InvalidRequest);
            result.needs_nak = true;
            result.nak_psn = bth.psn;
            return result;
        }

        let expected_psn = qp.expected_recv_psn();
        if bth.psn != expected_psn {
            result.syndrome = Some(AethSyndrome::PsnSeqError);
            result.needs_nak = true;
            result.nak_psn = expected_psn;
            self.stats.sequence_errors += 1;
            return result;
        }

        if !parser.has_reth() {
            result.syndrome = Some(AethSyndrome::InvalidRequest);
            result.needs_nak = true;
            result.nak_psn = bth.psn;
            return result;
        }

        let reth = parser.reth();
        if mr_table
            .validate_rkey(reth.rkey, reth.virtual_address, reth.dma_length as u64, AccessFlags::REMOTE_READ)
            .is_err()
        {
            result.syndrome = Some(AethSyndrome::RemoteAccessError);
            result.needs_nak = true;
            result.nak_psn = bth.psn;
            self.stats.rkey_errors += 1;
            warn!(qp = qp.qp_number(), rkey = reth.rkey, addr = reth.virtual_address, len = reth.dma_length, "read rkey error");
            return result;
        }

        qp.advance_recv_psn();

        result.response_packets = self.generate_read_responses(
            qp,
            host_memory,
            mr_table,
            reth.virtual_address,
            reth.rkey,
            reth.dma_length,
        );

        if result.response_packets.is_empty() && reth.dma_length > 0 {
            result.syndrome = Some(AethSyndrome::RemoteAccessError);
            result.needs_nak = true;
            result.nak_psn = bth.psn;
            self.stats.access_errors += 1;
            return result;
        }

        result.success = true;
        result
    }

    pub fn process_read_response(
        &mut self,
        qp: &mut RdmaQueuePair,
        host_memory: &mut HostMemory,
        mr_table: &MemoryRegionTable,
        parser: &RdmaPacketParser,
    ) -> ReadResponseResult {
        let mut result = ReadResponseResult::default();
        let bth = parser.bth();

        let is_response = matches!(
            bth.opcode,
            RdmaOpcode::RcReadResponseFirst
                | RdmaOpcode::RcReadResponseMiddle
                | RdmaOpcode::RcReadResponseLast
                | RdmaOpcode::RcReadResponseOnly
        );
        if !is_response {
            return result;
        }

        let Some(req_state) = self.request_states.get_mut(&qp.qp_number()) else {
            return result;
        };
        if !req_state.in_progress {
            return result;
        }

        let is_first = opcode_is_first(bth.opcode);
        let is_only = opcode_is_only(bth.opcode);
        let is_last = opcode_is_last(bth.opcode);

        if (is_first || is_only) && !parser.has_aeth() {
            return result;
        }

        if (is_first || is_only) && parser.aeth().syndrome != AethSyndrome::Ack {
            result.cqe = Some(RdmaCqe {
                wr_id: req_state.wr_id,
                status: WqeStatus::RemoteAccessError,
                opcode: WqeOpcode::RdmaRead,
                qp_number: qp.qp_number(),
                bytes_completed: 0,
                has_immediate: false,
                immediate_data: 0,
                is_send: true,
            });
            result.is_read_complete = true;
            req_state.in_progress = false;
            return result;
        }

        let payload = parser.payload();
        let local_lkey = req_state.local_lkey;
        let pd_handle = qp.pd_handle();
        let bytes_written = Self::write_to_sgl(
            host_memory,
            mr_table,
            &req_state.sgl,
            payload,
            &mut req_state.current_sge_idx,
            &mut req_state.sge_offset,
            local_lkey,
            pd_handle,
        );

        if bytes_written != payload.len() {
            result.cqe = Some(RdmaCqe {
                wr_id: req_state.wr_id,
                status: WqeStatus::LocalAccessError,
                opcode: WqeOpcode::RdmaRead,
                qp_number: qp.qp_number(),
                bytes_completed: req_state.bytes_received,
                has_immediate: false,
                immediate_data: 0,
                is_send: true,
            });
            result.is_read_complete = true;
            req_state.in_progress = false;
            self.stats.access_errors += 1;
            warn!(qp = qp.qp_number(), bytes_written, expected = payload.len(), "read local access error");
            return result;
        }

        req_state.bytes_received += bytes_written as u32;
        req_state.expected_psn = advance_psn(bth.psn);
        self.stats.bytes_read += bytes_written as u64;
        self.stats.read_responses_processed += 1;
        qp.record_packet_received(bytes_written);

        if is_last || is_only {
            result.is_read_complete = true;
            req_state.in_progress = false;
            self.stats.reads_completed += 1;
            debug!(qp = qp.qp_number(), wr_id = req_state.wr_id, bytes = req_state.bytes_received, "read complete");

            result.cqe = Some(RdmaCqe {
                wr_id: req_state.wr_id,
                status: WqeStatus::Success,
                opcode: WqeOpcode::RdmaRead,
                qp_number: qp.qp_number(),
                bytes_completed: req_state.bytes_received,
                has_immediate: false,
                immediate_data: 0,
                is_send: true,
            });
        }

        result.success = true;
        result
    }
}
