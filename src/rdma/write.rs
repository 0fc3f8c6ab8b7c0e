//! RC RDMA WRITE packet generation and processing (§4.5.3).

use std::collections::HashMap;

use crate::hostmem::HostMemory;
use crate::mr::{AccessFlags, MemoryRegionTable};
use crate::rdma::packet::{
    opcode_is_first, opcode_is_last, opcode_is_only, AethSyndrome, RdmaOpcode, RdmaPacketBuilder,
    RdmaPacketParser,
};
use crate::rdma::psn::advance_psn;
use crate::rdma::{RdmaCqe, RdmaQueuePair, SendWqe, WqeOpcode, WqeStatus};
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct WriteStats {
    pub writes_started: u64,
    pub write_packets_generated: u64,
    pub bytes_written: u64,
    pub write_packets_processed: u64,
    pub writes_completed: u64,
    pub sequence_errors: u64,
    pub rkey_errors: u64,
    pub access_errors: u64,
}

struct WriteMessageState {
    remote_address: u64,
    rkey: u32,
    bytes_written: u32,
    expected_psn: u32,
    in_progress: bool,
    has_immediate: bool,
    immediate_data: u32,
}

#[derive(Debug, Default)]
pub struct WriteResult {
    pub success: bool,
    pub needs_ack: bool,
    pub ack_psn: u32,
    pub syndrome: Option<AethSyndrome>,
    pub is_message_complete: bool,
    pub recv_cqe: Option<RdmaCqe>,
}

pub struct WriteProcessor {
    write_states: HashMap<u32, WriteMessageState>,
    stats: WriteStats,
}

impl Default for WriteProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteProcessor {
    pub fn new() -> Self {
        Self { write_states: HashMap::new(), stats: WriteStats::default() }
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.write_states.clear();
        self.stats = WriteStats::default();
    }

    pub fn clear_write_state(&mut self, qp_number: u32) {
        self.write_states.remove(&qp_number);
    }

    fn read_from_sgl(
        host_memory: &HostMemory,
        mr_table: &MemoryRegionTable,
        sgl: &[crate::rdma::RdmaSglEntry],
        lkey: u32,
        pd_handle: u32,
    ) -> Option<Vec<u8>> {
        let mut data = Vec::new();
        for entry in sgl {
            if mr_table
                .validate_lkey(lkey, pd_handle, entry.address, entry.length as u64, AccessFlags::LOCAL_READ)
                .is_err()
            {
                return None;
            }
            let old_len = data.len();
            data.resize(old_len + entry.length as usize, 0);
            if !host_memory.read(entry.address, &mut data[old_len..]).is_ok() {
                return None;
            }
        }
        Some(data)
    }

    fn write_to_remote(
        host_memory: &mut HostMemory,
        mr_table: &MemoryRegionTable,
        address: u64,
        rkey: u32,
        data: &[u8],
    ) -> bool {
        if mr_table.validate_rkey(rkey, address, data.len() as u64, AccessFlags::REMOTE_WRITE).is_err()
        {
            return false;
        }
        host_memory.write(address, data).is_ok()
    }

    fn calculate_packet_count(total_length: u32, mtu: u32) -> u32 {
        if total_length == 0 {
            1
        } else {
            total_length.div_ceil(mtu)
        }
    }

    fn get_write_opcode(is_first: bool, is_last: bool, has_immediate: bool) -> RdmaOpcode {
        if is_first && is_last {
            if has_immediate { RdmaOpcode::RcWriteOnlyImm } else { RdmaOpcode::RcWriteOnly }
        } else if is_first {
            RdmaOpcode::RcWriteFirst
        } else if is_last {
            if has_immediate { RdmaOpcode::RcWriteLastImm } else { RdmaOpcode::RcWriteLast }
        } else {
            RdmaOpcode::RcWriteMiddle
        }
    }

    pub fn generate_write_packets(
        &mut self,
        qp: &mut RdmaQueuePair,
        host_memory: &HostMemory,
        mr_table: &MemoryRegionTable,
        wqe: &SendWqe,
    ) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        if wqe.opcode != WqeOpcode::RdmaWrite && wqe.opcode != WqeOpcode::RdmaWriteImm {
            return packets;
        }

        let Some(data) = Self::read_from_sgl(host_memory, mr_table, &wqe.sgl, wqe.local_lkey, qp.pd_handle())
        else {
            return packets;
        };
        if data.len() as u32 != wqe.total_length {
            return packets;
        }

        let mtu = qp.mtu_bytes();
        let num_packets = Self::calculate_packet_count(wqe.total_length, mtu);
        let has_immediate = wqe.opcode == WqeOpcode::RdmaWriteImm;

        self.stats.writes_started += 1;
        debug!(qp = qp.qp_number(), remote_addr = wqe.remote_address, len = wqe.total_length, num_packets, "write");

        if wqe.total_length == 0 {
            let opcode = if has_immediate { RdmaOpcode::RcWriteOnlyImm } else { RdmaOpcode::RcWriteOnly };
            let mut builder = RdmaPacketBuilder::new()
                .set_opcode(opcode)
                .set_dest_qp(qp.dest_qp_number())
                .set_psn(qp.next_send_psn())
                .set_ack_request(true)
                .set_remote_address(wqe.remote_address)
                .set_rkey(wqe.rkey)
                .set_dma_length(0);
            if has_immediate {
                builder = builder.set_immediate(wqe.immediate_data);
            }
            let packet = builder.build();
            qp.record_packet_sent(packet.len());
            packets.push(packet);
            self.stats.write_packets_generated += 1;
            qp.add_pending_operation(wqe.clone(), 1);
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

            let opcode = Self::get_write_opcode(is_first, is_last, has_immediate && is_last);
            let mut builder = RdmaPacketBuilder::new()
                .set_opcode(opcode)
                .set_dest_qp(qp.dest_qp_number())
                .set_psn(qp.next_send_psn())
                .set_pad_count(pad_count)
                .set_ack_request(is_last)
                .set_payload(payload);

            if is_first {
                builder = builder
                    .set_remote_address(wqe.remote_address)
                    .set_rkey(wqe.rkey)
                    .set_dma_length(wqe.total_length);
            }
            if has_immediate && is_last {
                builder = builder.set_immediate(wqe.immediate_data);
            }

            let packet = builder.build();
            qp.record_packet_sent(packet.len());
            packets.push(packet);
            self.stats.write_packets_generated += 1;
            self.stats.bytes_written += payload_size as u64;

            offset += payload_size;
        }

        qp.add_pending_operation(wqe.clone(), num_packets);
        packets
    }

    pub fn process_write_packet(
        &mut self,
        qp: &mut RdmaQueuePair,
        host_memory: &mut HostMemory,
        mr_table: &MemoryRegionTable,
        parser: &RdmaPacketParser,
    ) -> WriteResult {
        let mut result = WriteResult::default();
        let bth = parser.bth();

        let is_write = matches!(
            bth.opcode,
            RdmaOpcode::RcWriteFirst
                | RdmaOpcode::RcWriteMiddle
                | RdmaOpcode::RcWriteLast
                | RdmaOpcode::RcWriteLastImm
                | RdmaOpcode::RcWriteOnly
                | RdmaOpcode::RcWriteOnlyImm
        );
        if !is_write {
            return result;
        }

        if !qp.can_receive() {
            result.syndrome = Some(AethSyndrome::InvalidRequest);
            result.needs_ack = true;
            result.ack_psn = bth.psn;
            return result;
        }

        let expected_psn = qp.expected_recv_psn();
        if bth.psn != expected_psn {
            result.syndrome = Some(AethSyndrome::PsnSeqError);
            result.needs_ack = true;
            result.ack_psn = expected_psn;
            self.stats.sequence_errors += 1;
            warn!(qp = qp.qp_number(), expected_psn, got = bth.psn, "write PSN mismatch");
            return result;
        }

        let is_first = opcode_is_first(bth.opcode);
        let is_only = opcode_is_only(bth.opcode);
        let is_last = opcode_is_last(bth.opcode);

        if is_first || is_only {
            if !parser.has_reth() {
                result.syndrome = Some(AethSyndrome::InvalidRequest);
                result.needs_ack = true;
                result.ack_psn = bth.psn;
                return result;
            }

            let reth = parser.reth();
            if mr_table
                .validate_rkey(reth.rkey, reth.virtual_address, reth.dma_length as u64, AccessFlags::REMOTE_WRITE)
                .is_err()
            {
                result.syndrome = Some(AethSyndrome::RemoteAccessError);
                result.needs_ack = true;
                result.ack_psn = bth.psn;
                self.stats.rkey_errors += 1;
                warn!(qp = qp.qp_number(), rkey = reth.rkey, addr = reth.virtual_address, "write rkey error");
                return result;
            }

            self.write_states.insert(
                qp.qp_number(),
                WriteMessageState {
                    remote_address: reth.virtual_address,
                    rkey: reth.rkey,
                    bytes_written: 0,
                    expected_psn: bth.psn,
                    in_progress: true,
                    has_immediate: false,
                    immediate_data: 0,
                },
            );
        }

        let Some(write_state) = self.write_states.get_mut(&qp.qp_number()) else {
            result.syndrome = Some(AethSyndrome::InvalidRequest);
            result.needs_ack = true;
            result.ack_psn = bth.psn;
            return result;
        };

        if !write_state.in_progress {
            result.syndrome = Some(AethSyndrome::InvalidRequest);
            result.needs_ack = true;
            result.ack_psn = bth.psn;
            return result;
        }

        if !is_first && !is_only && write_state.expected_psn != bth.psn {
            result.syndrome = Some(AethSyndrome::PsnSeqError);
            result.needs_ack = true;
            result.ack_psn = write_state.expected_psn;
            self.stats.sequence_errors += 1;
            return result;
        }

        let payload = parser.payload();
        let write_addr = write_state.remote_address + write_state.bytes_written as u64;

        if !payload.is_empty()
            && !Self::write_to_remote(host_memory, mr_table, write_addr, write_state.rkey, payload)
        {
            result.syndrome = Some(AethSyndrome::RemoteAccessError);
            result.needs_ack = true;
            result.ack_psn = bth.psn;
            write_state.in_progress = false;
            self.stats.access_errors += 1;
            return result;
        }

        write_state.bytes_written += payload.len() as u32;
        write_state.expected_psn = advance_psn(bth.psn);

        qp.advance_recv_psn();
        self.stats.write_packets_processed += 1;
        qp.record_packet_received(payload.len());

        if parser.has_immediate() {
            write_state.has_immediate = true;
            write_state.immediate_data = parser.immediate();
        }

        if is_last || is_only {
            result.is_message_complete = true;
            write_state.in_progress = false;
            self.stats.writes_completed += 1;
            debug!(qp = qp.qp_number(), bytes = write_state.bytes_written, "write complete");

            if write_state.has_immediate {
                let Some(recv_wqe) = qp.consume_recv() else {
                    result.syndrome = Some(AethSyndrome::RnrNak);
                    result.needs_ack = true;
                    result.ack_psn = bth.psn;
                    return result;
                };

                result.recv_cqe = Some(RdmaCqe {
                    wr_id: recv_wqe.wr_id,
                    status: WqeStatus::Success,
                    opcode: WqeOpcode::RdmaWriteImm,
                    qp_number: qp.qp_number(),
                    bytes_completed: write_state.bytes_written,
                    has_immediate: true,
                    immediate_data: write_state.immediate_data,
                    is_send: false,
                });
            }
        }

        if bth.ack_request || is_last || is_only {
            result.needs_ack = true;
            result.ack_psn = bth.psn;
            result.syndrome = Some(AethSyndrome::Ack);
        }

        result.success = true;
        result
    }
}
