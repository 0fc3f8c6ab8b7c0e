//! RC SEND/RECEIVE packet generation and processing (§4.5.2).

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
pub struct SendRecvStats {
    pub sends_started: u64,
    pub send_packets_generated: u64,
    pub bytes_sent: u64,
    pub recv_packets_processed: u64,
    pub recvs_completed: u64,
    pub bytes_received: u64,
    pub sequence_errors: u64,
    pub rnr_naks_sent: u64,
}

struct RecvMessageState {
    wr_id: u64,
    sgl: Vec<RdmaSglEntry>,
    bytes_received: u32,
    expected_psn: u32,
    current_sge_idx: usize,
    sge_offset: usize,
    in_progress: bool,
    has_immediate: bool,
    immediate_data: u32,
}

#[derive(Debug, Default)]
pub struct RecvResult {
    pub success: bool,
    pub needs_ack: bool,
    pub ack_psn: u32,
    pub syndrome: Option<AethSyndrome>,
    pub is_message_complete: bool,
    pub cqe: Option<RdmaCqe>,
}

pub struct SendRecvProcessor {
    recv_states: HashMap<u32, RecvMessageState>,
    stats: SendRecvStats,
}

impl Default for SendRecvProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl SendRecvProcessor {
    pub fn new() -> Self {
        Self { recv_states: HashMap::new(), stats: SendRecvStats::default() }
    }

    pub fn stats(&self) -> SendRecvStats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.recv_states.clear();
        self.stats = SendRecvStats::default();
    }

    pub fn clear_recv_state(&mut self, qp_number: u32) {
        self.recv_states.remove(&qp_number);
    }

    fn read_from_sgl(
        &self,
        host_memory: &HostMemory,
        mr_table: &MemoryRegionTable,
        sgl: &[RdmaSglEntry],
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
            let result = host_memory.read(entry.address, &mut data[old_len..]);
            if !result.is_ok() {
                return None;
            }
        }
        Some(data)
    }

    fn write_to_sgl(
        host_memory: &mut HostMemory,
        sgl: &[RdmaSglEntry],
        data: &[u8],
        sge_idx: &mut usize,
        sge_offset: &mut usize,
    ) -> usize {
        let mut total_written = 0;
        let mut data_offset = 0;

        while data_offset < data.len() && *sge_idx < sgl.len() {
            let entry = sgl[*sge_idx];
            let available = entry.length as usize - *sge_offset;
            let to_write = available.min(data.len() - data_offset);

            let dest_addr = entry.address + *sge_offset as u64;
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

    fn calculate_packet_count(total_length: u32, mtu: u32) -> u32 {
        if total_length == 0 {
            1
        } else {
            total_length.div_ceil(mtu)
        }
    }

    fn get_send_opcode(is_first: bool, is_last: bool, has_immediate: bool) -> RdmaOpcode {
        if is_first && is_last {
            if has_immediate { RdmaOpcode::RcSendOnlyImm } else { RdmaOpcode::RcSendOnly }
        } else if is_first {
            RdmaOpcode::RcSendFirst
        } else if is_last {
            if has_immediate { RdmaOpcode::RcSendLastImm } else { RdmaOpcode::RcSendLast }
        } else {
            RdmaOpcode::RcSendMiddle
        }
    }

    pub fn generate_send_packets(
        &mut self,
        qp: &mut RdmaQueuePair,
        host_memory: &HostMemory,
        mr_table: &MemoryRegionTable,
        wqe: &SendWqe,
    ) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        if wqe.opcode != WqeOpcode::Send && wqe.opcode != WqeOpcode::SendImm {
            return packets;
        }

        let Some(data) =
            self.read_from_sgl(host_memory, mr_table, &wqe.sgl, wqe.local_lkey, qp.pd_handle())
        else {
            return packets;
        };
        if data.len() as u32 != wqe.total_length {
            return packets;
        }

        let mtu = qp.mtu_bytes();
        let num_packets = Self::calculate_packet_count(wqe.total_length, mtu);
        let has_immediate = wqe.opcode == WqeOpcode::SendImm;

        self.stats.sends_started += 1;
        debug!(qp = qp.qp_number(), len = wqe.total_length, mtu, num_packets, "send");

        if wqe.total_length == 0 {
            let opcode = if has_immediate { RdmaOpcode::RcSendOnlyImm } else { RdmaOpcode::RcSendOnly };
            let mut builder = RdmaPacketBuilder::new()
                .set_opcode(opcode)
                .set_dest_qp(qp.dest_qp_number())
                .set_psn(qp.next_send_psn())
                .set_solicited_event(wqe.solicited)
                .set_ack_request(true);
            if has_immediate {
                builder = builder.set_immediate(wqe.immediate_data);
            }
            let packet = builder.build();
            qp.record_packet_sent(packet.len());
            packets.push(packet);
            self.stats.send_packets_generated += 1;
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

            let opcode = Self::get_send_opcode(is_first, is_last, has_immediate && is_last);
            let mut builder = RdmaPacketBuilder::new()
                .set_opcode(opcode)
                .set_dest_qp(qp.dest_qp_number())
                .set_psn(qp.next_send_psn())
                .set_pad_count(pad_count)
                .set_solicited_event(wqe.solicited && is_last)
                .set_ack_request(is_last)
                .set_payload(payload);
            if has_immediate && is_last {
                builder = builder.set_immediate(wqe.immediate_data);
            }

            let packet = builder.build();
            qp.record_packet_sent(packet.len());
            packets.push(packet);
            self.stats.send_packets_generated += 1;
            self.stats.bytes_sent += payload_size as u64;

            offset += payload_size;
        }

        qp.add_pending_operation(wqe.clone(), num_packets);
        packets
    }

    pub fn process_recv_packet(
        &mut self,
        qp: &mut RdmaQueuePair,
        host_memory: &mut HostMemory,
        parser: &RdmaPacketParser,
    ) -> RecvResult {
        let mut result = RecvResult::default();
        let bth = parser.bth();

        let is_send = matches!(
            bth.opcode,
            RdmaOpcode::RcSendFirst
                | RdmaOpcode::RcSendMiddle
                | RdmaOpcode::RcSendLast
                | RdmaOpcode::RcSendLastImm
                | RdmaOpcode::RcSendOnly
                | RdmaOpcode::RcSendOnlyImm
        );
        if !is_send {
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
            warn!(qp = qp.qp_number(), expected_psn, got = bth.psn, "recv PSN mismatch");
            return result;
        }

        let is_first = opcode_is_first(bth.opcode);
        let is_only = opcode_is_only(bth.opcode);
        let is_last = opcode_is_last(bth.opcode);

        if is_first || is_only {
            let Some(recv_wqe) = qp.consume_recv() else {
                result.syndrome = Some(AethSyndrome::RnrNak);
                result.needs_ack = true;
                result.ack_psn = bth.psn;
                self.stats.rnr_naks_sent += 1;
                warn!(qp = qp.qp_number(), "RNR: no recv WQE for incoming send");
                return result;
            };

            self.recv_states.insert(
                qp.qp_number(),
                RecvMessageState {
                    wr_id: recv_wqe.wr_id,
                    sgl: recv_wqe.sgl,
                    bytes_received: 0,
                    expected_psn: bth.psn,
                    current_sge_idx: 0,
                    sge_offset: 0,
                    in_progress: true,
                    has_immediate: false,
                    immediate_data: 0,
                },
            );
        }

        let Some(recv_state) = self.recv_states.get_mut(&qp.qp_number()) else {
            result.syndrome = Some(AethSyndrome::InvalidRequest);
            result.needs_ack = true;
            result.ack_psn = bth.psn;
            return result;
        };

        if !recv_state.in_progress {
            result.syndrome = Some(AethSyndrome::InvalidRequest);
            result.needs_ack = true;
            result.ack_psn = bth.psn;
            return result;
        }

        if !is_first && !is_only && recv_state.expected_psn != bth.psn {
            result.syndrome = Some(AethSyndrome::PsnSeqError);
            result.needs_ack = true;
            result.ack_psn = recv_state.expected_psn;
            self.stats.sequence_errors += 1;
            return result;
        }

        let payload = parser.payload();
        let bytes_written = Self::write_to_sgl(
            host_memory,
            &recv_state.sgl,
            payload,
            &mut recv_state.current_sge_idx,
            &mut recv_state.sge_offset,
        );

        if bytes_written != payload.len() {
            result.syndrome = Some(AethSyndrome::RemoteAccessError);
            result.needs_ack = true;
            result.ack_psn = bth.psn;
            recv_state.in_progress = false;
            return result;
        }

        recv_state.bytes_received += bytes_written as u32;
        recv_state.expected_psn = advance_psn(bth.psn);
        self.stats.bytes_received += bytes_written as u64;

        qp.advance_recv_psn();
        self.stats.recv_packets_processed += 1;
        qp.record_packet_received(bytes_written);

        if parser.has_immediate() {
            recv_state.has_immediate = true;
            recv_state.immediate_data = parser.immediate();
        }

        if is_last || is_only {
            result.is_message_complete = true;
            recv_state.in_progress = false;

            let cqe = RdmaCqe {
                wr_id: recv_state.wr_id,
                status: WqeStatus::Success,
                opcode: if recv_state.has_immediate { WqeOpcode::SendImm } else { WqeOpcode::Send },
                qp_number: qp.qp_number(),
                bytes_completed: recv_state.bytes_received,
                has_immediate: recv_state.has_immediate,
                immediate_data: recv_state.immediate_data,
                is_send: false,
            };
            debug!(qp = qp.qp_number(), wr_id = cqe.wr_id, bytes = cqe.bytes_completed, "recv complete");
            result.cqe = Some(cqe);
            self.stats.recvs_completed += 1;
        }

        if bth.ack_request || is_last || is_only {
            result.needs_ack = true;
            result.ack_psn = bth.psn;
            result.syndrome = Some(AethSyndrome::Ack);
        }

        result.success = true;
        result
    }

    pub fn generate_ack(
        qp: &RdmaQueuePair,
        psn: u32,
        syndrome: AethSyndrome,
        msn: u32,
    ) -> Vec<u8> {
        RdmaPacketBuilder::new()
            .set_opcode(RdmaOpcode::RcAck)
            .set_dest_qp(qp.dest_qp_number())
            .set_psn(psn)
            .set_syndrome(syndrome)
            .set_msn(msn)
            .set_ack_request(false)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mr::MemoryRegion;
    use crate::rdma::{QpState, RdmaQueuePairConfig};

    fn setup() -> (RdmaQueuePair, RdmaQueuePair, HostMemory, MemoryRegionTable) {
        let mut originator = RdmaQueuePair::new(RdmaQueuePairConfig {
            qp_number: 1,
            dest_qp_number: 2,
            pd_handle: 0,
            mtu_bytes: 64,
        });
        originator.set_state(QpState::ReadyToSend);
        let mut responder = RdmaQueuePair::new(RdmaQueuePairConfig {
            qp_number: 2,
            dest_qp_number: 1,
            pd_handle: 0,
            mtu_bytes: 64,
        });
        responder.set_state(QpState::ReadyToReceive);

        let mut host_memory = HostMemory::new(4096);
        assert!(host_memory.write(0, &[0xAB; 100]).is_ok());

        let mut mr_table = MemoryRegionTable::new();
        mr_table.register(MemoryRegion {
            lkey: 1,
            rkey: 1,
            pd_handle: 0,
            start_address: 0,
            length: 4096,
            access_flags: AccessFlags::LOCAL_READ | AccessFlags::LOCAL_WRITE,
        });

        (originator, responder, host_memory, mr_table)
    }

    #[test]
    fn s6_send_receive_round_trip() {
        let (mut originator, mut responder, mut host_memory, mr_table) = setup();
        let mut processor = SendRecvProcessor::new();

        let wqe = SendWqe {
            wr_id: 7,
            opcode: WqeOpcode::Send,
            sgl: vec![RdmaSglEntry { address: 0, length: 100 }],
            local_lkey: 1,
            total_length: 100,
            remote_address: 0,
            rkey: 0,
            solicited: false,
            immediate_data: 0,
        };

        let packets = processor.generate_send_packets(&mut originator, &host_memory, &mr_table, &wqe);
        assert_eq!(packets.len(), 2); // 100 bytes over 64-byte MTU

        responder.post_recv(RecvWqe { wr_id: 99, sgl: vec![RdmaSglEntry { address: 1000, length: 200 }] });

        let mut last_result = None;
        for packet in &packets {
            let parser = RdmaPacketParser::parse(packet).unwrap();
            last_result = Some(processor.process_recv_packet(&mut responder, &mut host_memory, &parser));
        }

        let result = last_result.unwrap();
        assert!(result.is_message_complete);
        let cqe = result.cqe.unwrap();
        assert_eq!(cqe.wr_id, 99);
        assert_eq!(cqe.bytes_completed, 100);
    }

    #[test]
    fn missing_recv_wqe_yields_rnr_nak() {
        let (mut originator, mut responder, mut host_memory, mr_table) = setup();
        let mut processor = SendRecvProcessor::new();

        let wqe = SendWqe {
            wr_id: 1,
            opcode: WqeOpcode::Send,
            sgl: vec![RdmaSglEntry { address: 0, length: 10 }],
            local_lkey: 1,
            total_length: 10,
            remote_address: 0,
            rkey: 0,
            solicited: false,
            immediate_data: 0,
        };
        let packets = processor.generate_send_packets(&mut originator, &host_memory, &mr_table, &wqe);
        let parser = RdmaPacketParser::parse(&packets[0]).unwrap();
        let result = processor.process_recv_packet(&mut responder, &mut host_memory, &parser);
        assert_eq!(result.syndrome, Some(AethSyndrome::RnrNak));
        assert!(!result.success);
    }
}
