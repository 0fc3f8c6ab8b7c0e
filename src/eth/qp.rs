//! Ethernet data-plane queue pair: the TX→RX pipeline described in §4.3.

use crate::checksum::compute_checksum;
use crate::dma::DmaEngine;
use crate::eth::descriptors::{
    ChecksumMode, CompletionEntry, CompletionStatus, RxDescriptor, TxDescriptor, MAX_MSS,
    MAX_TSO_SEGMENTS, MIN_MSS,
};
use crate::interrupt::{InterruptDispatcher, InterruptVector};
use crate::ring::{CompletionQueue, DescriptorRing};
use crate::stats::{StatsCollector, StatsErrorType};
use tracing::{debug, trace, warn};

pub struct QueuePairConfig {
    pub queue_id: u16,
    pub max_mtu: u32,
    pub tx_ring_capacity: usize,
    pub rx_ring_capacity: usize,
    pub cq_capacity: usize,
    pub tx_interrupt: InterruptVector,
    pub rx_interrupt: InterruptVector,
}

pub struct QueuePair {
    queue_id: u16,
    max_mtu: u32,
    tx_ring: DescriptorRing,
    rx_ring: DescriptorRing,
    tx_cq: CompletionQueue<CompletionEntry>,
    rx_cq: CompletionQueue<CompletionEntry>,
    tx_interrupt: InterruptVector,
    rx_interrupt: InterruptVector,
    drops_no_rx_desc: u64,
}

impl QueuePair {
    pub fn new(config: QueuePairConfig) -> Self {
        Self {
            queue_id: config.queue_id,
            max_mtu: config.max_mtu,
            tx_ring: DescriptorRing::new(config.queue_id, config.tx_ring_capacity, 24),
            rx_ring: DescriptorRing::new(config.queue_id, config.rx_ring_capacity, 16),
            tx_cq: CompletionQueue::new(config.queue_id, config.cq_capacity),
            rx_cq: CompletionQueue::new(config.queue_id, config.cq_capacity),
            tx_interrupt: config.tx_interrupt,
            rx_interrupt: config.rx_interrupt,
            drops_no_rx_desc: 0,
        }
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    pub fn push_tx_descriptor(&mut self, tx: &TxDescriptor) -> Result<(), crate::ring::RingError> {
        self.tx_ring.push_descriptor(&tx.encode())
    }

    pub fn push_rx_descriptor(&mut self, rx: &RxDescriptor) -> Result<(), crate::ring::RingError> {
        self.rx_ring.push_descriptor(&rx.encode())
    }

    pub fn poll_tx_completion(&mut self) -> Option<CompletionEntry> {
        self.tx_cq.poll_completion()
    }

    pub fn poll_rx_completion(&mut self) -> Option<CompletionEntry> {
        self.rx_cq.poll_completion()
    }

    pub fn drops_no_rx_desc(&self) -> u64 {
        self.drops_no_rx_desc
    }

    pub fn reset(&mut self) {
        self.tx_ring.reset();
        self.rx_ring.reset();
        self.tx_cq.reset();
        self.rx_cq.reset();
    }

    /// Perform exactly one TX descriptor's worth of work. Returns `false`
    /// only when the TX ring was empty or the popped descriptor failed to
    /// decode (no completion is posted in that case).
    pub fn process_once(
        &mut self,
        dma: &mut DmaEngine,
        interrupts: &mut InterruptDispatcher,
        stats: &StatsCollector,
    ) -> bool {
        if self.tx_ring.is_empty() {
            return false;
        }

        let raw = self.tx_ring.pop_descriptor().expect("checked non-empty above");
        let Some(tx) = TxDescriptor::decode(&raw) else {
            warn!(queue_id = self.queue_id, "TX descriptor decode failure");
            return false;
        };

        if self.rx_ring.is_empty() {
            self.post_tx_only(CompletionStatus::NoDescriptor, &tx, interrupts);
            self.drops_no_rx_desc += 1;
            stats.record_error(self.queue_id, StatsErrorType::TxDescriptorError);
            return true;
        }

        let mut buffer = vec![0u8; tx.length as usize];
        let read = dma.read(tx.buffer_address, &mut buffer);
        if !read.is_ok() {
            self.post_tx_only(CompletionStatus::Fault, &tx, interrupts);
            stats.record_error(self.queue_id, StatsErrorType::TxDmaError);
            return true;
        }

        if tx.checksum_mode != ChecksumMode::None && !tx.checksum_offload {
            let checksum = compute_checksum(&buffer);
            if checksum != tx.checksum_value {
                self.post_tx_only(CompletionStatus::ChecksumError, &tx, interrupts);
                stats.record_error(self.queue_id, StatsErrorType::TxChecksumError);
                return true;
            }
        }

        if buffer.len() as u32 > self.max_mtu {
            self.post_tx_only(CompletionStatus::MtuExceeded, &tx, interrupts);
            stats.record_error(self.queue_id, StatsErrorType::TxDescriptorError);
            return true;
        }

        let segments = match self.segment(&buffer, &tx) {
            Ok(segments) => segments,
            Err(status) => {
                self.post_tx_only(status, &tx, interrupts);
                stats.record_error(self.queue_id, StatsErrorType::TxDescriptorError);
                return true;
            }
        };

        if self.rx_ring.count() < segments.len() {
            self.post_tx_only(CompletionStatus::NoDescriptor, &tx, interrupts);
            self.drops_no_rx_desc += 1;
            stats.record_error(self.queue_id, StatsErrorType::TxDescriptorError);
            return true;
        }

        for segment in &segments {
            let raw_rx = self.rx_ring.pop_descriptor().expect("count checked above");
            let Some(rx) = RxDescriptor::decode(&raw_rx) else {
                warn!(queue_id = self.queue_id, "RX descriptor decode failure");
                self.post_tx_only(CompletionStatus::Fault, &tx, interrupts);
                return true;
            };

            let mut delivered = segment.clone();
            let mut rx_vlan_present = rx.vlan_present;
            let mut vlan_inserted = false;
            if tx.vlan_insert {
                let mut with_tag = Vec::with_capacity(delivered.len() + 4);
                with_tag.extend_from_slice(&[0x81, 0x00, (tx.vlan_tag >> 8) as u8, (tx.vlan_tag & 0xFF) as u8]);
                with_tag.extend_from_slice(&delivered);
                delivered = with_tag;
                rx_vlan_present = true;
                vlan_inserted = true;
            }

            let mut vlan_stripped = false;
            let mut stripped_tag = 0u16;
            if rx.vlan_strip && rx_vlan_present && delivered.len() >= 4 {
                stripped_tag = ((delivered[2] as u16) << 8) | delivered[3] as u16;
                delivered.drain(0..4);
                vlan_stripped = true;
            }

            if rx.buffer_length < delivered.len() as u32 {
                let mut rx_completion =
                    CompletionEntry::rx(self.queue_id, rx.descriptor_index, CompletionStatus::BufferTooSmall);
                rx_completion.vlan_stripped = vlan_stripped;
                rx_completion.vlan_tag = stripped_tag;
                self.rx_cq.post_completion(rx_completion);
                interrupts.post(self.rx_interrupt);
                stats.record_error(self.queue_id, StatsErrorType::RxDescriptorError);

                self.post_tx_only(CompletionStatus::Success, &tx, interrupts);
                return true;
            }

            let write = dma.write(rx.buffer_address, &delivered);
            if !write.is_ok() {
                let rx_completion =
                    CompletionEntry::rx(self.queue_id, rx.descriptor_index, CompletionStatus::Fault);
                self.rx_cq.post_completion(rx_completion);
                interrupts.post(self.rx_interrupt);
                stats.record_error(self.queue_id, StatsErrorType::RxDmaError);

                self.post_tx_only(CompletionStatus::Fault, &tx, interrupts);
                return true;
            }

            let mut rx_completion =
                CompletionEntry::rx(self.queue_id, rx.descriptor_index, CompletionStatus::Success);
            rx_completion.vlan_inserted = vlan_inserted;
            rx_completion.vlan_stripped = vlan_stripped;
            rx_completion.vlan_tag = stripped_tag;
            rx_completion.gro_aggregated = rx.gro_enabled;

            if rx.checksum_offload {
                let checksum = compute_checksum(&delivered);
                if checksum != 0 {
                    rx_completion.status = CompletionStatus::ChecksumError;
                    self.rx_cq.post_completion(rx_completion);
                    interrupts.post(self.rx_interrupt);
                    stats.record_error(self.queue_id, StatsErrorType::RxChecksumError);

                    self.post_tx_only(CompletionStatus::Success, &tx, interrupts);
                    return true;
                }
                rx_completion.checksum_verified = true;
            }

            self.rx_cq.post_completion(rx_completion);
            interrupts.post(self.rx_interrupt);
            stats.record_rx_packet(self.queue_id, delivered.len() as u64);
            trace!(queue_id = self.queue_id, bytes = delivered.len(), "segment delivered");
        }

        let n = segments.len() as u32;
        let mut tx_completion = CompletionEntry::tx(self.queue_id, tx.descriptor_index, CompletionStatus::Success);
        tx_completion.segments_produced = n;
        tx_completion.tso_performed = tx.tso_enabled && n > 1;
        tx_completion.gso_performed = tx.gso_enabled && n > 1;
        tx_completion.vlan_inserted = tx.vlan_insert;
        tx_completion.checksum_offloaded = tx.checksum_offload;
        self.tx_cq.post_completion(tx_completion);
        interrupts.post(self.tx_interrupt);

        stats.record_tx_packet(self.queue_id, buffer.len() as u64, n as u64);
        debug!(queue_id = self.queue_id, segments = n, "TX completed");
        true
    }

    fn post_tx_only(
        &mut self,
        status: CompletionStatus,
        tx: &TxDescriptor,
        interrupts: &mut InterruptDispatcher,
    ) {
        let completion = CompletionEntry::tx(self.queue_id, tx.descriptor_index, status);
        self.tx_cq.post_completion(completion);
        interrupts.post(self.tx_interrupt);
    }

    fn segment(&self, buffer: &[u8], tx: &TxDescriptor) -> Result<Vec<Vec<u8>>, CompletionStatus> {
        let length = buffer.len();
        let needs_segmentation =
            (tx.tso_enabled || tx.gso_enabled) && tx.mss > 0 && length > tx.mss as usize;

        if !needs_segmentation {
            return Ok(vec![buffer.to_vec()]);
        }

        if tx.mss < MIN_MSS || tx.mss > MAX_MSS || tx.header_length as usize > length {
            return Err(CompletionStatus::InvalidMss);
        }

        let header = &buffer[..tx.header_length as usize];
        let payload = &buffer[tx.header_length as usize..];
        let mut segments = Vec::new();
        let mut offset = 0usize;
        while offset < payload.len() {
            let chunk_len = (tx.mss as usize).min(payload.len() - offset);
            let mut segment = Vec::with_capacity(header.len() + chunk_len);
            segment.extend_from_slice(header);
            segment.extend_from_slice(&payload[offset..offset + chunk_len]);
            segments.push(segment);
            offset += chunk_len;
        }

        if segments.len() > MAX_TSO_SEGMENTS {
            return Err(CompletionStatus::TooManySegments);
        }

        Ok(segments)
    }
}
