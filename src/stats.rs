//! Centralized statistics collection (§4.8). Per-queue and per-VF counters
//! live in a fixed-size array plus a "seen" bitset rather than a hash map,
//! per the dense-small-key redesign note in §9 — this also removes the
//! "return a static empty stats" singleton the original relied on, since an
//! unseen slot is just a zeroed entry already sitting in the array.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsErrorType {
    TxDescriptorError,
    TxDmaError,
    TxChecksumError,
    RxDescriptorError,
    RxDmaError,
    RxChecksumError,
    RxDroppedFull,
}

#[derive(Debug, Default)]
pub struct QueueStats {
    pub tx_bytes: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_errors: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_packets: AtomicU64,
    pub rx_errors: AtomicU64,
}

impl QueueStats {
    fn reset(&self) {
        self.tx_bytes.store(0, Ordering::Relaxed);
        self.tx_packets.store(0, Ordering::Relaxed);
        self.tx_errors.store(0, Ordering::Relaxed);
        self.rx_bytes.store(0, Ordering::Relaxed);
        self.rx_packets.store(0, Ordering::Relaxed);
        self.rx_errors.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct VfStats {
    pub tx_bytes: AtomicU64,
    pub tx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_packets: AtomicU64,
    pub mailbox_messages: AtomicU64,
}

impl VfStats {
    fn reset(&self) {
        self.tx_bytes.store(0, Ordering::Relaxed);
        self.tx_packets.store(0, Ordering::Relaxed);
        self.rx_bytes.store(0, Ordering::Relaxed);
        self.rx_packets.store(0, Ordering::Relaxed);
        self.mailbox_messages.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PortStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
}

/// Fixed-capacity dense map from a small integer id to a statistics record,
/// with a bitset tracking which slots have been touched.
struct DenseSlots<T> {
    slots: Vec<T>,
    seen: Vec<bool>,
}

impl<T: Default> DenseSlots<T> {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, T::default);
        Self { slots, seen: vec![false; capacity] }
    }

    fn get(&self, id: u16) -> Option<&T> {
        self.slots.get(id as usize)
    }

    fn touch(&mut self, id: u16) -> Option<&T> {
        let idx = id as usize;
        if idx >= self.slots.len() {
            return None;
        }
        self.seen[idx] = true;
        Some(&self.slots[idx])
    }

    fn is_seen(&self, id: u16) -> bool {
        self.seen.get(id as usize).copied().unwrap_or(false)
    }

    fn reset_all(&mut self) {
        self.seen.iter_mut().for_each(|s| *s = false);
    }
}

pub struct StatsCollector {
    queues: DenseSlots<QueueStats>,
    vfs: DenseSlots<VfStats>,
}

impl StatsCollector {
    pub fn new(capacity: usize) -> Self {
        Self { queues: DenseSlots::new(capacity), vfs: DenseSlots::new(capacity) }
    }

    pub fn record_tx_packet(&self, queue_id: u16, bytes: u64, packets: u64) {
        if let Some(stats) = self.queues.get(queue_id) {
            stats.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
            stats.tx_packets.fetch_add(packets, Ordering::Relaxed);
        }
    }

    pub fn record_rx_packet(&self, queue_id: u16, bytes: u64) {
        if let Some(stats) = self.queues.get(queue_id) {
            stats.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
            stats.rx_packets.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self, queue_id: u16, kind: StatsErrorType) {
        let Some(stats) = self.queues.get(queue_id) else { return };
        match kind {
            StatsErrorType::TxDescriptorError
            | StatsErrorType::TxDmaError
            | StatsErrorType::TxChecksumError => {
                stats.tx_errors.fetch_add(1, Ordering::Relaxed);
            }
            StatsErrorType::RxDescriptorError
            | StatsErrorType::RxDmaError
            | StatsErrorType::RxChecksumError
            | StatsErrorType::RxDroppedFull => {
                stats.rx_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_vf_tx_packet(&self, vf_id: u16, bytes: u64) {
        if let Some(stats) = self.vfs.get(vf_id) {
            stats.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
            stats.tx_packets.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_vf_rx_packet(&self, vf_id: u16, bytes: u64) {
        if let Some(stats) = self.vfs.get(vf_id) {
            stats.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
            stats.rx_packets.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_vf_mailbox_message(&self, vf_id: u16) {
        if let Some(stats) = self.vfs.get(vf_id) {
            stats.mailbox_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn port_stats(&self) -> PortStats {
        let mut port = PortStats::default();
        for queue in &self.queues.slots {
            port.rx_bytes += queue.rx_bytes.load(Ordering::Relaxed);
            port.rx_packets += queue.rx_packets.load(Ordering::Relaxed);
            port.rx_errors += queue.rx_errors.load(Ordering::Relaxed);
            port.tx_bytes += queue.tx_bytes.load(Ordering::Relaxed);
            port.tx_packets += queue.tx_packets.load(Ordering::Relaxed);
            port.tx_errors += queue.tx_errors.load(Ordering::Relaxed);
        }
        port
    }

    pub fn queue_stats(&self, queue_id: u16) -> Option<&QueueStats> {
        self.queues.get(queue_id)
    }

    pub fn vf_stats(&self, vf_id: u16) -> Option<&VfStats> {
        self.vfs.get(vf_id)
    }

    pub fn queue_seen(&self, queue_id: u16) -> bool {
        self.queues.is_seen(queue_id)
    }

    pub fn reset_all(&mut self) {
        self.queues.slots.iter().for_each(QueueStats::reset);
        self.vfs.slots.iter().for_each(VfStats::reset);
        self.queues.reset_all();
        self.vfs.reset_all();
    }

    pub fn reset_queue(&mut self, queue_id: u16) {
        if let Some(stats) = self.queues.touch(queue_id) {
            stats.reset();
        }
    }

    pub fn reset_vf(&mut self, vf_id: u16) {
        if let Some(stats) = self.vfs.touch(vf_id) {
            stats.reset();
        }
    }
}
