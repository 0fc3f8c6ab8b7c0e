//! Bounded ring buffers with explicit producer/consumer indices and an
//! optional doorbell notification, shared by the TX/RX descriptor rings and
//! the completion queue.

use tracing::trace;

#[derive(Debug, Clone, Copy)]
pub struct DoorbellPayload {
    pub queue_id: u16,
    pub producer_idx: usize,
}

/// Side-effect-free notification sink rung after a producer index advances.
pub trait Doorbell {
    fn ring(&mut self, payload: DoorbellPayload);
}

/// A doorbell that just counts rings, useful for tests and for queues that
/// don't need a real interrupt-adjacent notification.
#[derive(Debug, Default)]
pub struct CountingDoorbell {
    pub rings: u64,
}

impl Doorbell for CountingDoorbell {
    fn ring(&mut self, _payload: DoorbellPayload) {
        self.rings += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    AccessError,
}

/// A FIFO of fixed-size byte slots: the TX/RX descriptor ring.
pub struct DescriptorRing {
    capacity: usize,
    descriptor_size: usize,
    producer_idx: usize,
    consumer_idx: usize,
    count: usize,
    slots: Vec<Vec<u8>>,
    queue_id: u16,
    doorbell: Option<Box<dyn Doorbell + Send>>,
}

impl DescriptorRing {
    pub fn new(queue_id: u16, capacity: usize, descriptor_size: usize) -> Self {
        Self {
            capacity,
            descriptor_size,
            producer_idx: 0,
            consumer_idx: 0,
            count: 0,
            slots: vec![vec![0u8; descriptor_size]; capacity],
            queue_id,
            doorbell: None,
        }
    }

    pub fn with_doorbell(mut self, doorbell: Box<dyn Doorbell + Send>) -> Self {
        self.doorbell = Some(doorbell);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn descriptor_size(&self) -> usize {
        self.descriptor_size
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn push_descriptor(&mut self, bytes: &[u8]) -> Result<(), RingError> {
        if self.is_full() {
            return Err(RingError::AccessError);
        }
        let slot = &mut self.slots[self.producer_idx];
        slot[..bytes.len().min(slot.len())]
            .copy_from_slice(&bytes[..bytes.len().min(slot.len())]);
        self.producer_idx = (self.producer_idx + 1) % self.capacity;
        self.count += 1;
        if let Some(doorbell) = self.doorbell.as_mut() {
            doorbell.ring(DoorbellPayload { queue_id: self.queue_id, producer_idx: self.producer_idx });
        }
        trace!(queue_id = self.queue_id, count = self.count, "pushed descriptor");
        Ok(())
    }

    pub fn pop_descriptor(&mut self) -> Result<Vec<u8>, RingError> {
        if self.is_empty() {
            return Err(RingError::AccessError);
        }
        let bytes = self.slots[self.consumer_idx].clone();
        self.consumer_idx = (self.consumer_idx + 1) % self.capacity;
        self.count -= 1;
        Ok(bytes)
    }

    pub fn reset(&mut self) {
        self.producer_idx = 0;
        self.consumer_idx = 0;
        self.count = 0;
    }
}

/// Ring of structured completion entries; identical shape to
/// [`DescriptorRing`] but stores `T` directly instead of raw bytes.
pub struct CompletionQueue<T> {
    capacity: usize,
    queue_id: u16,
    producer_idx: usize,
    consumer_idx: usize,
    count: usize,
    entries: Vec<Option<T>>,
    doorbell: Option<Box<dyn Doorbell + Send>>,
}

impl<T: Clone> CompletionQueue<T> {
    pub fn new(queue_id: u16, capacity: usize) -> Self {
        Self {
            capacity,
            queue_id,
            producer_idx: 0,
            consumer_idx: 0,
            count: 0,
            entries: vec![None; capacity],
            doorbell: None,
        }
    }

    pub fn with_doorbell(mut self, doorbell: Box<dyn Doorbell + Send>) -> Self {
        self.doorbell = Some(doorbell);
        self
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn available(&self) -> usize {
        self.count
    }

    pub fn space(&self) -> usize {
        self.capacity - self.count
    }

    pub fn post_completion(&mut self, entry: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries[self.producer_idx] = Some(entry);
        self.producer_idx = (self.producer_idx + 1) % self.capacity;
        self.count += 1;
        if let Some(doorbell) = self.doorbell.as_mut() {
            doorbell.ring(DoorbellPayload { queue_id: self.queue_id, producer_idx: self.producer_idx });
        }
        true
    }

    pub fn poll_completion(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let entry = self.entries[self.consumer_idx].take();
        self.consumer_idx = (self.consumer_idx + 1) % self.capacity;
        self.count -= 1;
        entry
    }

    pub fn reset(&mut self) {
        self.producer_idx = 0;
        self.consumer_idx = 0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_full_push_fails() {
        let mut ring = DescriptorRing::new(0, 2, 4);
        assert!(ring.push_descriptor(&[1, 2, 3, 4]).is_ok());
        assert!(ring.push_descriptor(&[1, 2, 3, 4]).is_ok());
        assert_eq!(ring.push_descriptor(&[1, 2, 3, 4]), Err(RingError::AccessError));
    }

    #[test]
    fn ring_pop_empty_fails() {
        let mut ring: DescriptorRing = DescriptorRing::new(0, 2, 4);
        assert_eq!(ring.pop_descriptor().unwrap_err(), RingError::AccessError);
    }

    #[test]
    fn reset_zeros_indices_preserves_capacity() {
        let mut ring = DescriptorRing::new(0, 4, 8);
        ring.push_descriptor(&[1; 8]).unwrap();
        ring.reset();
        assert_eq!(ring.count(), 0);
        assert_eq!(ring.capacity(), 4);
    }

    #[test]
    fn completion_queue_fifo_order() {
        let mut cq: CompletionQueue<u32> = CompletionQueue::new(0, 2);
        assert!(cq.post_completion(1));
        assert!(cq.post_completion(2));
        assert!(!cq.post_completion(3));
        assert_eq!(cq.poll_completion(), Some(1));
        assert_eq!(cq.poll_completion(), Some(2));
        assert_eq!(cq.poll_completion(), None);
    }
}
