//! PTP hardware clock model and per-queue RX/TX timestamping (§4.9).

#[derive(Debug, Clone, Copy, Default)]
pub struct PtpTime {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl PtpTime {
    const NANOS_PER_SEC: i64 = 1_000_000_000;

    fn to_nanos(self) -> i128 {
        self.seconds as i128 * Self::NANOS_PER_SEC as i128 + self.nanoseconds as i128
    }

    fn from_nanos(nanos: i128) -> Self {
        let nanos = nanos.max(0);
        let seconds = (nanos / Self::NANOS_PER_SEC as i128) as u64;
        let nanoseconds = (nanos % Self::NANOS_PER_SEC as i128) as u32;
        Self { seconds, nanoseconds }
    }
}

pub struct PtpClock {
    current: PtpTime,
    drift_ppb: i64,
    enabled: bool,
}

impl PtpClock {
    pub fn new() -> Self {
        Self { current: PtpTime::default(), drift_ppb: 0, enabled: true }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_time(&mut self, time: PtpTime) {
        self.current = time;
    }

    pub fn now(&self) -> PtpTime {
        self.current
    }

    pub fn set_drift(&mut self, ppb: i64) {
        self.drift_ppb = ppb;
    }

    /// Advances the clock by `elapsed_ns` of wall time, applying the
    /// configured drift. A no-op while the clock is disabled, matching the
    /// original's unwired free-running-when-off behavior.
    pub fn advance(&mut self, elapsed_ns: u64) {
        if !self.enabled {
            return;
        }
        let drift_correction = (elapsed_ns as i128 * self.drift_ppb as i128) / 1_000_000_000i128;
        let next = self.current.to_nanos() + elapsed_ns as i128 + drift_correction;
        self.current = PtpTime::from_nanos(next);
    }

    /// Step adjustment applied by an external sync protocol; saturates at
    /// zero rather than underflowing for a large negative offset.
    pub fn adjust(&mut self, offset_ns: i64) {
        let next = self.current.to_nanos() + offset_ns as i128;
        self.current = PtpTime::from_nanos(next);
    }
}

impl Default for PtpClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueTimestamps {
    pub last_rx: Option<PtpTime>,
    pub last_tx: Option<PtpTime>,
    pub rx_count: u64,
    pub tx_count: u64,
}

/// Per-queue PTP timestamp sampling. `ptp_packets_detected` in the original
/// counts only packets a caller explicitly flags as PTP event messages via
/// `record_ptp_rx`/`record_ptp_tx` — the detector itself never increments it,
/// since no PTP event-message parser was ever wired to this subsystem.
pub struct PtpTimestamper {
    per_queue: Vec<QueueTimestamps>,
    ptp_packets_detected: u64,
}

impl PtpTimestamper {
    pub fn new(queue_count: usize) -> Self {
        Self { per_queue: vec![QueueTimestamps::default(); queue_count], ptp_packets_detected: 0 }
    }

    pub fn record_rx(&mut self, queue_id: u16, time: PtpTime) {
        if let Some(q) = self.per_queue.get_mut(queue_id as usize) {
            q.last_rx = Some(time);
            q.rx_count += 1;
        }
    }

    pub fn record_tx(&mut self, queue_id: u16, time: PtpTime) {
        if let Some(q) = self.per_queue.get_mut(queue_id as usize) {
            q.last_tx = Some(time);
            q.tx_count += 1;
        }
    }

    pub fn record_ptp_rx(&mut self, queue_id: u16, time: PtpTime) {
        self.record_rx(queue_id, time);
        self.ptp_packets_detected += 1;
    }

    pub fn record_ptp_tx(&mut self, queue_id: u16, time: PtpTime) {
        self.record_tx(queue_id, time);
        self.ptp_packets_detected += 1;
    }

    pub fn queue_timestamps(&self, queue_id: u16) -> Option<&QueueTimestamps> {
        self.per_queue.get(queue_id as usize)
    }

    pub fn ptp_packets_detected(&self) -> u64 {
        self.ptp_packets_detected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_applies_positive_drift() {
        let mut clock = PtpClock::new();
        clock.set_drift(1_000_000);
        clock.advance(1_000_000_000);
        assert_eq!(clock.now().seconds, 1);
        assert!(clock.now().nanoseconds >= 1_000_000);
    }

    #[test]
    fn disabled_clock_does_not_advance() {
        let mut clock = PtpClock::new();
        clock.set_enabled(false);
        clock.advance(5_000_000_000);
        assert_eq!(clock.now().seconds, 0);
    }

    #[test]
    fn adjust_saturates_at_zero() {
        let mut clock = PtpClock::new();
        clock.set_time(PtpTime { seconds: 1, nanoseconds: 0 });
        clock.adjust(-5_000_000_000);
        assert_eq!(clock.now().seconds, 0);
        assert_eq!(clock.now().nanoseconds, 0);
    }

    #[test]
    fn ptp_packets_detected_requires_explicit_marking() {
        let mut ts = PtpTimestamper::new(2);
        ts.record_rx(0, PtpTime { seconds: 1, nanoseconds: 0 });
        assert_eq!(ts.ptp_packets_detected(), 0);
        ts.record_ptp_rx(0, PtpTime { seconds: 2, nanoseconds: 0 });
        assert_eq!(ts.ptp_packets_detected(), 1);
        assert_eq!(ts.queue_timestamps(0).unwrap().rx_count, 2);
    }

    #[test]
    fn out_of_range_queue_is_ignored() {
        let mut ts = PtpTimestamper::new(1);
        ts.record_rx(5, PtpTime::default());
        assert!(ts.queue_timestamps(5).is_none());
    }
}
