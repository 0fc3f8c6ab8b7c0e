//! IEEE 802.3x pause and 802.1Qbb PFC frame parsing/generation (§4.6, §6).

use serde::{Deserialize, Serialize};

pub const PAUSE_DEST_MAC: [u8; 6] = [0x01, 0x80, 0xC2, 0x00, 0x00, 0x01];
pub const ETHERTYPE_FLOW_CONTROL: u16 = 0x8808;
pub const OPCODE_CLASSIC_PAUSE: u16 = 0x0001;
pub const OPCODE_PFC: u16 = 0x0101;
pub const PFC_PRIORITIES: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct PauseFrame {
    pub pause_time: u16,
}

impl PauseFrame {
    pub fn is_pause_frame(bytes: &[u8]) -> bool {
        bytes.len() >= 16
            && bytes[0..6] == PAUSE_DEST_MAC
            && u16::from_be_bytes([bytes[12], bytes[13]]) == ETHERTYPE_FLOW_CONTROL
            && u16::from_be_bytes([bytes[14], bytes[15]]) == OPCODE_CLASSIC_PAUSE
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if !Self::is_pause_frame(bytes) || bytes.len() < 18 {
            return None;
        }
        Some(Self { pause_time: u16::from_be_bytes([bytes[16], bytes[17]]) })
    }

    pub fn serialize(&self) -> [u8; 64] {
        let mut frame = [0u8; 64];
        frame[0..6].copy_from_slice(&PAUSE_DEST_MAC);
        frame[12..14].copy_from_slice(&ETHERTYPE_FLOW_CONTROL.to_be_bytes());
        frame[14..16].copy_from_slice(&OPCODE_CLASSIC_PAUSE.to_be_bytes());
        frame[16..18].copy_from_slice(&self.pause_time.to_be_bytes());
        frame
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PfcFrame {
    pub enabled_priorities: u8,
    pub pause_times: [u16; PFC_PRIORITIES],
}

impl PfcFrame {
    pub fn is_pfc_frame(bytes: &[u8]) -> bool {
        bytes.len() >= 16
            && bytes[0..6] == PAUSE_DEST_MAC
            && u16::from_be_bytes([bytes[12], bytes[13]]) == ETHERTYPE_FLOW_CONTROL
            && u16::from_be_bytes([bytes[14], bytes[15]]) == OPCODE_PFC
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if !Self::is_pfc_frame(bytes) || bytes.len() < 34 {
            return None;
        }
        let enabled_priorities = bytes[16];
        let mut pause_times = [0u16; PFC_PRIORITIES];
        for (i, slot) in pause_times.iter_mut().enumerate() {
            let offset = 18 + i * 2;
            *slot = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        }
        Some(Self { enabled_priorities, pause_times })
    }

    pub fn serialize(&self) -> [u8; 64] {
        let mut frame = [0u8; 64];
        frame[0..6].copy_from_slice(&PAUSE_DEST_MAC);
        frame[12..14].copy_from_slice(&ETHERTYPE_FLOW_CONTROL.to_be_bytes());
        frame[14..16].copy_from_slice(&OPCODE_PFC.to_be_bytes());
        frame[16] = self.enabled_priorities;
        frame[17] = 0;
        for (i, time) in self.pause_times.iter().enumerate() {
            let offset = 18 + i * 2;
            frame[offset..offset + 2].copy_from_slice(&time.to_be_bytes());
        }
        frame
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlConfig {
    pub rx_pause_enabled: bool,
    pub pause_threshold: u32,
    pub resume_threshold: u32,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self { rx_pause_enabled: true, pause_threshold: 768, resume_threshold: 256 }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlowControlStats {
    pub total_paused_time_quanta: u64,
    pub pauses_sent: u64,
    pub pauses_received: u64,
}

pub struct FlowControlManager {
    config: FlowControlConfig,
    pause_timer: u32,
    pause_sent: bool,
    stats: FlowControlStats,
}

impl FlowControlManager {
    pub fn new(config: FlowControlConfig) -> Self {
        Self { config, pause_timer: 0, pause_sent: false, stats: FlowControlStats::default() }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_timer > 0
    }

    pub fn stats(&self) -> FlowControlStats {
        self.stats
    }

    pub fn on_pause_frame_received(&mut self, frame: &PauseFrame) {
        if !self.config.rx_pause_enabled {
            return;
        }
        self.pause_timer = frame.pause_time as u32;
        self.stats.pauses_received += 1;
    }

    pub fn tick(&mut self, quanta: u32) {
        let decrement = quanta.min(self.pause_timer);
        self.pause_timer -= decrement;
        self.stats.total_paused_time_quanta += decrement as u64;
    }

    pub fn generate_pause_frame(&mut self, depth: u32) -> Option<PauseFrame> {
        if depth >= self.config.pause_threshold && !self.pause_sent {
            self.pause_sent = true;
            self.stats.pauses_sent += 1;
            return Some(PauseFrame { pause_time: 0xFFFF });
        }
        if depth < self.config.resume_threshold && self.pause_sent {
            self.pause_sent = false;
            return Some(PauseFrame { pause_time: 0 });
        }
        None
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PfcPriorityConfig {
    pub pause_threshold: u32,
    pub resume_threshold: u32,
    pub default_pause_time: u16,
}

impl Default for PfcPriorityConfig {
    fn default() -> Self {
        Self { pause_threshold: 768, resume_threshold: 256, default_pause_time: 256 }
    }
}

pub struct PfcManager {
    configs: [PfcPriorityConfig; PFC_PRIORITIES],
    timers: [u32; PFC_PRIORITIES],
    sent: [bool; PFC_PRIORITIES],
}

impl PfcManager {
    pub fn new(configs: [PfcPriorityConfig; PFC_PRIORITIES]) -> Self {
        Self { configs, timers: [0; PFC_PRIORITIES], sent: [false; PFC_PRIORITIES] }
    }

    pub fn is_paused(&self, priority: usize) -> bool {
        self.timers[priority] > 0
    }

    pub fn on_pfc_frame_received(&mut self, frame: &PfcFrame) {
        for i in 0..PFC_PRIORITIES {
            if frame.enabled_priorities & (1 << i) != 0 {
                self.timers[i] = frame.pause_times[i] as u32;
            }
        }
    }

    pub fn tick(&mut self, quanta: u32) {
        for timer in &mut self.timers {
            let decrement = quanta.min(*timer);
            *timer -= decrement;
        }
    }

    pub fn generate_pfc_frame(&mut self, priority: usize, depth: u32) -> Option<PfcFrame> {
        let config = self.configs[priority];
        let clear = config.pause_threshold / 2;

        if depth >= config.pause_threshold && !self.sent[priority] {
            self.sent[priority] = true;
            let mut pause_times = [0u16; PFC_PRIORITIES];
            pause_times[priority] = config.default_pause_time;
            return Some(PfcFrame { enabled_priorities: 1 << priority, pause_times });
        }
        if depth < clear && self.sent[priority] {
            self.sent[priority] = false;
            let pause_times = [0u16; PFC_PRIORITIES];
            return Some(PfcFrame { enabled_priorities: 1 << priority, pause_times });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_pause_round_trip() {
        let frame = PauseFrame { pause_time: 356 };
        assert!(PauseFrame::is_pause_frame(&frame.serialize()));
        let parsed = PauseFrame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed.pause_time, 356);
        let bytes = frame.serialize();
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[12..14], &[0x88, 0x08]);
        assert_eq!(&bytes[14..16], &[0x00, 0x01]);
        assert_eq!(&bytes[16..18], &[0x01, 0x64]);
    }

    #[test]
    fn s4_pfc_hysteresis() {
        let mut configs = [PfcPriorityConfig { pause_threshold: 0, resume_threshold: 0, default_pause_time: 0 };
            PFC_PRIORITIES];
        configs[0] = PfcPriorityConfig { pause_threshold: 100, resume_threshold: 0, default_pause_time: 120 };
        let mut mgr = PfcManager::new(configs);

        let pause = mgr.generate_pfc_frame(0, 120).unwrap();
        assert_eq!(pause.enabled_priorities & 0b1, 1);
        assert_eq!(pause.pause_times[0], 120);

        let resume = mgr.generate_pfc_frame(0, 10).unwrap();
        assert_eq!(resume.pause_times[0], 0);
    }

    #[test]
    fn flow_control_pause_then_resume() {
        let mut mgr = FlowControlManager::new(FlowControlConfig {
            rx_pause_enabled: true,
            pause_threshold: 50,
            resume_threshold: 10,
        });
        assert!(mgr.generate_pause_frame(60).is_some());
        assert!(mgr.generate_pause_frame(60).is_none());
        assert!(mgr.generate_pause_frame(5).is_some());
    }

    #[test]
    fn rx_pause_ignored_when_disabled() {
        let mut mgr = FlowControlManager::new(FlowControlConfig {
            rx_pause_enabled: false,
            pause_threshold: 50,
            resume_threshold: 10,
        });
        mgr.on_pause_frame_received(&PauseFrame { pause_time: 500 });
        assert!(!mgr.is_paused());
    }
}
