//! Receive-side scaling: Toeplitz hash and indirection-table lookup (§4.4).

use serde::{Deserialize, Serialize};
use tracing::trace;

const DEFAULT_TOEPLITZ_KEY: [u8; 20] = [
    0x6D, 0x5A, 0x56, 0x6B, 0x65, 0x4E, 0x67, 0x6E, 0x67, 0x55, 0x6A, 0x6B, 0x61, 0x4F, 0x6B, 0x65,
    0x6F, 0x49, 0x4D, 0x42,
];
const DEFAULT_TABLE_SIZE: usize = 128;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RssConfig {
    pub key: Vec<u8>,
    pub table: Vec<u16>,
}

#[derive(Debug, Default, Clone)]
pub struct RssStats {
    pub hashes: u64,
    pub queue_hits: Vec<u64>,
}

pub struct RssEngine {
    config: RssConfig,
    stats: RssStats,
}

impl Default for RssEngine {
    fn default() -> Self {
        Self::new(RssConfig::default())
    }
}

impl RssEngine {
    pub fn new(mut config: RssConfig) -> Self {
        if config.key.is_empty() {
            config.key = DEFAULT_TOEPLITZ_KEY.to_vec();
        }
        if config.table.is_empty() {
            config.table = vec![0u16; DEFAULT_TABLE_SIZE];
        }
        let queue_hits = vec![0u64; config.table.len()];
        Self { config, stats: RssStats { hashes: 0, queue_hits } }
    }

    pub fn set_key(&mut self, mut key: Vec<u8>) {
        if key.is_empty() {
            key = DEFAULT_TOEPLITZ_KEY.to_vec();
        }
        self.config.key = key;
    }

    pub fn set_table(&mut self, mut table: Vec<u16>) {
        if table.is_empty() {
            table = vec![0u16; DEFAULT_TABLE_SIZE];
        }
        self.stats.queue_hits = vec![0u64; table.len()];
        self.config.table = table;
    }

    pub fn config(&self) -> &RssConfig {
        &self.config
    }

    pub fn stats(&self) -> &RssStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.hashes = 0;
        self.stats.queue_hits = vec![0u64; self.config.table.len()];
    }

    pub fn hash(&mut self, data: &[u8]) -> u32 {
        self.stats.hashes += 1;
        toeplitz_hash(&self.config.key, data)
    }

    pub fn select_queue(&mut self, data: &[u8]) -> Option<u16> {
        if self.config.table.is_empty() {
            return None;
        }
        let h = self.hash(data);
        let idx = (h % self.config.table.len() as u32) as usize;
        if idx < self.stats.queue_hits.len() {
            self.stats.queue_hits[idx] += 1;
        }
        trace!(hash = format!("{:#x}", h), queue = self.config.table[idx], "RSS");
        Some(self.config.table[idx])
    }
}

fn toeplitz_hash(key: &[u8], data: &[u8]) -> u32 {
    if key.is_empty() || data.is_empty() {
        return 0;
    }

    let key_bits = key.len() * 8;
    let data_bits = data.len() * 8;
    let mut hash_value: u32 = 0;

    let key_bit_at = |bit: usize| -> bool {
        let byte_idx = bit / 8;
        let bit_idx = 7 - (bit % 8);
        (key[byte_idx] >> bit_idx) & 1 != 0
    };

    for bit in 0..data_bits {
        let byte_idx = bit / 8;
        let bit_idx = 7 - (bit % 8);
        let data_bit = (data[byte_idx] >> bit_idx) & 1 != 0;
        if !data_bit {
            continue;
        }

        let mut segment: u32 = 0;
        for k in 0..32 {
            let key_bit = (bit + k) % key_bits;
            segment = (segment << 1) | (key_bit_at(key_bit) as u32);
        }
        hash_value ^= segment;
    }

    hash_value
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn hash_is_pure_function_of_key_and_data(data in proptest::collection::vec(any::<u8>(), 1..64)) {
            let key = DEFAULT_TOEPLITZ_KEY.to_vec();
            let a = toeplitz_hash(&key, &data);
            let b = toeplitz_hash(&key, &data);
            prop_assert_eq!(a, b);
        }
    }
}
