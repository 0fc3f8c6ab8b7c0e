//! DMA engine: single, burst, and scatter-gather transfers against [`HostMemory`].

use crate::hostmem::{HostAddress, HostMemory, HostMemoryError, HostMemoryResult};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    None,
    AccessError,
    AlignmentError,
    PermissionError,
    Timeout,
    Fault,
}

fn to_dma_error(err: HostMemoryError) -> DmaError {
    match err {
        HostMemoryError::OutOfBounds => DmaError::Fault,
        HostMemoryError::PermissionDenied => DmaError::PermissionError,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
pub struct DmaResult {
    pub error: DmaError,
    pub bytes_processed: usize,
}

impl DmaResult {
    pub fn ok(bytes: usize) -> Self {
        Self { error: DmaError::None, bytes_processed: bytes }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.error, DmaError::None)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SglEntry {
    pub address: HostAddress,
    pub length: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Sgl {
    pub entries: Vec<SglEntry>,
}

impl Sgl {
    pub fn total_length(&self) -> usize {
        self.entries.iter().map(|e| e.length).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DmaCounters {
    pub read_ops: u64,
    pub write_ops: u64,
    pub burst_read_ops: u64,
    pub burst_write_ops: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
}

pub struct DmaEngine<'a> {
    memory: &'a mut HostMemory,
    counters: DmaCounters,
}

impl<'a> DmaEngine<'a> {
    pub fn new(memory: &'a mut HostMemory) -> Self {
        Self { memory, counters: DmaCounters::default() }
    }

    pub fn counters(&self) -> DmaCounters {
        self.counters
    }

    pub fn read(&mut self, address: HostAddress, buffer: &mut [u8]) -> DmaResult {
        let host_result = self.memory.read(address, buffer);
        let result = self.map_result(host_result, buffer.len(), "dma_read");
        if result.is_ok() {
            self.counters.read_ops += 1;
            self.counters.bytes_read += result.bytes_processed as u64;
        }
        result
    }

    pub fn write(&mut self, address: HostAddress, data: &[u8]) -> DmaResult {
        let host_result = self.memory.write(address, data);
        let result = self.map_result(host_result, data.len(), "dma_write");
        if result.is_ok() {
            self.counters.write_ops += 1;
            self.counters.bytes_written += result.bytes_processed as u64;
        }
        result
    }

    pub fn read_burst(
        &mut self,
        address: HostAddress,
        buffer: &mut [u8],
        beat_bytes: usize,
        stride_bytes: usize,
    ) -> DmaResult {
        if beat_bytes == 0 || stride_bytes == 0 {
            self.counters.errors += 1;
            return DmaResult { error: DmaError::AlignmentError, bytes_processed: 0 };
        }
        if buffer.len() % beat_bytes != 0 {
            self.counters.errors += 1;
            return DmaResult { error: DmaError::AlignmentError, bytes_processed: 0 };
        }

        let beats = buffer.len() / beat_bytes;
        self.counters.burst_read_ops += 1;

        let mut total = 0usize;
        for beat_index in 0..beats {
            let offset = beat_index * beat_bytes;
            let beat = &mut buffer[offset..offset + beat_bytes];
            let beat_addr = address + (beat_index as u64 * stride_bytes as u64);
            let host_result = self.memory.read(beat_addr, beat);
            let result = self.map_result(host_result, beat_bytes, "dma_read_burst");
            if !result.is_ok() {
                return result;
            }
            total += result.bytes_processed;
        }

        self.counters.bytes_read += total as u64;
        DmaResult::ok(total)
    }

    pub fn write_burst(
        &mut self,
        address: HostAddress,
        data: &[u8],
        beat_bytes: usize,
        stride_bytes: usize,
    ) -> DmaResult {
        if beat_bytes == 0 || stride_bytes == 0 {
            self.counters.errors += 1;
            return DmaResult { error: DmaError::AlignmentError, bytes_processed: 0 };
        }
        if data.len() % beat_bytes != 0 {
            self.counters.errors += 1;
            return DmaResult { error: DmaError::AlignmentError, bytes_processed: 0 };
        }

        let beats = data.len() / beat_bytes;
        self.counters.burst_write_ops += 1;

        let mut total = 0usize;
        for beat_index in 0..beats {
            let offset = beat_index * beat_bytes;
            let beat = &data[offset..offset + beat_bytes];
            let beat_addr = address + (beat_index as u64 * stride_bytes as u64);
            let host_result = self.memory.write(beat_addr, beat);
            let result = self.map_result(host_result, beat_bytes, "dma_write_burst");
            if !result.is_ok() {
                return result;
            }
            total += result.bytes_processed;
        }

        self.counters.bytes_written += total as u64;
        DmaResult::ok(total)
    }

    pub fn transfer_sgl(
        &mut self,
        sgl: &Sgl,
        direction: DmaDirection,
        buffer: &mut [u8],
    ) -> DmaResult {
        if sgl.is_empty() {
            self.counters.errors += 1;
            return DmaResult { error: DmaError::AccessError, bytes_processed: 0 };
        }

        let total_length = sgl.total_length();
        if buffer.len() < total_length {
            self.counters.errors += 1;
            return DmaResult { error: DmaError::AccessError, bytes_processed: 0 };
        }

        let mut processed = 0usize;
        for entry in &sgl.entries {
            if entry.length == 0 {
                continue;
            }

            let chunk = &mut buffer[processed..processed + entry.length];
            let (host_result, context) = match direction {
                DmaDirection::Read => (self.memory.read(entry.address, chunk), "dma_sgl_read"),
                DmaDirection::Write => (self.memory.write(entry.address, chunk), "dma_sgl_write"),
            };

            let result = self.map_result(host_result, entry.length, context);
            if !result.is_ok() {
                return result;
            }
            processed += result.bytes_processed;
        }

        match direction {
            DmaDirection::Read => {
                self.counters.read_ops += 1;
                self.counters.bytes_read += processed as u64;
            }
            DmaDirection::Write => {
                self.counters.write_ops += 1;
                self.counters.bytes_written += processed as u64;
            }
        }

        DmaResult::ok(processed)
    }

    fn map_result(
        &mut self,
        host_result: HostMemoryResult,
        requested_bytes: usize,
        context: &'static str,
    ) -> DmaResult {
        if host_result.is_ok() {
            return DmaResult::ok(requested_bytes);
        }

        let error = to_dma_error(host_result.error.expect("checked above"));
        self.counters.errors += 1;
        warn!(context, ?error, "DMA error");
        DmaResult { error, bytes_processed: host_result.bytes_processed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_requires_aligned_buffer() {
        let mut mem = HostMemory::new(64);
        let mut engine = DmaEngine::new(&mut mem);
        let mut buf = [0u8; 5];
        let result = engine.read_burst(0, &mut buf, 4, 4);
        assert_eq!(result.error, DmaError::AlignmentError);
    }

    #[test]
    fn sgl_requires_sufficient_buffer() {
        let mut mem = HostMemory::new(64);
        let mut engine = DmaEngine::new(&mut mem);
        let sgl = Sgl { entries: vec![SglEntry { address: 0, length: 16 }] };
        let mut buf = [0u8; 8];
        let result = engine.transfer_sgl(&sgl, DmaDirection::Read, &mut buf);
        assert_eq!(result.error, DmaError::AccessError);
    }

    #[test]
    fn sgl_skips_zero_length_entries() {
        let mut mem = HostMemory::new(64);
        assert!(mem.write(0, &[7u8; 8]).is_ok());
        let mut engine = DmaEngine::new(&mut mem);
        let sgl = Sgl {
            entries: vec![
                SglEntry { address: 0, length: 0 },
                SglEntry { address: 0, length: 8 },
            ],
        };
        let mut buf = [0u8; 8];
        let result = engine.transfer_sgl(&sgl, DmaDirection::Read, &mut buf);
        assert!(result.is_ok());
        assert_eq!(result.bytes_processed, 8);
    }

    #[test]
    fn successful_transfers_only_bump_counters_on_success() {
        let mut mem = HostMemory::new(16);
        let mut engine = DmaEngine::new(&mut mem);
        let mut buf = [0u8; 4];
        // out of bounds
        let _ = engine.read(100, &mut buf);
        assert_eq!(engine.counters().read_ops, 0);
        assert_eq!(engine.counters().errors, 1);
        let _ = engine.read(0, &mut buf);
        assert_eq!(engine.counters().read_ops, 1);
    }
}
