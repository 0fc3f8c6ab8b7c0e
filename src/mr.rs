//! Registered memory regions keyed by lkey/rkey, per §3.3.

use bitflags::bitflags;
use std::collections::HashMap;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u8 {
        const LOCAL_READ = 0b0000_0001;
        const LOCAL_WRITE = 0b0000_0010;
        const REMOTE_READ = 0b0000_0100;
        const REMOTE_WRITE = 0b0000_1000;
        const ATOMIC = 0b0001_0000;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub lkey: u32,
    pub rkey: u32,
    pub pd_handle: u32,
    pub start_address: u64,
    pub length: u64,
    pub access_flags: AccessFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MrError {
    NotFound,
    PdMismatch,
    OutOfRange,
    AccessDenied,
}

#[derive(Default)]
pub struct MemoryRegionTable {
    by_lkey: HashMap<u32, MemoryRegion>,
    by_rkey: HashMap<u32, MemoryRegion>,
}

impl MemoryRegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, region: MemoryRegion) {
        self.by_lkey.insert(region.lkey, region);
        self.by_rkey.insert(region.rkey, region);
    }

    pub fn deregister_lkey(&mut self, lkey: u32) {
        if let Some(region) = self.by_lkey.remove(&lkey) {
            self.by_rkey.remove(&region.rkey);
        }
    }

    /// Validate a `[addr, addr+len)` access against the region addressed by
    /// `lkey`, with `pd_handle` required to match and `required` the access
    /// flag the operation direction demands.
    pub fn validate_lkey(
        &self,
        lkey: u32,
        pd_handle: u32,
        addr: u64,
        len: u64,
        required: AccessFlags,
    ) -> Result<MemoryRegion, MrError> {
        let region = self.by_lkey.get(&lkey).ok_or(MrError::NotFound)?;
        Self::validate_region(region, pd_handle, addr, len, required)
    }

    pub fn validate_rkey(
        &self,
        rkey: u32,
        addr: u64,
        len: u64,
        required: AccessFlags,
    ) -> Result<MemoryRegion, MrError> {
        let region = self.by_rkey.get(&rkey).ok_or(MrError::NotFound)?;
        // Remote access is not bound to a requester's PD; the PD check only
        // applies to local (lkey) operations performed by the region's own
        // QP context.
        Self::validate_region(region, region.pd_handle, addr, len, required)
    }

    fn validate_region(
        region: &MemoryRegion,
        pd_handle: u32,
        addr: u64,
        len: u64,
        required: AccessFlags,
    ) -> Result<MemoryRegion, MrError> {
        if region.pd_handle != pd_handle {
            return Err(MrError::PdMismatch);
        }
        let end = addr.checked_add(len).ok_or(MrError::OutOfRange)?;
        let region_end = region.start_address.checked_add(region.length).ok_or(MrError::OutOfRange)?;
        if addr < region.start_address || end > region_end {
            return Err(MrError::OutOfRange);
        }
        if !region.access_flags.contains(required) {
            return Err(MrError::AccessDenied);
        }
        Ok(*region)
    }
}
