//! Crate-wide error types for construction and configuration failures.
//!
//! Per-operation outcomes (DMA errors, completion status, RDMA WQE status,
//! AETH syndromes, admin status codes) are plain `Copy` enums returned by
//! value from their own modules; they are not wrapped in `NicError` because
//! they are expected results, not failures of the simulation itself.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NicError {
    #[error("invalid device configuration: {0}")]
    Config(String),

    #[error("failed to parse device configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("register offset {0:#06x} is out of range")]
    BadRegisterOffset(u32),

    #[error("queue id {0} exceeds configured queue count")]
    QueueOutOfRange(u16),

    #[error("no memory region registered for key {0:#x}")]
    UnknownMemoryRegion(u32),
}

pub type Result<T> = std::result::Result<T, NicError>;
