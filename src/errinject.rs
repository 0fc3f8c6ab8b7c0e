//! Controlled fault injection for testing error paths (§4.8).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    None,
    DmaReadFail,
    DmaWriteFail,
    InvalidDescriptor,
    ChecksumError,
    QueueFull,
    Timeout,
}

pub const WILDCARD_QUEUE: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy)]
pub struct ErrorConfig {
    pub error_type: ErrorType,
    pub target_queue: u16,
    pub trigger_count: u32,
    pub inject_count: u32,
    pub one_shot: bool,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            error_type: ErrorType::None,
            target_queue: 0,
            trigger_count: 0,
            inject_count: 1,
            one_shot: true,
        }
    }
}

struct ActiveError {
    config: ErrorConfig,
    operation_count: AtomicU32,
    inject_count: AtomicU32,
    enabled: AtomicBool,
}

#[derive(Default)]
pub struct ErrorInjector {
    active_errors: Vec<ActiveError>,
}

impl ErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&mut self, config: ErrorConfig) {
        if config.error_type == ErrorType::None {
            return;
        }
        self.active_errors.push(ActiveError {
            config,
            operation_count: AtomicU32::new(0),
            inject_count: AtomicU32::new(0),
            enabled: AtomicBool::new(true),
        });
    }

    pub fn should_inject(&self, error_type: ErrorType, queue_id: u16) -> bool {
        for error in &self.active_errors {
            if error.config.error_type != error_type {
                continue;
            }
            if !error.enabled.load(Ordering::Relaxed) {
                continue;
            }
            if error.config.target_queue != WILDCARD_QUEUE && error.config.target_queue != queue_id
            {
                continue;
            }

            let ops = error.operation_count.fetch_add(1, Ordering::Relaxed);
            if ops < error.config.trigger_count {
                continue;
            }

            if error.config.one_shot {
                let injected = error.inject_count.fetch_add(1, Ordering::Relaxed);
                if injected >= error.config.inject_count {
                    error.enabled.store(false, Ordering::Relaxed);
                    continue;
                }
            }

            warn!(?error_type, queue_id, "error injected");
            return true;
        }
        false
    }

    pub fn disable_all(&mut self) {
        for error in &self.active_errors {
            error.enabled.store(false, Ordering::Relaxed);
        }
        self.active_errors.clear();
    }

    pub fn active_errors(&self) -> Vec<ErrorConfig> {
        self.active_errors
            .iter()
            .filter(|e| e.enabled.load(Ordering::Relaxed))
            .map(|e| e.config)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_one_shot_injects_once_then_disables() {
        let mut injector = ErrorInjector::new();
        injector.configure(ErrorConfig {
            error_type: ErrorType::ChecksumError,
            target_queue: WILDCARD_QUEUE,
            trigger_count: 0,
            inject_count: 1,
            one_shot: true,
        });
        assert!(injector.should_inject(ErrorType::ChecksumError, 3));
        assert!(!injector.should_inject(ErrorType::ChecksumError, 3));
    }

    #[test]
    fn continuous_error_ignores_inject_count() {
        let mut injector = ErrorInjector::new();
        injector.configure(ErrorConfig {
            error_type: ErrorType::Timeout,
            target_queue: WILDCARD_QUEUE,
            trigger_count: 0,
            inject_count: 1,
            one_shot: false,
        });
        for _ in 0..10 {
            assert!(injector.should_inject(ErrorType::Timeout, 0));
        }
    }

    #[test]
    fn trigger_count_delays_first_injection() {
        let mut injector = ErrorInjector::new();
        injector.configure(ErrorConfig {
            error_type: ErrorType::QueueFull,
            target_queue: WILDCARD_QUEUE,
            trigger_count: 2,
            inject_count: 1,
            one_shot: true,
        });
        assert!(!injector.should_inject(ErrorType::QueueFull, 0));
        assert!(!injector.should_inject(ErrorType::QueueFull, 0));
        assert!(injector.should_inject(ErrorType::QueueFull, 0));
    }

    #[test]
    fn queue_targeting_respects_wildcard() {
        let mut injector = ErrorInjector::new();
        injector.configure(ErrorConfig {
            error_type: ErrorType::InvalidDescriptor,
            target_queue: 5,
            trigger_count: 0,
            inject_count: 1,
            one_shot: true,
        });
        assert!(!injector.should_inject(ErrorType::InvalidDescriptor, 1));
        assert!(injector.should_inject(ErrorType::InvalidDescriptor, 5));
    }
}
