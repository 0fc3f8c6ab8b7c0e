//! Logging bring-up (§5.1).
//!
//! The original control plane kept a process-wide `LogController` singleton
//! that any module could reach into and reconfigure at runtime. This crate
//! replaces that with `tracing`'s own global dispatcher, set exactly once at
//! process start: `init()` installs it, and nothing after that point can
//! swap it out from under in-flight subsystems.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs the global `tracing` subscriber, honoring `RUST_LOG` with a
/// `warn`-level default. Safe to call more than once; only the first call
/// takes effect, matching the write-once-at-construction guidance this
/// module exists to satisfy.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}
