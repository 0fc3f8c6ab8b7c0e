//! `softnic` bring-up binary: loads a `DeviceConfig` from a JSON file (or
//! runs with defaults if none is given) and brings up a `Device`.
//!
//! This is the one place in the crate allowed to log at `error` and exit
//! non-zero (§5.1) — everywhere else a fault is an expected, completion- or
//! CQE-shaped outcome, never a process abort.

use std::path::PathBuf;

use softnic::{Device, DeviceConfig};
use tracing::{error, info};

fn load_config(path: Option<PathBuf>) -> DeviceConfig {
    let Some(path) = path else {
        return DeviceConfig::default();
    };

    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to read device config");
            std::process::exit(1);
        }
    };

    match DeviceConfig::from_json(&text) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to parse device config");
            std::process::exit(1);
        }
    }
}

fn main() {
    softnic::logging::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path);

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid device config");
        std::process::exit(1);
    }

    let mut device = match Device::new(config) {
        Ok(device) => device,
        Err(e) => {
            error!(error = %e, "failed to bring up device");
            std::process::exit(1);
        }
    };

    info!(queues = device.eth_queue_count(), "device ready");

    // The simulated device has no external packet source of its own; a
    // real deployment would drive `device` from a driver-facing transport
    // (vhost, a TUN device, or a test harness) rather than running it here.
    device.tick(0);
}
