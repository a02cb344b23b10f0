//! Process-startup configuration: listen address, parameter file location,
//! and the acquisition engine's test-determinism knobs. Loaded once via a
//! `confy`-style load-or-default, then overridable by environment variables.

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 7010;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub host: String,
    pub port: u16,
    pub parameter_file: String,
    /// Dwell-time divisor: `1.0` runs acquisitions at real-world speed;
    /// values above `1.0` accelerate them for tests and demos.
    pub time_scale: f64,
    pub noise_seed: u64,
    pub analyzer_visible_name: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            parameter_file: "parameters.dat".to_string(),
            time_scale: 1.0,
            noise_seed: 0x5EED_C0DE,
            analyzer_visible_name: "KREIOS-150".to_string(),
        }
    }
}

impl SimulatorConfig {
    /// Applies `SIMULATOR_HOST`/`SIMULATOR_PORT` environment overrides on top
    /// of an already-loaded configuration. An unparsable `SIMULATOR_PORT` is
    /// logged and ignored rather than treated as fatal.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("SIMULATOR_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("SIMULATOR_PORT") {
            match port.parse() {
                Ok(p) => self.port = p,
                Err(_) => log::warn!("ignoring malformed SIMULATOR_PORT={port:?}"),
            }
        }
        self
    }

    pub fn listen_addr(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

/// Loads the named config file if present, falling back to `Default` rather
/// than failing startup, mirroring the load-or-default pattern this codebase
/// otherwise gets from `confy`.
pub fn load(app_name: &str) -> SimulatorConfig {
    confy::load(app_name, None).unwrap_or_else(|e| {
        log::warn!("could not load config ({e}), using defaults");
        SimulatorConfig::default()
    })
}
