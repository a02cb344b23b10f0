//! Acquisition engine: owns the spectrum spec, sample buffer, progress
//! counter, and state machine, and supervises the background generator.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use flume::Sender;
use jiff::Timestamp;

use crate::generator::{self, Shared};
use crate::spectrum::{SpectrumError, SpectrumSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Validated,
    Running,
    Paused,
    Finished,
    Aborted,
    Error,
}

impl EngineState {
    /// Lowercase spelling used in `ControllerStatus`/`ControllerState`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Validated => "validated",
            EngineState::Running => "running",
            EngineState::Paused => "paused",
            EngineState::Finished => "finished",
            EngineState::Aborted => "aborted",
            EngineState::Error => "error",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum EngineError {
    InvalidParameters(String),
    NoSpectrumDefined,
    NotValidated,
    AlreadyRunning,
    NotRunning,
    NotPaused,
    NothingToAbort,
    InvalidRange,
    ClearWhileRunning,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidParameters(msg) => write!(f, "invalid spectrum parameters: {msg}"),
            EngineError::NoSpectrumDefined => write!(f, "no spectrum defined"),
            EngineError::NotValidated => write!(f, "spectrum not validated"),
            EngineError::AlreadyRunning => write!(f, "acquisition already running"),
            EngineError::NotRunning => write!(f, "no acquisition running"),
            EngineError::NotPaused => write!(f, "acquisition not paused"),
            EngineError::NothingToAbort => write!(f, "no acquisition to abort"),
            EngineError::InvalidRange => write!(f, "invalid data range"),
            EngineError::ClearWhileRunning => {
                write!(f, "cannot clear spectrum while acquisition is active")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<SpectrumError> for EngineError {
    fn from(e: SpectrumError) -> Self {
        match e {
            SpectrumError::InvalidParameters(msg) => EngineError::InvalidParameters(msg),
        }
    }
}

pub struct StatusSnapshot {
    pub state: EngineState,
    pub acquired_samples: usize,
    pub elapsed_seconds: f64,
    pub current_iteration: u32,
    pub error: Option<String>,
}

pub struct AcquisitionEngine {
    time_scale: f64,
    noise_seed: u64,
    start_count: u64,
    spec: Option<SpectrumSpec>,
    defined: bool,
    validated: bool,
    shared: Arc<Mutex<Shared>>,
    generator_handle: Option<JoinHandle<()>>,
    exit_tx: Option<Sender<()>>,
}

impl AcquisitionEngine {
    pub fn new(time_scale: f64, noise_seed: u64) -> Self {
        AcquisitionEngine {
            time_scale,
            noise_seed,
            start_count: 0,
            spec: None,
            defined: false,
            validated: false,
            shared: Arc::new(Mutex::new(Shared::new())),
            generator_handle: None,
            exit_tx: None,
        }
    }

    fn state(&self) -> EngineState {
        generator::lock(&self.shared).state
    }

    pub fn spectrum(&self) -> Option<&SpectrumSpec> {
        self.spec.as_ref()
    }

    /// Structural validation without storing the spec; backs the `Check*`
    /// family of commands.
    pub fn check(&self, spec: &SpectrumSpec) -> Result<(), EngineError> {
        spec.validate()?;
        Ok(())
    }

    pub fn define(&mut self, spec: SpectrumSpec) -> Result<(), EngineError> {
        spec.validate()?;
        self.cancel_generator_if_active();
        self.spec = Some(spec);
        self.defined = true;
        self.validated = false;
        let mut g = generator::lock(&self.shared);
        g.buffer.clear();
        g.progress = 0;
        g.state = EngineState::Idle;
        g.error = None;
        Ok(())
    }

    pub fn validate(&mut self) -> Result<&SpectrumSpec, EngineError> {
        if !self.defined {
            return Err(EngineError::NoSpectrumDefined);
        }
        self.validated = true;
        generator::lock(&self.shared).state = EngineState::Validated;
        Ok(self.spec.as_ref().expect("defined implies spec present"))
    }

    pub fn clear(&mut self) -> Result<(), EngineError> {
        match self.state() {
            EngineState::Idle
            | EngineState::Validated
            | EngineState::Finished
            | EngineState::Aborted
            | EngineState::Error => {
                self.spec = None;
                self.defined = false;
                self.validated = false;
                let mut g = generator::lock(&self.shared);
                g.buffer.clear();
                g.progress = 0;
                g.state = EngineState::Idle;
                g.error = None;
                Ok(())
            }
            EngineState::Running | EngineState::Paused => Err(EngineError::ClearWhileRunning),
        }
    }

    /// Forces the engine back to `Idle` regardless of its current state,
    /// cancelling any active generator first. Used for `Disconnect` and
    /// connection loss, which must tear acquisition state down unconditionally.
    pub fn force_idle(&mut self) {
        self.cancel_generator_if_active();
        self.spec = None;
        self.defined = false;
        self.validated = false;
        let mut g = generator::lock(&self.shared);
        g.buffer.clear();
        g.progress = 0;
        g.state = EngineState::Idle;
        g.error = None;
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        if !self.validated {
            return Err(EngineError::NotValidated);
        }
        match self.state() {
            EngineState::Validated | EngineState::Finished | EngineState::Aborted => {}
            EngineState::Running | EngineState::Paused | EngineState::Error => {
                return Err(EngineError::AlreadyRunning);
            }
            EngineState::Idle => return Err(EngineError::NotValidated),
        }

        let spec = self
            .spec
            .clone()
            .expect("validated implies spec present");

        {
            let mut g = generator::lock(&self.shared);
            g.buffer = Vec::with_capacity(spec.total_values());
            g.progress = 0;
            g.started_at = Some(Timestamp::now());
            g.error = None;
            g.state = EngineState::Running;
        }

        self.start_count += 1;
        let seed = self.noise_seed.wrapping_add(self.start_count);
        let (exit_tx, exit_rx) = flume::bounded(0);
        self.exit_tx = Some(exit_tx);
        self.generator_handle = Some(generator::spawn(
            spec,
            Arc::clone(&self.shared),
            self.time_scale,
            seed,
            exit_rx,
        ));
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), EngineError> {
        let mut g = generator::lock(&self.shared);
        if g.state != EngineState::Running {
            return Err(EngineError::NotRunning);
        }
        g.state = EngineState::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), EngineError> {
        let mut g = generator::lock(&self.shared);
        if g.state != EngineState::Paused {
            return Err(EngineError::NotPaused);
        }
        g.state = EngineState::Running;
        Ok(())
    }

    pub fn abort(&mut self) -> Result<(), EngineError> {
        {
            let mut g = generator::lock(&self.shared);
            if !matches!(g.state, EngineState::Running | EngineState::Paused) {
                return Err(EngineError::NothingToAbort);
            }
            g.state = EngineState::Aborted;
        }
        self.join_generator();
        Ok(())
    }

    /// Signals the exit channel (waking a paused generator immediately
    /// rather than waiting for the next poll interval) and blocks until the
    /// generator thread has quiesced.
    fn join_generator(&mut self) {
        if let Some(exit_tx) = self.exit_tx.take() {
            exit_tx.send(()).ok();
        }
        if let Some(handle) = self.generator_handle.take() {
            handle.join().ok();
        }
    }

    fn cancel_generator_if_active(&mut self) {
        let should_join = {
            let mut g = generator::lock(&self.shared);
            if matches!(g.state, EngineState::Running | EngineState::Paused) {
                g.state = EngineState::Aborted;
                true
            } else {
                false
            }
        };
        if should_join {
            self.join_generator();
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        let g = generator::lock(&self.shared);
        let elapsed_seconds = g
            .started_at
            .map(|t| Timestamp::now().duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        StatusSnapshot {
            state: g.state,
            acquired_samples: g.progress,
            elapsed_seconds,
            current_iteration: 1,
            error: g.error.clone(),
        }
    }

    pub fn buffer_len(&self) -> usize {
        generator::lock(&self.shared).buffer.len()
    }

    pub fn read(&self, from: usize, to: usize) -> Result<Vec<f64>, EngineError> {
        let g = generator::lock(&self.shared);
        let buffer_len = g.buffer.len();
        if buffer_len == 0 || from > to || to >= buffer_len {
            return Err(EngineError::InvalidRange);
        }
        Ok(g.buffer[from..=to].to_vec())
    }
}

impl Drop for AcquisitionEngine {
    fn drop(&mut self) {
        self.cancel_generator_if_active();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::{build_from_request, SpectrumMode};
    use crate::codec::Request;
    use std::collections::HashMap;
    use std::time::Duration;

    fn fat_request(start: f64, end: f64, step: f64, dwell: f64) -> Request {
        let mut params = HashMap::new();
        params.insert("StartEnergy".to_string(), crate::codec::Value::Float(start));
        params.insert("EndEnergy".to_string(), crate::codec::Value::Float(end));
        params.insert("StepWidth".to_string(), crate::codec::Value::Float(step));
        params.insert("DwellTime".to_string(), crate::codec::Value::Float(dwell));
        params.insert("PassEnergy".to_string(), crate::codec::Value::Float(20.0));
        Request {
            id: "0001".to_string(),
            command: "DefineSpectrumFAT".to_string(),
            params,
        }
    }

    #[test]
    fn full_lifecycle_reaches_finished() {
        let mut engine = AcquisitionEngine::new(1000.0, 1);
        let spec = build_from_request(SpectrumMode::Fat, &fat_request(400.0, 402.0, 0.5, 0.001));
        engine.define(spec).unwrap();
        engine.validate().unwrap();
        engine.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let status = engine.status();
            if status.state == EngineState::Finished {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "acquisition never finished");
            std::thread::sleep(Duration::from_millis(5));
        }

        let data = engine.read(0, 4).unwrap();
        assert_eq!(data.len(), 5);
        assert!(data.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn start_without_validation_fails() {
        let mut engine = AcquisitionEngine::new(1.0, 1);
        assert!(matches!(engine.start(), Err(EngineError::NotValidated)));
    }

    #[test]
    fn double_start_fails_with_already_running() {
        let mut engine = AcquisitionEngine::new(1.0, 1);
        let spec = build_from_request(SpectrumMode::Fat, &fat_request(400.0, 450.0, 0.5, 1.0));
        engine.define(spec).unwrap();
        engine.validate().unwrap();
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning)));
        engine.abort().unwrap();
    }

    #[test]
    fn pause_resume_does_not_change_progress() {
        let mut engine = AcquisitionEngine::new(1.0, 1);
        let spec = build_from_request(SpectrumMode::Fat, &fat_request(400.0, 450.0, 0.5, 1.0));
        engine.define(spec).unwrap();
        engine.validate().unwrap();
        engine.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        engine.pause().unwrap();
        let before = engine.status().acquired_samples;
        std::thread::sleep(Duration::from_millis(50));
        let after = engine.status().acquired_samples;
        assert_eq!(before, after);
        engine.resume().unwrap();
        engine.abort().unwrap();
    }

    #[test]
    fn abort_from_idle_fails() {
        let mut engine = AcquisitionEngine::new(1.0, 1);
        assert!(matches!(engine.abort(), Err(EngineError::NothingToAbort)));
    }

    #[test]
    fn clear_while_running_is_rejected() {
        let mut engine = AcquisitionEngine::new(1.0, 1);
        let spec = build_from_request(SpectrumMode::Fat, &fat_request(400.0, 450.0, 0.5, 1.0));
        engine.define(spec).unwrap();
        engine.validate().unwrap();
        engine.start().unwrap();
        assert!(matches!(engine.clear(), Err(EngineError::ClearWhileRunning)));
        engine.abort().unwrap();
        engine.clear().unwrap();
    }

    #[test]
    fn invalid_range_is_rejected() {
        let mut engine = AcquisitionEngine::new(1000.0, 1);
        let spec = build_from_request(SpectrumMode::Fat, &fat_request(400.0, 402.0, 0.5, 0.001));
        engine.define(spec).unwrap();
        engine.validate().unwrap();
        engine.start().unwrap();
        std::thread::sleep(Duration::from_millis(200));
        assert!(matches!(engine.read(4, 2), Err(EngineError::InvalidRange)));
    }
}
