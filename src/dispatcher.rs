//! Routes a parsed request to the engine/parameter store, enforces
//! connection and state preconditions, and maps domain errors to wire codes.

use crate::codec::{format_error, format_ok, Request, Value};
use crate::config::SimulatorConfig;
use crate::engine::{AcquisitionEngine, EngineError};
use crate::param_store::{ParameterStore, ParameterStoreError};
use crate::spectrum::{self, SpectrumMode};

pub const SERVER_NAME: &str = "SpecsLab Prodigy Simulator";
pub const PROTOCOL_VERSION: &str = "1.2";

pub enum DispatchOutcome {
    Respond(String),
    RespondAndDisconnect(String),
}

pub struct Dispatcher {
    pub engine: AcquisitionEngine,
    pub store: ParameterStore,
    connected: bool,
    analyzer_visible_name: String,
}

impl Dispatcher {
    pub fn new(engine: AcquisitionEngine, store: ParameterStore, config: &SimulatorConfig) -> Self {
        Dispatcher {
            engine,
            store,
            connected: false,
            analyzer_visible_name: config.analyzer_visible_name.clone(),
        }
    }

    pub fn dispatch(&mut self, req: Request) -> DispatchOutcome {
        if req.command != "Connect" && !self.connected {
            return DispatchOutcome::Respond(format_error(&req.id, 3, "You are not connected."));
        }

        match req.command.as_str() {
            "Connect" => self.connect(&req),
            "Disconnect" => self.disconnect(&req),

            "DefineSpectrumFAT" => self.define(&req, SpectrumMode::Fat),
            "DefineSpectrumSFAT" => self.define(&req, SpectrumMode::Sfat),
            "DefineSpectrumFRR" => self.define(&req, SpectrumMode::Frr),
            "DefineSpectrumFE" => self.define(&req, SpectrumMode::Fe),
            "DefineSpectrumLVS" => self.define(&req, SpectrumMode::Lvs),

            "CheckSpectrumFAT" => self.check(&req, SpectrumMode::Fat),
            "CheckSpectrumSFAT" => self.check(&req, SpectrumMode::Sfat),
            "CheckSpectrumFRR" => self.check(&req, SpectrumMode::Frr),
            "CheckSpectrumFE" => self.check(&req, SpectrumMode::Fe),
            "CheckSpectrumLVS" => self.check(&req, SpectrumMode::Lvs),

            "ValidateSpectrum" => self.validate_spectrum(&req),
            "ClearSpectrum" => self.clear_spectrum(&req),

            "Start" => self.start(&req),
            "Pause" => self.pause(&req),
            "Resume" => self.resume(&req),
            "Abort" => self.abort(&req),

            "GetAcquisitionStatus" => self.get_status(&req),
            "GetAcquisitionData" => self.get_data(&req),

            "GetAllAnalyzerParameterNames" => self.get_all_parameter_names(&req),
            "GetAnalyzerParameterInfo" => self.get_parameter_info(&req),
            "GetAnalyzerVisibleName" => self.get_analyzer_visible_name(&req),
            "GetAnalyzerParameterValue" => self.get_parameter_value(&req),
            "SetAnalyzerParameterValue" => self.set_parameter_value(&req),

            other => DispatchOutcome::Respond(format_error(
                &req.id,
                101,
                &format!("Unknown command: {other}"),
            )),
        }
    }

    fn connect(&mut self, req: &Request) -> DispatchOutcome {
        if self.connected {
            return DispatchOutcome::Respond(format_error(
                &req.id,
                2,
                "Already connected to a TCP client.",
            ));
        }
        self.connected = true;
        DispatchOutcome::Respond(format_ok(
            &req.id,
            &[
                ("ServerName", Value::Str(SERVER_NAME.to_string())),
                ("ProtocolVersion", Value::Word(PROTOCOL_VERSION.to_string())),
            ],
        ))
    }

    fn disconnect(&mut self, req: &Request) -> DispatchOutcome {
        self.connected = false;
        self.engine.force_idle();
        DispatchOutcome::RespondAndDisconnect(format_ok(&req.id, &[]))
    }

    fn define(&mut self, req: &Request, mode: SpectrumMode) -> DispatchOutcome {
        let spec = spectrum::build_from_request(mode, req);
        match self.engine.define(spec) {
            Ok(()) => DispatchOutcome::Respond(format_ok(&req.id, &[])),
            Err(e) => DispatchOutcome::Respond(engine_error_response(&req.id, &e)),
        }
    }

    fn check(&mut self, req: &Request, mode: SpectrumMode) -> DispatchOutcome {
        let spec = spectrum::build_from_request(mode, req);
        match self.engine.check(&spec) {
            Ok(()) => DispatchOutcome::Respond(format_ok(&req.id, &[])),
            Err(e) => DispatchOutcome::Respond(engine_error_response(&req.id, &e)),
        }
    }

    fn validate_spectrum(&mut self, req: &Request) -> DispatchOutcome {
        match self.engine.validate() {
            Ok(spec) => {
                let params = vec![
                    ("StartEnergy", Value::Float(spec.start_energy)),
                    ("EndEnergy", Value::Float(spec.end_energy)),
                    ("StepWidth", Value::Float(spec.step_width)),
                    ("Samples", Value::Int(spec.num_samples() as i64)),
                    ("DwellTime", Value::Float(spec.dwell_time)),
                    ("PassEnergy", Value::Float(spec.pass_energy)),
                    ("LensMode", Value::Str(spec.lens_mode.as_str().to_string())),
                    ("ScanRange", Value::Str(spec.scan_range.as_str().to_string())),
                ];
                DispatchOutcome::Respond(format_ok(&req.id, &params))
            }
            Err(e) => DispatchOutcome::Respond(engine_error_response(&req.id, &e)),
        }
    }

    fn clear_spectrum(&mut self, req: &Request) -> DispatchOutcome {
        match self.engine.clear() {
            Ok(()) => DispatchOutcome::Respond(format_ok(&req.id, &[])),
            Err(e) => DispatchOutcome::Respond(engine_error_response(&req.id, &e)),
        }
    }

    fn start(&mut self, req: &Request) -> DispatchOutcome {
        match self.engine.start() {
            Ok(()) => DispatchOutcome::Respond(format_ok(&req.id, &[])),
            Err(e) => DispatchOutcome::Respond(engine_error_response(&req.id, &e)),
        }
    }

    fn pause(&mut self, req: &Request) -> DispatchOutcome {
        match self.engine.pause() {
            Ok(()) => DispatchOutcome::Respond(format_ok(&req.id, &[])),
            Err(e) => DispatchOutcome::Respond(engine_error_response(&req.id, &e)),
        }
    }

    fn resume(&mut self, req: &Request) -> DispatchOutcome {
        match self.engine.resume() {
            Ok(()) => DispatchOutcome::Respond(format_ok(&req.id, &[])),
            Err(e) => DispatchOutcome::Respond(engine_error_response(&req.id, &e)),
        }
    }

    fn abort(&mut self, req: &Request) -> DispatchOutcome {
        match self.engine.abort() {
            Ok(()) => DispatchOutcome::Respond(format_ok(&req.id, &[])),
            Err(e) => DispatchOutcome::Respond(engine_error_response(&req.id, &e)),
        }
    }

    fn get_status(&mut self, req: &Request) -> DispatchOutcome {
        let status = self.engine.status();
        let state = status.state;
        let mut params = vec![
            ("ControllerStatus", Value::Str(state.as_str().to_string())),
            ("ControllerState", Value::Str(state.as_str().to_string())),
            (
                "NumberOfAcquiredPoints",
                Value::Int(status.acquired_samples as i64),
            ),
            ("ElapsedTime", Value::Float(status.elapsed_seconds)),
            (
                "CurrentIteration",
                Value::Int(status.current_iteration as i64),
            ),
        ];
        if let Some(msg) = status.error {
            log::warn!("acquisition error surfaced to client: {msg}");
            params.push(("ErrorMessage", Value::Str(msg)));
        }
        DispatchOutcome::Respond(format_ok(&req.id, &params))
    }

    fn get_data(&mut self, req: &Request) -> DispatchOutcome {
        let from = req.u32("FromIndex").unwrap_or(0) as usize;
        let to = match req.u32("ToIndex") {
            Some(t) => t as usize,
            None => self.engine.buffer_len().saturating_sub(1),
        };
        match self.engine.read(from, to) {
            Ok(values) => {
                let data = Value::List(values.into_iter().map(Value::Float).collect());
                let params = vec![
                    ("FromIndex", Value::Int(from as i64)),
                    ("ToIndex", Value::Int(to as i64)),
                    ("Data", data),
                ];
                DispatchOutcome::Respond(format_ok(&req.id, &params))
            }
            Err(_) => DispatchOutcome::Respond(format_error(&req.id, 208, "Invalid data range.")),
        }
    }

    fn get_all_parameter_names(&mut self, req: &Request) -> DispatchOutcome {
        let names = Value::List(
            self.store
                .list_names()
                .into_iter()
                .map(|n| Value::Str(n.to_string()))
                .collect(),
        );
        DispatchOutcome::Respond(format_ok(&req.id, &[("ParameterNames", names)]))
    }

    fn get_parameter_info(&mut self, req: &Request) -> DispatchOutcome {
        let Some(name) = req.str("ParameterName") else {
            return DispatchOutcome::Respond(format_error(&req.id, 301, "Parameter not found."));
        };
        match self.store.info(name) {
            Ok(ty) => DispatchOutcome::Respond(format_ok(
                &req.id,
                &[("ValueType", Value::Word(ty.as_str().to_string()))],
            )),
            Err(e) => DispatchOutcome::Respond(store_error_response(&req.id, &e)),
        }
    }

    fn get_analyzer_visible_name(&mut self, req: &Request) -> DispatchOutcome {
        DispatchOutcome::Respond(format_ok(
            &req.id,
            &[(
                "AnalyzerVisibleName",
                Value::Str(self.analyzer_visible_name.clone()),
            )],
        ))
    }

    fn get_parameter_value(&mut self, req: &Request) -> DispatchOutcome {
        let Some(name) = req.str("ParameterName") else {
            return DispatchOutcome::Respond(format_error(&req.id, 301, "Parameter not found."));
        };
        match self.store.get(name) {
            Ok(value) => DispatchOutcome::Respond(format_ok(
                &req.id,
                &[
                    ("Name", Value::Str(name.to_string())),
                    ("Value", Value::Word(value.to_string())),
                ],
            )),
            Err(e) => DispatchOutcome::Respond(store_error_response(&req.id, &e)),
        }
    }

    fn set_parameter_value(&mut self, req: &Request) -> DispatchOutcome {
        let Some(name) = req.str("ParameterName") else {
            return DispatchOutcome::Respond(format_error(&req.id, 301, "Parameter not found."));
        };
        let raw_value = req
            .param("Value")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let raw_value = strip_matching_quotes(&raw_value);
        match self.store.set(name, raw_value) {
            Ok(()) => DispatchOutcome::Respond(format_ok(&req.id, &[])),
            Err(e) => DispatchOutcome::Respond(store_error_response(&req.id, &e)),
        }
    }
}

fn strip_matching_quotes(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn engine_error_response(req_id: &str, e: &EngineError) -> String {
    let code = match e {
        EngineError::InvalidParameters(_) => 201,
        EngineError::NoSpectrumDefined => 202,
        EngineError::NotValidated => 203,
        EngineError::AlreadyRunning => 204,
        EngineError::NotRunning => 205,
        EngineError::NotPaused => 206,
        EngineError::NothingToAbort => 207,
        EngineError::InvalidRange => 208,
        EngineError::ClearWhileRunning => 204,
    };
    format_error(req_id, code, &e.to_string())
}

fn store_error_response(req_id: &str, e: &ParameterStoreError) -> String {
    format_error(req_id, 301, &e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatorConfig;
    use std::collections::HashMap;

    fn dispatcher() -> Dispatcher {
        let config = SimulatorConfig::default();
        Dispatcher::new(
            AcquisitionEngine::new(1000.0, 1),
            ParameterStore::empty(),
            &config,
        )
    }

    fn req(id: &str, command: &str, params: &[(&str, Value)]) -> Request {
        let mut map = HashMap::new();
        for (k, v) in params {
            map.insert(k.to_string(), v.clone());
        }
        Request {
            id: id.to_string(),
            command: command.to_string(),
            params: map,
        }
    }

    fn respond_text(outcome: DispatchOutcome) -> String {
        match outcome {
            DispatchOutcome::Respond(s) => s,
            DispatchOutcome::RespondAndDisconnect(s) => s,
        }
    }

    #[test]
    fn connect_then_double_connect() {
        let mut d = dispatcher();
        let r1 = respond_text(d.dispatch(req("0001", "Connect", &[])));
        assert_eq!(
            r1,
            "!0001 OK: ServerName:\"SpecsLab Prodigy Simulator\" ProtocolVersion:1.2"
        );
        let r2 = respond_text(d.dispatch(req("0003", "Connect", &[])));
        assert_eq!(r2, "!0003 Error:2 Already connected to a TCP client.");
    }

    #[test]
    fn commands_before_connect_are_rejected() {
        let mut d = dispatcher();
        let r = respond_text(d.dispatch(req("0001", "GetAcquisitionStatus", &[])));
        assert_eq!(r, "!0001 Error:3 You are not connected.");
    }

    #[test]
    fn unknown_command_after_connect() {
        let mut d = dispatcher();
        d.dispatch(req("0001", "Connect", &[]));
        let r = respond_text(d.dispatch(req("0002", "Frobnicate", &[])));
        assert_eq!(r, "!0002 Error:101 Unknown command: Frobnicate");
    }

    #[test]
    fn full_fat_acquisition_scenario() {
        let mut d = dispatcher();
        d.dispatch(req("0001", "Connect", &[]));

        let define = respond_text(d.dispatch(req(
            "0010",
            "DefineSpectrumFAT",
            &[
                ("StartEnergy", Value::Float(400.0)),
                ("EndEnergy", Value::Float(402.0)),
                ("StepWidth", Value::Float(0.5)),
                ("DwellTime", Value::Float(0.001)),
                ("PassEnergy", Value::Float(20.0)),
            ],
        )));
        assert_eq!(define, "!0010 OK");

        let validate = respond_text(d.dispatch(req("0011", "ValidateSpectrum", &[])));
        assert!(validate.starts_with("!0011 OK: StartEnergy:400.0 EndEnergy:402.0 StepWidth:0.5 Samples:5"));

        let start = respond_text(d.dispatch(req("0012", "Start", &[])));
        assert_eq!(start, "!0012 OK");

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            let status = respond_text(d.dispatch(req("0013", "GetAcquisitionStatus", &[])));
            if status.contains("\"finished\"") {
                break;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let data = respond_text(d.dispatch(req(
            "0020",
            "GetAcquisitionData",
            &[("FromIndex", Value::Int(0)), ("ToIndex", Value::Int(4))],
        )));
        assert!(data.starts_with("!0020 OK: FromIndex:0 ToIndex:4 Data:["));
    }

    #[test]
    fn get_acquisition_data_invalid_range() {
        let mut d = dispatcher();
        d.dispatch(req("0001", "Connect", &[]));
        let r = respond_text(d.dispatch(req(
            "0040",
            "GetAcquisitionData",
            &[("FromIndex", Value::Int(4)), ("ToIndex", Value::Int(2))],
        )));
        assert!(r.starts_with("!0040 Error:208"));
    }

    #[test]
    fn unknown_parameter_is_error_301() {
        let mut d = dispatcher();
        d.dispatch(req("0001", "Connect", &[]));
        let r = respond_text(d.dispatch(req(
            "0002",
            "GetAnalyzerParameterValue",
            &[("ParameterName", Value::Str("Nope".to_string()))],
        )));
        assert!(r.starts_with("!0002 Error:301"));
    }

    #[test]
    fn generator_failure_surfaces_error_state_and_message_on_status() {
        let mut d = dispatcher();
        d.dispatch(req("0001", "Connect", &[]));
        d.dispatch(req(
            "0010",
            "DefineSpectrumFAT",
            &[
                ("StartEnergy", Value::Float(400.0)),
                ("EndEnergy", Value::Float(402.0)),
                ("StepWidth", Value::Float(0.5)),
                // Survives validation (only `<= 0.0` is rejected) but panics
                // inside the generator's `Duration::from_secs_f64`.
                ("DwellTime", Value::Float(f64::INFINITY)),
                ("PassEnergy", Value::Float(20.0)),
            ],
        ));
        d.dispatch(req("0011", "ValidateSpectrum", &[]));
        d.dispatch(req("0012", "Start", &[]));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            let status = respond_text(d.dispatch(req("0013", "GetAcquisitionStatus", &[])));
            if status.contains("\"error\"") {
                assert!(status.contains("ErrorMessage:"));
                break;
            }
            assert!(std::time::Instant::now() < deadline, "never reached error state");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn disconnect_closes_and_resets_engine() {
        let mut d = dispatcher();
        d.dispatch(req("0001", "Connect", &[]));
        match d.dispatch(req("0002", "Disconnect", &[])) {
            DispatchOutcome::RespondAndDisconnect(s) => assert_eq!(s, "!0002 OK"),
            DispatchOutcome::Respond(_) => panic!("expected disconnect outcome"),
        }
    }
}
