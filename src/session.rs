//! A single client's connection lifecycle: read-line loop over the codec,
//! dispatch, and response write-back, torn down on `Disconnect`, EOF, or I/O
//! error.

use std::io::{BufReader, Write};
use std::net::TcpStream;

use crate::codec;
use crate::config::SimulatorConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::engine::AcquisitionEngine;
use crate::param_store::ParameterStore;

pub struct Session {
    dispatcher: Dispatcher,
}

impl Session {
    pub fn new(store: ParameterStore, config: &SimulatorConfig) -> Self {
        let engine = AcquisitionEngine::new(config.time_scale, config.noise_seed);
        Session {
            dispatcher: Dispatcher::new(engine, store, config),
        }
    }

    /// Runs the read-respond loop for one accepted connection to completion.
    /// Never blocks the process on an acquisition: long-running generation
    /// happens on the engine's own background thread.
    pub fn run(mut self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        log::info!("client connected from {peer}");

        let mut reader = BufReader::new(match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                log::error!("could not clone socket for {peer}: {e}");
                return;
            }
        });
        let mut writer = stream;

        loop {
            let line = match codec::read_frame(&mut reader) {
                Ok(Some(line)) => line,
                Ok(None) => {
                    log::info!("client {peer} closed the connection");
                    break;
                }
                Err(e) => {
                    log::warn!("I/O error reading from {peer}: {e}");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            log::debug!("RX {peer}: {line}");

            let outcome = match codec::parse_request(&line) {
                Ok(req) => self.dispatcher.dispatch(req),
                Err(frame_err) => DispatchOutcome::Respond(codec::format_error(
                    &frame_err.req_id,
                    4,
                    &frame_err.message,
                )),
            };

            let (response, should_close) = match outcome {
                DispatchOutcome::Respond(s) => (s, false),
                DispatchOutcome::RespondAndDisconnect(s) => (s, true),
            };
            log::debug!("TX {peer}: {response}");
            if let Err(e) = write_line(&mut writer, &response) {
                log::warn!("I/O error writing to {peer}: {e}");
                break;
            }
            if should_close {
                break;
            }
        }

        self.dispatcher.engine.force_idle();
        log::info!("client {peer} disconnected");
    }
}

fn write_line(writer: &mut impl Write, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}
