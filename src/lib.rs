pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod generator;
pub mod param_store;
pub mod server;
pub mod session;
pub mod spectrum;

use log::{set_max_level, LevelFilter};
use simple_logger::SimpleLogger;

pub fn init_logging() {
    SimpleLogger::new().init().unwrap();
    set_max_level(LevelFilter::Info);
}
