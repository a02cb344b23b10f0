use prodigy_sim::config;
use prodigy_sim::server::Server;

fn main() {
    prodigy_sim::init_logging();

    let config = config::load("prodigy-sim").apply_env_overrides();
    log::info!(
        "starting Remote In simulator on {}:{}",
        config.host,
        config.port
    );

    let listen_addr = config.listen_addr();
    match Server::new(listen_addr, config) {
        Ok(server) => server.run(),
        Err(e) => {
            log::error!("could not start simulator: {e}");
            std::process::exit(1);
        }
    }
}
