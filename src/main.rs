//! SetuIO - real-time gateway between a serial motor/IMU board and TCP
//! clients.

use clap::Parser;
use setu_io::app;
use setu_io::config::Cli;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Invalid arguments exit with code 2 via clap.
    let cli = Cli::parse();
    let cfg = cli.into_config();

    log::info!("SetuIO v{} starting...", env!("CARGO_PKG_VERSION"));

    let code = app::run(cfg);
    std::process::exit(code);
}
