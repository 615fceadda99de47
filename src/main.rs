use clap::Parser;

use xvc_ftdi_bridge::config::{Cli, Config};
use xvc_ftdi_bridge::session;

fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let mut builder = env_logger::Builder::from_default_env();
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let config = match Config::load(cli) {
        Ok(c) => c,
        Err(e) => {
            log::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = session::run(&config) {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}
