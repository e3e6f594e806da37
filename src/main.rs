use clap::Parser;
use tracing::{error, info_span, Level};

use quarantine_proxy::config::{self, Args};
use quarantine_proxy::{engine, init_tracing};

fn main() {
    init_tracing(Level::INFO);

    let _span = info_span!("startup").entered();

    let args = Args::parse();
    let settings = match config::load(&args) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "could not load config");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("could not create tokio runtime");

    let result = runtime.block_on(engine::run(settings));
    if let Err(e) = result {
        error!(error = %e, "fatal engine error");
        std::process::exit(1);
    }
}
