// Entry point for the `pipeline` binary.
//
// Exit codes: 0 when every job instance succeeded, 1 when any failed,
// 2 for configuration errors and 130 when interrupted.

use clap::Parser;
use pipeline_common::constants::exit_code;
use pipeline_common::logging;
use pipeline_engine::cli::{self, Cli};

fn main() {
    let args = Cli::parse();
    logging::init(args.log_format, args.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to build Tokio runtime: {}", e);
            std::process::exit(exit_code::FAILURE);
        }
    };

    let code = runtime.block_on(cli::execute(args));
    tracing::debug!("Exiting with code {}", code);

    std::process::exit(code);
}
