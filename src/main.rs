// This file is part of the impexpd disk-transfer supervisor.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use impexpd::cli::Cli;
use impexpd::config::Verbosity;

fn main() {
    let cli = Cli::parse();

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("impexpd: {err}");
            std::process::exit(1);
        }
    };

    init_logging(config.verbosity);

    let code = impexpd::run(config);
    std::process::exit(code);
}

/// Maps `--debug`/`--verbose` onto `tracing` levels: default ERROR,
/// `--verbose` INFO, `--debug` TRACE (NOTSET). Logs go to stderr; stdout
/// is reserved for the inherited child shell glue.
fn init_logging(verbosity: Verbosity) {
    let level = match verbosity {
        Verbosity::Error => "error",
        Verbosity::Info => "info",
        Verbosity::Trace => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(format!("impexpd={level}")))
        .with_writer(std::io::stderr)
        .init();
}
