use clap::Parser;
use log::{error, info, LevelFilter};
use fan_link::cli::Cli;
use fan_link::{init_logging, run};
use fan_link::error::{AppRunError, ConfigError};

fn main() -> Result<(), AppRunError> {
    let cli = Cli::parse();
    init_logging(if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info });
    info!(concat!("fan-link ", env!("CARGO_PKG_VERSION")));

    match run(cli) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            eprintln!("fan-link is already running");
            Ok(())
        },
        Err(err) => {
            error!("{}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
