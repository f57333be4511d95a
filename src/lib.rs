use std::env;
use log::info;

use crate::cli::Cli;
use crate::config::io::ConfigIO;
use crate::device::btle::BtleTransport;
use crate::device::session::DeviceSession;
use crate::error::AppRunError;

pub mod cli;
pub mod config;
pub mod device;
pub mod error;

pub fn init_logging(level: log::LevelFilter) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        match fern::log_file(&log_file) {
            Ok(file) => dispatch = dispatch.chain(file),
            Err(err) => eprintln!("Failed to open LOG_FILE {}: {}", log_file, err),
        }
    }

    if let Err(err) = dispatch.apply() {
        eprintln!("Failed to initialize logger: {}", err);
    }
}

pub fn run(cli: Cli) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|source| AppRunError::Runtime { source })?;

    runtime.block_on(run_session(cli))
}

async fn run_session(cli: Cli) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync()?;
    // only one instance may own the fan at a time
    let mut locker = config_io.locker()?;
    let _guard = locker.lock()?;
    let config = config_io.load().await?;

    let transport = BtleTransport::new().await?;
    let session = DeviceSession::new(transport, config.session_config());
    info!("Device session ready, looking for {}", session.config().target_name);

    let result = cli::execute(&session, &cli).await;
    session.shutdown().await;
    result
}
