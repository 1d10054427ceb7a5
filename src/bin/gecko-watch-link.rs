use clap::Parser;
use log::{error, info};
use gecko_watch_link::{init_logging, run};
use gecko_watch_link::cli::Cli;
use gecko_watch_link::error::{AppRunError, ConfigError};

#[tokio::main]
async fn main() -> Result<(), AppRunError> {
    init_logging();
    info!(concat!("Gecko watch link ", env!("CARGO_PKG_VERSION")));

    let cli = Cli::parse();

    match run(cli).await {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            eprintln!("Another gecko-watch-link is already talking to the watch");
            Ok(())
        },
        Err(err) => {
            error!("{}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
