use std::env;
use std::str::FromStr;

pub mod cli;
pub mod config;
pub mod device;
pub mod error;

pub use crate::cli::run;

pub fn init_logging() {
    let level = env::var("GECKO_LOG")
        .ok()
        .and_then(|value| log::LevelFilter::from_str(&value).ok())
        .unwrap_or(log::LevelFilter::Info);

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
        // the platform backends are chatty at debug level
        .level_for("btleplug", log::LevelFilter::Warn)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}
