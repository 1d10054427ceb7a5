use std::io;
use std::str::Utf8Error;
use std::time::Duration;
use thiserror::Error;
use btleplug;
use serde_json;
use futures::channel::mpsc::SendError;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter available")]
    NoAdapter,

    #[error("The bluetooth adapter stopped reporting scan results")]
    ScanEnded,

    #[error("Bluetooth characteristic {0} is not available")]
    MissingCharacteristic(Uuid),

    #[error("Bluetooth characteristic {0} is not readable")]
    NotReadable(Uuid),

    #[error("Bluetooth characteristic {0} can not be written to")]
    NotWritable(Uuid),

    #[error("Failed to send command to the connection task: {source}")]
    SendError { #[from] source: SendError },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PayloadError {
    #[error("{payload} payload must be {expected} bytes, got {actual}")]
    WrongLength {
        payload: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to talk to the watch: {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Gave up waiting for the watch after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    #[error("The watch reported an error: {0}")]
    Watch(String),

    #[error("The connection task stopped unexpectedly")]
    EventStreamEnded,
}
