use std::future::Future;
use std::time::Duration;
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use futures::channel::mpsc::Receiver;
use log::{error, info, warn};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::btle::BtleTransport;
use crate::device::codec::Notification;
use crate::device::connection::{connection_task, WatchLink};
use crate::device::transport::transport_channel;
use crate::device::types::{ConnectionState, EventKind, EventRecord, Operation};
use crate::error::AppRunError;

/**
 * How long (seconds) to wait for the watch to confirm a close before giving up on it.
 */
const CLOSE_DEADLINE: u64 = 5;

#[derive(Debug, Parser)]
#[command(name = "gecko-watch-link", version, about = "Talk to a Gecko smart watch over BLE")]
pub struct Cli {
    /// Advertised name of the watch, overrides the config file
    #[arg(long)]
    pub device_name: Option<String>,

    /// Store --device-name in the config file
    #[arg(long, requires = "device_name")]
    pub remember: bool,

    /// How long to wait for the watch, e.g. "30s" or "2m"
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    pub timeout: Duration,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Action {
    /// Print every connection event until the timeout expires
    Monitor {
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Read the battery voltage
    Battery,
    /// Forward a notification to the watch
    Notify {
        #[arg(long)]
        app: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        body: Option<String>,
    },
    /// Set the watch clock to the local time of this machine
    SyncTime,
}

async fn within<T>(limit: Duration, fut: impl Future<Output = Result<T, AppRunError>>) -> Result<T, AppRunError> {
    timeout(limit, fut).await.map_err(|_| AppRunError::Timeout(limit))?
}

async fn next_event(events: &mut Receiver<EventRecord>) -> Result<EventRecord, AppRunError> {
    let record = events.next().await.ok_or(AppRunError::EventStreamEnded)?;
    info!("{} ({}): {}", record.connection_state, record.battery_voltage, record.message);

    if record.kind == EventKind::Error {
        return Err(AppRunError::Watch(record.message));
    }
    Ok(record)
}

/// Waits for the next successful event in `state`.
async fn wait_for(events: &mut Receiver<EventRecord>, state: ConnectionState) -> Result<EventRecord, AppRunError> {
    loop {
        let record = next_event(events).await?;
        if record.kind == EventKind::Success && record.connection_state == state {
            return Ok(record);
        }
    }
}

/// Waits for the result of `operation`, skipping lifecycle events such as a reconnect.
async fn wait_for_result(events: &mut Receiver<EventRecord>, operation: Operation) -> Result<EventRecord, AppRunError> {
    loop {
        let record = next_event(events).await?;
        if record.operation == Some(operation) {
            return Ok(record);
        }
    }
}

async fn perform(link: &WatchLink, events: &mut Receiver<EventRecord>, action: Action) -> Result<(), AppRunError> {
    let operation = match action {
        Action::Monitor { .. } => return Ok(()),
        Action::Battery => {
            link.read_battery_voltage().await?;
            Operation::BatteryRead
        },
        Action::Notify { app, title, body } => {
            let notification = Notification::posted_at(app, title, body, Utc::now());
            info!("Sending notification: {}", notification);
            link.write_notification(notification.encode()).await?;
            Operation::NotificationWrite
        },
        Action::SyncTime => {
            link.update_watch_time().await?;
            Operation::WatchTimeWrite
        },
    };

    let record = wait_for_result(events, operation).await?;
    match operation {
        Operation::BatteryRead => println!("{:.2} V", record.battery_voltage),
        _ => println!("{}", record.message),
    }
    Ok(())
}

async fn monitor(events: &mut Receiver<EventRecord>, limit: Duration, json: bool) -> Result<(), AppRunError> {
    let deadline = Instant::now() + limit;

    while let Ok(record) = tokio::time::timeout_at(deadline, events.next()).await {
        let record = record.ok_or(AppRunError::EventStreamEnded)?;

        if json {
            match serde_json::to_string(&record) {
                Ok(line) => println!("{}", line),
                Err(err) => warn!("Failed to encode event: {}", err),
            }
        } else {
            println!("{:?} {} {:.2}V {}", record.kind, record.connection_state, record.battery_voltage, record.message);
        }
    }

    Ok(())
}

fn override_device_name(config: &mut Config, device_name: String) {
    config.device_name = device_name;
    config.sanitize();
}

async fn load_config(config_io: &ConfigIO) -> Config {
    match config_io.read().await {
        Ok(config) => config,
        Err(err) => {
            if err.is_file_not_found_error() {
                info!("Config file not found, using defaults");
            } else {
                error!("Failed to load config, using defaults: {}", err);
            }
            Config::default()
        },
    }
}

pub async fn run(cli: Cli) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync()?;
    let mut locker = config_io.locker()?;
    let _instance_guard = locker.lock()?;

    let mut config = load_config(&config_io).await;
    if let Some(device_name) = cli.device_name {
        override_device_name(&mut config, device_name);
        if cli.remember {
            config_io.save(&config).await?;
        }
    }

    let (transport_sender, transport_receiver) = transport_channel();
    let transport = BtleTransport::new(transport_sender).await?;
    let cancel = CancellationToken::new();
    let (link, handle) = connection_task(cancel.clone(), transport, transport_receiver, &config);
    let mut events = link.subscribe();

    link.start_receiving().await?;

    let result = match cli.action {
        Action::Monitor { json } => monitor(&mut events, cli.timeout, json).await,
        action => match within(cli.timeout, wait_for(&mut events, ConnectionState::Connected)).await {
            Ok(_) => within(cli.timeout, perform(&link, &mut events, action)).await,
            Err(err) => Err(err),
        },
    };

    link.close_connection().await?;
    if link.connection_state() != ConnectionState::Uninitialized {
        let closed = within(Duration::from_secs(CLOSE_DEADLINE), wait_for(&mut events, ConnectionState::Uninitialized)).await;
        if let Err(err) = closed {
            warn!("Connection did not close cleanly: {}", err);
        }
    }

    cancel.cancel();
    if let Err(err) = handle.await {
        warn!("Connection task failed: {}", err);
    }

    result
}
