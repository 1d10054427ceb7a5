use futures::{SinkExt, StreamExt};
use futures::channel::mpsc::{channel, Receiver, Sender};
use log::{debug, error, info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::types::Config;
use crate::device::codec::time_sync_payload_now;
use crate::device::constants::COMMAND_CHANNEL_CAPACITY;
use crate::device::dispatcher::{event_dispatcher_task, EventDispatcher, EventPublisher};
use crate::device::scanner::DeviceScanner;
use crate::device::session::{GattSession, ReadOutcome};
use crate::device::transport::{GattStatus, GattTransport, LinkState, TransportEvent, TransportEventReceiver};
use crate::device::types::{ConnectionState, DeviceProfile, DisconnectReason, EventKind, EventRecord, Operation};
use crate::error::DeviceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartReceiving,
    ReadBatteryVoltage,
    WriteNotification(Vec<u8>),
    UpdateWatchTime,
    Reconnect,
    Disconnect,
    CloseConnection,
}

/// Failed connect attempts in the current connect cycle.
#[derive(Debug, Clone, Copy)]
pub struct RetryCounter {
    attempts: u32,
    max_attempts: u32,
}

impl RetryCounter {
    pub fn new(max_attempts: u32) -> Self {
        RetryCounter { attempts: 0, max_attempts }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Returns the new attempt number, or `None` once every retry has been used up.
    pub fn try_increment(&mut self) -> Option<u32> {
        if self.attempts < self.max_attempts {
            self.attempts += 1;
            Some(self.attempts)
        } else {
            None
        }
    }
}

/// The single owner of the connection lifecycle. Every command and every transport callback is
/// applied here, one at a time.
pub struct ConnectionMachine<T: GattTransport> {
    transport: T,
    publisher: EventPublisher,
    state_sender: watch::Sender<ConnectionState>,
    profile: DeviceProfile,
    target_mtu: u16,
    scanner: DeviceScanner,
    state: ConnectionState,
    disconnect_reason: DisconnectReason,
    retry: RetryCounter,
    /// Device of an outstanding (non-sticky) connect request that has no session yet.
    pending_device: Option<T::Device>,
    session: Option<GattSession<T::Device>>,
    battery_voltage: f32,
}

impl<T: GattTransport> ConnectionMachine<T> {
    pub fn new(transport: T, publisher: EventPublisher, state_sender: watch::Sender<ConnectionState>, config: &Config) -> Self {
        ConnectionMachine {
            transport,
            publisher,
            state_sender,
            profile: DeviceProfile::default(),
            target_mtu: config.target_mtu,
            scanner: DeviceScanner::new(config.device_name.clone()),
            state: ConnectionState::Uninitialized,
            disconnect_reason: DisconnectReason::None,
            retry: RetryCounter::new(config.max_connection_attempts),
            pending_device: None,
            session: None,
            battery_voltage: 0.0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry.attempts()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    pub fn disconnect_reason(&self) -> DisconnectReason {
        self.disconnect_reason
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!("Connection state {} -> {}", self.state, state);
        }
        self.state = state;
        self.state_sender.send_replace(state);
    }

    fn publish(&mut self, kind: EventKind, connection_state: ConnectionState, message: String, operation: Option<Operation>) {
        let record = EventRecord {
            kind,
            battery_voltage: self.battery_voltage,
            connection_state,
            message,
            operation,
        };
        debug!("Publishing {:?}", record);
        self.publisher.publish(record);
    }

    fn emit(&mut self, kind: EventKind, connection_state: ConnectionState, message: impl Into<String>) {
        self.publish(kind, connection_state, message.into(), None);
    }

    /// Publishes the successful result of `operation`.
    fn emit_result(&mut self, operation: Operation, message: impl Into<String>) {
        self.publish(EventKind::Success, self.state, message.into(), Some(operation));
    }

    pub fn handle_command(&mut self, command: Command) {
        debug!("Command {:?} while {}", command, self.state);

        match command {
            Command::StartReceiving => self.start_receiving(),
            Command::ReadBatteryVoltage => self.read_battery_voltage(),
            Command::WriteNotification(payload) => self.write_notification(&payload),
            Command::UpdateWatchTime => self.update_watch_time(),
            Command::Reconnect => self.reconnect(),
            Command::Disconnect => self.disconnect(),
            Command::CloseConnection => self.close_connection(),
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent<T::Device>) {
        match event {
            TransportEvent::ScanResult { device, name } => self.on_scan_result(device, name),
            TransportEvent::ScanFailed { reason } => self.on_scan_failed(&reason),
            TransportEvent::ConnectionStateChanged { status: GattStatus::Success, state: LinkState::Connected } => {
                self.on_connected()
            },
            TransportEvent::ConnectionStateChanged { status: GattStatus::Success, state: LinkState::Disconnected } => {
                self.on_disconnected()
            },
            TransportEvent::ConnectionStateChanged { status: GattStatus::Failure(reason), .. } => {
                self.on_link_error(&reason)
            },
            TransportEvent::ServicesDiscovered { status } => self.on_services_discovered(&status),
            TransportEvent::MtuChanged { mtu, status } => self.on_mtu_changed(mtu, &status),
            TransportEvent::CharacteristicRead { characteristic, value, status } => {
                self.on_characteristic_read(characteristic, &value, &status)
            },
            TransportEvent::CharacteristicWritten { characteristic, status } => {
                self.on_characteristic_written(characteristic, &status)
            },
        }
    }

    /// Stops everything without waiting for the transport. Used when the connection task exits.
    pub fn shutdown(&mut self) {
        self.scanner.stop(&mut self.transport);
        self.release_link();
        self.disconnect_reason = DisconnectReason::None;
        self.set_state(ConnectionState::Uninitialized);
    }

    fn start_receiving(&mut self) {
        match self.state {
            ConnectionState::Uninitialized | ConnectionState::Error => {},
            state => {
                debug!("Ignoring start request while {}", state);
                return;
            },
        }

        self.retry.reset();
        self.disconnect_reason = DisconnectReason::None;
        self.set_state(ConnectionState::Initializing);
        self.begin_scan(true);
    }

    fn begin_scan(&mut self, announce: bool) {
        match self.scanner.start(&mut self.transport) {
            Ok(true) if announce => {
                self.emit(EventKind::Loading, ConnectionState::Initializing, "Scanning BLE devices...")
            },
            Ok(_) => {},
            Err(err) => self.on_scan_failed(&err.to_string()),
        }
    }

    fn on_scan_failed(&mut self, reason: &str) {
        error!("Scanning failed: {}", reason);
        // clears the transport's scan handle so the next start really scans
        self.scanner.stop(&mut self.transport);

        if self.state != ConnectionState::Initializing {
            return;
        }

        self.set_state(ConnectionState::Error);
        self.emit(EventKind::Error, ConnectionState::Error, format!("Could not scan for BLE devices: {}", reason));
    }

    fn on_scan_result(&mut self, device: T::Device, name: Option<String>) {
        let Some(device) = self.scanner.on_scan_result(&mut self.transport, device, name.as_deref()) else {
            return;
        };

        self.emit(EventKind::Loading, ConnectionState::Initializing, "Connecting to device...");

        // Connect right away without auto connect; once connected, drops are answered with a
        // sticky reconnect instead.
        self.pending_device = Some(device.clone());
        if let Err(err) = self.transport.connect(&device, false) {
            self.on_link_error(&err.to_string());
        }
    }

    fn on_connected(&mut self) {
        if let Some(device) = self.pending_device.take() {
            if let Some(stale) = self.session.replace(GattSession::new(device, self.profile)) {
                stale.close(&mut self.transport);
            }
        }

        if self.session.is_none() {
            warn!("Transport reported a connection without a known device");
            return;
        }

        self.set_state(ConnectionState::Connected);
        self.retry.reset();

        let Some(session) = self.session.as_ref() else {
            return;
        };

        if self.disconnect_reason != DisconnectReason::None {
            // A disconnect was requested while the connect was in flight; ask again so the next
            // confirmation consumes the reason.
            info!("Connected while a {:?} is pending", self.disconnect_reason);
            session.disconnect(&mut self.transport);
            return;
        }

        let result = session.discover_services(&mut self.transport);
        self.emit(EventKind::Loading, ConnectionState::Initializing, "Discovering services...");
        if let Err(err) = result {
            warn!("Could not start service discovery: {}", err);
        }
    }

    fn on_disconnected(&mut self) {
        match std::mem::take(&mut self.disconnect_reason) {
            DisconnectReason::None => self.on_unsolicited_disconnect(),
            DisconnectReason::UserDisconnect => {
                info!("Disconnected on request, keeping the session");
                self.set_state(ConnectionState::Disconnected);
                self.emit(EventKind::Success, ConnectionState::Disconnected, "Disconnected");
            },
            DisconnectReason::UserClose => self.finish_close(),
        }
    }

    fn on_unsolicited_disconnect(&mut self) {
        let Some(session) = self.session.as_ref() else {
            if self.pending_device.is_some() {
                self.on_link_error("disconnected before the connection was established");
            } else {
                debug!("Ignoring disconnect without a session");
            }
            return;
        };

        if self.state != ConnectionState::Connected {
            // late report for a link that is already down
            debug!("Ignoring disconnect while {}", self.state);
            return;
        }

        warn!("Connection lost, issuing sticky reconnect");
        let result = self.transport.connect(session.device(), true);
        self.set_state(ConnectionState::Disconnected);
        self.emit(EventKind::Success, ConnectionState::Disconnected, "Connection lost, reconnecting...");

        if let Err(err) = result {
            self.on_link_error(&err.to_string());
        }
    }

    fn on_link_error(&mut self, reason: &str) {
        if self.state == ConnectionState::Connected {
            // the link dropped underneath us; the reason decides what happens next
            warn!("Link error while connected: {}", reason);
            self.on_disconnected();
            return;
        }

        if self.session.is_none() && self.pending_device.is_none() {
            debug!("Ignoring link error without a link: {}", reason);
            return;
        }

        warn!("Connect attempt failed: {}", reason);
        self.release_link();

        match std::mem::take(&mut self.disconnect_reason) {
            DisconnectReason::UserClose => self.finish_close(),
            DisconnectReason::UserDisconnect | DisconnectReason::None => self.retry_connect(),
        }
    }

    fn retry_connect(&mut self) {
        match self.retry.try_increment() {
            Some(attempt) => {
                self.set_state(ConnectionState::Initializing);
                self.emit(
                    EventKind::Loading,
                    ConnectionState::Initializing,
                    format!("Attempting to connect {}/{}", attempt, self.retry.max_attempts()),
                );
                // the attempt counter message must not be replaced by the scanning message
                self.begin_scan(false);
            },
            None => {
                error!("Giving up after {} connect attempts", self.retry.attempts());
                self.scanner.stop(&mut self.transport);
                self.set_state(ConnectionState::Error);
                self.emit(EventKind::Error, ConnectionState::Error, "Could not connect to BLE device");
            },
        }
    }

    fn finish_close(&mut self) {
        self.release_link();
        self.disconnect_reason = DisconnectReason::None;
        self.set_state(ConnectionState::Uninitialized);
        self.emit(EventKind::Success, ConnectionState::Uninitialized, "Connection closed");
    }

    /// Frees the session and any outstanding connect request.
    fn release_link(&mut self) {
        if let Some(session) = self.session.take() {
            session.close(&mut self.transport);
        }
        if let Some(device) = self.pending_device.take() {
            self.transport.close(&device);
        }
    }

    fn on_services_discovered(&mut self, status: &GattStatus) {
        let Some(session) = self.session.as_ref() else {
            debug!("Ignoring service discovery without a session");
            return;
        };

        if let GattStatus::Failure(reason) = status {
            warn!("Service discovery failed: {}", reason);
        }

        let result = session.request_mtu(&mut self.transport, self.target_mtu);
        self.emit(EventKind::Loading, ConnectionState::Initializing, "Adjusting MTU space...");
        if let Err(err) = result {
            warn!("Could not request MTU: {}", err);
        }
    }

    fn on_mtu_changed(&mut self, mtu: u16, status: &GattStatus) {
        if self.state != ConnectionState::Connected {
            debug!("Ignoring MTU change while {}", self.state);
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if let GattStatus::Failure(reason) = status {
            warn!("MTU request failed ({}), continuing with {}", reason, mtu);
        }
        session.accept_mtu(mtu);

        self.emit(EventKind::Success, ConnectionState::Connected, format!("Connected (MTU {})", mtu));
    }

    fn read_battery_voltage(&mut self) {
        if self.state != ConnectionState::Connected {
            debug!("Not connected, not reading battery voltage");
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };

        if let Err(err) = session.read_battery_voltage(&mut self.transport) {
            warn!("Battery voltage read dropped: {}", err);
        }
    }

    fn write_notification(&mut self, payload: &[u8]) {
        if self.state != ConnectionState::Connected {
            debug!("Not connected, not sending notification");
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };

        if let Err(err) = session.write_notification(&mut self.transport, payload) {
            error!("Notification dropped: {}", err);
        }
    }

    fn update_watch_time(&mut self) {
        if self.state != ConnectionState::Connected {
            debug!("Not connected, not updating watch time");
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let payload = time_sync_payload_now();
        info!("Updating watch time: {:02X?}", payload);
        if let Err(err) = session.write_watch_time(&mut self.transport, &payload) {
            error!("Watch time update dropped: {}", err);
        }
    }

    fn on_characteristic_read(&mut self, characteristic: uuid::Uuid, value: &[u8], status: &GattStatus) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        match session.interpret_read(characteristic, status, value) {
            ReadOutcome::BatteryVoltage(voltage) => {
                info!("Battery voltage {} V", voltage);
                self.battery_voltage = voltage;
                self.emit_result(Operation::BatteryRead, format!("Battery voltage {:.2} V", voltage));
            },
            ReadOutcome::UnknownCharacteristic(uuid) => error!("Read UUID {} not recognized", uuid),
            ReadOutcome::Failed(reason) => error!("Battery voltage read failed: {}", reason),
            ReadOutcome::Malformed(err) => warn!("Ignoring battery voltage: {}", err),
        }
    }

    fn on_characteristic_written(&mut self, characteristic: uuid::Uuid, status: &GattStatus) {
        let Some(operation) = self.session.as_ref().and_then(|session| session.write_operation(characteristic)) else {
            warn!("Write confirmation for unknown characteristic {}", characteristic);
            return;
        };

        let description = match operation {
            Operation::NotificationWrite => "Notification sent",
            Operation::WatchTimeWrite => "Watch time updated",
            Operation::BatteryRead => return,
        };
        match status {
            GattStatus::Success => self.emit_result(operation, description),
            GattStatus::Failure(reason) => error!("Write to {} failed: {}", characteristic, reason),
        }
    }

    fn reconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!("Ignoring reconnect while {}", self.state);
            return;
        }
        let Some(session) = self.session.as_ref() else {
            debug!("Nothing to reconnect to");
            return;
        };

        info!("Reconnecting to {:?}", session.device());
        let result = self.transport.connect(session.device(), false);
        self.emit(EventKind::Loading, ConnectionState::Disconnected, "Reconnecting...");
        if let Err(err) = result {
            self.on_link_error(&err.to_string());
        }
    }

    fn disconnect(&mut self) {
        if self.state != ConnectionState::Connected {
            debug!("Ignoring disconnect while {}", self.state);
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };

        session.disconnect(&mut self.transport);
        self.disconnect_reason = DisconnectReason::UserDisconnect;
    }

    fn close_connection(&mut self) {
        self.scanner.stop(&mut self.transport);

        if self.state == ConnectionState::Connected {
            if let Some(session) = self.session.as_ref() {
                // the session is released once the transport confirms the disconnect
                session.disconnect(&mut self.transport);
                self.disconnect_reason = DisconnectReason::UserClose;
                return;
            }
        }

        if let Some(device) = self.pending_device.as_ref() {
            info!("Cancelling connect to {:?}", device);
            self.transport.disconnect(device);
            self.disconnect_reason = DisconnectReason::UserClose;
            return;
        }

        self.finish_close();
    }
}

/// Handle for issuing commands to the connection task and observing it.
#[derive(Debug, Clone)]
pub struct WatchLink {
    commands: Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    dispatcher: EventDispatcher,
}

impl WatchLink {
    async fn send(&self, command: Command) -> Result<(), DeviceError> {
        let mut commands = self.commands.clone();
        commands.send(command).await?;
        Ok(())
    }

    pub async fn start_receiving(&self) -> Result<(), DeviceError> {
        self.send(Command::StartReceiving).await
    }

    pub async fn read_battery_voltage(&self) -> Result<(), DeviceError> {
        self.send(Command::ReadBatteryVoltage).await
    }

    pub async fn write_notification(&self, payload: Vec<u8>) -> Result<(), DeviceError> {
        self.send(Command::WriteNotification(payload)).await
    }

    pub async fn update_watch_time(&self) -> Result<(), DeviceError> {
        self.send(Command::UpdateWatchTime).await
    }

    pub async fn reconnect(&self) -> Result<(), DeviceError> {
        self.send(Command::Reconnect).await
    }

    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        self.send(Command::Disconnect).await
    }

    pub async fn close_connection(&self) -> Result<(), DeviceError> {
        self.send(Command::CloseConnection).await
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> Receiver<EventRecord> {
        self.dispatcher.subscribe()
    }
}

async fn run_connection<T: GattTransport>(
    cancel: CancellationToken,
    mut machine: ConnectionMachine<T>,
    mut commands: Receiver<Command>,
    mut transport_events: TransportEventReceiver<T::Device>,
) {
    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            Some(command) = commands.next() => {
                machine.handle_command(command);
            },
            Some(event) = transport_events.next() => {
                machine.handle_transport_event(event);
            },
            else => break 'mainloop,
        }
    }

    info!("Connection task stopping");
    machine.shutdown();
}

/// Spawns the connection task and its event dispatcher. Both stop when `cancel` is cancelled.
pub fn connection_task<T: GattTransport>(
    cancel: CancellationToken,
    transport: T,
    transport_events: TransportEventReceiver<T::Device>,
    config: &Config,
) -> (WatchLink, JoinHandle<()>) {
    let (dispatcher, publisher, dispatcher_handle) = event_dispatcher_task(cancel.clone(), config.event_channel_capacity);
    let (state_sender, state_receiver) = watch::channel(ConnectionState::Uninitialized);
    let (command_sender, command_receiver) = channel(COMMAND_CHANNEL_CAPACITY);
    let machine = ConnectionMachine::new(transport, publisher, state_sender, config);

    let handle = spawn(async move {
        run_connection(cancel, machine, command_receiver, transport_events).await;
        if let Err(err) = dispatcher_handle.await {
            warn!("Event dispatcher task failed: {}", err);
        }
    });

    let link = WatchLink {
        commands: command_sender,
        state: state_receiver,
        dispatcher,
    };

    (link, handle)
}
