use futures::{SinkExt, StreamExt};
use btleplug::api::{Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::{CONNECT_DELAY, IS_CONNECTED_DEADLINE, LINK_POLL_DELAY};
use crate::device::transport::{GattStatus, GattTransport, LinkState, TransportEvent, TransportEventSender};
use crate::error::DeviceError;

type Events = TransportEventSender<Peripheral>;

async fn report(events: &mut Events, event: TransportEvent<Peripheral>) {
    if let Err(err) = events.send(event).await {
        debug!("Connection task is gone, dropping transport event: {}", err);
    }
}

fn status_of<T>(result: &Result<T, btleplug::Error>) -> GattStatus {
    match result {
        Ok(_) => GattStatus::Success,
        Err(err) => GattStatus::Failure(err.to_string()),
    }
}

fn find_characteristic(peripheral: &Peripheral, service: Uuid, characteristic: Uuid) -> Option<Characteristic> {
    peripheral
        .services()
        .into_iter()
        .filter(|s| s.uuid == service)
        .flat_map(|s| s.characteristics.into_iter())
        .find(|c| c.uuid == characteristic)
}

/// Runs until `cancel` fires; any other way out is a scan failure.
async fn scan(adapter: &Adapter, cancel: &CancellationToken, events: &mut Events) -> Result<(), DeviceError> {
    let mut central_events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;

    loop {
        let id = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = central_events.next() => match event {
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => id,
                Some(_) => continue,
                None => return Err(DeviceError::ScanEnded),
            },
        };

        let peripheral = match adapter.peripheral(&id).await {
            Ok(v) => v,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripheral {:?}: {}", id, err);
                continue;
            },
        };

        let name = match peripheral.properties().await {
            Ok(Some(properties)) => properties.local_name,
            Ok(None) => None,
            Err(err) => {
                warn!("Could not query peripheral for properties: {:?}", err);
                continue;
            },
        };

        report(events, TransportEvent::ScanResult { device: peripheral, name }).await;
    }
}

/// Polls the link until it drops or `cancel` fires. Drops are reported as an unsolicited disconnect.
async fn supervise_link(peripheral: &Peripheral, cancel: &CancellationToken, events: &mut Events) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(Duration::from_millis(LINK_POLL_DELAY)) => {},
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => return,
            // macOS sometimes never answers
            _ = sleep(Duration::from_millis(IS_CONNECTED_DEADLINE)) => {
                GattStatus::Failure(String::from("checking for connection status took too long"))
            },
            result = peripheral.is_connected() => match result {
                Ok(true) => continue,
                Ok(false) => GattStatus::Success,
                Err(err) => GattStatus::Failure(err.to_string()),
            },
        };

        warn!("Connection lost ({:?})", status);
        report(events, TransportEvent::ConnectionStateChanged { status, state: LinkState::Disconnected }).await;
        return;
    }
}

async fn connect(peripheral: Peripheral, auto_connect: bool, cancel: CancellationToken, mut events: Events) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = peripheral.connect() => result,
        };

        match result {
            Ok(()) => {
                info!("Connected to peripheral {:?}", peripheral.id());
                report(&mut events, TransportEvent::ConnectionStateChanged {
                    status: GattStatus::Success,
                    state: LinkState::Connected,
                }).await;
                supervise_link(&peripheral, &cancel, &mut events).await;
                return;
            },
            Err(err) if auto_connect => {
                debug!("Reconnect failed, trying again: {}", err);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(Duration::from_millis(CONNECT_DELAY)) => {},
                }
            },
            Err(err) => {
                warn!("Connecting to peripheral failed: {:?}", err);
                report(&mut events, TransportEvent::ConnectionStateChanged {
                    status: GattStatus::Failure(err.to_string()),
                    state: LinkState::Disconnected,
                }).await;
                return;
            },
        }
    }
}

/// [`GattTransport`] on top of btleplug. Every request runs as its own tokio task.
pub struct BtleTransport {
    adapter: Adapter,
    events: Events,
    scan_cancel: Option<CancellationToken>,
    // cancels the connect / supervision task of the current link
    link_cancel: CancellationToken,
}

impl BtleTransport {
    /// Uses the first bluetooth adapter of the system.
    pub async fn new(events: Events) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next().ok_or(DeviceError::NoAdapter)?;
        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or(String::from("UNKNOWN")));

        Ok(BtleTransport {
            adapter,
            events,
            scan_cancel: None,
            link_cancel: CancellationToken::new(),
        })
    }

    fn replace_link(&mut self) -> CancellationToken {
        self.link_cancel.cancel();
        self.link_cancel = CancellationToken::new();
        self.link_cancel.clone()
    }

    fn characteristic(&self, device: &Peripheral, service: Uuid, characteristic: Uuid) -> Result<Characteristic, DeviceError> {
        find_characteristic(device, service, characteristic).ok_or(DeviceError::MissingCharacteristic(characteristic))
    }
}

impl GattTransport for BtleTransport {
    type Device = Peripheral;

    fn start_scan(&mut self) -> Result<(), DeviceError> {
        if self.scan_cancel.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        self.scan_cancel = Some(cancel.clone());
        let adapter = self.adapter.clone();
        let mut events = self.events.clone();

        spawn(async move {
            if let Err(err) = scan(&adapter, &cancel, &mut events).await {
                report(&mut events, TransportEvent::ScanFailed { reason: err.to_string() }).await;
            }
            if let Err(err) = adapter.stop_scan().await {
                debug!("Failed to stop scan: {}", err);
            }
        });

        Ok(())
    }

    fn stop_scan(&mut self) {
        if let Some(cancel) = self.scan_cancel.take() {
            cancel.cancel();
        }
    }

    fn connect(&mut self, device: &Peripheral, auto_connect: bool) -> Result<(), DeviceError> {
        let cancel = self.replace_link();
        spawn(connect(device.clone(), auto_connect, cancel, self.events.clone()));
        Ok(())
    }

    fn disconnect(&mut self, device: &Peripheral) {
        // stop supervision first, the confirmation below is the only disconnect event
        self.replace_link();
        let peripheral = device.clone();
        let mut events = self.events.clone();

        spawn(async move {
            let result = peripheral.disconnect().await;
            report(&mut events, TransportEvent::ConnectionStateChanged {
                status: status_of(&result),
                state: LinkState::Disconnected,
            }).await;
        });
    }

    fn close(&mut self, device: &Peripheral) {
        self.replace_link();
        let peripheral = device.clone();

        spawn(async move {
            if let Ok(true) = peripheral.is_connected().await {
                if let Err(err) = peripheral.disconnect().await {
                    debug!("Disconnect while closing failed: {}", err);
                }
            }
        });
    }

    fn discover_services(&mut self, device: &Peripheral) -> Result<(), DeviceError> {
        let peripheral = device.clone();
        let mut events = self.events.clone();

        spawn(async move {
            let result = peripheral.discover_services().await;
            report(&mut events, TransportEvent::ServicesDiscovered { status: status_of(&result) }).await;
        });
        Ok(())
    }

    fn request_mtu(&mut self, _device: &Peripheral, mtu: u16) -> Result<(), DeviceError> {
        // btleplug leaves MTU negotiation to the platform stack; acknowledge the request as is
        debug!("MTU negotiation is handled by the platform");
        let mut events = self.events.clone();
        spawn(async move {
            report(&mut events, TransportEvent::MtuChanged { mtu, status: GattStatus::Success }).await;
        });
        Ok(())
    }

    fn characteristic_properties(&self, device: &Peripheral, service: Uuid, characteristic: Uuid) -> Option<CharPropFlags> {
        find_characteristic(device, service, characteristic).map(|c| c.properties)
    }

    fn read_characteristic(&mut self, device: &Peripheral, service: Uuid, characteristic: Uuid) -> Result<(), DeviceError> {
        let target = self.characteristic(device, service, characteristic)?;
        let peripheral = device.clone();
        let mut events = self.events.clone();

        spawn(async move {
            let result = peripheral.read(&target).await;
            let status = status_of(&result);
            report(&mut events, TransportEvent::CharacteristicRead {
                characteristic,
                value: result.unwrap_or_default(),
                status,
            }).await;
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        device: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), DeviceError> {
        let target = self.characteristic(device, service, characteristic)?;
        let peripheral = device.clone();
        let value = value.to_vec();
        let mut events = self.events.clone();

        spawn(async move {
            let result = peripheral.write(&target, &value, write_type).await;
            report(&mut events, TransportEvent::CharacteristicWritten { characteristic, status: status_of(&result) }).await;
        });
        Ok(())
    }
}
