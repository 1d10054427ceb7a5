//! The capability interface between the connection state machine and the radio.
//!
//! Every request is fire-and-forget: a method returns as soon as the request is handed to the
//! platform, and its outcome arrives later as a [`TransportEvent`] on the channel the transport was
//! created with. An `Err` return means the request could not even be issued.

use std::fmt::Debug;
use btleplug::api::{CharPropFlags, WriteType};
use futures::channel::mpsc::{channel, Receiver, Sender};
use uuid::Uuid;

use crate::device::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::DeviceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Callbacks from the radio, delivered in the order the platform produced them.
#[derive(Debug, Clone)]
pub enum TransportEvent<D> {
    ScanResult {
        device: D,
        name: Option<String>,
    },
    ScanFailed {
        reason: String,
    },
    ConnectionStateChanged {
        status: GattStatus,
        state: LinkState,
    },
    ServicesDiscovered {
        status: GattStatus,
    },
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
    CharacteristicRead {
        characteristic: Uuid,
        value: Vec<u8>,
        status: GattStatus,
    },
    CharacteristicWritten {
        characteristic: Uuid,
        status: GattStatus,
    },
}

pub type TransportEventSender<D> = Sender<TransportEvent<D>>;
pub type TransportEventReceiver<D> = Receiver<TransportEvent<D>>;

pub fn transport_channel<D>() -> (TransportEventSender<D>, TransportEventReceiver<D>) {
    channel(EVENT_CHANNEL_CAPACITY)
}

pub trait GattTransport: Send + 'static {
    /// Handle to a discovered peripheral.
    type Device: Clone + Debug + Send + Sync + 'static;

    fn start_scan(&mut self) -> Result<(), DeviceError>;

    /// Must be safe to call while no scan is running.
    fn stop_scan(&mut self);

    /// With `auto_connect` the platform keeps retrying until the device comes back into range
    /// (or until `disconnect`/`close` is requested).
    fn connect(&mut self, device: &Self::Device, auto_connect: bool) -> Result<(), DeviceError>;

    /// Answered by a `ConnectionStateChanged` event.
    fn disconnect(&mut self, device: &Self::Device);

    /// Releases every platform resource held for `device`. Produces no event.
    fn close(&mut self, device: &Self::Device);

    fn discover_services(&mut self, device: &Self::Device) -> Result<(), DeviceError>;

    fn request_mtu(&mut self, device: &Self::Device, mtu: u16) -> Result<(), DeviceError>;

    /// `None` if the characteristic was not discovered.
    fn characteristic_properties(&self, device: &Self::Device, service: Uuid, characteristic: Uuid) -> Option<CharPropFlags>;

    fn read_characteristic(&mut self, device: &Self::Device, service: Uuid, characteristic: Uuid) -> Result<(), DeviceError>;

    fn write_characteristic(
        &mut self,
        device: &Self::Device,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), DeviceError>;
}
