use btleplug::api::{CharPropFlags, WriteType};
use log::{debug, info};
use uuid::Uuid;

use crate::device::codec::decode_battery_voltage;
use crate::device::transport::{GattStatus, GattTransport};
use crate::device::types::{DeviceProfile, Operation};
use crate::error::{DeviceError, PayloadError};

/// Outcome of a characteristic read that the session was asked to interpret.
#[derive(Debug, PartialEq)]
pub enum ReadOutcome {
    BatteryVoltage(f32),
    UnknownCharacteristic(Uuid),
    Failed(String),
    Malformed(PayloadError),
}

/// Prefers acknowledged writes when the characteristic supports both.
pub fn select_write_type(properties: CharPropFlags) -> Option<WriteType> {
    if properties.contains(CharPropFlags::WRITE) {
        Some(WriteType::WithResponse)
    } else if properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
        Some(WriteType::WithoutResponse)
    } else {
        None
    }
}

/// A live GATT link to the watch. Owned by the connection state machine.
#[derive(Debug)]
pub struct GattSession<D> {
    device: D,
    profile: DeviceProfile,
    mtu: Option<u16>,
}

impl<D: Clone + std::fmt::Debug> GattSession<D> {
    pub fn new(device: D, profile: DeviceProfile) -> Self {
        GattSession { device, profile, mtu: None }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn mtu(&self) -> Option<u16> {
        self.mtu
    }

    pub fn discover_services<T: GattTransport<Device = D>>(&self, transport: &mut T) -> Result<(), DeviceError> {
        info!("Discovering services...");
        transport.discover_services(&self.device)
    }

    pub fn request_mtu<T: GattTransport<Device = D>>(&self, transport: &mut T, mtu: u16) -> Result<(), DeviceError> {
        debug!("Requesting MTU {}", mtu);
        transport.request_mtu(&self.device, mtu)
    }

    pub fn accept_mtu(&mut self, mtu: u16) {
        info!("MTU was updated to {}", mtu);
        self.mtu = Some(mtu);
    }

    pub fn read_battery_voltage<T: GattTransport<Device = D>>(&self, transport: &mut T) -> Result<(), DeviceError> {
        let characteristic = self.profile.battery_level;
        let properties = transport
            .characteristic_properties(&self.device, self.profile.service, characteristic)
            .ok_or(DeviceError::MissingCharacteristic(characteristic))?;

        if !properties.contains(CharPropFlags::READ) {
            return Err(DeviceError::NotReadable(characteristic));
        }

        transport.read_characteristic(&self.device, self.profile.service, characteristic)
    }

    pub fn write_notification<T: GattTransport<Device = D>>(&self, transport: &mut T, payload: &[u8]) -> Result<(), DeviceError> {
        self.write(transport, self.profile.notification, payload)
    }

    pub fn write_watch_time<T: GattTransport<Device = D>>(&self, transport: &mut T, payload: &[u8]) -> Result<(), DeviceError> {
        self.write(transport, self.profile.update_watch_time, payload)
    }

    fn write<T: GattTransport<Device = D>>(&self, transport: &mut T, characteristic: Uuid, payload: &[u8]) -> Result<(), DeviceError> {
        let properties = transport
            .characteristic_properties(&self.device, self.profile.service, characteristic)
            .ok_or(DeviceError::MissingCharacteristic(characteristic))?;
        let write_type = select_write_type(properties).ok_or(DeviceError::NotWritable(characteristic))?;

        debug!("Writing {} bytes to {} ({:?})", payload.len(), characteristic, write_type);
        transport.write_characteristic(&self.device, self.profile.service, characteristic, payload, write_type)
    }

    pub fn interpret_read(&self, characteristic: Uuid, status: &GattStatus, value: &[u8]) -> ReadOutcome {
        if characteristic != self.profile.battery_level {
            return ReadOutcome::UnknownCharacteristic(characteristic);
        }

        if let GattStatus::Failure(reason) = status {
            return ReadOutcome::Failed(reason.clone());
        }

        debug!("Incoming battery voltage bytes: {:02X?}", value);
        match decode_battery_voltage(value) {
            Ok(voltage) => ReadOutcome::BatteryVoltage(voltage),
            Err(err) => ReadOutcome::Malformed(err),
        }
    }

    pub fn write_operation(&self, characteristic: Uuid) -> Option<Operation> {
        if characteristic == self.profile.notification {
            Some(Operation::NotificationWrite)
        } else if characteristic == self.profile.update_watch_time {
            Some(Operation::WatchTimeWrite)
        } else {
            None
        }
    }

    pub fn disconnect<T: GattTransport<Device = D>>(&self, transport: &mut T) {
        info!("Disconnecting from {:?}", self.device);
        transport.disconnect(&self.device);
    }

    pub fn close<T: GattTransport<Device = D>>(self, transport: &mut T) {
        info!("Closing session with {:?}", self.device);
        transport.close(&self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::constants::{BATTERY_LEVEL_CHARACTERISTIC, NOTIFICATION_CHARACTERISTIC, UPDATE_WATCH_TIME_CHARACTERISTIC};
    use crate::device::fake::{Call, FakeDevice, FakeTransport};

    fn session() -> GattSession<FakeDevice> {
        GattSession::new("watch", DeviceProfile::default())
    }

    #[test]
    fn write_type_prefers_response() {
        assert_eq!(select_write_type(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE), Some(WriteType::WithResponse));
        assert_eq!(select_write_type(CharPropFlags::WRITE_WITHOUT_RESPONSE), Some(WriteType::WithoutResponse));
        assert_eq!(select_write_type(CharPropFlags::READ | CharPropFlags::NOTIFY), None);
    }

    #[test]
    fn writes_use_advertised_write_type() {
        let mut transport = FakeTransport::new();
        let session = session();

        session.write_notification(&mut transport, b"hi").unwrap();
        session.write_watch_time(&mut transport, &[0, 0, 0, 0, 0, 0, 0, 1]).unwrap();

        assert_eq!(transport.calls(), vec![
            Call::Write { characteristic: NOTIFICATION_CHARACTERISTIC, value: b"hi".to_vec(), write_type: WriteType::WithResponse },
            Call::Write { characteristic: UPDATE_WATCH_TIME_CHARACTERISTIC, value: vec![0, 0, 0, 0, 0, 0, 0, 1], write_type: WriteType::WithoutResponse },
        ]);
    }

    #[test]
    fn unwritable_characteristic_is_dropped() {
        let mut transport = FakeTransport::new().with_properties(NOTIFICATION_CHARACTERISTIC, CharPropFlags::READ);
        let result = session().write_notification(&mut transport, b"hi");

        assert!(matches!(result, Err(DeviceError::NotWritable(uuid)) if uuid == NOTIFICATION_CHARACTERISTIC));
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn battery_read_requires_readable_characteristic() {
        let mut transport = FakeTransport::new();
        session().read_battery_voltage(&mut transport).unwrap();
        assert_eq!(transport.take_calls(), vec![Call::Read(BATTERY_LEVEL_CHARACTERISTIC)]);

        let mut transport = FakeTransport::new().with_properties(BATTERY_LEVEL_CHARACTERISTIC, CharPropFlags::WRITE);
        assert!(matches!(session().read_battery_voltage(&mut transport), Err(DeviceError::NotReadable(_))));

        let mut transport = FakeTransport::new().without_characteristic(BATTERY_LEVEL_CHARACTERISTIC);
        assert!(matches!(session().read_battery_voltage(&mut transport), Err(DeviceError::MissingCharacteristic(_))));
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn interprets_battery_reads() {
        let session = session();

        assert_eq!(
            session.interpret_read(BATTERY_LEVEL_CHARACTERISTIC, &GattStatus::Success, &[0x00, 0x00, 0x80, 0x3F]),
            ReadOutcome::BatteryVoltage(1.0)
        );
        assert_eq!(
            session.interpret_read(NOTIFICATION_CHARACTERISTIC, &GattStatus::Success, &[0x00, 0x00, 0x80, 0x3F]),
            ReadOutcome::UnknownCharacteristic(NOTIFICATION_CHARACTERISTIC)
        );
        assert_eq!(
            session.interpret_read(BATTERY_LEVEL_CHARACTERISTIC, &GattStatus::Failure(String::from("busy")), &[]),
            ReadOutcome::Failed(String::from("busy"))
        );
        assert!(matches!(
            session.interpret_read(BATTERY_LEVEL_CHARACTERISTIC, &GattStatus::Success, &[0x01]),
            ReadOutcome::Malformed(PayloadError::WrongLength { actual: 1, .. })
        ));
    }

    #[test]
    fn remembers_granted_mtu() {
        let mut session = session();
        assert_eq!(session.mtu(), None);
        session.accept_mtu(247);
        assert_eq!(session.mtu(), Some(247));
    }

    #[test]
    fn maps_written_characteristics_to_operations() {
        let session = session();
        assert_eq!(session.write_operation(NOTIFICATION_CHARACTERISTIC), Some(Operation::NotificationWrite));
        assert_eq!(session.write_operation(UPDATE_WATCH_TIME_CHARACTERISTIC), Some(Operation::WatchTimeWrite));
        assert_eq!(session.write_operation(BATTERY_LEVEL_CHARACTERISTIC), None);
    }
}
