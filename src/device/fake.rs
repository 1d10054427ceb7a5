//! In-memory transport used by the state machine tests. It never produces events on its own; tests
//! feed `TransportEvent`s and then inspect which requests were made.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use btleplug::api::{CharPropFlags, WriteType};
use uuid::Uuid;

use crate::device::constants::{BATTERY_LEVEL_CHARACTERISTIC, NOTIFICATION_CHARACTERISTIC, UPDATE_WATCH_TIME_CHARACTERISTIC};
use crate::device::transport::GattTransport;
use crate::error::DeviceError;

pub type FakeDevice = &'static str;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect { device: FakeDevice, auto_connect: bool },
    Disconnect(FakeDevice),
    Close(FakeDevice),
    DiscoverServices(FakeDevice),
    RequestMtu(u16),
    Read(Uuid),
    Write { characteristic: Uuid, value: Vec<u8>, write_type: WriteType },
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<Call>,
    fail_scan: bool,
}

/// Cloning shares the call log, so a test can keep a copy after moving one into the link.
#[derive(Debug, Clone)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
    properties: HashMap<Uuid, CharPropFlags>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let mut properties = HashMap::new();
        properties.insert(BATTERY_LEVEL_CHARACTERISTIC, CharPropFlags::READ);
        properties.insert(NOTIFICATION_CHARACTERISTIC, CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE);
        properties.insert(UPDATE_WATCH_TIME_CHARACTERISTIC, CharPropFlags::WRITE_WITHOUT_RESPONSE);

        FakeTransport {
            state: Arc::new(Mutex::new(FakeState::default())),
            properties,
        }
    }

    pub fn with_properties(mut self, characteristic: Uuid, properties: CharPropFlags) -> Self {
        self.properties.insert(characteristic, properties);
        self
    }

    pub fn without_characteristic(mut self, characteristic: Uuid) -> Self {
        self.properties.remove(&characteristic);
        self
    }

    pub fn fail_scans(&self) {
        self.state.lock().unwrap().fail_scan = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Returns the calls made since the previous `take_calls`.
    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.state.lock().unwrap().calls)
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

impl GattTransport for FakeTransport {
    type Device = FakeDevice;

    fn start_scan(&mut self) -> Result<(), DeviceError> {
        if self.state.lock().unwrap().fail_scan {
            return Err(DeviceError::NoAdapter);
        }
        self.record(Call::StartScan);
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.record(Call::StopScan);
    }

    fn connect(&mut self, device: &FakeDevice, auto_connect: bool) -> Result<(), DeviceError> {
        self.record(Call::Connect { device: *device, auto_connect });
        Ok(())
    }

    fn disconnect(&mut self, device: &FakeDevice) {
        self.record(Call::Disconnect(*device));
    }

    fn close(&mut self, device: &FakeDevice) {
        self.record(Call::Close(*device));
    }

    fn discover_services(&mut self, device: &FakeDevice) -> Result<(), DeviceError> {
        self.record(Call::DiscoverServices(*device));
        Ok(())
    }

    fn request_mtu(&mut self, _device: &FakeDevice, mtu: u16) -> Result<(), DeviceError> {
        self.record(Call::RequestMtu(mtu));
        Ok(())
    }

    fn characteristic_properties(&self, _device: &FakeDevice, _service: Uuid, characteristic: Uuid) -> Option<CharPropFlags> {
        self.properties.get(&characteristic).copied()
    }

    fn read_characteristic(&mut self, _device: &FakeDevice, _service: Uuid, characteristic: Uuid) -> Result<(), DeviceError> {
        self.record(Call::Read(characteristic));
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        _device: &FakeDevice,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), DeviceError> {
        self.record(Call::Write { characteristic, value: value.to_vec(), write_type });
        Ok(())
    }
}
