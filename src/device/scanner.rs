use log::{debug, info};

use crate::device::transport::GattTransport;
use crate::error::DeviceError;

/// Looks for the one peripheral advertising `target_name`. At most one scan runs at a time.
#[derive(Debug)]
pub struct DeviceScanner {
    target_name: String,
    scanning: bool,
}

impl DeviceScanner {
    pub fn new(target_name: String) -> Self {
        DeviceScanner { target_name, scanning: false }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Returns `true` if a new scan was started, `false` if one was already running.
    pub fn start<T: GattTransport>(&mut self, transport: &mut T) -> Result<bool, DeviceError> {
        if self.scanning {
            debug!("Scan already in progress");
            return Ok(false);
        }

        info!("Scanning for {}...", self.target_name);
        transport.start_scan()?;
        self.scanning = true;
        Ok(true)
    }

    pub fn stop<T: GattTransport>(&mut self, transport: &mut T) {
        if self.scanning {
            transport.stop_scan();
            self.scanning = false;
        }
    }

    /// Stops the scan and hands out `device` if it is the first match. Results that arrive after
    /// the scan was stopped are ignored.
    pub fn on_scan_result<T: GattTransport>(
        &mut self,
        transport: &mut T,
        device: T::Device,
        name: Option<&str>,
    ) -> Option<T::Device> {
        if !self.scanning || name != Some(self.target_name.as_str()) {
            return None;
        }

        info!("Found {} {:?}", self.target_name, device);
        self.stop(transport);
        Some(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::{Call, FakeTransport};

    #[test]
    fn only_one_scan_at_a_time() {
        let mut transport = FakeTransport::new();
        let mut scanner = DeviceScanner::new(String::from("Gecko"));

        assert!(scanner.start(&mut transport).unwrap());
        assert!(!scanner.start(&mut transport).unwrap());
        assert!(scanner.is_scanning());
        assert_eq!(transport.calls(), vec![Call::StartScan]);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut transport = FakeTransport::new();
        let mut scanner = DeviceScanner::new(String::from("Gecko"));

        scanner.stop(&mut transport);
        scanner.start(&mut transport).unwrap();
        scanner.stop(&mut transport);
        scanner.stop(&mut transport);

        assert!(!scanner.is_scanning());
        assert_eq!(transport.calls(), vec![Call::StartScan, Call::StopScan]);
    }

    #[test]
    fn hands_out_first_exact_name_match_once() {
        let mut transport = FakeTransport::new();
        let mut scanner = DeviceScanner::new(String::from("Gecko"));
        scanner.start(&mut transport).unwrap();

        assert_eq!(scanner.on_scan_result(&mut transport, "headphones", Some("Buds")), None);
        assert_eq!(scanner.on_scan_result(&mut transport, "unnamed", None), None);
        assert_eq!(scanner.on_scan_result(&mut transport, "almost", Some("Gecko2")), None);
        assert_eq!(scanner.on_scan_result(&mut transport, "watch", Some("Gecko")), Some("watch"));
        assert_eq!(scanner.on_scan_result(&mut transport, "watch", Some("Gecko")), None);

        assert!(!scanner.is_scanning());
        assert_eq!(transport.calls(), vec![Call::StartScan, Call::StopScan]);
    }

    #[test]
    fn failed_start_leaves_scanner_idle() {
        let mut transport = FakeTransport::new();
        transport.fail_scans();
        let mut scanner = DeviceScanner::new(String::from("Gecko"));

        assert!(scanner.start(&mut transport).is_err());
        assert!(!scanner.is_scanning());
    }
}
