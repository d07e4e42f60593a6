//! Device registry
//! Merges scan results from both discovery sources into one list, unique by
//! address, in the order devices were first seen.

use std::sync::Mutex;

use log::debug;
use tokio::sync::watch;

use crate::core::bluetooth::DiscoveredDevice;
use crate::core::session::channel::StateChannel;

pub struct DeviceRegistry {
    devices: Mutex<Vec<DiscoveredDevice>>,
    channel: StateChannel<Vec<DiscoveredDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            channel: StateChannel::new(),
        }
    }

    /// Clears the list and republishes it empty
    pub fn reset(&self) {
        let mut devices = self.devices.lock().unwrap();
        devices.clear();
        self.channel.publish(Vec::new());
    }

    /// Adds the candidate unless its address is already known, then republishes.
    /// Returns true if the candidate was added.
    pub fn offer(&self, candidate: DiscoveredDevice) -> bool {
        let mut devices = self.devices.lock().unwrap();
        let added = if devices.iter().any(|d| d.address == candidate.address) {
            debug!(
                "Dropping duplicate report of {} from {:?}",
                candidate.address, candidate.source
            );
            false
        } else {
            devices.push(candidate);
            true
        };
        self.channel.publish(devices.clone());
        added
    }

    pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
        self.devices.lock().unwrap().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.channel.subscribe()
    }

    pub fn close(&self) {
        self.channel.close();
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Presentation order: watches of the product family first, otherwise
/// discovery order.
pub fn sort_for_display(devices: &[DiscoveredDevice], product_prefix: &str) -> Vec<DiscoveredDevice> {
    let mut sorted = devices.to_vec();
    sorted.sort_by_key(|d| !d.matches_product(product_prefix));
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::DeviceSource;

    fn device(name: &str, address: &str, rssi: i16, source: DeviceSource) -> DiscoveredDevice {
        DiscoveredDevice::new(name, address, rssi, source)
    }

    #[test]
    fn first_seen_report_wins() {
        let registry = DeviceRegistry::new();
        registry.offer(device("AW12-X", "AA:01", -60, DeviceSource::PrimaryScanner));
        let added = registry.offer(device("AW12-X-DUP", "AA:01", -40, DeviceSource::VendorScanner));

        assert!(!added);
        let devices = registry.snapshot();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "AW12-X");
        assert_eq!(devices[0].rssi, -60);
        assert_eq!(devices[0].source, DeviceSource::PrimaryScanner);
    }

    #[test]
    fn insertion_order_is_kept() {
        let registry = DeviceRegistry::new();
        registry.offer(device("Weak", "AA:03", -90, DeviceSource::VendorScanner));
        registry.offer(device("Strong", "AA:01", -30, DeviceSource::PrimaryScanner));
        registry.offer(device("Weak", "AA:03", -20, DeviceSource::PrimaryScanner));
        registry.offer(device("Middle", "AA:02", -50, DeviceSource::VendorScanner));

        let addresses: Vec<_> = registry.snapshot().into_iter().map(|d| d.address).collect();
        assert_eq!(addresses, vec!["AA:03", "AA:01", "AA:02"]);
    }

    #[test]
    fn every_offer_republishes() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();

        registry.offer(device("AW12-X", "AA:01", -60, DeviceSource::PrimaryScanner));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        registry.offer(device("AW12-X", "AA:01", -60, DeviceSource::VendorScanner));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);
    }

    #[test]
    fn reset_publishes_empty_list() {
        let registry = DeviceRegistry::new();
        registry.offer(device("AW12-X", "AA:01", -60, DeviceSource::PrimaryScanner));
        let rx = registry.subscribe();

        registry.reset();

        assert!(registry.snapshot().is_empty());
        assert!(rx.borrow().is_empty());
    }

    #[test]
    fn display_sort_puts_product_family_first() {
        let devices = vec![
            device("Phone", "AA:01", -40, DeviceSource::PrimaryScanner),
            device("AW12-Pro", "AA:02", -70, DeviceSource::VendorScanner),
            device("Speaker", "AA:03", -50, DeviceSource::PrimaryScanner),
            device("AW12-Lite", "AA:04", -80, DeviceSource::PrimaryScanner),
        ];

        let names: Vec<_> = sort_for_display(&devices, "AW12")
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["AW12-Pro", "AW12-Lite", "Phone", "Speaker"]);
    }
}
