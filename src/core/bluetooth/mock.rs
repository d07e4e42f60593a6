//! In-process stand-ins for the scanner and the vendor plugin.
//! Used by the test suites and by the CLI `--simulate` mode.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::info;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::{
    EVENT_CHANNEL_CAPACITY, VENDOR_STATE_CONNECTED, VENDOR_STATE_CONNECTING,
    VENDOR_STATE_DISCONNECTED,
};
use crate::core::bluetooth::transport::{ScanProvider, VendorPlugin};
use crate::core::bluetooth::types::{
    BackgroundImage, DeviceSource, DiscoveredDevice, FileTransferEvent, VendorEvent,
};

/// How the mock plugin answers
#[derive(Debug, Clone)]
pub struct MockBehaviour {
    pub available: bool,
    /// Emit a "connected" state from `connect`
    pub auto_link: bool,
    /// How long `connect` takes before it links
    pub link_delay: Duration,
    pub fail_connect: bool,
    pub fail_scan: bool,
    pub fail_info_queries: bool,
    pub fail_transfers: bool,
    /// Play a progress sequence after a transfer is submitted
    pub simulate_transfers: bool,
    pub transfer_step: Duration,
    pub firmware: String,
    pub battery: i32,
    pub display_face: i32,
    pub scan_results: Vec<DiscoveredDevice>,
}

impl Default for MockBehaviour {
    fn default() -> Self {
        Self {
            available: true,
            auto_link: false,
            link_delay: Duration::ZERO,
            fail_connect: false,
            fail_scan: false,
            fail_info_queries: false,
            fail_transfers: false,
            simulate_transfers: false,
            transfer_step: Duration::from_millis(200),
            firmware: "1.0.0".to_string(),
            battery: 80,
            display_face: 0,
            scan_results: Vec::new(),
        }
    }
}

/// Calls recorded by the mock plugin
#[derive(Debug, Clone, Default)]
pub struct MockCalls {
    pub connects: Vec<(String, bool)>,
    pub disconnects: usize,
    pub firmware_queries: usize,
    pub battery_queries: usize,
    pub face_queries: usize,
    pub face_sets: Vec<i32>,
    pub images: Vec<(BackgroundImage, u64)>,
    pub packages: Vec<(PathBuf, i32, u64)>,
    pub transfer_cancels: usize,
    /// Address the mock currently holds a link to
    pub linked: Option<String>,
    pub scan_starts: usize,
    pub scan_stops: usize,
}

/// Scriptable vendor plugin
pub struct MockVendorPlugin {
    events: broadcast::Sender<VendorEvent>,
    behaviour: Mutex<MockBehaviour>,
    calls: Mutex<MockCalls>,
    transfer: Mutex<Option<CancellationToken>>,
}

impl MockVendorPlugin {
    pub fn new() -> Self {
        Self::with_behaviour(MockBehaviour::default())
    }

    pub fn with_behaviour(behaviour: MockBehaviour) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            events,
            behaviour: Mutex::new(behaviour),
            calls: Mutex::new(MockCalls::default()),
            transfer: Mutex::new(None),
        }
    }

    /// A plugin that links, reports and transfers on its own, with two watches nearby
    pub fn simulated() -> Self {
        Self::with_behaviour(MockBehaviour {
            auto_link: true,
            simulate_transfers: true,
            firmware: "AW12-2.3.1".to_string(),
            battery: 76,
            scan_results: vec![
                DiscoveredDevice::new("AW12-Pro", "C4:7F:0E:11:22:33", -58, DeviceSource::VendorScanner),
                DiscoveredDevice::new("AW12-Lite", "C4:7F:0E:44:55:66", -71, DeviceSource::VendorScanner),
            ],
            ..MockBehaviour::default()
        })
    }

    pub fn update_behaviour(&self, update: impl FnOnce(&mut MockBehaviour)) {
        update(&mut self.behaviour.lock().unwrap());
    }

    pub fn calls(&self) -> MockCalls {
        self.calls.lock().unwrap().clone()
    }

    /// Injects a raw vendor notification
    pub fn emit(&self, event: VendorEvent) {
        let _ = self.events.send(event);
    }

    fn behaviour(&self) -> MockBehaviour {
        self.behaviour.lock().unwrap().clone()
    }

    fn record(&self, update: impl FnOnce(&mut MockCalls)) {
        update(&mut self.calls.lock().unwrap());
    }

    fn play_transfer(&self, step: Duration) {
        let cancel_token = CancellationToken::new();
        if let Some(previous) = self.transfer.lock().unwrap().replace(cancel_token.clone()) {
            previous.cancel();
        }
        let events = self.events.clone();
        tokio::spawn(async move {
            for progress in [0, 25, 50, 75, 100] {
                tokio::select! {
                    _ = tokio::time::sleep(step) => {}
                    _ = cancel_token.cancelled() => return,
                }
                let _ = events.send(VendorEvent::FileTransfer(FileTransferEvent::progress(progress)));
            }
        });
    }

    fn stop_transfer(&self) {
        if let Some(token) = self.transfer.lock().unwrap().take() {
            token.cancel();
        }
    }
}

impl Default for MockVendorPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ScanProvider for MockVendorPlugin {
    fn source(&self) -> DeviceSource {
        DeviceSource::VendorScanner
    }

    async fn is_available(&self) -> bool {
        self.behaviour().available
    }

    async fn start_scan(&self, sink: mpsc::UnboundedSender<DiscoveredDevice>) -> Result<()> {
        self.record(|c| c.scan_starts += 1);
        let behaviour = self.behaviour();
        if behaviour.fail_scan {
            return Err(anyhow!("Vendor scan refused"));
        }
        for device in behaviour.scan_results {
            let _ = sink.send(device);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(|c| c.scan_stops += 1);
        Ok(())
    }
}

#[async_trait::async_trait]
impl VendorPlugin for MockVendorPlugin {
    async fn connect(&self, address: &str, auto_connect: bool) -> Result<()> {
        self.record(|c| c.connects.push((address.to_string(), auto_connect)));
        let behaviour = self.behaviour();
        if behaviour.fail_connect {
            return Err(anyhow!("Device {} refused the connection", address));
        }
        self.emit(VendorEvent::connection_state(VENDOR_STATE_CONNECTING, address));
        if behaviour.auto_link {
            if !behaviour.link_delay.is_zero() {
                tokio::time::sleep(behaviour.link_delay).await;
            }
            info!("Mock link to {} established", address);
            self.record(|c| c.linked = Some(address.to_string()));
            self.emit(VendorEvent::connection_state(VENDOR_STATE_CONNECTED, address));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_transfer();
        let mut address = None;
        self.record(|c| {
            c.disconnects += 1;
            address = c.linked.take();
        });
        self.emit(VendorEvent::connection_state(
            VENDOR_STATE_DISCONNECTED,
            address.unwrap_or_default(),
        ));
        Ok(())
    }

    async fn query_firmware_version(&self) -> Result<String> {
        self.record(|c| c.firmware_queries += 1);
        let behaviour = self.behaviour();
        if behaviour.fail_info_queries {
            return Err(anyhow!("Firmware query timed out"));
        }
        Ok(behaviour.firmware)
    }

    async fn query_battery(&self) -> Result<()> {
        self.record(|c| c.battery_queries += 1);
        let behaviour = self.behaviour();
        if behaviour.fail_info_queries {
            return Err(anyhow!("Battery query timed out"));
        }
        self.emit(VendorEvent::Battery(behaviour.battery));
        Ok(())
    }

    async fn query_display_face(&self) -> Result<i32> {
        self.record(|c| c.face_queries += 1);
        Ok(self.behaviour().display_face)
    }

    async fn set_display_face(&self, index: i32) -> Result<()> {
        self.record(|c| c.face_sets.push(index));
        self.update_behaviour(|b| b.display_face = index);
        Ok(())
    }

    async fn send_background_image(&self, image: BackgroundImage, timeout_secs: u64) -> Result<()> {
        self.record(|c| c.images.push((image, timeout_secs)));
        let behaviour = self.behaviour();
        if behaviour.fail_transfers {
            return Err(anyhow!("Image command rejected"));
        }
        if behaviour.simulate_transfers {
            self.play_transfer(behaviour.transfer_step);
        }
        Ok(())
    }

    async fn send_bin_package(&self, path: &Path, index: i32, timeout_secs: u64) -> Result<()> {
        self.record(|c| c.packages.push((path.to_path_buf(), index, timeout_secs)));
        let behaviour = self.behaviour();
        if behaviour.fail_transfers {
            return Err(anyhow!("Package command rejected"));
        }
        if behaviour.simulate_transfers {
            self.play_transfer(behaviour.transfer_step);
        }
        Ok(())
    }

    async fn cancel_transfer(&self) -> Result<()> {
        self.record(|c| c.transfer_cancels += 1);
        self.stop_transfer();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<VendorEvent> {
        self.events.subscribe()
    }
}

/// Scriptable generic scanner
pub struct MockScanProvider {
    devices: Vec<DiscoveredDevice>,
    available: AtomicBool,
    fail_start: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockScanProvider {
    pub fn new(devices: Vec<DiscoveredDevice>) -> Self {
        Self {
            devices,
            available: AtomicBool::new(true),
            fail_start: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ScanProvider for MockScanProvider {
    fn source(&self) -> DeviceSource {
        DeviceSource::PrimaryScanner
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn start_scan(&self, sink: mpsc::UnboundedSender<DiscoveredDevice>) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(anyhow!("Generic scanner unavailable"));
        }
        for device in &self.devices {
            let _ = sink.send(device.clone());
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
