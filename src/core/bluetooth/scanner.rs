
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bluest::{Adapter, AdvertisingDevice, Device, Uuid};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::RADIO_READY_TIMEOUT_MS;
use crate::core::bluetooth::transport::ScanProvider;
use crate::core::bluetooth::types::{DeviceSource, DiscoveredDevice};

/// Device handles seen by any scanner, keyed by hardware address
pub type DeviceCache = Arc<Mutex<HashMap<String, Device>>>;

struct ScanTask {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Cycling BLE scanner over a bluest adapter
pub struct BluetoothScanner {
    adapter: Adapter,
    devices: DeviceCache,
    source: DeviceSource,
    service_filter: Vec<Uuid>,
    cycle: Duration,
    min_rssi: i16,
    task: Mutex<Option<ScanTask>>,
}

impl BluetoothScanner {
    pub fn new(
        adapter: Adapter,
        devices: DeviceCache,
        source: DeviceSource,
        service_filter: Vec<Uuid>,
        cycle: Duration,
        min_rssi: i16,
    ) -> Self {
        Self {
            adapter,
            devices,
            source,
            service_filter,
            cycle,
            min_rssi,
            task: Mutex::new(None),
        }
    }

    /// Scans until cancelled, restarting the adapter scan every cycle
    async fn internal_scan_task(
        adapter: Adapter,
        devices: DeviceCache,
        sink: mpsc::UnboundedSender<DiscoveredDevice>,
        cancel_token: CancellationToken,
        service_filter: Vec<Uuid>,
        source: DeviceSource,
        cycle: Duration,
        min_rssi: i16,
    ) -> Result<()> {
        loop {
            info!("Starting {:?} scan cycle of {:?}", source, cycle);
            let mut scan_stream = adapter.scan(&service_filter).await?;
            let cycle_end = tokio::time::sleep(cycle);
            tokio::pin!(cycle_end);

            loop {
                tokio::select! {
                    result = scan_stream.next() => {
                        match result {
                            Some(discovered_device) => {
                                Self::report_device(&devices, &sink, discovered_device, source, min_rssi);
                            }
                            None => {
                                info!("Bluetooth scan stream has ended.");
                                break;
                            }
                        }
                    }
                    _ = &mut cycle_end => {
                        debug!("Scan cycle elapsed, restarting");
                        break;
                    }
                    _ = cancel_token.cancelled() => {
                        return Ok(());
                    }
                }
            }

            if sink.is_closed() {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                _ = cancel_token.cancelled() => return Ok(()),
            }
        }
    }

    fn report_device(
        devices: &DeviceCache,
        sink: &mpsc::UnboundedSender<DiscoveredDevice>,
        discovered_device: AdvertisingDevice,
        source: DeviceSource,
        min_rssi: i16,
    ) {
        let device = discovered_device.device;
        let Some(rssi) = discovered_device.rssi else {
            return;
        };
        // Only include devices with medium or stronger signal strength
        if rssi < min_rssi {
            return;
        }

        let name = discovered_device
            .adv_data
            .local_name
            .or_else(|| device.name().ok())
            .unwrap_or_else(|| "Unknown".to_string());
        let id = device.id().to_string();
        let address = extract_mac_address(&id).unwrap_or_else(|| id.clone());
        debug!("Found device - Address: {}, Name: {}, RSSI: {}", address, name, rssi);

        devices.lock().unwrap().insert(address.clone(), device);
        let _ = sink.send(DiscoveredDevice::new(name, address, rssi, source));
    }
}

#[async_trait::async_trait]
impl ScanProvider for BluetoothScanner {
    fn source(&self) -> DeviceSource {
        self.source
    }

    async fn is_available(&self) -> bool {
        radio_ready(
            self.adapter.wait_available(),
            Duration::from_millis(RADIO_READY_TIMEOUT_MS),
        )
        .await
    }

    async fn start_scan(&self, sink: mpsc::UnboundedSender<DiscoveredDevice>) -> Result<()> {
        self.stop_scan().await?;

        let cancel_token = CancellationToken::new();
        let cancel_token_for_task = cancel_token.clone();
        let adapter_for_task = self.adapter.clone();
        let devices_for_task = self.devices.clone();
        let service_filter = self.service_filter.clone();
        let (source, cycle, min_rssi) = (self.source, self.cycle, self.min_rssi);

        let handle = tokio::spawn(async move {
            if let Err(e) = Self::internal_scan_task(
                adapter_for_task,
                devices_for_task,
                sink,
                cancel_token_for_task,
                service_filter,
                source,
                cycle,
                min_rssi,
            )
            .await
            {
                error!("{:?} scan task failed: {}", source, e);
            }
        });

        *self.task.lock().unwrap() = Some(ScanTask { cancel_token, handle });
        info!("{:?} scan task started.", self.source);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let task = self.task.lock().unwrap().take();
        let Some(task) = task else {
            debug!("No active {:?} scan task to stop.", self.source);
            return Ok(());
        };

        info!("Stopping {:?} scan.", self.source);
        task.cancel_token.cancel();
        match task.handle.await {
            Ok(()) => info!("{:?} scan task finished after cancellation.", self.source),
            Err(e) if e.is_cancelled() => info!("{:?} scan task was cancelled.", self.source),
            Err(e) => error!("{:?} scan task ended with a join error: {:?}", self.source, e),
        }
        Ok(())
    }
}

/// True when `wait_available` resolves successfully within `limit`.
/// A powered-off radio never resolves, so it reads as unavailable.
pub async fn radio_ready<F, E>(wait_available: F, limit: Duration) -> bool
where
    F: Future<Output = std::result::Result<(), E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(limit, wait_available).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("Bluetooth adapter unavailable: {}", e);
            false
        }
        Err(_) => {
            debug!("Bluetooth adapter not powered on within {:?}", limit);
            false
        }
    }
}

/// Pulls a MAC address out of a platform device id
pub fn extract_mac_address(device_id_str: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
    re.find_iter(device_id_str)
        .last()
        .map(|m| m.as_str().replace('-', ":").to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_is_extracted_from_bluez_path() {
        assert_eq!(
            extract_mac_address("/org/bluez/hci0/dev_C4-7F-0E-11-22-33"),
            Some("C4:7F:0E:11:22:33".to_string())
        );
    }

    #[test]
    fn last_mac_wins_in_windows_ids() {
        assert_eq!(
            extract_mac_address("BluetoothLE#BluetoothLE00:1a:7d:da:71:13-c4:7f:0e:11:22:33"),
            Some("C4:7F:0E:11:22:33".to_string())
        );
    }

    #[test]
    fn opaque_ids_have_no_mac() {
        assert_eq!(extract_mac_address("5C2A0B1E-7D41-4F0E-9E55-8C0D3E5A7B21"), None);
    }

    const READY_LIMIT: Duration = Duration::from_millis(RADIO_READY_TIMEOUT_MS);

    #[tokio::test]
    async fn powered_adapter_is_ready() {
        assert!(radio_ready(async { Ok::<(), String>(()) }, READY_LIMIT).await);
    }

    #[tokio::test(start_paused = true)]
    async fn adapter_that_never_powers_on_is_unavailable() {
        let started = tokio::time::Instant::now();
        assert!(!radio_ready(std::future::pending::<std::result::Result<(), String>>(), READY_LIMIT).await);
        assert!(started.elapsed() >= READY_LIMIT);
    }

    #[tokio::test]
    async fn adapter_error_is_unavailable() {
        assert!(!radio_ready(async { Err::<(), _>("no adapter".to_string()) }, READY_LIMIT).await);
    }
}
