//! Vendor plugin over bluest GATT
//! This module provides the vendor scanner and the vendor command set for
//! watches exposing the watch service.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use bluest::{Adapter, Device};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::commands::{TransferExecutor, TransferFrame, TransferKind};
use crate::core::bluetooth::connection::{BluestFrameSender, ConnectionManager, WatchLink};
use crate::core::bluetooth::constants::{
    CONNECT_RETRY_DELAY_MS, EVENT_CHANNEL_CAPACITY, MAX_CONNECT_RETRIES, TRANSFER_ERROR_FILE_READ,
    TRANSFER_ERROR_NOT_CONNECTED, TRANSFER_ERROR_TIMEOUT, TRANSFER_ERROR_WRITE_FAILED,
    UUID_WATCH_SERVICE, VENDOR_STATE_CONNECTED, VENDOR_STATE_CONNECTING, VENDOR_STATE_DISCONNECTED,
};
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::scanner::{BluetoothScanner, DeviceCache, extract_mac_address};
use crate::core::bluetooth::transport::{ScanProvider, VendorPlugin};
use crate::core::bluetooth::types::{
    BackgroundImage, DeviceSource, DiscoveredDevice, FileTransferEvent, VendorEvent,
};

/// The live link and its running transfer, shared with the connection watch
#[derive(Default)]
struct LinkSlot {
    /// Bumped by every connect and disconnect; a connect that finishes under
    /// a newer generation was abandoned
    generation: AtomicU64,
    link: Mutex<Option<WatchLink>>,
    transfer: Mutex<Option<CancellationToken>>,
}

impl LinkSlot {
    fn begin_attempt(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn cancel_transfer(&self) {
        if let Some(token) = self.transfer.lock().unwrap().take() {
            token.cancel();
            info!("Running transfer cancelled");
        }
    }

    /// Drops the link of `generation` after the OS reported it gone
    fn release(&self, generation: u64) {
        if !self.is_current(generation) {
            debug!("Lost link of generation {} already replaced", generation);
            return;
        }
        self.cancel_transfer();
        self.link.lock().unwrap().take();
    }
}

/// Vendor plugin talking to the watch service over GATT
pub struct GattVendorPlugin {
    adapter: Adapter,
    devices: DeviceCache,
    scanner: BluetoothScanner,
    connection_manager: ConnectionManager,
    notification_handler: NotificationHandler,
    slot: Arc<LinkSlot>,
    events: broadcast::Sender<VendorEvent>,
}

impl GattVendorPlugin {
    /// Creates the plugin; the device cache is shared with the generic scanner
    pub fn new(adapter: Adapter, devices: DeviceCache, scan_cycle: Duration, min_rssi: i16) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let scanner = BluetoothScanner::new(
            adapter.clone(),
            devices.clone(),
            DeviceSource::VendorScanner,
            vec![UUID_WATCH_SERVICE],
            scan_cycle,
            min_rssi,
        );
        Self {
            connection_manager: ConnectionManager::new(adapter.clone(), CONNECT_RETRY_DELAY_MS),
            notification_handler: NotificationHandler::new(events.clone()),
            adapter,
            devices,
            scanner,
            slot: Arc::new(LinkSlot::default()),
            events,
        }
    }

    fn emit(&self, event: VendorEvent) {
        let _ = self.events.send(event);
    }

    /// Looks the address up among scanned devices, then among devices the OS already holds
    async fn find_device(&self, address: &str) -> Result<Device> {
        let cached = self.devices.lock().unwrap().get(address).cloned();
        if let Some(device) = cached {
            return Ok(device);
        }

        for device in self.adapter.connected_devices().await? {
            let id = device.id().to_string();
            if extract_mac_address(&id).as_deref() == Some(address) || id == address {
                return Ok(device);
            }
        }

        Err(anyhow!("Device {} has not been discovered, scan first", address))
    }

    fn current_link(&self) -> Result<WatchLink> {
        self.slot
            .link
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("No watch connected"))
    }

    /// Runs the transfer in the background, reporting progress as vendor events.
    /// A transfer still running is cancelled first.
    fn spawn_transfer(&self, link: WatchLink, kind: TransferKind, begin_frame: TransferFrame<'static>, payload: Vec<u8>, timeout: Duration) {
        let cancel_token = CancellationToken::new();
        if let Some(previous) = self.slot.transfer.lock().unwrap().replace(cancel_token.clone()) {
            previous.cancel();
        }

        let events = self.events.clone();
        tokio::spawn(async move {
            let executor = TransferExecutor::new(BluestFrameSender::new(link.transfer_characteristic));
            let progress_events = events.clone();
            let transfer = tokio::time::timeout(
                timeout,
                executor.send_payload(begin_frame, &payload, move |progress| {
                    let _ = progress_events.send(VendorEvent::FileTransfer(FileTransferEvent::progress(progress)));
                }),
            );
            let result = tokio::select! {
                result = transfer => result,
                _ = cancel_token.cancelled() => {
                    info!("{:?} transfer stopped before completion", kind);
                    return;
                }
            };

            let error_code = match result {
                Ok(Ok(())) => return,
                Ok(Err(e)) => {
                    error!("{:?} transfer failed: {}", kind, e);
                    TRANSFER_ERROR_WRITE_FAILED
                }
                Err(_) => {
                    error!("{:?} transfer timed out after {:?}", kind, timeout);
                    TRANSFER_ERROR_TIMEOUT
                }
            };
            let _ = events.send(VendorEvent::FileTransfer(FileTransferEvent::failed(error_code)));
        });
    }
}

#[async_trait::async_trait]
impl ScanProvider for GattVendorPlugin {
    fn source(&self) -> DeviceSource {
        DeviceSource::VendorScanner
    }

    async fn is_available(&self) -> bool {
        self.scanner.is_available().await
    }

    async fn start_scan(&self, sink: mpsc::UnboundedSender<DiscoveredDevice>) -> Result<()> {
        self.scanner.start_scan(sink).await
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop_scan().await
    }
}

#[async_trait::async_trait]
impl VendorPlugin for GattVendorPlugin {
    async fn connect(&self, address: &str, auto_connect: bool) -> Result<()> {
        let generation = self.slot.begin_attempt();
        let device = self.find_device(address).await?;
        self.emit(VendorEvent::connection_state(VENDOR_STATE_CONNECTING, address));

        let retries = if auto_connect { MAX_CONNECT_RETRIES } else { 1 };
        let link = self
            .connection_manager
            .connect_with_retry(address, &device, retries)
            .await?;

        if !self.slot.is_current(generation) {
            warn!("Connect to {} finished after it was abandoned, dropping the link", address);
            if let Err(e) = self.connection_manager.disconnect(&device).await {
                warn!("Failed to drop abandoned link to {}: {}", address, e);
            }
            return Err(anyhow!("Connect to {} was abandoned", address));
        }

        let slot = self.slot.clone();
        self.notification_handler.setup_notifications(
            self.adapter.clone(),
            device,
            address.to_string(),
            link.battery_characteristic.clone(),
            move || slot.release(generation),
        )?;
        *self.slot.link.lock().unwrap() = Some(link);

        info!("Watch {} connected and link state stored.", address);
        self.emit(VendorEvent::connection_state(VENDOR_STATE_CONNECTED, address));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Invalidates any connect still in flight
        self.slot.begin_attempt();
        self.slot.cancel_transfer();
        self.notification_handler.stop_notifications();
        let link = self.slot.link.lock().unwrap().take();
        let Some(link) = link else {
            info!("No watch connected, nothing to disconnect");
            return Ok(());
        };

        info!("Link state cleared, releasing device and characteristic objects.");
        let result = self.connection_manager.disconnect(&link.device).await;
        self.emit(VendorEvent::connection_state(VENDOR_STATE_DISCONNECTED, link.address));
        result
    }

    async fn query_firmware_version(&self) -> Result<String> {
        let link = self.current_link()?;
        let characteristic = link
            .firmware_characteristic
            .ok_or_else(|| anyhow!("Firmware revision is not available"))?;
        let raw = characteristic.read().await?;
        let version = String::from_utf8_lossy(&raw).trim_end_matches('\0').trim().to_string();
        self.emit(VendorEvent::Info(version.clone()));
        Ok(version)
    }

    async fn query_battery(&self) -> Result<()> {
        let link = self.current_link()?;
        let characteristic = link
            .battery_characteristic
            .ok_or_else(|| anyhow!("Battery level is not available"))?;
        let data = characteristic.read().await?;
        let level = data.first().ok_or_else(|| anyhow!("No battery level data received"))?;
        self.emit(VendorEvent::Battery(i32::from(*level)));
        Ok(())
    }

    async fn query_display_face(&self) -> Result<i32> {
        let link = self.current_link()?;
        let data = link.face_characteristic.read().await?;
        data.first()
            .map(|index| i32::from(*index))
            .ok_or_else(|| anyhow!("No watch face index received"))
    }

    async fn set_display_face(&self, index: i32) -> Result<()> {
        let index = u8::try_from(index).map_err(|_| anyhow!("Watch face index {} out of range", index))?;
        let link = self.current_link()?;
        link.face_characteristic.write(&[index]).await?;
        info!("Watch face {} selected", index);
        Ok(())
    }

    async fn send_background_image(&self, image: BackgroundImage, timeout_secs: u64) -> Result<()> {
        let link = match self.current_link() {
            Ok(link) => link,
            Err(e) => {
                self.emit(VendorEvent::FileTransfer(FileTransferEvent::failed(TRANSFER_ERROR_NOT_CONNECTED)));
                return Err(e);
            }
        };

        let primary_len = image.primary.len();
        let mut payload = image.primary;
        payload.extend_from_slice(&image.thumbnail);
        let begin_frame = TransferFrame::Begin {
            kind: TransferKind::Image,
            index: 0,
            total_len: u32::try_from(payload.len())?,
            primary_len: u32::try_from(primary_len)?,
            width: u16::try_from(image.width)?,
            height: u16::try_from(image.height)?,
            thumb_width: u16::try_from(image.thumb_width)?,
            thumb_height: u16::try_from(image.thumb_height)?,
        };

        self.spawn_transfer(
            link,
            TransferKind::Image,
            begin_frame,
            payload,
            Duration::from_secs(timeout_secs),
        );
        Ok(())
    }

    async fn send_bin_package(&self, path: &Path, index: i32, timeout_secs: u64) -> Result<()> {
        let link = match self.current_link() {
            Ok(link) => link,
            Err(e) => {
                self.emit(VendorEvent::FileTransfer(FileTransferEvent::failed(TRANSFER_ERROR_NOT_CONNECTED)));
                return Err(e);
            }
        };

        let payload = match tokio::fs::read(path).await {
            Ok(payload) => payload,
            Err(e) => {
                self.emit(VendorEvent::FileTransfer(FileTransferEvent::failed(TRANSFER_ERROR_FILE_READ)));
                return Err(e.into());
            }
        };
        if payload.is_empty() {
            warn!("Package {:?} is empty", path);
            return Err(anyhow!("Package {:?} is empty", path));
        }

        let len = u32::try_from(payload.len())?;
        let begin_frame = TransferFrame::Begin {
            kind: TransferKind::Package,
            index: u8::try_from(index).map_err(|_| anyhow!("Package index {} out of range", index))?,
            total_len: len,
            primary_len: len,
            width: 0,
            height: 0,
            thumb_width: 0,
            thumb_height: 0,
        };

        info!("Sending package {:?} ({} bytes) to slot {}", path, len, index);
        self.spawn_transfer(link, TransferKind::Package, begin_frame, payload, Duration::from_secs(timeout_secs));
        Ok(())
    }

    async fn cancel_transfer(&self) -> Result<()> {
        self.slot.cancel_transfer();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<VendorEvent> {
        self.events.subscribe()
    }
}
