//! Bluetooth connection handling for the watch
//! This module handles connecting to and disconnecting from the watch and
//! locating the characteristics the vendor protocol uses.

use anyhow::{Result, anyhow};
use bluest::{Adapter, Characteristic, Device, Service, Uuid};
use log::{info, warn};
use std::time::Duration;

use crate::core::bluetooth::commands::FrameSender;
use crate::core::bluetooth::constants::{
    DEFAULT_MAX_WRITE_LEN, UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE, UUID_DEVICE_INFORMATION_SERVICE,
    UUID_FIRMWARE_REVISION, UUID_WATCH_FACE_CHAR, UUID_WATCH_SERVICE, UUID_WATCH_TRANSFER_CHAR,
};

/// Handles of a live link to the watch
#[derive(Clone)]
pub struct WatchLink {
    pub address: String,
    pub device: Device,
    pub face_characteristic: Characteristic,
    pub transfer_characteristic: Characteristic,
    pub battery_characteristic: Option<Characteristic>,
    pub firmware_characteristic: Option<Characteristic>,
}

/// Connection manager for the watch
#[derive(Clone)]
pub struct ConnectionManager {
    adapter: Adapter,
    retry_delay: u64,
}

impl ConnectionManager {
    pub fn new(adapter: Adapter, retry_delay: u64) -> Self {
        Self { adapter, retry_delay }
    }

    /// Connect to the watch, trying up to `max_retries` times
    pub async fn connect_with_retry(&self, address: &str, device: &Device, max_retries: u32) -> Result<WatchLink> {
        let max_retries = max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..max_retries {
            match self.try_connect(address, device).await {
                Ok(link) => {
                    info!("Successfully connected to {}", address);
                    return Ok(link);
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);

                    if attempt + 1 < max_retries {
                        info!("Retrying connection in {} ms...", self.retry_delay);
                        tokio::time::sleep(Duration::from_millis(self.retry_delay)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("Failed to connect after {} attempts", max_retries)))
    }

    /// Try to connect to the watch once
    async fn try_connect(&self, address: &str, device: &Device) -> Result<WatchLink> {
        if !device.is_connected().await {
            info!("Initiating connection to {}...", address);
            self.adapter.connect_device(device).await?;
        }

        info!("Connection successful, discovering services...");
        let services = device.services().await?;

        let watch_service = find_service(&services, UUID_WATCH_SERVICE)
            .ok_or_else(|| {
                for service in &services {
                    info!("Available service: {}", service.uuid());
                }
                anyhow!("Watch service not found: {}", UUID_WATCH_SERVICE)
            })?;

        let characteristics = watch_service.characteristics().await?;
        let face_characteristic = find_characteristic(&characteristics, UUID_WATCH_FACE_CHAR)
            .ok_or_else(|| anyhow!("Watch face characteristic not found: {}", UUID_WATCH_FACE_CHAR))?;
        let transfer_characteristic = find_characteristic(&characteristics, UUID_WATCH_TRANSFER_CHAR)
            .ok_or_else(|| anyhow!("Transfer characteristic not found: {}", UUID_WATCH_TRANSFER_CHAR))?;

        // Standard services are optional, the link works without them
        let battery_characteristic = match find_service(&services, UUID_BATTERY_SERVICE) {
            Some(service) => find_characteristic(&service.characteristics().await?, UUID_BATTERY_LEVEL),
            None => None,
        };
        let firmware_characteristic = match find_service(&services, UUID_DEVICE_INFORMATION_SERVICE) {
            Some(service) => find_characteristic(&service.characteristics().await?, UUID_FIRMWARE_REVISION),
            None => None,
        };
        if battery_characteristic.is_none() {
            warn!("Battery service not exposed by {}", address);
        }
        if firmware_characteristic.is_none() {
            warn!("Firmware revision not exposed by {}", address);
        }

        info!("Connection and setup process completed successfully");
        Ok(WatchLink {
            address: address.to_string(),
            device: device.clone(),
            face_characteristic,
            transfer_characteristic,
            battery_characteristic,
            firmware_characteristic,
        })
    }

    /// Disconnect from the watch
    pub async fn disconnect(&self, device: &Device) -> Result<()> {
        if device.is_connected().await {
            info!("Disconnecting from device {}", device.id());
            self.adapter.disconnect_device(device).await?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", device.id());
        }
        Ok(())
    }
}

fn find_service(services: &[Service], uuid: Uuid) -> Option<Service> {
    services.iter().find(|s| s.uuid() == uuid).cloned()
}

fn find_characteristic(characteristics: &[Characteristic], uuid: Uuid) -> Option<Characteristic> {
    characteristics.iter().find(|c| c.uuid() == uuid).cloned()
}

/// Writes transfer frames to the vendor transfer characteristic
#[derive(Clone)]
pub struct BluestFrameSender {
    transfer_char: Characteristic,
    max_write_len: usize,
}

impl BluestFrameSender {
    /// Reads the write length negotiated for the link once, up front
    pub fn new(transfer_char: Characteristic) -> Self {
        let max_write_len = match transfer_char.max_write_len() {
            Ok(len) => len,
            Err(e) => {
                warn!("Write length unknown ({}), assuming {} bytes", e, DEFAULT_MAX_WRITE_LEN);
                DEFAULT_MAX_WRITE_LEN
            }
        };
        Self {
            transfer_char,
            max_write_len,
        }
    }
}

#[async_trait::async_trait]
impl FrameSender for BluestFrameSender {
    async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        // Write with response so every frame is acknowledged before the next one
        self.transfer_char.write(frame).await?;
        Ok(())
    }

    fn max_frame_len(&self) -> usize {
        self.max_write_len
    }
}
