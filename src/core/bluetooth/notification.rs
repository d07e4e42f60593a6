//! Notification handling for the watch
//! This module watches the link state and the battery characteristic and
//! republishes both as vendor events.

use anyhow::Result;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use log::{debug, error, info};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::{VENDOR_STATE_CONNECTED, VENDOR_STATE_DISCONNECTED};
use crate::core::bluetooth::types::VendorEvent;

/// Notification handler for one watch link
pub struct NotificationHandler {
    events: broadcast::Sender<VendorEvent>,
    cancel_token: Mutex<Option<CancellationToken>>,
}

impl NotificationHandler {
    /// Create a new NotificationHandler
    pub fn new(events: broadcast::Sender<VendorEvent>) -> Self {
        Self {
            events,
            cancel_token: Mutex::new(None),
        }
    }

    /// Set up link and battery notifications for a freshly connected watch.
    /// `on_link_lost` runs once if the OS reports the link gone.
    pub fn setup_notifications<F>(
        &self,
        adapter: Adapter,
        device: Device,
        address: String,
        battery_char: Option<Characteristic>,
        on_link_lost: F,
    ) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        info!("Subscribing to notifications...");
        let cancel_token = CancellationToken::new();
        if let Some(previous) = self.cancel_token.lock().unwrap().replace(cancel_token.clone()) {
            previous.cancel();
        }

        let events = self.events.clone();
        let token = cancel_token.clone();
        tokio::spawn(async move {
            Self::watch_connection(adapter, device, address, events, token, on_link_lost).await;
        });

        if let Some(battery_char) = battery_char {
            let events = self.events.clone();
            tokio::spawn(async move {
                Self::process_battery_notifications(battery_char, events, cancel_token).await;
            });
        }

        Ok(())
    }

    /// Stops every notification task of the current link
    pub fn stop_notifications(&self) {
        if let Some(token) = self.cancel_token.lock().unwrap().take() {
            token.cancel();
            info!("Notification tasks stopped");
        }
    }

    async fn watch_connection<F>(
        adapter: Adapter,
        device: Device,
        address: String,
        events: broadcast::Sender<VendorEvent>,
        cancel_token: CancellationToken,
        on_link_lost: F,
    ) where
        F: FnOnce(),
    {
        let mut connection_events = match adapter.device_connection_events(&device).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to watch connection events: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                event = connection_events.next() => match event {
                    Some(ConnectionEvent::Connected) => {
                        debug!("Link to {} reported connected", address);
                        let _ = events.send(VendorEvent::connection_state(VENDOR_STATE_CONNECTED, address.as_str()));
                    }
                    Some(ConnectionEvent::Disconnected) => {
                        info!("Link to {} lost", address);
                        on_link_lost();
                        let _ = events.send(VendorEvent::connection_state(VENDOR_STATE_DISCONNECTED, address.as_str()));
                        break;
                    }
                    None => break,
                },
                _ = cancel_token.cancelled() => break,
            }
        }
        debug!("Connection watch ended");
    }

    async fn process_battery_notifications(
        battery_char: Characteristic,
        events: broadcast::Sender<VendorEvent>,
        cancel_token: CancellationToken,
    ) {
        let mut notification_stream = match battery_char.notify().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to subscribe to battery notifications: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                result = notification_stream.next() => match result {
                    Some(Ok(value)) => match value.first() {
                        Some(level) => {
                            debug!("Battery notification: {}", level);
                            let _ = events.send(VendorEvent::Battery(i32::from(*level)));
                        }
                        None => error!("Empty battery notification"),
                    },
                    Some(Err(e)) => {
                        error!("Error in battery notification stream: {}", e);
                        break;
                    }
                    None => break,
                },
                _ = cancel_token.cancelled() => break,
            }
        }
        info!("Battery notification stream ended");
    }
}
