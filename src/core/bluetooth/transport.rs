//! Transport adapter
//! This module puts the generic BLE scanner and the vendor plugin behind one
//! capability set and translates vendor notification codes into
//! vendor-agnostic events.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::{
    BATTERY_UNKNOWN, EVENT_CHANNEL_CAPACITY, VENDOR_STATE_CONNECTED, VENDOR_STATE_CONNECTING,
    VENDOR_STATE_DISCONNECTED, VENDOR_STATE_DISCONNECTING,
};
use crate::core::bluetooth::types::{
    BackgroundImage, CommandReply, DeviceSource, DiscoveredDevice, FileTransferEvent, LinkState,
    VendorCommand, VendorEvent,
};

/// A discovery source able to report nearby devices
#[async_trait::async_trait]
pub trait ScanProvider: Send + Sync {
    /// Which source tag the reported devices carry
    fn source(&self) -> DeviceSource;

    /// Returns false when the radio behind this provider is off or missing
    async fn is_available(&self) -> bool;

    /// Starts scanning, reporting every device into `sink` until stopped
    async fn start_scan(&self, sink: mpsc::UnboundedSender<DiscoveredDevice>) -> Result<()>;

    /// Stops scanning, waiting for the running scan cycle to wind down
    async fn stop_scan(&self) -> Result<()>;
}

/// The vendor-specific plugin: its own scanner plus the vendor command set
#[async_trait::async_trait]
pub trait VendorPlugin: ScanProvider {
    async fn connect(&self, address: &str, auto_connect: bool) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn query_firmware_version(&self) -> Result<String>;
    /// The level arrives as a [`VendorEvent::Battery`] notification
    async fn query_battery(&self) -> Result<()>;
    async fn query_display_face(&self) -> Result<i32>;
    async fn set_display_face(&self, index: i32) -> Result<()>;
    /// Submits the image; progress arrives as [`VendorEvent::FileTransfer`]
    async fn send_background_image(&self, image: BackgroundImage, timeout_secs: u64) -> Result<()>;
    /// Submits the package unmodified; progress arrives as [`VendorEvent::FileTransfer`]
    async fn send_bin_package(&self, path: &Path, index: i32, timeout_secs: u64) -> Result<()>;
    /// Stops writing the running transfer; no failure code is emitted
    async fn cancel_transfer(&self) -> Result<()>;
    /// Subscribes to raw vendor notifications
    fn subscribe(&self) -> broadcast::Receiver<VendorEvent>;
}

/// The notification channels every transport publishes on
pub struct TransportChannels {
    pub scan_results: broadcast::Sender<DiscoveredDevice>,
    pub link: broadcast::Sender<LinkState>,
    pub battery: broadcast::Sender<i32>,
    pub info: broadcast::Sender<String>,
    pub file_transfer: broadcast::Sender<FileTransferEvent>,
}

impl TransportChannels {
    pub fn new() -> Self {
        Self {
            scan_results: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            link: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            battery: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            info: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            file_transfer: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }

    /// Routes one raw vendor notification to the matching channel.
    /// Send errors only mean nobody is listening and are ignored.
    pub fn dispatch_vendor_event(&self, event: VendorEvent) {
        match event {
            VendorEvent::ConnectionState { code, address } => match code {
                VENDOR_STATE_CONNECTED => {
                    let _ = self.link.send(LinkState::Connected(address));
                }
                VENDOR_STATE_DISCONNECTED => {
                    let _ = self.link.send(LinkState::Disconnected);
                }
                VENDOR_STATE_CONNECTING | VENDOR_STATE_DISCONNECTING => {
                    debug!("Transitional vendor connection state {} for {}", code, address);
                }
                other => warn!("Unknown vendor connection state code {}", other),
            },
            VendorEvent::Battery(level) => {
                let level = if (0..=100).contains(&level) { level } else { BATTERY_UNKNOWN };
                let _ = self.battery.send(level);
            }
            VendorEvent::Info(info) => {
                let _ = self.info.send(info);
            }
            VendorEvent::FileTransfer(event) => {
                let _ = self.file_transfer.send(event);
            }
        }
    }
}

impl Default for TransportChannels {
    fn default() -> Self {
        Self::new()
    }
}

/// The capability set the session manager talks to
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn is_available(&self) -> bool;
    async fn start_scan(&self) -> Result<()>;
    async fn stop_scan(&self) -> Result<()>;
    fn is_scanning(&self) -> bool;
    async fn connect(&self, address: &str) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn send_command(&self, command: VendorCommand) -> Result<CommandReply>;
    fn channels(&self) -> &TransportChannels;
}

/// Transport built from an optional generic scanner and a vendor plugin
pub struct DualTransport {
    primary: Option<Arc<dyn ScanProvider>>,
    vendor: Arc<dyn VendorPlugin>,
    auto_connect: bool,
    channels: TransportChannels,
    scanning: AtomicBool,
    scan_sink: mpsc::UnboundedSender<DiscoveredDevice>,
    cancel_token: CancellationToken,
}

impl DualTransport {
    /// Creates the transport and starts pumping provider output into its channels.
    /// Must be called from within a tokio runtime.
    pub fn new(
        primary: Option<Arc<dyn ScanProvider>>,
        vendor: Arc<dyn VendorPlugin>,
        auto_connect: bool,
    ) -> Arc<Self> {
        let (scan_sink, scan_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            primary,
            vendor,
            auto_connect,
            channels: TransportChannels::new(),
            scanning: AtomicBool::new(false),
            scan_sink,
            cancel_token: CancellationToken::new(),
        });

        Self::spawn_scan_pump(
            scan_rx,
            transport.channels.scan_results.clone(),
            transport.cancel_token.clone(),
        );
        Self::spawn_vendor_pump(
            transport.vendor.subscribe(),
            TransportChannels {
                scan_results: transport.channels.scan_results.clone(),
                link: transport.channels.link.clone(),
                battery: transport.channels.battery.clone(),
                info: transport.channels.info.clone(),
                file_transfer: transport.channels.file_transfer.clone(),
            },
            transport.cancel_token.clone(),
        );

        transport
    }

    fn spawn_scan_pump(
        mut scan_rx: mpsc::UnboundedReceiver<DiscoveredDevice>,
        scan_results: broadcast::Sender<DiscoveredDevice>,
        cancel_token: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    device = scan_rx.recv() => match device {
                        Some(device) => {
                            let _ = scan_results.send(device);
                        }
                        None => break,
                    },
                    _ = cancel_token.cancelled() => break,
                }
            }
            debug!("Scan pump stopped");
        });
    }

    fn spawn_vendor_pump(
        mut events: broadcast::Receiver<VendorEvent>,
        channels: TransportChannels,
        cancel_token: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => channels.dispatch_vendor_event(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Vendor event pump lagged, {} events dropped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = cancel_token.cancelled() => break,
                }
            }
            debug!("Vendor event pump stopped");
        });
    }
}

impl Drop for DualTransport {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[async_trait::async_trait]
impl Transport for DualTransport {
    async fn is_available(&self) -> bool {
        if self.vendor.is_available().await {
            return true;
        }
        match &self.primary {
            Some(primary) => primary.is_available().await,
            None => false,
        }
    }

    async fn start_scan(&self) -> Result<()> {
        let mut started = 0;
        let mut last_error = None;

        if let Some(primary) = &self.primary {
            match primary.start_scan(self.scan_sink.clone()).await {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!("{:?} failed to start: {}", primary.source(), e);
                    last_error = Some(e);
                }
            }
        }

        match self.vendor.start_scan(self.scan_sink.clone()).await {
            Ok(()) => started += 1,
            Err(e) => {
                warn!("{:?} failed to start: {}", self.vendor.source(), e);
                last_error = Some(e);
            }
        }

        if started == 0 {
            self.scanning.store(false, Ordering::SeqCst);
            return Err(last_error.unwrap_or_else(|| anyhow!("No scan provider available")));
        }

        self.scanning.store(true, Ordering::SeqCst);
        info!("Scanning with {} provider(s)", started);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        let mut last_error = None;

        if let Some(primary) = &self.primary {
            if let Err(e) = primary.stop_scan().await {
                warn!("{:?} failed to stop: {}", primary.source(), e);
                last_error = Some(e);
            }
        }
        if let Err(e) = self.vendor.stop_scan().await {
            warn!("{:?} failed to stop: {}", self.vendor.source(), e);
            last_error = Some(e);
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    async fn connect(&self, address: &str) -> Result<()> {
        self.vendor.connect(address, self.auto_connect).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.vendor.disconnect().await
    }

    async fn send_command(&self, command: VendorCommand) -> Result<CommandReply> {
        debug!("Sending vendor command {}", command.name());
        match command {
            VendorCommand::QueryFirmwareVersion => {
                let version = self.vendor.query_firmware_version().await?;
                let _ = self.channels.info.send(version.clone());
                Ok(CommandReply::FirmwareVersion(version))
            }
            VendorCommand::QueryBattery => {
                self.vendor.query_battery().await?;
                Ok(CommandReply::Done)
            }
            VendorCommand::QueryDisplayFace => {
                Ok(CommandReply::DisplayFace(self.vendor.query_display_face().await?))
            }
            VendorCommand::SetDisplayFace(index) => {
                self.vendor.set_display_face(index).await?;
                Ok(CommandReply::Done)
            }
            VendorCommand::SendBackgroundImage { image, timeout_secs } => {
                self.vendor.send_background_image(image, timeout_secs).await?;
                Ok(CommandReply::Done)
            }
            VendorCommand::SendBinPackage { path, index, timeout_secs } => {
                self.vendor.send_bin_package(&path, index, timeout_secs).await?;
                Ok(CommandReply::Done)
            }
            VendorCommand::CancelTransfer => {
                self.vendor.cancel_transfer().await?;
                Ok(CommandReply::Done)
            }
        }
    }

    fn channels(&self) -> &TransportChannels {
        &self.channels
    }
}
