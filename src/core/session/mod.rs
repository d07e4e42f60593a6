//! Watch session manager
//! This module composes the device registry, the connection state machine and
//! the transfer pipeline behind one session object built once per process.

mod channel;
mod connection;
mod pairing;
mod registry;
mod transcode;
mod transfer;
mod types;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::core::bluetooth::{DiscoveredDevice, LinkState, Transport};
use crate::error::BridgeError;

pub use channel::{EventChannel, StateChannel};
pub use connection::ConnectionStateMachine;
pub use pairing::{
    JsonPairingStore, MemoryPairingStore, PAIRING_FILE_NAME, PairingError, PairingStore,
    pairing_path,
};
pub use registry::{DeviceRegistry, sort_for_display};
pub use transcode::{IMAGE_TYPE_TAG, PRIMARY_SIZE, THUMBNAIL_SIZE, transcode_background};
pub use transfer::{TransferJob, TransferPipeline};
pub use types::{
    ConnectionSession, ConnectionStatus, ErrorEvent, ErrorKind, LastPairedDevice, TransferJobKind,
    TransferProgress, TransferState,
};

/// The process-wide session: observable state plus imperative operations
pub struct WatchSession {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    registry: Arc<DeviceRegistry>,
    connection: Arc<ConnectionStateMachine>,
    transfers: Arc<TransferPipeline>,
    errors: Arc<EventChannel<ErrorEvent>>,
    /// Set once `init` registered the notification pumps
    pumps: Mutex<Option<CancellationToken>>,
    disposed: AtomicBool,
}

impl WatchSession {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn PairingStore>, config: SessionConfig) -> Self {
        let errors = Arc::new(EventChannel::new());
        let connection = ConnectionStateMachine::new(
            transport.clone(),
            store,
            Duration::from_secs(config.connect_timeout_secs),
            errors.clone(),
        );
        let transfers = TransferPipeline::new(
            transport.clone(),
            Duration::from_secs(config.transfer_timeout_secs),
            errors.clone(),
        );
        Self {
            transport,
            config,
            registry: Arc::new(DeviceRegistry::new()),
            connection,
            transfers,
            errors,
            pumps: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Subscribes to every transport notification. Calling it again is a no-op.
    pub fn init(&self) -> Result<(), BridgeError> {
        self.ensure_live()?;
        let mut pumps = self.pumps.lock().unwrap();
        if pumps.is_some() {
            debug!("Session already initialized");
            return Ok(());
        }

        let token = CancellationToken::new();
        let channels = self.transport.channels();

        let registry = self.registry.clone();
        spawn_pump("scan results", channels.scan_results.subscribe(), token.clone(), move |device| {
            registry.offer(device);
        });

        let connection = self.connection.clone();
        let transfers = self.transfers.clone();
        spawn_pump("link state", channels.link.subscribe(), token.clone(), move |link| {
            let lost = link == LinkState::Disconnected;
            connection.handle_link(link);
            if lost {
                transfers.abort("link dropped");
            }
        });

        let connection = self.connection.clone();
        spawn_pump("battery", channels.battery.subscribe(), token.clone(), move |level| {
            connection.handle_battery(level);
        });

        let connection = self.connection.clone();
        spawn_pump("device info", channels.info.subscribe(), token.clone(), move |version| {
            connection.handle_info(version);
        });

        let transfers = self.transfers.clone();
        spawn_pump("file transfer", channels.file_transfer.subscribe(), token.clone(), move |event| {
            transfers.handle_event(event);
        });

        *pumps = Some(token);
        info!("Watch session initialized");
        Ok(())
    }

    /// Stops every pump and closes every published stream. Does not disconnect.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.pumps.lock().unwrap().take() {
            token.cancel();
        }
        if self.transport.is_scanning() {
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Failed to stop scanning on teardown: {}", e);
            }
        }

        self.connection.close();
        self.transfers.close();
        self.registry.close();
        self.errors.close();
        info!("Watch session disposed");
    }

    fn ensure_live(&self) -> Result<(), BridgeError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BridgeError::Disposed);
        }
        Ok(())
    }

    async fn ensure_radio(&self) -> Result<(), BridgeError> {
        self.ensure_live()?;
        if !self.transport.is_available().await {
            warn!("Bluetooth radio unavailable");
            return Err(BridgeError::RadioUnavailable);
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), BridgeError> {
        self.ensure_live()?;
        if !self.connection.snapshot().is_connected() {
            return Err(BridgeError::NotConnected);
        }
        Ok(())
    }

    /// Publishes a transport failure and hands it back to the caller
    fn report_transport(&self, what: &str, e: anyhow::Error) -> BridgeError {
        warn!("{} failed: {}", what, e);
        self.errors
            .publish(ErrorEvent::new(ErrorKind::Transport, format!("{} failed: {}", what, e)));
        BridgeError::Transport(e)
    }

    /// Clears the device list and starts both discovery sources
    pub async fn start_scan(&self) -> Result<(), BridgeError> {
        self.ensure_radio().await?;
        self.registry.reset();
        self.transport
            .start_scan()
            .await
            .map_err(|e| self.report_transport("scan", e))
    }

    pub async fn stop_scan(&self) -> Result<(), BridgeError> {
        self.ensure_live()?;
        self.transport
            .stop_scan()
            .await
            .map_err(|e| self.report_transport("stopping scan", e))
    }

    pub fn is_scanning(&self) -> bool {
        self.transport.is_scanning()
    }

    pub async fn connect(&self, address: &str, name: &str) -> Result<(), BridgeError> {
        self.ensure_radio().await?;
        self.connection.connect(address, name).await
    }

    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        self.ensure_live()?;
        self.connection.disconnect().await;
        self.transfers.abort("disconnected by user");
        Ok(())
    }

    /// Returns false when no watch was paired before
    pub async fn reconnect_last(&self) -> Result<bool, BridgeError> {
        self.ensure_radio().await?;
        self.connection.reconnect_last().await
    }

    pub async fn forget(&self) -> Result<(), BridgeError> {
        self.ensure_live()?;
        self.connection.forget().await
    }

    pub async fn upload_background_image(&self, path: &Path) -> Result<u64, BridgeError> {
        self.ensure_connected()?;
        self.transfers.upload_image(path).await
    }

    /// Uploads a `.bin` package, at `index` or the configured default slot
    pub async fn upload_bin_package(&self, path: &Path, index: Option<i32>) -> Result<u64, BridgeError> {
        self.ensure_connected()?;
        let index = index.unwrap_or(self.config.default_bin_index);
        self.transfers.upload_bin(path, index).await
    }

    pub async fn get_display_face(&self) -> Result<i32, BridgeError> {
        self.ensure_connected()?;
        self.transfers.get_display_face().await
    }

    pub async fn set_display_face(&self, index: i32) -> Result<(), BridgeError> {
        self.ensure_connected()?;
        self.transfers.set_display_face(index).await
    }

    pub fn connection(&self) -> ConnectionSession {
        self.connection.snapshot()
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.registry.snapshot()
    }

    /// Devices in presentation order, product family first
    pub fn sorted_devices(&self) -> Vec<DiscoveredDevice> {
        sort_for_display(&self.registry.snapshot(), &self.config.product_name_prefix)
    }

    pub fn current_transfer(&self) -> Option<TransferJob> {
        self.transfers.current_job()
    }

    pub fn transfer_preview(&self) -> Option<Vec<u8>> {
        self.transfers.preview()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionSession> {
        self.connection.subscribe()
    }

    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.registry.subscribe()
    }

    pub fn subscribe_battery(&self) -> broadcast::Receiver<i32> {
        self.connection.subscribe_battery()
    }

    pub fn subscribe_transfers(&self) -> broadcast::Receiver<TransferProgress> {
        self.transfers.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.errors.subscribe()
    }
}

/// Forwards every value of `rx` to `handle` until cancelled or closed
fn spawn_pump<T, F>(name: &'static str, mut rx: broadcast::Receiver<T>, token: CancellationToken, mut handle: F)
where
    T: Clone + Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                value = rx.recv() => match value {
                    Ok(value) => handle(value),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("{} pump lagged, {} events dropped", name, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = token.cancelled() => break,
            }
        }
        debug!("{} pump stopped", name);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::mock::{MockScanProvider, MockVendorPlugin};
    use crate::core::bluetooth::{DeviceSource, DualTransport, VendorEvent, VendorPlugin};

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        primary: Arc<MockScanProvider>,
        vendor: Arc<MockVendorPlugin>,
        store: Arc<MemoryPairingStore>,
        session: WatchSession,
    }

    fn fixture() -> Fixture {
        let primary = Arc::new(MockScanProvider::new(vec![
            DiscoveredDevice::new("Phone", "AA:00", -40, DeviceSource::PrimaryScanner),
            DiscoveredDevice::new("AW12-X", "AA:01", -60, DeviceSource::PrimaryScanner),
        ]));
        let vendor = Arc::new(MockVendorPlugin::new());
        vendor.update_behaviour(|b| {
            b.auto_link = true;
            b.simulate_transfers = true;
            b.transfer_step = Duration::from_millis(5);
            b.scan_results = vec![
                DiscoveredDevice::new("AW12-X-DUP", "AA:01", -30, DeviceSource::VendorScanner),
                DiscoveredDevice::new("AW12-Y", "AA:02", -70, DeviceSource::VendorScanner),
            ];
        });
        let transport = DualTransport::new(Some(primary.clone()), vendor.clone(), false);
        let store = Arc::new(MemoryPairingStore::new());
        let session = WatchSession::new(transport, store.clone(), SessionConfig::default());
        session.init().unwrap();
        Fixture {
            primary,
            vendor,
            store,
            session,
        }
    }

    impl Fixture {
        fn current_transfer_state(&self) -> Option<TransferState> {
            self.session.current_transfer().map(|job| job.state)
        }
    }

    async fn connected() -> Fixture {
        let f = fixture();
        let mut state = f.session.subscribe_connection();
        f.session.connect("AA:01", "AW12-X").await.unwrap();
        // The battery query answers right after the link comes up
        tokio::time::timeout(WAIT, state.wait_for(|s| s.is_connected() && s.battery == 80))
            .await
            .unwrap()
            .unwrap();
        f
    }

    #[tokio::test]
    async fn scan_merges_both_sources() {
        let f = fixture();
        let mut devices = f.session.subscribe_devices();

        f.session.start_scan().await.unwrap();
        tokio::time::timeout(WAIT, devices.wait_for(|list| list.len() == 3))
            .await
            .unwrap()
            .unwrap();

        let list = f.session.devices();
        let merged = list.iter().find(|d| d.address == "AA:01").unwrap();
        assert_eq!(merged.name, "AW12-X");
        assert_eq!(merged.source, DeviceSource::PrimaryScanner);

        let sorted: Vec<_> = f.session.sorted_devices().into_iter().map(|d| d.name).collect();
        assert_eq!(sorted, vec!["AW12-X", "AW12-Y", "Phone"]);

        f.session.stop_scan().await.unwrap();
        assert!(!f.session.is_scanning());
        assert_eq!(f.primary.stop_count(), 1);
    }

    #[tokio::test]
    async fn radio_off_is_reported_before_any_transport_call() {
        let f = fixture();
        f.primary.set_available(false);
        f.vendor.update_behaviour(|b| b.available = false);

        assert!(matches!(f.session.start_scan().await, Err(BridgeError::RadioUnavailable)));
        assert!(matches!(
            f.session.connect("AA:01", "AW12-X").await,
            Err(BridgeError::RadioUnavailable)
        ));
        assert_eq!(f.primary.start_count(), 0);
        assert!(f.vendor.calls().connects.is_empty());
    }

    #[tokio::test]
    async fn connect_fills_in_device_info() {
        let f = connected().await;
        let mut state = f.session.subscribe_connection();

        let session = tokio::time::timeout(
            WAIT,
            state.wait_for(|s| s.battery == 80 && s.firmware_version == "1.0.0"),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();

        assert_eq!(session.address.as_deref(), Some("AA:01"));
        assert_eq!(session.name.as_deref(), Some("AW12-X"));
    }

    #[tokio::test]
    async fn init_registers_pumps_once() {
        let f = connected().await;
        f.session.init().unwrap();
        f.session.init().unwrap();
        let mut battery = f.session.subscribe_battery();

        f.vendor.emit(VendorEvent::Battery(55));

        assert_eq!(tokio::time::timeout(WAIT, battery.recv()).await.unwrap().unwrap(), 55);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(battery.try_recv().is_err());
    }

    #[tokio::test]
    async fn transfers_require_a_connection() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.bin");
        std::fs::write(&path, [1, 2, 3]).unwrap();

        assert!(matches!(
            f.session.upload_bin_package(&path, None).await,
            Err(BridgeError::NotConnected)
        ));
        assert!(matches!(f.session.set_display_face(1).await, Err(BridgeError::NotConnected)));
        assert!(f.vendor.calls().packages.is_empty());
    }

    #[tokio::test]
    async fn package_upload_runs_to_completion() {
        let f = connected().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.bin");
        std::fs::write(&path, [1, 2, 3]).unwrap();
        let mut progress = f.session.subscribe_transfers();

        let job_id = f.session.upload_bin_package(&path, None).await.unwrap();

        let last = tokio::time::timeout(WAIT, async {
            loop {
                let report = progress.recv().await.unwrap();
                if report.state.is_terminal() {
                    return report;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(last.job_id, job_id);
        assert_eq!((last.progress, last.state), (100, TransferState::Complete));
        assert_eq!(f.vendor.calls().packages, vec![(path, 0, 120)]);
    }

    #[tokio::test]
    async fn unexpected_link_loss_is_reported() {
        let f = connected().await;
        let mut errors = f.session.subscribe_errors();
        let mut state = f.session.subscribe_connection();

        f.vendor.emit(VendorEvent::connection_state(
            crate::core::bluetooth::VENDOR_STATE_DISCONNECTED,
            "AA:01",
        ));

        tokio::time::timeout(WAIT, state.wait_for(|s| s.status == ConnectionStatus::Idle))
            .await
            .unwrap()
            .unwrap();
        let error = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        assert_eq!(error, ErrorEvent::device_disconnected());
    }

    #[tokio::test]
    async fn successful_connect_is_remembered() {
        let f = connected().await;
        f.session.disconnect().await.unwrap();
        // Let the transport's own disconnect notification pass first
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(WAIT, async {
            while f.store.get().unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut state = f.session.subscribe_connection();
        assert!(f.session.reconnect_last().await.unwrap());
        // The transport connect runs in a spawned task
        let session = tokio::time::timeout(WAIT, state.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(session.address.as_deref(), Some("AA:01"));
        assert_eq!(f.vendor.calls().connects.len(), 2);

        f.session.forget().await.unwrap();
        assert!(f.store.get().unwrap().is_none());
    }

    #[tokio::test]
    async fn disconnect_stops_the_running_transfer() {
        let f = connected().await;
        f.vendor.update_behaviour(|b| b.transfer_step = Duration::from_millis(20));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.bin");
        std::fs::write(&path, [1, 2, 3]).unwrap();
        let mut progress = f.session.subscribe_transfers();

        f.session.upload_bin_package(&path, None).await.unwrap();
        tokio::time::timeout(WAIT, async {
            while progress.recv().await.unwrap().state != TransferState::InProgress {}
        })
        .await
        .unwrap();

        f.session.disconnect().await.unwrap();
        let mut raw = f.vendor.subscribe();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(f.current_transfer_state(), Some(TransferState::Failed));
        while let Ok(event) = raw.try_recv() {
            assert!(!matches!(event, VendorEvent::FileTransfer(_)), "transfer kept running: {:?}", event);
        }
    }

    #[tokio::test]
    async fn dispose_closes_every_stream() {
        let f = fixture();
        let mut errors = f.session.subscribe_errors();
        let mut state = f.session.subscribe_connection();
        let mut progress = f.session.subscribe_transfers();

        f.session.dispose().await;
        f.session.dispose().await;

        assert!(matches!(errors.recv().await, Err(broadcast::error::RecvError::Closed)));
        assert!(matches!(progress.recv().await, Err(broadcast::error::RecvError::Closed)));
        assert!(state.changed().await.is_err());

        // Late notifications are dropped quietly
        f.vendor.emit(VendorEvent::Battery(20));
        assert!(matches!(f.session.init(), Err(BridgeError::Disposed)));
        assert!(matches!(f.session.start_scan().await, Err(BridgeError::Disposed)));
    }
}
