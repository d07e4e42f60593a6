//! Connection state machine
//! Owns the single logical connection: connect with a bounded timeout,
//! device-info interrogation, unexpected link loss and explicit disconnect.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::{CommandReply, LinkState, Transport, VendorCommand};
use crate::core::session::channel::{EventChannel, StateChannel};
use crate::core::session::pairing::PairingStore;
use crate::core::session::types::{ConnectionSession, ConnectionStatus, ErrorEvent, ErrorKind};
use crate::error::BridgeError;

struct Inner {
    session: ConnectionSession,
    /// Bumped on every connect and disconnect; stale timers and tasks compare against it
    attempt: u64,
    /// Present exactly while CONNECTING
    timeout: Option<CancellationToken>,
    /// The transport connect of the pending attempt
    connect_task: Option<JoinHandle<()>>,
}

impl Inner {
    /// Stops the timer and the transport connect of the pending attempt
    fn abandon_attempt(&mut self) {
        if let Some(timeout) = self.timeout.take() {
            timeout.cancel();
        }
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
    }
}

pub struct ConnectionStateMachine {
    transport: Arc<dyn Transport>,
    store: Arc<dyn PairingStore>,
    connect_timeout: Duration,
    inner: Mutex<Inner>,
    state: StateChannel<ConnectionSession>,
    battery: EventChannel<i32>,
    errors: Arc<EventChannel<ErrorEvent>>,
}

impl ConnectionStateMachine {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn PairingStore>,
        connect_timeout: Duration,
        errors: Arc<EventChannel<ErrorEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            store,
            connect_timeout,
            inner: Mutex::new(Inner {
                session: ConnectionSession::default(),
                attempt: 0,
                timeout: None,
                connect_task: None,
            }),
            state: StateChannel::new(),
            battery: EventChannel::new(),
            errors,
        })
    }

    pub fn snapshot(&self) -> ConnectionSession {
        self.inner.lock().unwrap().session.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSession> {
        self.state.subscribe()
    }

    pub fn subscribe_battery(&self) -> broadcast::Receiver<i32> {
        self.battery.subscribe()
    }

    /// Starts connecting to `address`. Ignored while another attempt is pending.
    pub async fn connect(self: &Arc<Self>, address: &str, name: &str) -> Result<(), BridgeError> {
        let connected_elsewhere = {
            let inner = self.inner.lock().unwrap();
            match inner.session.status {
                ConnectionStatus::Connecting => {
                    info!("Connect to {} ignored, an attempt is already pending", address);
                    return Ok(());
                }
                ConnectionStatus::Connected if inner.session.address.as_deref() == Some(address) => {
                    info!("Already connected to {}", address);
                    return Ok(());
                }
                ConnectionStatus::Connected => true,
                ConnectionStatus::Idle => false,
            }
        };
        if connected_elsewhere {
            info!("Dropping current link before connecting to {}", address);
            self.disconnect().await;
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.session.status != ConnectionStatus::Idle {
                info!("Connect to {} ignored, state changed meanwhile", address);
                return Ok(());
            }
            inner.abandon_attempt();
            inner.attempt += 1;
            let attempt = inner.attempt;
            let timeout = CancellationToken::new();
            inner.timeout = Some(timeout.clone());
            inner.session = ConnectionSession {
                address: Some(address.to_string()),
                name: Some(name.to_string()),
                status: ConnectionStatus::Connecting,
                ..ConnectionSession::default()
            };
            self.state.publish(inner.session.clone());
            self.arm_timeout(attempt, timeout);

            info!("Connecting to {} ({}), attempt {}", name, address, attempt);
            // Spawned under the lock so the handle is stored before the task can fail
            let this = self.clone();
            let address = address.to_string();
            inner.connect_task = Some(tokio::spawn(async move {
                if let Err(e) = this.transport.connect(&address).await {
                    this.fail_attempt(attempt, ErrorEvent::new(ErrorKind::Transport, format!("connection failed: {}", e)));
                }
            }));
        }
        Ok(())
    }

    fn arm_timeout(self: &Arc<Self>, attempt: u64, token: CancellationToken) {
        let this = self.clone();
        let connect_timeout = self.connect_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(connect_timeout) => {
                    if this.fail_attempt(attempt, ErrorEvent::connection_timed_out()) {
                        warn!("Connection attempt {} timed out after {:?}", attempt, connect_timeout);
                        if let Err(e) = this.transport.disconnect().await {
                            warn!("Best-effort disconnect after timeout failed: {}", e);
                        }
                    }
                }
                _ = token.cancelled() => {
                    debug!("Connect timeout of attempt {} cancelled", attempt);
                }
            }
        });
    }

    /// Reverts a pending attempt to IDLE and reports `event`.
    /// Returns false if the attempt is no longer pending.
    fn fail_attempt(&self, attempt: u64, event: ErrorEvent) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.attempt != attempt || inner.session.status != ConnectionStatus::Connecting {
            debug!("Ignoring failure of stale attempt {}: {}", attempt, event.message);
            return false;
        }
        inner.abandon_attempt();
        inner.session = ConnectionSession::default();
        self.state.publish(inner.session.clone());
        warn!("Connection attempt {} failed: {}", attempt, event.message);
        self.errors.publish(event);
        true
    }

    /// Applies a link-state notification from the transport
    pub fn handle_link(self: &Arc<Self>, link: LinkState) {
        match link {
            LinkState::Connected(address) => self.on_link_up(&address),
            LinkState::Disconnected => self.on_link_down(),
        }
    }

    fn on_link_up(self: &Arc<Self>, linked: &str) {
        let (attempt, address, name) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.session.status != ConnectionStatus::Connecting {
                debug!("Ignoring link-up of {} while {:?}", linked, inner.session.status);
                return;
            }
            if inner.session.address.as_deref() != Some(linked) {
                warn!(
                    "Ignoring link-up of {} while connecting to {}",
                    linked,
                    inner.session.address.as_deref().unwrap_or("?")
                );
                return;
            }
            if let Some(timeout) = inner.timeout.take() {
                timeout.cancel();
            }
            // The connect task is done or about to be; let it finish
            inner.connect_task.take();
            inner.session.status = ConnectionStatus::Connected;
            self.state.publish(inner.session.clone());
            (
                inner.attempt,
                inner.session.address.clone().unwrap_or_default(),
                inner.session.name.clone().unwrap_or_default(),
            )
        };
        info!("Connected to {} ({})", name, address);

        let store = self.store.clone();
        let (record_address, record_name) = (address.clone(), name);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.set(&record_address, &record_name) {
                warn!("Failed to remember paired device {}: {}", record_address, e);
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            this.query_device_info(attempt).await;
        });
    }

    fn on_link_down(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.session.status {
            ConnectionStatus::Connected => {
                warn!(
                    "Link to {} lost unexpectedly",
                    inner.session.address.as_deref().unwrap_or("?")
                );
                inner.attempt += 1;
                inner.session = ConnectionSession::default();
                self.state.publish(inner.session.clone());
                self.errors.publish(ErrorEvent::device_disconnected());
            }
            ConnectionStatus::Connecting => {
                let attempt = inner.attempt;
                drop(inner);
                self.fail_attempt(
                    attempt,
                    ErrorEvent::new(ErrorKind::Transport, "connection failed: link dropped while connecting"),
                );
            }
            ConnectionStatus::Idle => debug!("Ignoring link-down while idle"),
        }
    }

    /// Firmware then battery, both best-effort
    async fn query_device_info(&self, attempt: u64) {
        match self.transport.send_command(VendorCommand::QueryFirmwareVersion).await {
            Ok(CommandReply::FirmwareVersion(version)) => self.apply_firmware(attempt, version),
            Ok(other) => warn!("Unexpected reply to firmware query: {:?}", other),
            Err(e) => warn!("Best-effort firmware query failed: {}", e),
        }

        if let Err(e) = self.transport.send_command(VendorCommand::QueryBattery).await {
            warn!("Best-effort battery query failed: {}", e);
        }
    }

    fn apply_firmware(&self, attempt: u64, version: String) {
        let mut inner = self.inner.lock().unwrap();
        if inner.attempt != attempt || !inner.session.is_connected() {
            debug!("Dropping firmware version of stale attempt {}", attempt);
            return;
        }
        inner.session.firmware_version = version;
        self.state.publish(inner.session.clone());
    }

    /// Applies a firmware/info notification
    pub fn handle_info(&self, version: String) {
        let attempt = self.inner.lock().unwrap().attempt;
        self.apply_firmware(attempt, version);
    }

    /// Applies a battery notification
    pub fn handle_battery(&self, level: i32) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.session.is_connected() {
            debug!("Ignoring battery level {} while {:?}", level, inner.session.status);
            return;
        }
        inner.session.battery = level;
        self.state.publish(inner.session.clone());
        self.battery.publish(level);
    }

    /// Drops the link and resets the session, whatever the transport says
    pub async fn disconnect(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.abandon_attempt();
            inner.attempt += 1;
            inner.session = ConnectionSession::default();
            self.state.publish(inner.session.clone());
        }
        info!("Disconnecting");

        if let Err(e) = self.transport.disconnect().await {
            warn!("Best-effort disconnect failed: {}", e);
        }
    }

    /// Connects to the last paired watch. Returns false if none is recorded.
    pub async fn reconnect_last(self: &Arc<Self>) -> Result<bool, BridgeError> {
        let store = self.store.clone();
        let record = tokio::task::spawn_blocking(move || store.get()).await??;
        match record {
            Some(record) => {
                info!("Reconnecting to last paired watch {}", record.address);
                self.connect(&record.address, &record.name).await?;
                Ok(true)
            }
            None => {
                info!("No paired watch recorded");
                Ok(false)
            }
        }
    }

    /// Forgets the last paired watch
    pub async fn forget(&self) -> Result<(), BridgeError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.clear()).await??;
        info!("Paired watch forgotten");
        Ok(())
    }

    /// Abandons the pending attempt and closes the published streams
    pub fn close(&self) {
        self.inner.lock().unwrap().abandon_attempt();
        self.state.close();
        self.battery.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::mock::MockVendorPlugin;
    use crate::core::bluetooth::{
        DualTransport, VENDOR_STATE_CONNECTED, VENDOR_STATE_DISCONNECTED, VendorEvent,
    };
    use crate::core::session::pairing::MemoryPairingStore;

    struct Fixture {
        vendor: Arc<MockVendorPlugin>,
        store: Arc<MemoryPairingStore>,
        machine: Arc<ConnectionStateMachine>,
        errors: broadcast::Receiver<ErrorEvent>,
    }

    fn fixture() -> Fixture {
        let vendor = Arc::new(MockVendorPlugin::new());
        let transport = DualTransport::new(None, vendor.clone(), false);
        let store = Arc::new(MemoryPairingStore::new());
        let errors = Arc::new(EventChannel::new());
        let errors_rx = errors.subscribe();
        let machine = ConnectionStateMachine::new(transport, store.clone(), Duration::from_secs(15), errors);
        Fixture {
            vendor,
            store,
            machine,
            errors: errors_rx,
        }
    }

    /// Lets spawned tasks run without advancing the paused clock
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn link_up(address: &str) -> LinkState {
        LinkState::Connected(address.to_string())
    }

    /// The record is written from the blocking pool
    fn wait_for_record(store: &MemoryPairingStore) -> Option<String> {
        for _ in 0..200 {
            if let Some(record) = store.get().unwrap() {
                return Some(record.address);
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        None
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_while_connecting_is_ignored() {
        let f = fixture();

        f.machine.connect("AA:01", "AW12-X").await.unwrap();
        f.machine.connect("AA:01", "AW12-X").await.unwrap();
        f.machine.connect("AA:02", "AW12-Y").await.unwrap();
        settle().await;

        assert_eq!(f.vendor.calls().connects.len(), 1);
        let session = f.machine.snapshot();
        assert_eq!(session.status, ConnectionStatus::Connecting);
        assert_eq!(session.address.as_deref(), Some("AA:01"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_transport_times_out_once() {
        let mut f = fixture();

        f.machine.connect("AA:01", "AW12-X").await.unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_secs(16)).await;
        settle().await;

        assert_eq!(f.machine.snapshot().status, ConnectionStatus::Idle);
        assert_eq!(f.errors.try_recv().unwrap(), ErrorEvent::connection_timed_out());
        assert!(f.errors.try_recv().is_err());
        // Pending attempt aborted on the transport
        assert_eq!(f.vendor.calls().disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn link_up_cancels_timeout_and_queries_info() {
        let mut f = fixture();
        f.vendor.update_behaviour(|b| {
            b.firmware = "2.0.1".to_string();
            b.battery = 64;
        });
        let mut transport_battery = f.machine.transport.channels().battery.subscribe();

        f.machine.connect("AA:01", "AW12-X").await.unwrap();
        settle().await;
        f.machine.handle_link(link_up("AA:01"));
        settle().await;
        // Battery arrives as a notification; route it like the facade does
        let level = transport_battery.recv().await.unwrap();
        f.machine.handle_battery(level);

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;

        let session = f.machine.snapshot();
        assert_eq!(session.status, ConnectionStatus::Connected);
        assert_eq!(session.firmware_version, "2.0.1");
        assert_eq!(session.battery, 64);
        assert!(f.errors.try_recv().is_err());
        assert_eq!(wait_for_record(&f.store).as_deref(), Some("AA:01"));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_info_queries_keep_the_connection() {
        let mut f = fixture();
        f.vendor.update_behaviour(|b| b.fail_info_queries = true);

        f.machine.connect("AA:01", "AW12-X").await.unwrap();
        settle().await;
        f.machine.handle_link(link_up("AA:01"));
        settle().await;

        let session = f.machine.snapshot();
        assert_eq!(session.status, ConnectionStatus::Connected);
        assert_eq!(session.firmware_version, "");
        assert_eq!(session.battery, -1);
        assert!(f.errors.try_recv().is_err());
        assert_eq!(f.vendor.calls().battery_queries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_link_loss_resets_and_reports_once() {
        let mut f = fixture();

        f.machine.connect("AA:01", "AW12-X").await.unwrap();
        settle().await;
        f.machine.handle_link(link_up("AA:01"));
        settle().await;
        f.machine.handle_battery(50);

        f.machine.handle_link(LinkState::Disconnected);
        f.machine.handle_link(LinkState::Disconnected);

        let session = f.machine.snapshot();
        assert_eq!(session.status, ConnectionStatus::Idle);
        assert_eq!(session.battery, -1);
        assert_eq!(session.firmware_version, "");
        assert_eq!(f.errors.try_recv().unwrap(), ErrorEvent::device_disconnected());
        assert!(f.errors.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_disconnect_is_not_an_error() {
        let mut f = fixture();

        f.machine.connect("AA:01", "AW12-X").await.unwrap();
        settle().await;
        f.machine.handle_link(link_up("AA:01"));
        settle().await;

        f.machine.disconnect().await;
        // The transport confirms the drop afterwards
        f.machine.handle_link(LinkState::Disconnected);

        assert_eq!(f.machine.snapshot(), ConnectionSession::default());
        assert!(f.errors.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_connecting_disarms_timeout() {
        let mut f = fixture();

        f.machine.connect("AA:01", "AW12-X").await.unwrap();
        settle().await;
        f.machine.disconnect().await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;

        assert_eq!(f.machine.snapshot().status, ConnectionStatus::Idle);
        assert!(f.errors.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timeout_does_not_hit_new_attempt() {
        let mut f = fixture();

        f.machine.connect("AA:01", "AW12-X").await.unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        f.machine.disconnect().await;
        f.machine.connect("AA:02", "AW12-Y").await.unwrap();
        settle().await;
        // First attempt's deadline passes, second one is still pending
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(f.machine.snapshot().status, ConnectionStatus::Connecting);
        assert!(f.errors.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_refusal_reverts_to_idle() {
        let mut f = fixture();
        f.vendor.update_behaviour(|b| b.fail_connect = true);

        f.machine.connect("AA:01", "AW12-X").await.unwrap();
        settle().await;

        assert_eq!(f.machine.snapshot().status, ConnectionStatus::Idle);
        assert_eq!(f.errors.try_recv().unwrap().kind, ErrorKind::Transport);
        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert!(f.errors.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_uses_the_stored_record() {
        let f = fixture();

        assert!(!f.machine.reconnect_last().await.unwrap());
        f.store.set("AA:09", "AW12-Z").unwrap();
        assert!(f.machine.reconnect_last().await.unwrap());
        settle().await;

        assert_eq!(f.vendor.calls().connects, vec![("AA:09".to_string(), false)]);
        assert_eq!(f.machine.snapshot().name.as_deref(), Some("AW12-Z"));

        f.machine.forget().await.unwrap();
        assert!(f.store.get().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn link_events_flow_through_vendor_codes() {
        let f = fixture();
        let mut link = f.machine.transport.channels().link.subscribe();

        f.machine.connect("AA:01", "AW12-X").await.unwrap();
        settle().await;
        f.vendor.emit(VendorEvent::connection_state(VENDOR_STATE_CONNECTED, "AA:01"));
        f.machine.handle_link(link.recv().await.unwrap());
        assert!(f.machine.snapshot().is_connected());

        f.vendor.emit(VendorEvent::connection_state(VENDOR_STATE_DISCONNECTED, "AA:01"));
        f.machine.handle_link(link.recv().await.unwrap());
        assert_eq!(f.machine.snapshot().status, ConnectionStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn link_up_for_another_watch_is_ignored() {
        let mut f = fixture();

        f.machine.connect("AA:02", "AW12-Y").await.unwrap();
        settle().await;
        f.machine.handle_link(link_up("AA:01"));

        let session = f.machine.snapshot();
        assert_eq!(session.status, ConnectionStatus::Connecting);
        assert_eq!(session.address.as_deref(), Some("AA:02"));
        assert!(f.errors.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn late_link_of_timed_out_attempt_is_not_credited() {
        let mut f = fixture();
        let mut link = f.machine.transport.channels().link.subscribe();
        f.vendor.update_behaviour(|b| {
            b.auto_link = true;
            b.link_delay = Duration::from_secs(20);
        });

        f.machine.connect("AA:01", "AW12-X").await.unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_secs(16)).await;
        settle().await;
        assert_eq!(f.machine.snapshot().status, ConnectionStatus::Idle);
        assert_eq!(f.errors.try_recv().unwrap(), ErrorEvent::connection_timed_out());
        while let Ok(state) = link.try_recv() {
            f.machine.handle_link(state);
        }

        f.machine.connect("AA:02", "AW12-Y").await.unwrap();
        settle().await;
        // Past the moment the first attempt would have linked
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        while let Ok(state) = link.try_recv() {
            f.machine.handle_link(state);
        }

        let session = f.machine.snapshot();
        assert_eq!(session.status, ConnectionStatus::Connecting);
        assert_eq!(session.address.as_deref(), Some("AA:02"));
        assert_eq!(f.vendor.calls().linked, None);
        assert_eq!(f.vendor.calls().connects.len(), 2);
        assert!(f.errors.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_abandons_the_pending_transport_connect() {
        let f = fixture();
        f.vendor.update_behaviour(|b| {
            b.auto_link = true;
            b.link_delay = Duration::from_secs(5);
        });

        f.machine.connect("AA:01", "AW12-X").await.unwrap();
        settle().await;
        f.machine.disconnect().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        assert_eq!(f.vendor.calls().linked, None);
        assert_eq!(f.machine.snapshot().status, ConnectionStatus::Idle);
    }
}
