//! The device session: one authoritative state machine for the link to the fan.
//!
//! `DeviceSession` is a cheap handle around shared state; clone it to hand it to whatever shows
//! the fan controls. All native operations against the device (connect, discovery, writes,
//! disconnect) run while holding the session's link lock, so they never race each other. Scans
//! only involve the adapter and are serialized on a lock of their own.
//!
//! A new scan supersedes the one in flight, and a new connect supersedes the pending connect
//! (and any scan). The superseded operation cleans up its native resources and resolves with
//! [`SessionError::Cancelled`] before the new one touches the transport.

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::command::{Command, CommandEncoder, PayloadFormat};
use crate::device::constants::{
    CONNECT_DEADLINE, DISCONNECT_DEADLINE, FAN_COMMAND_CHARACTERISTIC, FAN_SERVICE, SCAN_WINDOW, TARGET_NAME,
    WRITE_DEADLINE,
};
use crate::device::scan::{scan, NameFilter, ScanResult};
use crate::device::transport::{LinkEvent, Transport};
use crate::device::types::{ConnectionState, DeviceDescriptor, DeviceEvent, DeviceId, SessionState};
use crate::error::{SessionError, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub target_name: String,
    pub service_id: Uuid,
    pub characteristic_id: Uuid,
    pub payload_format: PayloadFormat,
    pub scan_window: Duration,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub disconnect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            target_name: String::from(TARGET_NAME),
            service_id: FAN_SERVICE,
            characteristic_id: FAN_COMMAND_CHARACTERISTIC,
            payload_format: PayloadFormat::default(),
            scan_window: Duration::from_millis(SCAN_WINDOW),
            connect_timeout: Duration::from_millis(CONNECT_DEADLINE),
            write_timeout: Duration::from_millis(WRITE_DEADLINE),
            disconnect_timeout: Duration::from_millis(DISCONNECT_DEADLINE),
        }
    }
}

#[derive(Debug)]
struct ActiveLink<L> {
    descriptor: DeviceDescriptor,
    link: L,
    serial: u64,
}

struct SessionInner<T: Transport> {
    transport: T,
    config: SessionConfig,
    encoder: CommandEncoder,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<DeviceEvent>,
    link: Mutex<Option<ActiveLink<T::Link>>>,
    // serial of the most recently established link
    link_serial: AtomicU64,
    scan_lock: Mutex<()>,
    scan_cancel: StdMutex<Option<CancellationToken>>,
    connect_cancel: StdMutex<Option<CancellationToken>>,
    // cancelled on teardown; every operation token is a child of this one
    shutdown: CancellationToken,
}

impl<T: Transport> Drop for SessionInner<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub struct DeviceSession<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Transport> Clone for DeviceSession<T> {
    fn clone(&self) -> Self {
        DeviceSession { inner: self.inner.clone() }
    }
}

impl<T: Transport> DeviceSession<T> {
    /// Creates the session and starts watching the transport for lost links.
    /// Must be called from within a tokio runtime.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState {
            connection: ConnectionState::Disconnected,
            descriptor: None,
            service_id: config.service_id,
            characteristic_id: config.characteristic_id,
        });
        let (events, _) = broadcast::channel(64);
        let link_events = transport.link_events();
        let encoder = CommandEncoder::new(config.service_id, config.characteristic_id, config.payload_format);

        let inner = Arc::new(SessionInner {
            transport,
            config,
            encoder,
            state,
            events,
            link: Mutex::new(None),
            link_serial: AtomicU64::new(0),
            scan_lock: Mutex::new(()),
            scan_cancel: StdMutex::new(None),
            connect_cancel: StdMutex::new(None),
            shutdown: CancellationToken::new(),
        });

        spawn(watch_link_events(Arc::downgrade(&inner), link_events, inner.shutdown.clone()));

        DeviceSession { inner }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn current_state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    /// Scans for the configured target name for `window`.
    ///
    /// Cancels a scan that is already running; that scan resolves with `Cancelled`.
    pub async fn begin_scan(&self, window: Duration) -> Result<ScanResult, SessionError> {
        let cancel = self.supersede(&self.inner.scan_cancel);

        let _scan_guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            guard = self.inner.scan_lock.lock() => guard,
        };

        self.update_state(|state| {
            (state.connection == ConnectionState::Disconnected).then_some((ConnectionState::Scanning, None))
        });

        let filter = NameFilter::exact(self.inner.config.target_name.as_str());
        let result = scan(&self.inner.transport, |name| filter.matches(name), window, &cancel).await;

        self.update_state(|state| {
            (state.connection == ConnectionState::Scanning).then_some((ConnectionState::Disconnected, None))
        });

        match &result {
            Ok(found) if found.is_empty() => info!("No {} found", filter.target()),
            Ok(found) => info!("Found {} {} device(s)", found.len(), filter.target()),
            Err(err) => warn!("Scanning failed: {}", err),
        }

        result
    }

    pub fn cancel_scan(&self) {
        cancel_slot(&self.inner.scan_cancel);
    }

    /// Connects to a previously discovered device and verifies it exposes the fan characteristic.
    ///
    /// Any scan and any pending connect are cancelled first. Connecting to the device that is
    /// already connected is a no-op; connecting to another one releases the current link.
    pub async fn connect(&self, descriptor: DeviceDescriptor) -> Result<DeviceDescriptor, SessionError> {
        let cancel = self.supersede(&self.inner.connect_cancel);
        self.cancel_scan();

        // the cancelled scan has to stop scanning before the connect goes out
        let mut link = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            guard = async {
                drop(self.inner.scan_lock.lock().await);
                self.inner.link.lock().await
            } => guard,
        };

        if let Some(active) = link.as_ref() {
            if active.descriptor.id == descriptor.id && self.current_state().is_connected() {
                info!("Already connected to {}", active.descriptor);
                return Ok(active.descriptor.clone());
            }
        }

        if let Some(active) = link.take() {
            info!("Releasing link to {} first", active.descriptor);
            self.set_state(ConnectionState::Disconnecting, Some(active.descriptor.clone()));
            self.release(&active.link).await;
        }

        self.set_state(ConnectionState::Connecting, Some(descriptor.clone()));

        match self.establish(&descriptor, &cancel).await {
            Ok(native) => {
                let serial = self.inner.link_serial.fetch_add(1, Ordering::SeqCst) + 1;
                *link = Some(ActiveLink { descriptor: descriptor.clone(), link: native, serial });
                self.set_state(ConnectionState::Connected, Some(descriptor.clone()));
                info!("Peripheral ready");
                Ok(descriptor)
            },
            Err(err) => {
                warn!("Connecting to peripheral {} failed: {}", descriptor.id, err);
                self.set_state(ConnectionState::Disconnected, None);
                Err(err)
            },
        }
    }

    /// Encodes and writes a command. Leaves the session untouched on failure, so the caller may retry.
    pub async fn send_command(&self, command: Command) -> Result<(), SessionError> {
        if !self.current_state().is_connected() {
            return Err(SessionError::NotConnected);
        }

        let encoded = self.inner.encoder.encode(command)?;

        let link = self.inner.link.lock().await;
        let active = match link.as_ref() {
            Some(active) if self.current_state().is_connected() => active,
            _ => return Err(SessionError::NotConnected),
        };

        debug!(
            "Writing '{}' (base64: {}) to characteristic {} on service {}",
            encoded.payload,
            encoded.payload.to_base64(),
            encoded.characteristic,
            encoded.service,
        );

        let fut = self.inner.transport.write_characteristic(
            &active.link,
            encoded.service,
            encoded.characteristic,
            encoded.payload.as_bytes(),
        );

        match timeout(self.inner.config.write_timeout, fut).await {
            Err(_) => {
                warn!("Sending to fan characteristic took too long");
                Err(SessionError::Timeout)
            },
            Ok(Err(source)) => {
                warn!("Failed to send to fan characteristic: {}", source);
                Err(SessionError::WriteFailed { source })
            },
            Ok(Ok(())) => {
                info!("Sent {:?} to {}", command, active.descriptor.id);
                Ok(())
            },
        }
    }

    /// Cancels any scan or connect in flight and releases the link. Idempotent.
    pub async fn disconnect(&self) {
        self.cancel_scan();
        cancel_slot(&self.inner.connect_cancel);

        // let a cancelled scan put the state back before looking at it
        drop(self.inner.scan_lock.lock().await);
        let mut link = self.inner.link.lock().await;

        match link.take() {
            Some(active) => {
                self.set_state(ConnectionState::Disconnecting, Some(active.descriptor.clone()));
                self.release(&active.link).await;
                self.set_state(ConnectionState::Disconnected, None);
                info!("Disconnected from {}", active.descriptor.id);
            },
            None => {
                self.set_state(ConnectionState::Disconnected, None);
            },
        }
    }

    /// Tears the session down: no further operation succeeds after this.
    pub async fn shutdown(self) {
        info!("Shutting down device session");
        self.inner.shutdown.cancel();
        self.disconnect().await;
    }

    async fn establish(&self, descriptor: &DeviceDescriptor, cancel: &CancellationToken) -> Result<T::Link, SessionError> {
        let transport = &self.inner.transport;
        let config = &self.inner.config;
        let id = &descriptor.id;

        info!("Connecting to peripheral {}...", descriptor);
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = timeout(config.connect_timeout, transport.connect(id)) => Some(result),
        };

        let native = match connected {
            Some(Ok(Ok(native))) => native,
            Some(Ok(Err(source))) => {
                self.abort_connect(id).await;
                return Err(SessionError::DeviceUnreachable { id: id.to_string(), source: Some(source) });
            },
            Some(Err(_)) => {
                warn!("Connecting to peripheral took too long");
                self.abort_connect(id).await;
                return Err(SessionError::DeviceUnreachable { id: id.to_string(), source: None });
            },
            None => {
                self.abort_connect(id).await;
                return Err(SessionError::Cancelled);
            },
        };

        info!("Connected; Discovering services...");
        let discovered = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = timeout(config.connect_timeout, transport.discover_services(&native)) => Some(result),
        };

        let failure = match discovered {
            Some(Ok(Ok(services))) => {
                let found = services.iter().any(|service| {
                    service.uuid == config.service_id && service.has_characteristic(&config.characteristic_id)
                });
                if found {
                    debug!("Found characteristic {} on service {}", config.characteristic_id, config.service_id);
                    return Ok(native);
                }
                SessionError::ServiceDiscoveryFailed {
                    id: id.to_string(),
                    source: Some(TransportError::MissingCharacteristic),
                }
            },
            Some(Ok(Err(source))) => SessionError::ServiceDiscoveryFailed { id: id.to_string(), source: Some(source) },
            Some(Err(_)) => {
                warn!("Discovering services took too long");
                SessionError::ServiceDiscoveryFailed { id: id.to_string(), source: None }
            },
            None => SessionError::Cancelled,
        };

        self.release(&native).await;
        Err(failure)
    }

    async fn abort_connect(&self, id: &DeviceId) {
        match timeout(self.inner.config.disconnect_timeout, self.inner.transport.cancel_connect(id)).await {
            Err(_) => warn!("Cancelling connection to {} took too long", id),
            Ok(Err(err)) => warn!("Failed to cancel connection to {}: {}", id, err),
            Ok(Ok(())) => debug!("Cancelled connection attempt to {}", id),
        }
    }

    // The handle is dropped by the caller no matter how this goes.
    async fn release(&self, link: &T::Link) {
        match timeout(self.inner.config.disconnect_timeout, self.inner.transport.disconnect(link)).await {
            Err(_) => warn!("Disconnecting took too long"),
            Ok(Err(err)) => warn!("Disconnect error: {}", err),
            Ok(Ok(())) => {},
        }
    }

    async fn handle_link_lost(&self, id: &DeviceId) {
        // make the loss visible right away, even if a write currently holds the link
        let Some((descriptor, serial)) = self.mark_lost(id) else {
            // also the echo of disconnects (and aborted connects) the session made itself
            debug!("Ignoring disconnect of {}, it is not the connected device", id);
            return;
        };

        let mut link = self.inner.link.lock().await;
        if link.as_ref().map_or(false, |active| active.serial == serial) {
            if let Some(active) = link.take() {
                self.release(&active.link).await;
            }
        }
        drop(link);

        warn!("Connection lost to {}", descriptor);
        let _ = self.inner.events.send(DeviceEvent::LinkLost(descriptor));
    }

    // Only a Connected state counts, and it always belongs to the newest link serial.
    fn mark_lost(&self, id: &DeviceId) -> Option<(DeviceDescriptor, u64)> {
        let mut lost = None;
        self.update_state(|state| {
            let descriptor = state.descriptor.as_ref().filter(|descriptor| &descriptor.id == id)?;
            if state.connection != ConnectionState::Connected {
                return None;
            }
            lost = Some((descriptor.clone(), self.inner.link_serial.load(Ordering::SeqCst)));
            Some((ConnectionState::Disconnected, None))
        });
        lost
    }

    fn supersede(&self, slot: &StdMutex<Option<CancellationToken>>) -> CancellationToken {
        let token = self.inner.shutdown.child_token();
        let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    fn set_state(&self, connection: ConnectionState, descriptor: Option<DeviceDescriptor>) {
        self.update_state(|_| Some((connection, descriptor)));
    }

    fn update_state<F>(&self, transition: F)
    where
        F: FnOnce(&SessionState) -> Option<(ConnectionState, Option<DeviceDescriptor>)>,
    {
        let changed = self.inner.state.send_if_modified(|state| {
            let (connection, descriptor) = match transition(state) {
                Some(next) => next,
                None => return false,
            };
            if state.connection == connection && state.descriptor == descriptor {
                return false;
            }
            state.connection = connection;
            state.descriptor = descriptor;
            true
        });

        if changed {
            let snapshot = self.current_state();
            debug!("Session state changed to {}", snapshot.connection);
            let _ = self.inner.events.send(DeviceEvent::StateChange(snapshot));
        }
    }
}

fn cancel_slot(slot: &StdMutex<Option<CancellationToken>>) {
    let slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(token) = slot.as_ref() {
        token.cancel();
    }
}

async fn watch_link_events<T: Transport>(
    session: Weak<SessionInner<T>>,
    mut link_events: broadcast::Receiver<LinkEvent>,
    cancel: CancellationToken,
) {
    'mainloop: loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = link_events.recv() => event,
        };

        match event {
            Ok(LinkEvent::Lost(id)) => {
                let Some(inner) = session.upgrade() else {
                    break 'mainloop;
                };
                DeviceSession { inner }.handle_link_lost(&id).await;
            },
            Err(RecvError::Lagged(missed)) => warn!("Missed {} link events", missed),
            Err(RecvError::Closed) => {
                debug!("Link event channel closed");
                break 'mainloop;
            },
        }
    }
}
