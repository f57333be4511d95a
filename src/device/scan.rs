//! Time-bounded discovery.
//!
//! A scan window is a finite operation: it starts discovery on the transport, folds the
//! advertisements it sees into an ordered, de-duplicated set and always stops discovery again,
//! whether the window elapsed or the scan was cancelled.

use std::time::Duration;
use futures::StreamExt;
use indexmap::IndexMap;
use indexmap::map::Entry;
use log::{debug, info, warn};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::device::transport::{Advertisement, Transport};
use crate::device::types::{DeviceDescriptor, DeviceId};
use crate::error::SessionError;

/// Exact, case-sensitive match on the advertised local name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFilter {
    target: String,
}

impl NameFilter {
    pub fn exact(target: impl Into<String>) -> Self {
        NameFilter { target: target.into() }
    }

    pub fn matches(&self, name: Option<&str>) -> bool {
        name == Some(self.target.as_str())
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Devices found during one scan window, in the order they were first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    devices: Vec<DeviceDescriptor>,
}

impl ScanResult {
    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn first(&self) -> Option<&DeviceDescriptor> {
        self.devices.first()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn into_devices(self) -> Vec<DeviceDescriptor> {
        self.devices
    }
}

impl IntoIterator for ScanResult {
    type Item = DeviceDescriptor;
    type IntoIter = std::vec::IntoIter<DeviceDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.into_iter()
    }
}

fn collect<P>(found: &mut IndexMap<DeviceId, DeviceDescriptor>, advertisement: Advertisement, predicate: &P)
where
    P: Fn(Option<&str>) -> bool,
{
    if !predicate(advertisement.name.as_deref()) {
        debug!("Ignoring device {} {:?}", advertisement.id, advertisement.name);
        return;
    }

    match found.entry(advertisement.id) {
        Entry::Occupied(mut entry) => {
            let descriptor = entry.get_mut();
            if advertisement.rssi.is_some() {
                descriptor.rssi = advertisement.rssi;
            }
            if descriptor.name.is_none() {
                descriptor.name = advertisement.name;
            }
        },
        Entry::Vacant(entry) => {
            let descriptor = DeviceDescriptor {
                id: entry.key().clone(),
                name: advertisement.name,
                rssi: advertisement.rssi,
            };
            info!("Discovered target device {}", descriptor);
            entry.insert(descriptor);
        },
    }
}

/// Runs one scan window against `transport`.
///
/// Resolves with the matching devices once `window` has elapsed, or with
/// [`SessionError::Cancelled`] as soon as `cancel` fires. Errors reported for individual
/// advertisements are logged and skipped; only failing to start discovery is fatal.
pub async fn scan<T, P>(
    transport: &T,
    predicate: P,
    window: Duration,
    cancel: &CancellationToken,
) -> Result<ScanResult, SessionError>
where
    T: Transport,
    P: Fn(Option<&str>) -> bool,
{
    if cancel.is_cancelled() {
        return Err(SessionError::Cancelled);
    }

    let deadline = Instant::now() + window;
    let mut advertisements = transport.start_scan().await.map_err(|source| {
        if source.is_unavailable() {
            SessionError::TransportUnavailable { source }
        } else {
            SessionError::ScanStartFailed { source }
        }
    })?;

    info!("Scanning for {} ms...", window.as_millis());
    let mut found: IndexMap<DeviceId, DeviceDescriptor> = IndexMap::new();
    let window_end = sleep_until(deadline);
    tokio::pin!(window_end);

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Scan cancelled");
                break Err(SessionError::Cancelled);
            },
            _ = &mut window_end => {
                info!("Scan stopped after {} ms", window.as_millis());
                break Ok(());
            },
            advertisement = advertisements.next() => match advertisement {
                Some(Ok(advertisement)) => collect(&mut found, advertisement, &predicate),
                Some(Err(err)) => warn!("Scan error, skipping advertisement: {}", err),
                None => {
                    warn!("Advertisements stopped before the scan window elapsed");
                    break Ok(());
                },
            },
        }
    };

    drop(advertisements);
    if let Err(err) = transport.stop_scan().await {
        warn!("Failed to stop scanning: {}", err);
    }

    outcome.map(|_| ScanResult { devices: found.into_values().collect() })
}
