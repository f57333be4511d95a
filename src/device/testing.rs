//! Scripted in-memory transport for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use tokio::sync::broadcast;
use tokio::time::sleep;
use uuid::Uuid;

use crate::device::constants::{FAN_COMMAND_CHARACTERISTIC, FAN_SERVICE};
use crate::device::transport::{Advertisement, AdvertisementStream, GattService, LinkEvent, Transport};
use crate::device::types::DeviceId;
use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    StartScan,
    StopScan,
    Connect(DeviceId),
    CancelConnect(DeviceId),
    DiscoverServices(DeviceId),
    Write(Vec<u8>),
    Disconnect(DeviceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Succeed,
    Fail,
    Hang,
    /// Succeeds after this many milliseconds.
    Delay(u64),
}

#[derive(Debug, Clone)]
pub(crate) struct MockLink {
    pub id: DeviceId,
    pub serial: u64,
}

type ScriptedAdvertisement = (u64, Result<Advertisement, TransportError>);

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    scans: VecDeque<Vec<ScriptedAdvertisement>>,
    scan_start_error: Option<TransportError>,
    active_scans: usize,
    max_active_scans: usize,
    connects: VecDeque<Step>,
    discoveries: VecDeque<Step>,
    hide_fan_service: bool,
    writes: VecDeque<Step>,
    fail_disconnect: bool,
    next_serial: u64,
    open_links: Vec<MockLink>,
}

#[derive(Clone)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
    link_events: broadcast::Sender<LinkEvent>,
}

pub(crate) fn advertisement(id: &str, name: Option<&str>) -> Advertisement {
    Advertisement {
        id: DeviceId::new(id),
        name: name.map(String::from),
        rssi: None,
    }
}

fn failure() -> TransportError {
    TransportError::Btle { source: btleplug::Error::NotConnected }
}

impl MockTransport {
    pub fn new() -> Self {
        let (link_events, _) = broadcast::channel(16);
        MockTransport {
            state: Arc::new(Mutex::new(MockState::default())),
            link_events,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().expect("mock state poisoned");
        f(&mut state)
    }

    /// Advertisements for the next scan; each is delivered `delay` milliseconds after the previous one.
    pub fn script_scan(&self, advertisements: Vec<ScriptedAdvertisement>) {
        self.with_state(|state| state.scans.push_back(advertisements));
    }

    pub fn fail_scan_start(&self, error: TransportError) {
        self.with_state(|state| state.scan_start_error = Some(error));
    }

    pub fn script_connect(&self, step: Step) {
        self.with_state(|state| state.connects.push_back(step));
    }

    pub fn script_discovery(&self, step: Step) {
        self.with_state(|state| state.discoveries.push_back(step));
    }

    pub fn hide_fan_service(&self) {
        self.with_state(|state| state.hide_fan_service = true);
    }

    pub fn script_write(&self, step: Step) {
        self.with_state(|state| state.writes.push_back(step));
    }

    pub fn fail_disconnect(&self) {
        self.with_state(|state| state.fail_disconnect = true);
    }

    pub fn lose_link(&self, id: &str) {
        let _ = self.link_events.send(LinkEvent::Lost(DeviceId::new(id)));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with_state(|state| state.calls.clone())
    }

    pub fn count(&self, matcher: impl Fn(&Call) -> bool) -> usize {
        self.with_state(|state| state.calls.iter().filter(|call| matcher(call)).count())
    }

    pub fn open_links(&self) -> usize {
        self.with_state(|state| state.open_links.len())
    }

    pub fn active_scans(&self) -> usize {
        self.with_state(|state| state.active_scans)
    }

    pub fn max_active_scans(&self) -> usize {
        self.with_state(|state| state.max_active_scans)
    }
}

async fn perform(step: Step) -> Result<(), TransportError> {
    match step {
        Step::Succeed => Ok(()),
        Step::Fail => Err(failure()),
        Step::Hang => future::pending().await,
        Step::Delay(millis) => {
            sleep(Duration::from_millis(millis)).await;
            Ok(())
        },
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Link = MockLink;

    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError> {
        let script = self.with_state(|state| {
            state.calls.push(Call::StartScan);
            if let Some(err) = state.scan_start_error.take() {
                return Err(err);
            }
            state.active_scans += 1;
            state.max_active_scans = state.max_active_scans.max(state.active_scans);
            Ok(state.scans.pop_front().unwrap_or_default())
        })?;

        let scripted = stream::iter(script).then(|(delay, item)| async move {
            sleep(Duration::from_millis(delay)).await;
            item
        });

        // a real scan only ends when it is stopped
        Ok(scripted.chain(stream::pending()).boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.with_state(|state| {
            state.calls.push(Call::StopScan);
            state.active_scans = state.active_scans.saturating_sub(1);
        });
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<MockLink, TransportError> {
        let step = self.with_state(|state| {
            state.calls.push(Call::Connect(id.clone()));
            state.connects.pop_front().unwrap_or(Step::Succeed)
        });

        perform(step).await?;

        Ok(self.with_state(|state| {
            state.next_serial += 1;
            let link = MockLink { id: id.clone(), serial: state.next_serial };
            state.open_links.push(link.clone());
            link
        }))
    }

    async fn cancel_connect(&self, id: &DeviceId) -> Result<(), TransportError> {
        self.with_state(|state| {
            state.calls.push(Call::CancelConnect(id.clone()));
            state.open_links.retain(|link| &link.id != id);
        });
        Ok(())
    }

    async fn discover_services(&self, link: &MockLink) -> Result<Vec<GattService>, TransportError> {
        let (step, hide_fan_service) = self.with_state(|state| {
            state.calls.push(Call::DiscoverServices(link.id.clone()));
            (state.discoveries.pop_front().unwrap_or(Step::Succeed), state.hide_fan_service)
        });

        perform(step).await?;

        let battery = GattService {
            uuid: Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb),
            characteristics: vec![Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb)],
        };
        if hide_fan_service {
            return Ok(vec![battery]);
        }

        Ok(vec![
            battery,
            GattService { uuid: FAN_SERVICE, characteristics: vec![FAN_COMMAND_CHARACTERISTIC] },
        ])
    }

    async fn write_characteristic(
        &self,
        _link: &MockLink,
        _service: Uuid,
        _characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let step = self.with_state(|state| {
            state.calls.push(Call::Write(value.to_vec()));
            state.writes.pop_front().unwrap_or(Step::Succeed)
        });

        perform(step).await
    }

    async fn disconnect(&self, link: &MockLink) -> Result<(), TransportError> {
        let fail = self.with_state(|state| {
            state.calls.push(Call::Disconnect(link.id.clone()));
            state.open_links.retain(|open| open.serial != link.serial);
            state.fail_disconnect
        });

        if fail { Err(failure()) } else { Ok(()) }
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_events.subscribe()
    }
}
