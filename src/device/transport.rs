//! The capability set the session needs from a platform BLE stack.
//!
//! Platform specific implementations (see [`crate::device::btle`]) are picked when the
//! application is composed; the session itself never branches on the platform.

use std::fmt::Debug;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::device::types::DeviceId;
use crate::error::TransportError;

/// A single advertisement as reported during scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl GattService {
    pub fn has_characteristic(&self, characteristic: &Uuid) -> bool {
        self.characteristics.contains(characteristic)
    }
}

/// Out-of-band notifications about established links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Lost(DeviceId),
}

pub type AdvertisementStream = BoxStream<'static, Result<Advertisement, TransportError>>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Native connection handle.
    type Link: Clone + Debug + Send + Sync + 'static;

    /// Starts continuous discovery. Advertisements keep flowing until `stop_scan` is called.
    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, id: &DeviceId) -> Result<Self::Link, TransportError>;

    /// Aborts a pending `connect` and drops whatever half-open link it left behind.
    async fn cancel_connect(&self, id: &DeviceId) -> Result<(), TransportError>;

    async fn discover_services(&self, link: &Self::Link) -> Result<Vec<GattService>, TransportError>;

    /// Writes with response; resolves once the peripheral acknowledged the write.
    async fn write_characteristic(
        &self,
        link: &Self::Link,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, link: &Self::Link) -> Result<(), TransportError>;

    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;
}
