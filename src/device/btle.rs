use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use std::time::Duration;
use futures::{future, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::LOOKUP_WINDOW;
use crate::device::transport::{Advertisement, AdvertisementStream, GattService, LinkEvent, Transport};
use crate::device::types::DeviceId;
use crate::error::TransportError;

/// Transport backed by the platform bluetooth stack through `btleplug`.
pub struct BtleTransport {
    adapter: Adapter,
    link_events: broadcast::Sender<LinkEvent>,
    cancel: CancellationToken,
}

impl BtleTransport {
    /// Uses the first adapter of the system. Fails with [`TransportError::Unavailable`] if there is none.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?
            .into_iter()
            .next()
            .ok_or(TransportError::Unavailable)?;

        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        let (link_events, _) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        forward_disconnects(&adapter, link_events.clone(), cancel.clone()).await?;

        Ok(BtleTransport { adapter, link_events, cancel })
    }

    async fn find_peripheral(&self, id: &DeviceId) -> Result<Peripheral, TransportError> {
        self.adapter.peripherals().await?
            .into_iter()
            .find(|peripheral| peripheral.id().to_string() == id.as_str())
            .ok_or_else(|| TransportError::UnknownDevice { id: id.to_string() })
    }

    // CoreBluetooth and WinRT only know peripherals that showed up in a scan of this process
    async fn lookup_peripheral(&self, id: &DeviceId) -> Result<Peripheral, TransportError> {
        match self.find_peripheral(id).await {
            Err(TransportError::UnknownDevice { .. }) => {},
            found => return found,
        }

        info!("Peripheral {} is not known yet, scanning for it", id);
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let seen = timeout(Duration::from_millis(LOOKUP_WINDOW), async {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(peripheral_id) | CentralEvent::DeviceUpdated(peripheral_id)
                        if peripheral_id.to_string() == id.as_str() => return true,
                    _ => {},
                }
            }
            false
        }).await;

        if let Err(err) = self.adapter.stop_scan().await {
            warn!("Failed to stop the lookup scan: {}", err);
        }

        match seen {
            Ok(true) => self.find_peripheral(id).await,
            _ => Err(TransportError::UnknownDevice { id: id.to_string() }),
        }
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn forward_disconnects(
    adapter: &Adapter,
    sender: broadcast::Sender<LinkEvent>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let mut events = adapter.events().await?;

    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(id)) => {
                        debug!("Peripheral {} disconnected", id);
                        // nobody listening is fine
                        let _ = sender.send(LinkEvent::Lost(DeviceId::new(id.to_string())));
                    },
                    Some(_) => {},
                    None => break 'mainloop,
                },
            }
        }
    });

    Ok(())
}

async fn advertisement_for(adapter: &Adapter, id: &PeripheralId) -> Result<Option<Advertisement>, TransportError> {
    let peripheral = adapter.peripheral(id).await?;

    Ok(peripheral.properties().await?.map(|properties| Advertisement {
        id: DeviceId::new(id.to_string()),
        name: properties.local_name,
        rssi: properties.rssi,
    }))
}

#[async_trait]
impl Transport for BtleTransport {
    type Link = Peripheral;

    async fn start_scan(&self) -> Result<AdvertisementStream, TransportError> {
        let events = self.adapter.events().await?;
        // the name filter is applied by the scan coordinator, some platforms ignore scan filters anyway
        self.adapter.start_scan(ScanFilter::default()).await?;

        let adapter = self.adapter.clone();
        let advertisements = events
            .filter_map(|event| future::ready(match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => Some(id),
                _ => None,
            }))
            .then(move |id| {
                let adapter = adapter.clone();
                async move { advertisement_for(&adapter, &id).await }
            })
            .filter_map(|result| future::ready(result.transpose()));

        Ok(advertisements.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<Peripheral, TransportError> {
        let peripheral = self.lookup_peripheral(id).await?;
        peripheral.connect().await?;
        Ok(peripheral)
    }

    async fn cancel_connect(&self, id: &DeviceId) -> Result<(), TransportError> {
        // btleplug has no separate cancel, disconnecting aborts a pending connect as well
        match self.find_peripheral(id).await {
            Ok(peripheral) => {
                peripheral.disconnect().await?;
                Ok(())
            },
            Err(TransportError::UnknownDevice { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn discover_services(&self, link: &Peripheral) -> Result<Vec<GattService>, TransportError> {
        link.discover_services().await?;

        Ok(link.services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|characteristic| characteristic.uuid).collect(),
            })
            .collect())
    }

    async fn write_characteristic(
        &self,
        link: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let target = link.characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or(TransportError::MissingCharacteristic)?;

        link.write(&target, value, WriteType::WithResponse).await?;
        Ok(())
    }

    async fn disconnect(&self, link: &Peripheral) -> Result<(), TransportError> {
        match link.is_connected().await {
            Ok(false) => {
                debug!("Peripheral {} already disconnected", link.id());
                Ok(())
            },
            Ok(true) => {
                link.disconnect().await?;
                Ok(())
            },
            Err(err) => {
                warn!("Error checking for connection state: {}", err);
                link.disconnect().await?;
                Ok(())
            },
        }
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_events.subscribe()
    }
}
