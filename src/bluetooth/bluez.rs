//! BlueZ radio backend.
//!
//! Negotiated links go through GATT: the device is connected, its services
//! are resolved and the configured characteristic is opened for notify and
//! write. Streaming links are plain RFCOMM sockets on the configured
//! channel.

use std::{pin::Pin, time::Duration};

use async_trait::async_trait;
use bluer::{
   Adapter, AdapterEvent, Address, Session,
   gatt::remote::Characteristic,
   rfcomm::{Socket, SocketAddr},
};
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{runtime::Handle, task::JoinHandle, time};
use uuid::Uuid;

use crate::{
   bluetooth::{
      channel::{Channel, StrategyKind},
      radio::{Radio, ScanReporter},
   },
   capability::Capability,
   config::BluezSettings,
   error::{ConnectError, LinkError, Result},
   peer::Peer,
};

/// Timeout for connection attempts
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval while waiting for GATT services to resolve
const RESOLVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct BluezRadio {
   _session: Session,
   adapter: Adapter,
   rfcomm_channel: u8,
   scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BluezRadio {
   /// Opens a BlueZ session on the configured adapter, or the default one.
   pub async fn new(settings: &BluezSettings) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match &settings.adapter {
         Some(name) => session.adapter(name),
         None => session.default_adapter().await,
      }
      .map_err(|e| {
         warn!("No usable Bluetooth adapter: {e}");
         LinkError::UnsupportedHardware
      })?;
      info!("Using adapter {}", adapter.name());

      Ok(Self {
         _session: session,
         adapter,
         rfcomm_channel: settings.rfcomm_channel,
         scan_task: Mutex::new(None),
      })
   }

   fn address(peer: &Peer) -> std::result::Result<Address, ConnectError> {
      peer
         .id()
         .as_str()
         .parse()
         .map_err(|_| ConnectError::PeerUnreachable(format!("invalid address {}", peer.id())))
   }

   async fn peer_for(adapter: &Adapter, address: Address) -> Peer {
      let name = match adapter.device(address) {
         Ok(device) => device.name().await.ok().flatten(),
         Err(_) => None,
      };
      Peer::new(address.to_string(), name)
   }

   async fn find_characteristic(
      device: &bluer::Device,
      service: Uuid,
      characteristic: Uuid,
   ) -> std::result::Result<Characteristic, ConnectError> {
      let resolved = time::timeout(CONNECT_TIMEOUT, async {
         while !device.is_services_resolved().await.unwrap_or(false) {
            time::sleep(RESOLVE_POLL_INTERVAL).await;
         }
      });
      resolved.await.map_err(|_| ConnectError::ConnectTimeout)?;

      let services = device.services().await.map_err(io_failure)?;
      for candidate in services {
         if candidate.uuid().await.ok() != Some(service) {
            continue;
         }
         for c in candidate.characteristics().await.map_err(io_failure)? {
            if c.uuid().await.ok() == Some(characteristic) {
               return Ok(c);
            }
         }
         return Err(ConnectError::CharacteristicNotFound(characteristic));
      }
      Err(ConnectError::ServiceNotFound(service))
   }

   async fn open_gatt(
      &self,
      peer: &Peer,
      device: &bluer::Device,
      service: Uuid,
      characteristic: Uuid,
   ) -> std::result::Result<Channel, ConnectError> {
      if !device.is_connected().await.unwrap_or(false) {
         time::timeout(CONNECT_TIMEOUT, device.connect())
            .await
            .map_err(|_| ConnectError::ConnectTimeout)?
            .map_err(|e| ConnectError::PeerUnreachable(e.to_string()))?;
      }

      let characteristic = Self::find_characteristic(device, service, characteristic).await?;
      let reader = characteristic.notify_io().await.map_err(io_failure)?;
      let writer = characteristic.write_io().await.map_err(io_failure)?;
      debug!("{}: notify mtu {}, write mtu {}", peer.id(), reader.mtu(), writer.mtu());

      Ok(Channel::new(
         peer.clone(),
         StrategyKind::Negotiated,
         Box::pin(reader),
         Box::pin(writer),
      ))
   }
}

/// Runs its callback on drop unless disarmed.
struct DisconnectGuard<F: FnOnce()> {
   on_drop: Option<F>,
}

impl<F: FnOnce()> DisconnectGuard<F> {
   fn new(on_drop: F) -> Self {
      Self {
         on_drop: Some(on_drop),
      }
   }

   fn disarm(mut self) {
      self.on_drop = None;
   }
}

impl<F: FnOnce()> Drop for DisconnectGuard<F> {
   fn drop(&mut self) {
      if let Some(on_drop) = self.on_drop.take() {
         on_drop();
      }
   }
}

fn io_failure(e: bluer::Error) -> ConnectError {
   ConnectError::IoFailure(e.to_string())
}

#[async_trait]
impl Radio for BluezRadio {
   fn is_supported(&self) -> bool {
      true
   }

   async fn is_enabled(&self) -> bool {
      self.adapter.is_powered().await.unwrap_or(false)
   }

   fn check_permission(&self, _capability: Capability) -> bool {
      // BlueZ authorizes callers through D-Bus policy, not runtime grants.
      true
   }

   async fn start_scan(&self, reporter: ScanReporter) -> Result<()> {
      let events = self.adapter.discover_devices().await?;
      let mut events: Pin<Box<dyn Stream<Item = AdapterEvent> + Send>> = Box::pin(events);
      let adapter = self.adapter.clone();

      let task = tokio::spawn(async move {
         while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceAdded(address) = event {
               let peer = Self::peer_for(&adapter, address).await;
               debug!("Device found: {peer}");
               if !reporter.report(peer) {
                  break;
               }
            }
         }
         debug!("Discovery stream ended");
      });

      if let Some(previous) = self.scan_task.lock().replace(task) {
         previous.abort();
      }
      Ok(())
   }

   async fn stop_scan(&self) {
      // Dropping the discovery stream ends discovery.
      if let Some(task) = self.scan_task.lock().take() {
         task.abort();
      }
   }

   async fn open_negotiated_link(
      &self,
      peer: &Peer,
      service: Uuid,
      characteristic: Uuid,
   ) -> std::result::Result<Channel, ConnectError> {
      let address = Self::address(peer)?;
      let device = self
         .adapter
         .device(address)
         .map_err(|e| ConnectError::PeerUnreachable(e.to_string()))?;

      // Armed until the channel is handed over; also covers the attempt
      // being cancelled mid-await.
      let handle = Handle::try_current().ok();
      let target = device.clone();
      let guard = DisconnectGuard::new(move || {
         let Some(handle) = handle else {
            return;
         };
         handle.spawn(async move {
            if target.is_connected().await.unwrap_or(false)
               && let Err(e) = target.disconnect().await
            {
               warn!("{address}: failed to disconnect after failed attempt: {e}");
            }
         });
      });

      let channel = self.open_gatt(peer, &device, service, characteristic).await?;
      guard.disarm();
      Ok(channel)
   }

   async fn open_streaming_link(
      &self,
      peer: &Peer,
      service: Uuid,
   ) -> std::result::Result<Channel, ConnectError> {
      let address = Self::address(peer)?;
      debug!(
         "{address}: opening RFCOMM channel {} for {service}",
         self.rfcomm_channel
      );

      let socket = Socket::new().map_err(|e| ConnectError::SocketCreateFailed(e.to_string()))?;
      let stream = time::timeout(
         CONNECT_TIMEOUT,
         socket.connect(SocketAddr::new(address, self.rfcomm_channel)),
      )
      .await
      .map_err(|_| ConnectError::ConnectTimeout)?
      .map_err(|e| ConnectError::PeerUnreachable(e.to_string()))?;

      Ok(Channel::from_stream(peer.clone(), StrategyKind::Streaming, stream))
   }

   async fn bonded_peers(&self) -> Result<Vec<Peer>> {
      let mut peers = Vec::new();
      for address in self.adapter.device_addresses().await? {
         let device = self.adapter.device(address)?;
         if device.is_paired().await.unwrap_or(false) {
            peers.push(Self::peer_for(&self.adapter, address).await);
         }
      }
      Ok(peers)
   }
}
