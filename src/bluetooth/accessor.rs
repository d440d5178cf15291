//! Top-level accessor handed to the bus transport.
//!
//! [`BtAccessor`] ties the discovery manager to the L2CAP link layer: it
//! owns the single listening socket, pauses discovery around outgoing
//! connects and remote SDP queries, and decodes remote service records.

use std::{
   io,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   select,
   sync::{Notify, mpsc},
};

use crate::{
   bluetooth::{
      bluez::{BluezEvent, BluezProxy},
      hci::HciBackend,
      l2cap::{Connection, L2capBackend, L2capLink, Listener},
      manager::DiscoveryManager,
      node::BusAddress,
      sdp::{self, BUS_UUID_BASE, ServiceRecord},
   },
   config::Config,
   error::{AccessorError, Result},
   event::{EventSender, PolicyRef},
};

struct AccessorInner {
   manager: DiscoveryManager,
   link: L2capLink,
   listener: Mutex<Option<Arc<Listener>>>,
   closed: Notify,
   advertising: AtomicBool,
}

/// Bluetooth side of the bus transport.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct BtAccessor(Arc<AccessorInner>);

impl BtAccessor {
   pub fn new(
      config: Config,
      bluez: Arc<dyn BluezProxy>,
      hci: Arc<dyn HciBackend>,
      l2cap: Arc<dyn L2capBackend>,
      policy: PolicyRef,
      event_tx: EventSender,
      events: mpsc::Receiver<BluezEvent>,
   ) -> Self {
      let link = L2capLink::new(
         l2cap,
         policy,
         config.l2cap_mtu,
         config.connect_attempts,
         config.connect_waits,
      );
      let manager = DiscoveryManager::new(config, bluez, hci, event_tx, events);
      Self(Arc::new(AccessorInner {
         manager,
         link,
         listener: Mutex::new(None),
         closed: Notify::new(),
         advertising: AtomicBool::new(false),
      }))
   }

   pub fn manager(&self) -> &DiscoveryManager {
      &self.0.manager
   }

   // === Connectable ===

   /// Starts listening on the default adapter and returns the local bus
   /// address. Returns the existing address if already listening.
   pub fn start_connectable(&self) -> Result<BusAddress> {
      let adapter = self
         .0
         .manager
         .default_adapter()
         .ok_or(AccessorError::AdapterNotAvailable)?;
      let local = adapter.address();

      let mut listener = self.0.listener.lock();
      if let Some(existing) = listener.as_ref() {
         return Ok(BusAddress::new(local, existing.psm()));
      }
      let new = self.0.link.listen(local)?;
      let bus_addr = BusAddress::new(local, new.psm());
      *listener = Some(Arc::new(new));
      info!("Connectable at {bus_addr}");
      Ok(bus_addr)
   }

   /// Closes the listening socket. Pending accepts fail.
   pub fn stop_connectable(&self) {
      if self.0.listener.lock().take().is_some() {
         info!("No longer connectable");
         self.0.closed.notify_waiters();
      }
   }

   pub fn is_connectable(&self) -> bool {
      self.0.listener.lock().is_some()
   }

   /// Waits for the next vetted incoming link.
   pub async fn accept(&self) -> Result<Connection> {
      let closed = self.0.closed.notified();
      let listener = self
         .0
         .listener
         .lock()
         .clone()
         .ok_or(AccessorError::NotFound("listening socket"))?;

      select! {
          conn = self.0.link.accept(&listener) => conn,
          () = closed => {
              debug!("Accept aborted, listening socket closed");
              Err(io::Error::from(io::ErrorKind::ConnectionAborted).into())
          }
      }
   }

   // === Outgoing ===

   /// Connects to a remote node with discovery paused.
   pub async fn connect(&self, target: BusAddress) -> Result<Connection> {
      let _pause = self.0.manager.pause_discovery();
      self.0.link.connect(target).await
   }

   /// Queries the bus service record of a remote device.
   pub async fn get_device_info(&self, addr: Address) -> Result<ServiceRecord> {
      let _pause = self.0.manager.pause_discovery();

      let device = self.0.manager.device_object_path(addr).await?;
      let records = self.0.manager.bluez().discover_services(&device, "").await?;
      debug!("{addr}: {} service records", records.len());

      for (handle, xml) in records {
         match sdp::decode(&xml, &BUS_UUID_BASE) {
            Ok(record) => {
               info!(
                  "{addr}: bus record {handle:#x} at {}, uuid rev {:08x}, {} nodes",
                  record.bus_addr,
                  record.uuid_rev,
                  record.nodes.len()
               );
               return Ok(record);
            },
            Err(e) => debug!("{addr}: record {handle:#x} is not a bus record: {e}"),
         }
      }
      warn!("{addr}: no bus service record found");
      Err(AccessorError::NotFound("bus service record"))
   }

   // === Lifecycle ===

   /// Stops listening, advertising and the published record.
   pub async fn shutdown(&self) {
      self.stop_connectable();
      self.stop_advertising().await;
      self.0.manager.stop_discoverability().await;
      if let Err(e) = self.0.manager.retract_service_record().await {
         warn!("Failed to retract service record on shutdown: {e}");
      }
   }

   /// Starts discovery and discoverability for `duration`, or indefinitely
   /// when zero.
   pub async fn advertise(&self, ignore: impl IntoIterator<Item = Address>, duration: Duration) {
      self.0.manager.start_discovery(ignore, duration);
      self.0.manager.start_discoverability(duration).await;
   }

   /// Discovers and stays discoverable until [`Self::stop_advertising`].
   /// Holds at most one discovery reference no matter how often it is called.
   pub async fn start_advertising(&self, ignore: impl IntoIterator<Item = Address>) {
      if self.0.advertising.swap(true, Ordering::AcqRel) {
         debug!("Already advertising");
         return;
      }
      self.advertise(ignore, Duration::ZERO).await;
   }

   pub async fn stop_advertising(&self) {
      if !self.0.advertising.swap(false, Ordering::AcqRel) {
         return;
      }
      self.0.manager.stop_discovery();
      self.0.manager.stop_discoverability().await;
   }

   pub fn is_advertising(&self) -> bool {
      self.0.advertising.load(Ordering::Acquire)
   }
}
