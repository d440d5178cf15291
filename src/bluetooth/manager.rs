//! Adapter and discovery state machine.
//!
//! The [`DiscoveryManager`] tracks the daemon's adapters, reference-counts
//! discovery, classifies found devices, and owns the single published
//! service record. Daemon notifications and deferred operations are handled
//! one at a time on a manager task; discovery start/stop commands and their
//! confirmation waits run on a separate control task so they never stall it.

use std::{
   collections::{BTreeSet, HashMap, HashSet, hash_map::Entry},
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicI32, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{self, mpsc, oneshot},
   time::{self, Instant},
};

use crate::{
   bluetooth::{
      adapter::{Adapter, AdapterState, any_adapter_path},
      bluez::{
         AdapterProperty, AdapterSetting, BluezEvent, BluezProxy, DeviceProperty, DeviceProps,
      },
      dispatch::{AlarmId, DispatchOp, DispatchQueue},
      hci::{HciBackend, HciChannel, Role, SniffParams},
      node::{AdvertisedNode, BusAddress, INVALID_UUID_REV},
      sdp::{self, BUS_UUID_BASE, COD_BUS_CAPABLE, PROTOCOL_VERSION, ServiceRecord},
   },
   config::Config,
   error::{AccessorError, Result},
   event::{AccessorEvent, EventSender},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;
/// Poll interval while waiting for the adapter to confirm a discovery change
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Expected bounds of the discovery reference count
const DISCOVERY_REFCOUNT_MIN: i32 = -2;
const DISCOVERY_REFCOUNT_MAX: i32 = 1;

// === State ===

#[derive(Default)]
struct AdapterMap {
   adapters: HashMap<SmolStr, Adapter>,
   default: Option<Adapter>,
   /// Record pseudo-adapter derived from the default adapter's path
   any: Option<SmolStr>,
}

struct FoundEntry {
   uuid_rev: u32,
   expires: Instant,
}

#[derive(Default)]
struct FoundDevices {
   entries: HashMap<Address, FoundEntry>,
   expirations: BTreeSet<(Instant, Address)>,
}

#[derive(Default)]
struct Alarms {
   stop_discoverability: Option<AlarmId>,
   expire: Option<AlarmId>,
}

struct Shared {
   config: Config,
   bluez: Arc<dyn BluezProxy>,
   hci: Arc<dyn HciBackend>,
   event_tx: EventSender,
   dispatch: DispatchQueue,
   discovery_tx: mpsc::UnboundedSender<bool>,

   adapters: Mutex<AdapterMap>,
   found: Mutex<FoundDevices>,
   ignore: Mutex<HashSet<Address>>,
   created: Mutex<HashSet<SmolStr>>,
   alarms: Mutex<Alarms>,
   record: sync::Mutex<Option<u32>>,

   discovery_ctrl: AtomicI32,
   discoverable: AtomicBool,
   available: AtomicBool,
}

/// Snapshot of the manager state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStatus {
   pub adapters: Vec<SmolStr>,
   pub default_adapter: Option<SmolStr>,
   pub available: bool,
   pub discoverable: bool,
   pub discovery_refcount: i32,
   pub found_devices: usize,
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   GetStatus(oneshot::Sender<ManagerStatus>),
}

// === Handle ===

/// Discovery, discoverability and service-record control.
///
/// This type is cheaply cloneable. The manager task stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct DiscoveryManager {
   shared: Arc<Shared>,
   inbox: mpsc::Sender<ManagerCommand>,
}

/// Keeps discovery paused while alive.
#[must_use = "discovery resumes as soon as the pause is dropped"]
pub struct DiscoveryPause {
   shared: Arc<Shared>,
}

impl Drop for DiscoveryPause {
   fn drop(&mut self) {
      self.shared.adjust_discovery_refcount(1);
   }
}

impl DiscoveryManager {
   pub fn new(
      config: Config,
      bluez: Arc<dyn BluezProxy>,
      hci: Arc<dyn HciBackend>,
      event_tx: EventSender,
      events: mpsc::Receiver<BluezEvent>,
   ) -> Self {
      let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
      let shared = Arc::new(Shared {
         config,
         bluez,
         hci,
         event_tx,
         dispatch: DispatchQueue::new(),
         discovery_tx,
         adapters: Mutex::new(AdapterMap::default()),
         found: Mutex::new(FoundDevices::default()),
         ignore: Mutex::new(HashSet::new()),
         created: Mutex::new(HashSet::new()),
         alarms: Mutex::new(Alarms::default()),
         record: sync::Mutex::new(None),
         discovery_ctrl: AtomicI32::new(0),
         discoverable: AtomicBool::new(false),
         available: AtomicBool::new(false),
      });

      tokio::spawn(discovery_control_task(Arc::downgrade(&shared), discovery_rx));

      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(
         ManagerActor {
            shared: shared.clone(),
            command_rx,
            events,
         }
         .run(),
      );
      Self {
         shared,
         inbox: command_tx,
      }
   }

   pub fn config(&self) -> &Config {
      &self.shared.config
   }

   pub fn bluez(&self) -> &Arc<dyn BluezProxy> {
      &self.shared.bluez
   }

   pub async fn status(&self) -> Result<ManagerStatus> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::GetStatus(tx))
         .await
         .map_err(|_| AccessorError::ManagerShutdown)?;
      rx.await.map_err(|_| AccessorError::ManagerShutdown)
   }

   /// Whether a usable default adapter is present.
   pub fn is_available(&self) -> bool {
      self.shared.available.load(Ordering::Acquire)
   }

   pub fn default_adapter(&self) -> Option<Adapter> {
      self.shared.default_adapter()
   }

   pub fn adapter(&self, path: &str) -> Option<Adapter> {
      self.shared.adapter(path)
   }

   pub fn any_adapter_path(&self) -> Option<SmolStr> {
      self.shared.adapters.lock().any.clone()
   }

   /// Whether the default adapter supports extended inquiry response.
   pub fn is_eir_capable(&self) -> bool {
      self
         .default_adapter()
         .is_some_and(|adapter| adapter.is_eir_capable())
   }

   pub fn discovery_refcount(&self) -> i32 {
      self.shared.discovery_ctrl.load(Ordering::Acquire)
   }

   // === Discovery ===

   /// Starts (or keeps) discovering, ignoring `ignore` until the next call.
   /// A non-zero `duration` schedules the matching stop.
   pub fn start_discovery(&self, ignore: impl IntoIterator<Item = Address>, duration: Duration) {
      self.shared.start_discovery(ignore.into_iter().collect(), duration);
   }

   pub fn stop_discovery(&self) {
      self.shared.stop_discovery();
   }

   pub fn adjust_discovery_refcount(&self, delta: i32) {
      self.shared.adjust_discovery_refcount(delta);
   }

   /// Pauses discovery until the returned guard is dropped.
   pub fn pause_discovery(&self) -> DiscoveryPause {
      self.shared.adjust_discovery_refcount(-1);
      DiscoveryPause {
         shared: self.shared.clone(),
      }
   }

   // === Discoverability ===

   pub async fn start_discoverability(&self, duration: Duration) {
      self.shared.start_discoverability(duration).await;
   }

   pub async fn stop_discoverability(&self) {
      self.shared.stop_discoverability().await;
   }

   // === Service record ===

   /// Publishes the bus record, replacing any previous one. An invalid
   /// revision retracts it instead.
   pub async fn publish_service_record(
      &self,
      uuid_rev: u32,
      bus_addr: BusAddress,
      nodes: &[AdvertisedNode],
   ) -> Result<()> {
      if uuid_rev == INVALID_UUID_REV {
         return self.retract_service_record().await;
      }

      let record = ServiceRecord {
         uuid_rev,
         version: PROTOCOL_VERSION,
         bus_addr,
         nodes: nodes.to_vec(),
      };
      let xml = sdp::encode(&record, &BUS_UUID_BASE);
      let any = self
         .any_adapter_path()
         .ok_or(AccessorError::AdapterNotAvailable)?;

      let mut handle = self.shared.record.lock().await;
      if let Some(old) = *handle {
         debug!("{any}: removing old record {old:#x}");
         if let Err(e) = self.shared.bluez.remove_record(&any, old).await {
            warn!("{any}: failed to remove record {old:#x}: {e}");
            return Err(e);
         }
         *handle = None;
      }

      let new = self.shared.bluez.add_record(&any, &xml).await?;
      info!(
         "{any}: published record {new:#x} for {bus_addr}, uuid rev {uuid_rev:08x}, {} nodes",
         nodes.len()
      );
      *handle = Some(new);
      drop(handle);

      self.mark_bus_capable().await;
      Ok(())
   }

   pub async fn retract_service_record(&self) -> Result<()> {
      let mut handle = self.shared.record.lock().await;
      let Some(old) = *handle else {
         return Ok(());
      };
      let any = self
         .any_adapter_path()
         .ok_or(AccessorError::AdapterNotAvailable)?;
      if let Err(e) = self.shared.bluez.remove_record(&any, old).await {
         warn!("{any}: failed to retract record {old:#x}: {e}");
         return Err(e);
      }
      info!("{any}: retracted record {old:#x}");
      *handle = None;
      Ok(())
   }

   pub async fn record_handle(&self) -> Option<u32> {
      *self.shared.record.lock().await
   }

   async fn mark_bus_capable(&self) {
      let Some(adapter) = self.default_adapter() else {
         return;
      };
      let class = adapter.class();
      let cod = class | COD_BUS_CAPABLE;
      if cod == class {
         return;
      }
      let result = match self.default_hci() {
         Ok(hci) => hci.write_class_of_device(cod).await,
         Err(e) => Err(e),
      };
      match result {
         Ok(()) => {
            debug!("{}: class of device now {cod:06x}", adapter.path());
            adapter.set_class(cod);
         },
         Err(e) => warn!("{}: failed to write class of device: {e}", adapter.path()),
      }
   }

   // === Devices ===

   /// Object path of the daemon's device entry for `addr`, creating one on
   /// the default adapter if no adapter knows it yet.
   pub async fn device_object_path(&self, addr: Address) -> Result<SmolStr> {
      let adapters: Vec<Adapter> = self.shared.adapters.lock().adapters.values().cloned().collect();
      for adapter in &adapters {
         match self.shared.bluez.find_device(adapter.path(), addr).await {
            Ok(Some(path)) => return Ok(path),
            Ok(None) => {},
            Err(e) => warn!("{}: FindDevice({addr}) failed: {e}", adapter.path()),
         }
      }

      let adapter = self
         .default_adapter()
         .ok_or(AccessorError::AdapterNotAvailable)?;
      let path = self.shared.bluez.create_device(adapter.path(), addr).await?;
      debug!("{}: created device {path} for {addr}", adapter.path());
      self.shared.created.lock().insert(path.clone());
      Ok(path)
   }

   // === Link control ===

   fn default_hci(&self) -> Result<HciChannel> {
      let adapter = self
         .default_adapter()
         .ok_or(AccessorError::AdapterNotAvailable)?;
      adapter.hci(self.shared.hci.as_ref(), self.shared.config.hci_timeout())
   }

   pub async fn request_role(&self, addr: Address, role: Role) -> Result<()> {
      self.default_hci()?.request_role(addr, role).await
   }

   pub fn is_master(&self, addr: Address) -> Result<bool> {
      Ok(self.default_hci()?.acl_conn_info(addr)?.is_master())
   }

   pub async fn enter_sniff_mode(&self, addr: Address, params: &SniffParams) -> Result<()> {
      let hci = self.default_hci()?;
      let conn = hci.acl_conn_info(addr)?;
      hci.enter_sniff_mode(conn.handle, params).await
   }

   pub async fn exit_sniff_mode(&self, addr: Address) -> Result<()> {
      let hci = self.default_hci()?;
      let conn = hci.acl_conn_info(addr)?;
      hci.exit_sniff_mode(conn.handle).await
   }

   /// Whether the link to `addr` may be put into sniff mode.
   pub async fn sniff_allowed(&self, addr: Address) -> Result<bool> {
      let hci = self.default_hci()?;
      let conn = hci.acl_conn_info(addr)?;
      hci.sniff_allowed(conn.handle).await
   }
}

// === Shared state operations ===

impl Shared {
   fn default_adapter(&self) -> Option<Adapter> {
      self.adapters.lock().default.clone()
   }

   fn adapter(&self, path: &str) -> Option<Adapter> {
      self.adapters.lock().adapters.get(path).cloned()
   }

   fn is_default(&self, adapter: &Adapter) -> bool {
      self.adapters.lock().default.as_ref() == Some(adapter)
   }

   fn emit(&self, event: AccessorEvent) {
      self.event_tx.emit(event);
   }

   fn set_available(&self, available: bool) {
      if self.available.swap(available, Ordering::AcqRel) != available {
         info!("Bluetooth {}", if available { "available" } else { "unavailable" });
         self.emit(AccessorEvent::DeviceAvailable(available));
      }
   }

   fn status(&self) -> ManagerStatus {
      let (adapters, default_adapter) = {
         let map = self.adapters.lock();
         let mut adapters: Vec<SmolStr> = map.adapters.keys().cloned().collect();
         adapters.sort();
         (adapters, map.default.as_ref().map(|a| a.path().clone()))
      };
      ManagerStatus {
         adapters,
         default_adapter,
         available: self.available.load(Ordering::Acquire),
         discoverable: self.discoverable.load(Ordering::Acquire),
         discovery_refcount: self.discovery_ctrl.load(Ordering::Acquire),
         found_devices: self.found.lock().entries.len(),
      }
   }

   // --- discovery ---

   fn start_discovery(&self, ignore: HashSet<Address>, duration: Duration) {
      self
         .found
         .lock()
         .entries
         .retain(|addr, _| !ignore.contains(addr));
      *self.ignore.lock() = ignore;

      self.adjust_discovery_refcount(1);
      if !duration.is_zero() {
         self.dispatch.schedule_in(duration, DispatchOp::StopDiscovery);
      }
   }

   fn stop_discovery(&self) {
      self.adjust_discovery_refcount(-1);
      self.dispatch.dispatch_now(DispatchOp::FlushFoundDevices);
   }

   fn adjust_discovery_refcount(&self, delta: i32) {
      let prev = self.discovery_ctrl.fetch_add(delta, Ordering::AcqRel);
      let count = prev + delta;
      if !(DISCOVERY_REFCOUNT_MIN..=DISCOVERY_REFCOUNT_MAX).contains(&count) {
         warn!("Discovery ref count {count} out of range after adjusting by {delta}");
      }
      // Only crossings between 0 and 1 change what the adapter is doing.
      if count == 1 && prev < 1 {
         self.request_discovery(true);
      } else if count == 0 && prev > 0 {
         self.request_discovery(false);
      }
   }

   fn request_discovery(&self, start: bool) {
      if self.discovery_tx.send(start).is_err() {
         warn!("Discovery control task is gone, dropping request (start: {start})");
      }
   }

   /// Issues a start or stop and waits for the adapter's flag to follow.
   async fn discovery_control(&self, start: bool) {
      let Some(adapter) = self.default_adapter() else {
         debug!("No default adapter for discovery control (start: {start})");
         return;
      };
      let path = adapter.path().clone();
      let result = if start {
         self.bluez.start_discovery(&path).await
      } else {
         self.bluez.stop_discovery(&path).await
      };
      // Wait even after a failed call; the flag can still converge.
      if let Err(e) = result {
         warn!("{path}: {} discovery failed: {e}", if start { "starting" } else { "stopping" });
      }

      let deadline = Instant::now() + self.config.discovery_wait();
      let mut current = Some(adapter);
      while let Some(adapter) = current.take().filter(Adapter::is_valid) {
         if adapter.is_discovering() == start {
            debug!("{}: discovering = {start}", adapter.path());
            return;
         }
         if Instant::now() >= deadline {
            warn!("{}: discovering did not become {start}", adapter.path());
            return;
         }
         time::sleep(DISCOVERY_POLL_INTERVAL).await;
         current = self.default_adapter();
      }
   }

   // --- found devices ---

   fn device_found(&self, adapter: &str, addr: Address, props: &DeviceProps) {
      if self.ignore.lock().contains(&addr) {
         return;
      }

      let (candidate, eir, uuid_rev) = match &props.uuids {
         Some(uuids) => {
            let rev = sdp::find_bus_uuid_rev(uuids.iter().map(String::as_str), &BUS_UUID_BASE);
            (rev.is_some(), true, rev.unwrap_or(INVALID_UUID_REV))
         },
         None => (
            props.class.is_some_and(|class| class & COD_BUS_CAPABLE != 0),
            false,
            INVALID_UUID_REV,
         ),
      };
      let rssi = props.rssi.unwrap_or(0);
      if !candidate || rssi <= self.config.min_rssi {
         return;
      }

      let notify = {
         let mut found = self.found.lock();
         let FoundDevices {
            entries,
            expirations,
         } = &mut *found;
         let (entry, new) = match entries.entry(addr) {
            Entry::Occupied(e) => (e.into_mut(), false),
            Entry::Vacant(e) => {
               let expires = Instant::now() + self.config.device_expiry();
               expirations.insert((expires, addr));
               (
                  e.insert(FoundEntry {
                     uuid_rev: INVALID_UUID_REV,
                     expires,
                  }),
                  true,
               )
            },
         };

         let notify =
            eir && (new || (entry.uuid_rev != uuid_rev && uuid_rev != INVALID_UUID_REV));
         if notify {
            entry.uuid_rev = uuid_rev;
         }
         if new && let Some(&(earliest, _)) = expirations.first() {
            self.arm_expiry(earliest);
         }
         notify
      };

      if notify {
         info!("{addr}: bus device found on {adapter} (rssi {rssi}, uuid rev {uuid_rev:08x})");
         self.emit(AccessorEvent::DeviceChange {
            addr,
            uuid_rev,
            eir_capable: true,
         });
      } else {
         debug!("{addr}: seen on {adapter} (rssi {rssi}, eir {eir})");
      }
   }

   fn arm_expiry(&self, earliest: Instant) {
      let mut alarms = self.alarms.lock();
      if alarms.expire.is_some_and(|id| self.dispatch.is_pending(id)) {
         return;
      }
      alarms.expire = Some(self.dispatch.schedule_at(
         earliest + self.config.expiry_grace(),
         DispatchOp::ExpireFoundDevices,
      ));
   }

   /// Drops expired entries, or all of them, reporting any that were never
   /// classified.
   fn expire_found_devices(&self, all: bool) {
      let now = Instant::now();
      let mut unclassified = Vec::new();
      {
         let mut found = self.found.lock();
         while let Some(&(expires, addr)) = found.expirations.first() {
            if !all && expires > now {
               break;
            }
            found.expirations.pop_first();
            if let Entry::Occupied(entry) = found.entries.entry(addr)
               && entry.get().expires == expires
            {
               if entry.remove().uuid_rev == INVALID_UUID_REV {
                  unclassified.push(addr);
               }
            }
         }
         if let Some(&(earliest, _)) = found.expirations.first() {
            self.arm_expiry(earliest);
         }
      }

      for addr in unclassified {
         debug!("{addr}: expired without classification");
         self.emit(AccessorEvent::DeviceChange {
            addr,
            uuid_rev: INVALID_UUID_REV,
            eir_capable: false,
         });
      }
   }

   // --- discoverability ---

   async fn start_discoverability(&self, duration: Duration) {
      self.discoverable.store(true, Ordering::Release);
      if !self.available.load(Ordering::Acquire) {
         return;
      }
      self.set_discoverable_all(true).await;

      let mut alarms = self.alarms.lock();
      if let Some(old) = alarms.stop_discoverability.take() {
         self.dispatch.cancel(old);
      }
      if !duration.is_zero() {
         alarms.stop_discoverability =
            Some(self.dispatch.schedule_in(duration, DispatchOp::StopDiscoverability));
      }
   }

   async fn stop_discoverability(&self) {
      self.discoverable.store(false, Ordering::Release);
      if let Some(old) = self.alarms.lock().stop_discoverability.take() {
         self.dispatch.cancel(old);
      }
      if self.available.load(Ordering::Acquire) {
         self.set_discoverable_all(false).await;
      }
   }

   async fn set_discoverable_all(&self, discoverable: bool) {
      let adapters: Vec<Adapter> = self.adapters.lock().adapters.values().cloned().collect();
      for adapter in adapters {
         self.set_discoverable(&adapter, discoverable).await;
      }
   }

   async fn set_discoverable(&self, adapter: &Adapter, discoverable: bool) {
      if let Err(e) = self
         .bluez
         .set_adapter_property(adapter.path(), AdapterSetting::Discoverable(discoverable))
         .await
      {
         warn!("{}: failed to set Discoverable={discoverable}: {e}", adapter.path());
      }
   }

   // --- adapters ---

   async fn enumerate_adapters(self: &Arc<Self>) {
      match self.bluez.list_adapters().await {
         Ok(paths) => {
            for path in paths {
               self.adapter_added(path).await;
            }
         },
         Err(e) => {
            warn!("Failed to list adapters: {e}");
            return;
         },
      }
      match self.bluez.default_adapter().await {
         Ok(path) => self.default_adapter_changed(&path),
         Err(e) => info!("No default adapter: {e}"),
      }
   }

   async fn adapter_added(self: &Arc<Self>, path: SmolStr) {
      if self.adapter(&path).is_some() {
         error!("{path}: adapter already exists");
         return;
      }

      let adapter = Adapter::new(path.clone());
      adapter.set_state(AdapterState::Initializing);
      let props = match self.bluez.adapter_properties(&path).await {
         Ok(props) => props,
         Err(e) => {
            warn!("{path}: failed to initialize adapter: {e}");
            adapter.invalidate();
            return;
         },
      };
      adapter.set_address(props.address);
      adapter.set_class(props.class);
      adapter.set_discovering(props.discovering);
      adapter.set_powered(props.powered);
      info!("{path}: adapter {} added (powered: {})", props.address, props.powered);
      self.adapters.lock().adapters.insert(path, adapter.clone());

      if props.powered {
         self.spawn_eir_query(adapter);
      } else {
         adapter.mark_ready();
      }
   }

   /// Queries EIR support off the manager task, then marks the adapter ready.
   fn spawn_eir_query(self: &Arc<Self>, adapter: Adapter) {
      let shared = self.clone();
      tokio::spawn(async move {
         let result = match adapter.hci(shared.hci.as_ref(), shared.config.hci_timeout()) {
            Ok(hci) => hci.is_eir_capable().await,
            Err(e) => Err(e),
         };
         match result {
            Ok(eir) => adapter.set_eir_capable(eir),
            Err(e) => warn!("{}: EIR capability query failed: {e}", adapter.path()),
         }
         if adapter.mark_ready() {
            debug!("{}: ready (eir: {})", adapter.path(), adapter.is_eir_capable());
         }
      });
   }

   fn adapter_removed(&self, path: &str) {
      let (adapter, was_default) = {
         let mut map = self.adapters.lock();
         let Some(adapter) = map.adapters.remove(path) else {
            debug!("{path}: removal of unknown adapter");
            return;
         };
         let was_default = map.default.as_ref() == Some(&adapter);
         if was_default {
            map.default = None;
            map.any = None;
         }
         (adapter, was_default)
      };
      adapter.invalidate();
      info!("{path}: adapter removed");
      if was_default {
         self.set_available(false);
      }
   }

   fn default_adapter_changed(self: &Arc<Self>, path: &str) {
      let adapter = {
         let mut map = self.adapters.lock();
         let adapter = map.adapters.get(path).cloned();
         map.any = adapter.as_ref().map(|a| any_adapter_path(a.path()));
         map.default.clone_from(&adapter);
         adapter
      };
      let Some(adapter) = adapter else {
         warn!("{path}: default adapter is not a known adapter");
         return;
      };

      info!("{path}: default adapter");
      if adapter.is_powered() {
         self.spawn_radio_setup(adapter);
      }
      self.set_available(true);
      if self.discovery_ctrl.load(Ordering::Acquire) == 1 {
         self.request_discovery(true);
      }
   }

   /// Refreshes EIR capability and applies the inquiry scan settings,
   /// off the manager task.
   fn spawn_radio_setup(self: &Arc<Self>, adapter: Adapter) {
      let shared = self.clone();
      tokio::spawn(async move {
         if let Err(e) = shared.radio_setup(&adapter).await {
            warn!("{}: radio setup failed: {e}", adapter.path());
         }
      });
   }

   async fn radio_setup(&self, adapter: &Adapter) -> Result<()> {
      let hci = adapter.hci(self.hci.as_ref(), self.config.hci_timeout())?;
      adapter.set_eir_capable(hci.is_eir_capable().await?);
      let inquiry = &self.config.inquiry;
      hci.configure_inquiry_scan(
         inquiry.window_ms,
         inquiry.interval_ms,
         inquiry.interlaced,
         inquiry.tx_power,
      )
      .await
   }

   async fn adapter_property_changed(self: &Arc<Self>, path: &str, prop: AdapterProperty) {
      let Some(adapter) = self.adapter(path) else {
         debug!("{path}: property change on unknown adapter: {prop:?}");
         return;
      };
      match prop {
         AdapterProperty::Discoverable(false) if self.discoverable.load(Ordering::Acquire) => {
            info!("{path}: daemon cleared Discoverable, re-asserting");
            self.set_discoverable(&adapter, true).await;
         },
         AdapterProperty::Discoverable(_) => {},
         AdapterProperty::Discovering(discovering) => {
            debug!("{path}: Discovering = {discovering}");
            adapter.set_discovering(discovering);
         },
         AdapterProperty::Powered(powered) => {
            info!("{path}: Powered = {powered}");
            adapter.set_powered(powered);
            if powered {
               self.spawn_radio_setup(adapter.clone());
            }
            if self.is_default(&adapter) {
               self.set_available(powered);
            }
         },
         AdapterProperty::Other(name) => debug!("{path}: {name} changed"),
      }
   }

   async fn device_property_changed(&self, path: &str, prop: DeviceProperty) {
      if prop != DeviceProperty::Connected(false) || !self.created.lock().remove(path) {
         return;
      }
      let Some(adapter) = self.default_adapter() else {
         return;
      };
      debug!("{path}: disconnected, removing device we created");
      if let Err(e) = self.bluez.remove_device(adapter.path(), path).await {
         warn!("{}: failed to remove device {path}: {e}", adapter.path());
      }
   }

   async fn daemon_lost(&self) {
      warn!("Bluetooth daemon left the bus");
      // The daemon dropped its records along with its connection.
      *self.record.lock().await = None;
      self.discoverable.store(false, Ordering::Release);
      if let Some(old) = self.alarms.lock().stop_discoverability.take() {
         self.dispatch.cancel(old);
      }

      let adapters: Vec<Adapter> = {
         let mut map = self.adapters.lock();
         map.default = None;
         map.any = None;
         map.adapters.drain().map(|(_, adapter)| adapter).collect()
      };
      for adapter in adapters {
         adapter.invalidate();
      }
      self.created.lock().clear();
      self.set_available(false);
   }

   // --- dispatch ---

   async fn handle_event(self: &Arc<Self>, event: BluezEvent) {
      match event {
         BluezEvent::AdapterAdded(path) => self.adapter_added(path).await,
         BluezEvent::AdapterRemoved(path) => self.adapter_removed(&path),
         BluezEvent::DefaultAdapterChanged(path) => self.default_adapter_changed(&path),
         BluezEvent::DeviceFound {
            adapter,
            addr,
            props,
         } => self.device_found(&adapter, addr, &props),
         BluezEvent::DeviceCreated { adapter, device } => {
            debug!("{adapter}: device created: {device}");
         },
         BluezEvent::DeviceRemoved { adapter, device } => {
            debug!("{adapter}: device removed: {device}");
            self.created.lock().remove(&device);
         },
         BluezEvent::AdapterPropertyChanged { path, prop } => {
            self.adapter_property_changed(&path, prop).await;
         },
         BluezEvent::DevicePropertyChanged { path, prop } => {
            self.device_property_changed(&path, prop).await;
         },
         BluezEvent::DaemonLost => self.daemon_lost().await,
         BluezEvent::DaemonAppeared => {
            info!("Bluetooth daemon appeared");
            self.enumerate_adapters().await;
         },
      }
   }

   async fn handle_op(&self, op: DispatchOp) {
      debug!("Dispatching {op:?}");
      match op {
         DispatchOp::StopDiscovery => self.stop_discovery(),
         DispatchOp::StopDiscoverability => self.stop_discoverability().await,
         DispatchOp::ExpireFoundDevices => self.expire_found_devices(false),
         DispatchOp::FlushFoundDevices => self.expire_found_devices(true),
      }
   }
}

async fn discovery_control_task(shared: Weak<Shared>, mut requests: mpsc::UnboundedReceiver<bool>) {
   while let Some(start) = requests.recv().await {
      let Some(shared) = shared.upgrade() else {
         break;
      };
      shared.discovery_control(start).await;
   }
   debug!("Discovery control task stopped");
}

// === Manager Actor ===

struct ManagerActor {
   shared: Arc<Shared>,
   command_rx: mpsc::Receiver<ManagerCommand>,
   events: mpsc::Receiver<BluezEvent>,
}

impl ManagerActor {
   async fn run(mut self) {
      info!("Discovery manager starting up");
      self.shared.enumerate_adapters().await;

      loop {
         select! {
             biased;
             Some(event) = self.events.recv() => {
                 self.shared.handle_event(event).await;
             }
             op = self.shared.dispatch.next() => {
                 self.shared.handle_op(op).await;
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Discovery manager shutting down");
                     break;
                 };
                 self.handle_command(cmd);
             }
         }
      }
   }

   fn handle_command(&self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::GetStatus(reply) => {
            let _ = reply.send(self.shared.status());
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      bluetooth::{
         bluez::testing::FakeBluez,
         hci::{OP_SNIFF_MODE, OP_WRITE_CLASS_OF_DEVICE, OP_WRITE_INQUIRY_SCAN_ACTIVITY, testing::AckingHci},
      },
      event::EventProcessor,
   };

   const HCI0: &str = "/org/bluez/100/hci0";
   const HCI1: &str = "/org/bluez/100/hci1";
   const LOCAL: Address = Address([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x13]);
   const PEER: Address = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

   struct Harness {
      manager: DiscoveryManager,
      bluez: Arc<FakeBluez>,
      hci: Arc<AckingHci>,
      events: Arc<EventProcessor>,
   }

   impl Harness {
      async fn new() -> Self {
         let (bluez, rx) = FakeBluez::new();
         bluez.add_adapter(HCI0, LOCAL);
         let hci = AckingHci::new(true);
         let events = EventProcessor::new();
         let manager =
            DiscoveryManager::new(Config::default(), bluez.clone(), hci.clone(), events.clone(), rx);
         settle().await;
         Self {
            manager,
            bluez,
            hci,
            events,
         }
      }

      fn drain(&self) -> Vec<AccessorEvent> {
         std::iter::from_fn(|| self.events.try_recv()).collect()
      }

      async fn found(&self, addr: Address, props: DeviceProps) {
         self
            .bluez
            .emit(BluezEvent::DeviceFound {
               adapter: HCI0.into(),
               addr,
               props,
            })
            .await;
      }
   }

   async fn settle() {
      time::sleep(Duration::from_secs(1)).await;
   }

   fn eir_props(uuid_rev: u32, rssi: i16) -> DeviceProps {
      DeviceProps {
         uuids: Some(vec![
            "0000110b-0000-1000-8000-00805f9b34fb".to_owned(),
            sdp::bus_uuid(uuid_rev, &BUS_UUID_BASE).to_string(),
         ]),
         rssi: Some(rssi),
         ..Default::default()
      }
   }

   fn class_props(class: u32, rssi: i16) -> DeviceProps {
      DeviceProps {
         class: Some(class),
         rssi: Some(rssi),
         ..Default::default()
      }
   }

   fn change(addr: Address, uuid_rev: u32, eir_capable: bool) -> AccessorEvent {
      AccessorEvent::DeviceChange {
         addr,
         uuid_rev,
         eir_capable,
      }
   }

   #[tokio::test(start_paused = true)]
   async fn test_startup_selects_default_adapter() {
      let h = Harness::new().await;

      assert_eq!(h.drain(), vec![AccessorEvent::DeviceAvailable(true)]);
      let status = h.manager.status().await.unwrap();
      assert_eq!(status.adapters, vec![SmolStr::new(HCI0)]);
      assert_eq!(status.default_adapter.as_deref(), Some(HCI0));
      assert!(status.available);

      let adapter = h.manager.default_adapter().unwrap();
      assert_eq!(adapter.address(), LOCAL);
      assert_eq!(adapter.state(), AdapterState::Ready);
      assert!(h.manager.is_eir_capable());
      assert_eq!(h.manager.any_adapter_path().as_deref(), Some("/org/bluez/100/any"));
      assert!(h.hci.opcodes().contains(&OP_WRITE_INQUIRY_SCAN_ACTIVITY));
   }

   #[tokio::test(start_paused = true)]
   async fn test_discovery_commands_follow_refcount_crossings() {
      let h = Harness::new().await;

      h.manager.start_discovery([], Duration::ZERO);
      settle().await;
      assert_eq!(h.bluez.count("start_discovery"), 1);
      assert!(h.manager.default_adapter().unwrap().is_discovering());

      {
         let _pause = h.manager.pause_discovery();
         assert_eq!(h.manager.discovery_refcount(), 0);
         settle().await;
         assert_eq!(h.bluez.count("stop_discovery"), 1);
         assert!(!h.manager.default_adapter().unwrap().is_discovering());
      }
      assert_eq!(h.manager.discovery_refcount(), 1);
      settle().await;
      assert_eq!(h.bluez.count("start_discovery"), 2);

      h.manager.stop_discovery();
      settle().await;
      assert_eq!(h.manager.discovery_refcount(), 0);
      let calls: Vec<String> = h
         .bluez
         .calls()
         .into_iter()
         .filter(|c| c.contains("discovery"))
         .collect();
      assert_eq!(
         calls,
         [
            "start_discovery /org/bluez/100/hci0",
            "stop_discovery /org/bluez/100/hci0",
            "start_discovery /org/bluez/100/hci0",
            "stop_discovery /org/bluez/100/hci0",
         ]
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_concurrent_pauses_issue_one_stop() {
      let h = Harness::new().await;
      h.manager.start_discovery([], Duration::ZERO);
      settle().await;

      let mut tasks = Vec::new();
      for _ in 0..2 {
         let manager = h.manager.clone();
         tasks.push(tokio::spawn(async move {
            let pause = manager.pause_discovery();
            time::sleep(Duration::from_secs(2)).await;
            drop(pause);
         }));
      }
      for task in tasks {
         task.await.unwrap();
      }
      settle().await;

      assert_eq!(h.manager.discovery_refcount(), 1);
      assert_eq!(h.bluez.count("stop_discovery"), 1);
      assert_eq!(h.bluez.count("start_discovery"), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_discovery_duration_schedules_stop() {
      let h = Harness::new().await;
      h.manager.start_discovery([], Duration::from_secs(30));
      settle().await;
      assert_eq!(h.bluez.count("stop_discovery"), 0);

      time::sleep(Duration::from_secs(30)).await;
      assert_eq!(h.manager.discovery_refcount(), 0);
      assert_eq!(h.bluez.count("stop_discovery"), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_failed_discovery_call_still_waits_for_flag() {
      let h = Harness::new().await;
      h.bluez.fail_discovery.store(true, Ordering::Relaxed);

      h.manager.start_discovery([], Duration::ZERO);
      settle().await;
      assert_eq!(h.bluez.count("start_discovery"), 1);

      h.manager.stop_discovery();
      settle().await;
      assert_eq!(h.bluez.count("stop_discovery"), 0);

      time::sleep(Duration::from_secs(10)).await;
      assert_eq!(h.bluez.count("stop_discovery"), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_silent_radio_does_not_delay_alarms() {
      let h = Harness::new().await;
      h.hci.silent.lock().push(1);
      h.bluez.add_adapter(HCI1, PEER);

      h.manager.start_discoverability(Duration::from_secs(2)).await;
      h.bluez.emit(BluezEvent::AdapterAdded(HCI1.into())).await;
      time::sleep(Duration::from_millis(2500)).await;

      let adapter = h.manager.adapter(HCI1).unwrap();
      assert_eq!(adapter.state(), AdapterState::Initializing);
      let cleared = h
         .bluez
         .calls()
         .iter()
         .filter(|c| c.starts_with("set_discoverable") && c.ends_with(" false"))
         .count();
      assert_eq!(cleared, 2);

      time::sleep(Duration::from_secs(10)).await;
      assert_eq!(adapter.state(), AdapterState::Ready);
      assert!(!adapter.is_eir_capable());
   }

   #[tokio::test(start_paused = true)]
   async fn test_eir_device_reported_once_per_revision() {
      let h = Harness::new().await;
      h.drain();

      h.found(PEER, eir_props(0x1234, -50)).await;
      h.found(PEER, eir_props(0x1234, -55)).await;
      settle().await;
      assert_eq!(h.drain(), vec![change(PEER, 0x1234, true)]);

      h.found(PEER, eir_props(0x1235, -50)).await;
      settle().await;
      assert_eq!(h.drain(), vec![change(PEER, 0x1235, true)]);

      time::sleep(Duration::from_secs(25)).await;
      assert!(h.drain().is_empty());
      assert_eq!(h.manager.status().await.unwrap().found_devices, 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_class_only_device_reported_at_expiry() {
      let h = Harness::new().await;
      h.drain();

      h.found(PEER, class_props(COD_BUS_CAPABLE | 0x020c, -60)).await;
      settle().await;
      assert!(h.drain().is_empty());
      assert_eq!(h.manager.status().await.unwrap().found_devices, 1);

      time::sleep(Duration::from_secs(20)).await;
      assert_eq!(h.drain(), vec![change(PEER, INVALID_UUID_REV, false)]);
      assert_eq!(h.manager.status().await.unwrap().found_devices, 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_late_eir_classifies_cached_device() {
      let h = Harness::new().await;
      h.drain();

      h.found(PEER, class_props(COD_BUS_CAPABLE, -60)).await;
      h.found(PEER, eir_props(0x42, -60)).await;
      settle().await;
      assert_eq!(h.drain(), vec![change(PEER, 0x42, true)]);

      time::sleep(Duration::from_secs(25)).await;
      assert!(h.drain().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_unqualified_devices_are_ignored() {
      let h = Harness::new().await;
      h.drain();

      h.found(PEER, eir_props(0x1234, -80)).await;
      h.found(PEER, class_props(0x020c, -40)).await;
      let other = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x66]);
      h.found(
         other,
         DeviceProps {
            uuids: Some(vec!["0000110b-0000-1000-8000-00805f9b34fb".to_owned()]),
            rssi: Some(-40),
            ..Default::default()
         },
      )
      .await;
      settle().await;

      assert!(h.drain().is_empty());
      assert_eq!(h.manager.status().await.unwrap().found_devices, 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_ignore_list_drops_cached_and_new_reports() {
      let h = Harness::new().await;
      h.drain();

      h.found(PEER, class_props(COD_BUS_CAPABLE, -60)).await;
      settle().await;
      assert_eq!(h.manager.status().await.unwrap().found_devices, 1);

      h.manager.start_discovery([PEER], Duration::ZERO);
      h.found(PEER, eir_props(0x1234, -50)).await;
      settle().await;
      assert_eq!(h.manager.status().await.unwrap().found_devices, 0);

      time::sleep(Duration::from_secs(25)).await;
      assert!(h.drain().is_empty());
   }

   #[tokio::test(start_paused = true)]
   async fn test_stop_discovery_flushes_unclassified() {
      let h = Harness::new().await;
      h.manager.start_discovery([], Duration::ZERO);
      h.found(PEER, class_props(COD_BUS_CAPABLE, -60)).await;
      settle().await;
      h.drain();

      h.manager.stop_discovery();
      settle().await;
      assert_eq!(h.drain(), vec![change(PEER, INVALID_UUID_REV, false)]);
      assert_eq!(h.manager.status().await.unwrap().found_devices, 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_discoverability_is_reasserted_until_stopped() {
      let h = Harness::new().await;
      let cleared = || BluezEvent::AdapterPropertyChanged {
         path: HCI0.into(),
         prop: AdapterProperty::Discoverable(false),
      };

      h.manager.start_discoverability(Duration::from_secs(60)).await;
      assert_eq!(h.bluez.calls().last().unwrap(), "set_discoverable /org/bluez/100/hci0 true");

      h.bluez.emit(cleared()).await;
      settle().await;
      assert_eq!(h.bluez.count("set_discoverable"), 2);

      time::sleep(Duration::from_secs(60)).await;
      assert_eq!(h.bluez.calls().last().unwrap(), "set_discoverable /org/bluez/100/hci0 false");
      assert!(!h.manager.status().await.unwrap().discoverable);

      h.bluez.emit(cleared()).await;
      settle().await;
      assert_eq!(h.bluez.count("set_discoverable"), 3);
   }

   #[tokio::test(start_paused = true)]
   async fn test_discoverability_restart_supersedes_stop() {
      let h = Harness::new().await;
      h.manager.start_discoverability(Duration::from_secs(60)).await;
      time::sleep(Duration::from_secs(10)).await;
      h.manager.start_discoverability(Duration::from_secs(120)).await;

      time::sleep(Duration::from_secs(60)).await;
      assert_eq!(h.bluez.count("set_discoverable"), 2);
      assert!(h.manager.status().await.unwrap().discoverable);

      time::sleep(Duration::from_secs(70)).await;
      assert_eq!(h.bluez.count("set_discoverable"), 3);
      assert!(!h.manager.status().await.unwrap().discoverable);
   }

   #[tokio::test(start_paused = true)]
   async fn test_publish_replaces_and_retracts_record() {
      let h = Harness::new().await;
      let bus_addr = BusAddress::new(LOCAL, 0x1001);
      let nodes = [AdvertisedNode::new("0123456789abcdef0123456789abcdef", bus_addr).with_name("org.example.svc")];

      h.manager.publish_service_record(0x1234, bus_addr, &nodes).await.unwrap();
      assert_eq!(h.manager.record_handle().await, Some(0x10000));
      assert_eq!(h.bluez.calls().last().unwrap(), "add_record /org/bluez/100/any");
      assert!(h.hci.opcodes().contains(&OP_WRITE_CLASS_OF_DEVICE));
      assert_ne!(h.manager.default_adapter().unwrap().class() & COD_BUS_CAPABLE, 0);

      h.manager.publish_service_record(0x1235, bus_addr, &nodes).await.unwrap();
      assert_eq!(h.manager.record_handle().await, Some(0x10001));
      assert!(h.bluez.calls().contains(&"remove_record /org/bluez/100/any 0x10000".to_owned()));

      h.bluez.fail_remove_record.store(true, Ordering::Relaxed);
      assert!(h.manager.publish_service_record(0x1236, bus_addr, &nodes).await.is_err());
      assert_eq!(h.manager.record_handle().await, Some(0x10001));
      assert!(h.manager.retract_service_record().await.is_err());
      assert_eq!(h.manager.record_handle().await, Some(0x10001));

      h.bluez.fail_remove_record.store(false, Ordering::Relaxed);
      h.manager.publish_service_record(INVALID_UUID_REV, bus_addr, &[]).await.unwrap();
      assert_eq!(h.manager.record_handle().await, None);
      assert_eq!(h.bluez.count("add_record"), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_removing_default_adapter_reports_unavailable() {
      let h = Harness::new().await;
      h.drain();
      let adapter = h.manager.default_adapter().unwrap();

      h.bluez.emit(BluezEvent::AdapterRemoved(HCI0.into())).await;
      settle().await;

      assert_eq!(h.drain(), vec![AccessorEvent::DeviceAvailable(false)]);
      assert!(!adapter.is_valid());
      assert!(h.manager.default_adapter().is_none());
      assert!(h.manager.any_adapter_path().is_none());
   }

   #[tokio::test(start_paused = true)]
   async fn test_duplicate_adapter_added_is_ignored() {
      let h = Harness::new().await;
      let adapter = h.manager.default_adapter().unwrap();
      h.bluez.add_adapter(HCI1, Address([0x00, 0x1a, 0x7d, 0xda, 0x71, 0x14]));

      h.bluez.emit(BluezEvent::AdapterAdded(HCI0.into())).await;
      h.bluez.emit(BluezEvent::AdapterAdded(HCI1.into())).await;
      settle().await;

      let status = h.manager.status().await.unwrap();
      assert_eq!(status.adapters, vec![SmolStr::new(HCI0), SmolStr::new(HCI1)]);
      assert_eq!(h.manager.default_adapter(), Some(adapter));
   }

   #[tokio::test(start_paused = true)]
   async fn test_powered_change_follows_default_adapter() {
      let h = Harness::new().await;
      h.drain();

      let powered = |on| BluezEvent::AdapterPropertyChanged {
         path: HCI0.into(),
         prop: AdapterProperty::Powered(on),
      };
      h.bluez.emit(powered(false)).await;
      settle().await;
      assert_eq!(h.drain(), vec![AccessorEvent::DeviceAvailable(false)]);
      assert!(!h.manager.default_adapter().unwrap().is_powered());

      h.bluez.emit(powered(true)).await;
      settle().await;
      assert_eq!(h.drain(), vec![AccessorEvent::DeviceAvailable(true)]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_daemon_loss_and_return() {
      let h = Harness::new().await;
      let bus_addr = BusAddress::new(LOCAL, 0x1001);
      h.manager.publish_service_record(0x1234, bus_addr, &[]).await.unwrap();
      h.manager.start_discoverability(Duration::ZERO).await;
      h.drain();
      let adapter = h.manager.default_adapter().unwrap();

      h.bluez.emit(BluezEvent::DaemonLost).await;
      settle().await;
      assert_eq!(h.drain(), vec![AccessorEvent::DeviceAvailable(false)]);
      assert!(!adapter.is_valid());
      assert_eq!(h.manager.record_handle().await, None);
      let status = h.manager.status().await.unwrap();
      assert!(status.adapters.is_empty());
      assert!(!status.discoverable);

      h.bluez.emit(BluezEvent::DaemonAppeared).await;
      settle().await;
      assert_eq!(h.drain(), vec![AccessorEvent::DeviceAvailable(true)]);
      assert_ne!(h.manager.default_adapter(), Some(adapter));
   }

   #[tokio::test(start_paused = true)]
   async fn test_created_device_removed_on_disconnect() {
      let h = Harness::new().await;

      let path = h.manager.device_object_path(PEER).await.unwrap();
      assert_eq!(path, "/org/bluez/100/hci0/dev_00_11_22_33_44_55");
      assert_eq!(h.bluez.count("create_device"), 1);
      assert_eq!(h.manager.device_object_path(PEER).await.unwrap(), path);
      assert_eq!(h.bluez.count("create_device"), 1);

      let disconnected = || BluezEvent::DevicePropertyChanged {
         path: path.clone(),
         prop: DeviceProperty::Connected(false),
      };
      h.bluez.emit(disconnected()).await;
      h.bluez.emit(disconnected()).await;
      settle().await;
      assert_eq!(h.bluez.count("remove_device"), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_link_control_uses_connection_handle() {
      let h = Harness::new().await;
      assert!(h.manager.is_master(PEER).unwrap());

      let params = SniffParams {
         min_interval: 0x10,
         max_interval: 0x20,
         attempt: 1,
         timeout: 0,
      };
      h.manager.enter_sniff_mode(PEER, &params).await.unwrap();
      let sent = h.hci.sent.lock().last().cloned().unwrap();
      assert_eq!(u16::from_le_bytes([sent[1], sent[2]]), OP_SNIFF_MODE);
      assert_eq!(&sent[4..6], &0x0042u16.to_le_bytes());
   }
}
