//! BlueZ daemon access.
//!
//! [`BluezProxy`] is the request side used by the manager and accessor;
//! [`BluezEvent`] is the notification side, delivered through one channel.
//! [`ZbusBluez`] implements both against the BlueZ 4 D-Bus API on the system
//! bus.

use std::{collections::HashMap, future::Future, str::FromStr, time::Duration};

use async_trait::async_trait;
use bluer::Address;
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use smol_str::SmolStr;
use tokio::{sync::mpsc, time};
use zbus::{
   Connection, MatchRule, Message, MessageStream, message, proxy,
   zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value},
};

use crate::{
   config::Config,
   error::{AccessorError, Result},
};

const BLUEZ_SERVICE: &str = "org.bluez";
const EVENT_BUFFER_SIZE: usize = 256;

/// Properties read when an adapter is initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterProps {
   pub address: Address,
   pub class: u32,
   pub powered: bool,
   pub discovering: bool,
}

/// Attributes carried by a device-found notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProps {
   /// Service UUIDs from the extended inquiry response, when present.
   pub uuids: Option<Vec<String>>,
   pub class: Option<u32>,
   pub rssi: Option<i16>,
   pub name: Option<String>,
   pub icon: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
enum PropertyName {
   Address,
   Class,
   Connected,
   Discoverable,
   Discovering,
   Icon,
   Name,
   Powered,
   #[strum(serialize = "RSSI")]
   Rssi,
   #[strum(serialize = "UUIDs")]
   Uuids,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterProperty {
   Discoverable(bool),
   Discovering(bool),
   Powered(bool),
   Other(SmolStr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceProperty {
   Connected(bool),
   Other(SmolStr),
}

/// Settable adapter properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterSetting {
   Discoverable(bool),
}

/// Asynchronous notifications from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluezEvent {
   AdapterAdded(SmolStr),
   AdapterRemoved(SmolStr),
   DefaultAdapterChanged(SmolStr),
   DeviceFound {
      adapter: SmolStr,
      addr: Address,
      props: DeviceProps,
   },
   DeviceCreated {
      adapter: SmolStr,
      device: SmolStr,
   },
   DeviceRemoved {
      adapter: SmolStr,
      device: SmolStr,
   },
   AdapterPropertyChanged {
      path: SmolStr,
      prop: AdapterProperty,
   },
   DevicePropertyChanged {
      path: SmolStr,
      prop: DeviceProperty,
   },
   /// The daemon dropped off the bus.
   DaemonLost,
   /// The daemon (re)acquired its bus name.
   DaemonAppeared,
}

/// Requests to the Bluetooth daemon. Every call is time-bounded.
#[async_trait]
pub trait BluezProxy: Send + Sync {
   async fn list_adapters(&self) -> Result<Vec<SmolStr>>;
   async fn default_adapter(&self) -> Result<SmolStr>;
   async fn adapter_properties(&self, adapter: &str) -> Result<AdapterProps>;
   async fn set_adapter_property(&self, adapter: &str, setting: AdapterSetting) -> Result<()>;
   async fn start_discovery(&self, adapter: &str) -> Result<()>;
   async fn stop_discovery(&self, adapter: &str) -> Result<()>;
   /// Object path of an existing device, `None` if the adapter has none.
   async fn find_device(&self, adapter: &str, addr: Address) -> Result<Option<SmolStr>>;
   async fn create_device(&self, adapter: &str, addr: Address) -> Result<SmolStr>;
   async fn remove_device(&self, adapter: &str, device: &str) -> Result<()>;
   /// Remote SDP records as handle and XML pairs.
   async fn discover_services(&self, device: &str, pattern: &str) -> Result<Vec<(u32, String)>>;
   async fn add_record(&self, adapter: &str, xml: &str) -> Result<u32>;
   async fn remove_record(&self, adapter: &str, handle: u32) -> Result<()>;
}

#[proxy(
   interface = "org.bluez.Manager",
   default_service = "org.bluez",
   default_path = "/"
)]
trait BluezManager {
   fn list_adapters(&self) -> zbus::Result<Vec<OwnedObjectPath>>;
   fn default_adapter(&self) -> zbus::Result<OwnedObjectPath>;
}

#[proxy(interface = "org.bluez.Adapter", default_service = "org.bluez")]
trait BluezAdapter {
   fn get_properties(&self) -> zbus::Result<HashMap<String, OwnedValue>>;
   fn set_property(&self, name: &str, value: &Value<'_>) -> zbus::Result<()>;
   fn start_discovery(&self) -> zbus::Result<()>;
   fn stop_discovery(&self) -> zbus::Result<()>;
   fn find_device(&self, address: &str) -> zbus::Result<OwnedObjectPath>;
   fn create_device(&self, address: &str) -> zbus::Result<OwnedObjectPath>;
   fn remove_device(&self, device: &ObjectPath<'_>) -> zbus::Result<()>;
}

#[proxy(interface = "org.bluez.Service", default_service = "org.bluez")]
trait BluezService {
   fn add_record(&self, record: &str) -> zbus::Result<u32>;
   fn remove_record(&self, handle: u32) -> zbus::Result<()>;
}

#[proxy(interface = "org.bluez.Device", default_service = "org.bluez")]
trait BluezDevice {
   fn discover_services(&self, pattern: &str) -> zbus::Result<HashMap<u32, String>>;
}

fn as_bool(value: &Value<'_>) -> Option<bool> {
   match value {
      Value::Bool(b) => Some(*b),
      Value::Value(inner) => as_bool(inner),
      _ => None,
   }
}

fn as_u32(value: &Value<'_>) -> Option<u32> {
   match value {
      Value::U32(v) => Some(*v),
      Value::Value(inner) => as_u32(inner),
      _ => None,
   }
}

fn as_i16(value: &Value<'_>) -> Option<i16> {
   match value {
      Value::I16(v) => Some(*v),
      Value::Value(inner) => as_i16(inner),
      _ => None,
   }
}

fn as_string(value: &Value<'_>) -> Option<String> {
   match value {
      Value::Str(s) => Some(s.as_str().to_owned()),
      Value::Value(inner) => as_string(inner),
      _ => None,
   }
}

fn as_strings(value: &Value<'_>) -> Option<Vec<String>> {
   match value {
      Value::Array(array) => Some(array.iter().filter_map(as_string).collect()),
      Value::Value(inner) => as_strings(inner),
      _ => None,
   }
}

/// Collects the attributes of a device-found dictionary we care about.
pub fn device_props<'a, 'v: 'a>(
   entries: impl IntoIterator<Item = (&'a str, &'a Value<'v>)>,
) -> DeviceProps {
   let mut props = DeviceProps::default();
   for (key, value) in entries {
      match PropertyName::from_str(key) {
         Ok(PropertyName::Uuids) => props.uuids = as_strings(value),
         Ok(PropertyName::Class) => props.class = as_u32(value),
         Ok(PropertyName::Rssi) => props.rssi = as_i16(value),
         Ok(PropertyName::Name) => props.name = as_string(value),
         Ok(PropertyName::Icon) => props.icon = as_string(value),
         _ => {},
      }
   }
   props
}

/// Reads the four properties adapter initialization needs.
pub fn adapter_props<'a, 'v: 'a>(
   entries: impl IntoIterator<Item = (&'a str, &'a Value<'v>)>,
) -> Result<AdapterProps> {
   let mut address = None;
   let mut class = None;
   let mut powered = None;
   let mut discovering = None;
   for (key, value) in entries {
      match PropertyName::from_str(key) {
         Ok(PropertyName::Address) => {
            address = as_string(value).and_then(|s| Address::from_str(&s).ok());
         },
         Ok(PropertyName::Class) => class = as_u32(value),
         Ok(PropertyName::Powered) => powered = as_bool(value),
         Ok(PropertyName::Discovering) => discovering = as_bool(value),
         _ => {},
      }
   }
   Ok(AdapterProps {
      address: address.ok_or(AccessorError::NotFound("adapter Address property"))?,
      class: class.ok_or(AccessorError::NotFound("adapter Class property"))?,
      powered: powered.ok_or(AccessorError::NotFound("adapter Powered property"))?,
      discovering: discovering.ok_or(AccessorError::NotFound("adapter Discovering property"))?,
   })
}

pub fn adapter_property(name: &str, value: &Value<'_>) -> AdapterProperty {
   let parsed = match PropertyName::from_str(name) {
      Ok(PropertyName::Discoverable) => as_bool(value).map(AdapterProperty::Discoverable),
      Ok(PropertyName::Discovering) => as_bool(value).map(AdapterProperty::Discovering),
      Ok(PropertyName::Powered) => as_bool(value).map(AdapterProperty::Powered),
      _ => None,
   };
   parsed.unwrap_or_else(|| AdapterProperty::Other(name.into()))
}

pub fn device_property(name: &str, value: &Value<'_>) -> DeviceProperty {
   match (PropertyName::from_str(name), as_bool(value)) {
      (Ok(PropertyName::Connected), Some(connected)) => DeviceProperty::Connected(connected),
      _ => DeviceProperty::Other(name.into()),
   }
}

fn path_str(path: &OwnedObjectPath) -> SmolStr {
   path.as_str().into()
}

/// Translates one signal into an event, if it is one we track.
fn decode_signal(msg: &Message) -> Option<BluezEvent> {
   let header = msg.header();
   let interface = header.interface()?.as_str();
   let member = header.member()?.as_str();
   let path: SmolStr = header.path()?.as_str().into();
   let body = msg.body();

   let event = match (interface, member) {
      ("org.bluez.Manager", "AdapterAdded") => {
         BluezEvent::AdapterAdded(path_str(&body.deserialize::<OwnedObjectPath>().ok()?))
      },
      ("org.bluez.Manager", "AdapterRemoved") => {
         BluezEvent::AdapterRemoved(path_str(&body.deserialize::<OwnedObjectPath>().ok()?))
      },
      ("org.bluez.Manager", "DefaultAdapterChanged") => BluezEvent::DefaultAdapterChanged(
         path_str(&body.deserialize::<OwnedObjectPath>().ok()?),
      ),
      ("org.bluez.Adapter", "DeviceFound") => {
         let (addr, dict) = body
            .deserialize::<(String, HashMap<String, OwnedValue>)>()
            .ok()?;
         let Ok(addr) = Address::from_str(&addr) else {
            warn!("{path}: DeviceFound with bad address {addr:?}");
            return None;
         };
         BluezEvent::DeviceFound {
            adapter: path,
            addr,
            props: device_props(dict.iter().map(|(k, v)| (k.as_str(), &**v))),
         }
      },
      ("org.bluez.Adapter", "DeviceCreated") => BluezEvent::DeviceCreated {
         adapter: path,
         device: path_str(&body.deserialize::<OwnedObjectPath>().ok()?),
      },
      ("org.bluez.Adapter", "DeviceRemoved") => BluezEvent::DeviceRemoved {
         adapter: path,
         device: path_str(&body.deserialize::<OwnedObjectPath>().ok()?),
      },
      ("org.bluez.Adapter", "PropertyChanged") => {
         let (name, value) = body.deserialize::<(String, OwnedValue)>().ok()?;
         BluezEvent::AdapterPropertyChanged {
            prop: adapter_property(&name, &value),
            path,
         }
      },
      ("org.bluez.Device", "PropertyChanged") => {
         let (name, value) = body.deserialize::<(String, OwnedValue)>().ok()?;
         BluezEvent::DevicePropertyChanged {
            prop: device_property(&name, &value),
            path,
         }
      },
      ("org.freedesktop.DBus", "NameOwnerChanged") => {
         let (name, old, new) = body.deserialize::<(String, String, String)>().ok()?;
         if name != BLUEZ_SERVICE {
            return None;
         }
         if new.is_empty() {
            BluezEvent::DaemonLost
         } else if old.is_empty() {
            BluezEvent::DaemonAppeared
         } else {
            return None;
         }
      },
      _ => return None,
   };
   Some(event)
}

/// BlueZ 4 over zbus.
#[derive(Clone)]
pub struct ZbusBluez {
   conn: Connection,
   call_timeout: Duration,
   sdp_query_timeout: Duration,
   create_device_timeout: Duration,
}

impl ZbusBluez {
   pub fn new(conn: Connection, config: &Config) -> Self {
      Self {
         conn,
         call_timeout: config.call_timeout(),
         sdp_query_timeout: config.sdp_query_timeout(),
         create_device_timeout: config.create_device_timeout(),
      }
   }

   pub async fn system(config: &Config) -> Result<Self> {
      Ok(Self::new(Connection::system().await?, config))
   }

   /// Subscribes to the daemon's signals and forwards them as events.
   pub async fn events(&self) -> Result<mpsc::Receiver<BluezEvent>> {
      let mut streams = Vec::new();
      for interface in ["org.bluez.Manager", "org.bluez.Adapter", "org.bluez.Device"] {
         let rule = MatchRule::builder()
            .msg_type(message::Type::Signal)
            .sender(BLUEZ_SERVICE)?
            .interface(interface)?
            .build();
         streams.push(MessageStream::for_match_rule(rule, &self.conn, None).await?);
      }
      let rule = MatchRule::builder()
         .msg_type(message::Type::Signal)
         .sender("org.freedesktop.DBus")?
         .interface("org.freedesktop.DBus")?
         .member("NameOwnerChanged")?
         .add_arg(BLUEZ_SERVICE)?
         .build();
      streams.push(MessageStream::for_match_rule(rule, &self.conn, None).await?);

      let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
      tokio::spawn(async move {
         let mut signals = stream::select_all(streams);
         while let Some(msg) = signals.next().await {
            let msg = match msg {
               Ok(msg) => msg,
               Err(e) => {
                  warn!("BlueZ signal stream error: {e}");
                  continue;
               },
            };
            if let Some(event) = decode_signal(&msg) {
               debug!("BlueZ event: {event:?}");
               if tx.send(event).await.is_err() {
                  break;
               }
            }
         }
         debug!("BlueZ signal pump stopped");
      });
      Ok(rx)
   }

   async fn bounded<T>(
      &self,
      limit: Duration,
      what: &'static str,
      call: impl Future<Output = zbus::Result<T>>,
   ) -> Result<T> {
      Ok(time::timeout(limit, call)
         .await
         .map_err(|_| AccessorError::Timeout(what))??)
   }

   async fn adapter(&self, path: &str) -> Result<BluezAdapterProxy<'static>> {
      Ok(BluezAdapterProxy::builder(&self.conn)
         .path(path.to_owned())?
         .cache_properties(zbus::proxy::CacheProperties::No)
         .build()
         .await?)
   }

   async fn service(&self, path: &str) -> Result<BluezServiceProxy<'static>> {
      Ok(BluezServiceProxy::builder(&self.conn)
         .path(path.to_owned())?
         .cache_properties(zbus::proxy::CacheProperties::No)
         .build()
         .await?)
   }

   async fn device(&self, path: &str) -> Result<BluezDeviceProxy<'static>> {
      Ok(BluezDeviceProxy::builder(&self.conn)
         .path(path.to_owned())?
         .cache_properties(zbus::proxy::CacheProperties::No)
         .build()
         .await?)
   }
}

#[async_trait]
impl BluezProxy for ZbusBluez {
   async fn list_adapters(&self) -> Result<Vec<SmolStr>> {
      let manager = BluezManagerProxy::new(&self.conn).await?;
      let paths = self
         .bounded(self.call_timeout, "ListAdapters", manager.list_adapters())
         .await?;
      Ok(paths.iter().map(path_str).collect())
   }

   async fn default_adapter(&self) -> Result<SmolStr> {
      let manager = BluezManagerProxy::new(&self.conn).await?;
      let path = self
         .bounded(self.call_timeout, "DefaultAdapter", manager.default_adapter())
         .await?;
      Ok(path_str(&path))
   }

   async fn adapter_properties(&self, adapter: &str) -> Result<AdapterProps> {
      let proxy = self.adapter(adapter).await?;
      let props = self
         .bounded(self.call_timeout, "adapter GetProperties", proxy.get_properties())
         .await?;
      adapter_props(props.iter().map(|(k, v)| (k.as_str(), &**v)))
   }

   async fn set_adapter_property(&self, adapter: &str, setting: AdapterSetting) -> Result<()> {
      let proxy = self.adapter(adapter).await?;
      let (name, value) = match setting {
         AdapterSetting::Discoverable(on) => (PropertyName::Discoverable, Value::from(on)),
      };
      self
         .bounded(
            self.call_timeout,
            "adapter SetProperty",
            proxy.set_property(&name.to_string(), &value),
         )
         .await
   }

   async fn start_discovery(&self, adapter: &str) -> Result<()> {
      let proxy = self.adapter(adapter).await?;
      self
         .bounded(self.call_timeout, "StartDiscovery", proxy.start_discovery())
         .await
   }

   async fn stop_discovery(&self, adapter: &str) -> Result<()> {
      let proxy = self.adapter(adapter).await?;
      self
         .bounded(self.call_timeout, "StopDiscovery", proxy.stop_discovery())
         .await
   }

   async fn find_device(&self, adapter: &str, addr: Address) -> Result<Option<SmolStr>> {
      let proxy = self.adapter(adapter).await?;
      let addr = addr.to_string();
      match self
         .bounded(self.call_timeout, "FindDevice", proxy.find_device(&addr))
         .await
      {
         Ok(path) => Ok(Some(path_str(&path))),
         Err(AccessorError::DBus(zbus::Error::MethodError(name, msg, _))) => {
            debug!("{adapter}: FindDevice({addr}): {name} - {}", msg.unwrap_or_default());
            Ok(None)
         },
         Err(e) => Err(e),
      }
   }

   async fn create_device(&self, adapter: &str, addr: Address) -> Result<SmolStr> {
      let proxy = self.adapter(adapter).await?;
      let path = self
         .bounded(
            self.create_device_timeout,
            "CreateDevice",
            proxy.create_device(&addr.to_string()),
         )
         .await?;
      Ok(path_str(&path))
   }

   async fn remove_device(&self, adapter: &str, device: &str) -> Result<()> {
      let proxy = self.adapter(adapter).await?;
      let device = ObjectPath::try_from(device).map_err(zbus::Error::from)?;
      self
         .bounded(self.call_timeout, "RemoveDevice", proxy.remove_device(&device))
         .await
   }

   async fn discover_services(&self, device: &str, pattern: &str) -> Result<Vec<(u32, String)>> {
      let proxy = self.device(device).await?;
      let records = self
         .bounded(
            self.sdp_query_timeout,
            "DiscoverServices",
            proxy.discover_services(pattern),
         )
         .await?;
      Ok(records.into_iter().collect())
   }

   async fn add_record(&self, adapter: &str, xml: &str) -> Result<u32> {
      let proxy = self.service(adapter).await?;
      self
         .bounded(self.call_timeout, "AddRecord", proxy.add_record(xml))
         .await
   }

   async fn remove_record(&self, adapter: &str, handle: u32) -> Result<()> {
      let proxy = self.service(adapter).await?;
      self
         .bounded(self.call_timeout, "RemoveRecord", proxy.remove_record(handle))
         .await
   }
}


#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_device_props_with_uuids() {
      let uuids = Value::from(vec![
         "0000110b-0000-1000-8000-00805f9b34fb".to_owned(),
         "DEADBEEF-1C25-481F-9DFB-59193D238280".to_owned(),
      ]);
      let rssi = Value::from(-60i16);
      let name = Value::from("phone");
      let entries = [("UUIDs", &uuids), ("RSSI", &rssi), ("Name", &name)];

      let props = device_props(entries);
      assert_eq!(props.uuids.as_ref().map(Vec::len), Some(2));
      assert_eq!(props.rssi, Some(-60));
      assert_eq!(props.name.as_deref(), Some("phone"));
      assert_eq!(props.class, None);
   }

   #[test]
   fn test_device_props_ignore_wrong_types() {
      let class = Value::from("not a number");
      let alias = Value::from("x");
      let props = device_props([("Class", &class), ("Alias", &alias)]);
      assert_eq!(props, DeviceProps::default());
   }

   #[test]
   fn test_adapter_props_require_all_fields() {
      let address = Value::from("00:11:22:33:44:55");
      let class = Value::from(0x5a_020cu32);
      let powered = Value::from(true);
      let discovering = Value::from(false);

      let props = adapter_props([
         ("Address", &address),
         ("Class", &class),
         ("Powered", &powered),
         ("Discovering", &discovering),
      ])
      .unwrap();
      assert_eq!(props.address, Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]));
      assert_eq!(props.class, 0x5a_020c);
      assert!(props.powered);

      let err = adapter_props([("Address", &address), ("Class", &class)]).unwrap_err();
      assert!(matches!(err, AccessorError::NotFound(_)));
   }

   #[test]
   fn test_property_changes() {
      let off = Value::from(false);
      assert_eq!(adapter_property("Discoverable", &off), AdapterProperty::Discoverable(false));
      assert_eq!(adapter_property("Powered", &off), AdapterProperty::Powered(false));
      assert_eq!(adapter_property("Name", &off), AdapterProperty::Other("Name".into()));
      assert_eq!(device_property("Connected", &off), DeviceProperty::Connected(false));
      assert_eq!(device_property("Paired", &off), DeviceProperty::Other("Paired".into()));
   }
}
