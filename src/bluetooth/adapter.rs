//! Local adapter handles.
//!
//! An [`Adapter`] is shared between the manager task and callers running
//! blocking operations. Removal or daemon loss marks it invalid; holders
//! check [`Adapter::is_valid`] rather than relying on the map entry.

use std::{
   fmt,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU32, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use smol_str::{SmolStr, format_smolstr};

use crate::{
   bluetooth::hci::{HciBackend, HciChannel},
   error::{AccessorError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AdapterState {
   Unknown,
   Initializing,
   Ready,
   Invalid,
}

/// Adapter index from the trailing digits of its object path.
pub fn parse_adapter_id(path: &str) -> Option<u16> {
   let digits = path.len() - path.trim_end_matches(|c: char| c.is_ascii_digit()).len();
   path[path.len() - digits..].parse().ok()
}

/// Path of the pseudo-adapter that publishes records on every radio.
pub fn any_adapter_path(default_path: &str) -> SmolStr {
   let parent = default_path.rsplit_once('/').map_or("", |(parent, _)| parent);
   format_smolstr!("{parent}/any")
}

struct AdapterInner {
   path: SmolStr,
   id: Option<u16>,
   address: AtomicCell<Address>,
   class: AtomicU32,
   powered: AtomicBool,
   discovering: AtomicBool,
   eir_capable: AtomicBool,
   state: AtomicCell<AdapterState>,
}

/// A local Bluetooth radio.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct Adapter(Arc<AdapterInner>);

impl fmt::Debug for Adapter {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Adapter")
         .field("path", &self.0.path)
         .field("address", &self.address())
         .field("state", &self.state())
         .field("powered", &self.is_powered())
         .field("discovering", &self.is_discovering())
         .field("eir_capable", &self.is_eir_capable())
         .finish()
   }
}

impl PartialEq for Adapter {
   fn eq(&self, other: &Self) -> bool {
      Arc::ptr_eq(&self.0, &other.0)
   }
}

impl Eq for Adapter {}

impl Adapter {
   pub fn new(path: impl Into<SmolStr>) -> Self {
      let path = path.into();
      Self(Arc::new(AdapterInner {
         id: parse_adapter_id(&path),
         path,
         address: AtomicCell::new(Address::any()),
         class: AtomicU32::new(0),
         powered: AtomicBool::new(false),
         discovering: AtomicBool::new(false),
         eir_capable: AtomicBool::new(false),
         state: AtomicCell::new(AdapterState::Unknown),
      }))
   }

   pub fn path(&self) -> &SmolStr {
      &self.0.path
   }

   pub fn id(&self) -> Option<u16> {
      self.0.id
   }

   pub fn address(&self) -> Address {
      self.0.address.load()
   }

   pub fn set_address(&self, address: Address) {
      self.0.address.store(address);
   }

   pub fn class(&self) -> u32 {
      self.0.class.load(Ordering::Relaxed)
   }

   pub fn set_class(&self, class: u32) {
      self.0.class.store(class, Ordering::Relaxed);
   }

   pub fn is_powered(&self) -> bool {
      self.0.powered.load(Ordering::Acquire)
   }

   pub fn set_powered(&self, powered: bool) {
      self.0.powered.store(powered, Ordering::Release);
   }

   pub fn is_discovering(&self) -> bool {
      self.0.discovering.load(Ordering::Acquire)
   }

   pub fn set_discovering(&self, discovering: bool) {
      self.0.discovering.store(discovering, Ordering::Release);
   }

   pub fn is_eir_capable(&self) -> bool {
      self.0.eir_capable.load(Ordering::Acquire)
   }

   pub fn set_eir_capable(&self, eir_capable: bool) {
      self.0.eir_capable.store(eir_capable, Ordering::Release);
   }

   pub fn state(&self) -> AdapterState {
      self.0.state.load()
   }

   pub fn set_state(&self, state: AdapterState) {
      self.0.state.store(state);
   }

   /// Moves an initializing adapter to ready. Returns false if it was
   /// invalidated meanwhile.
   pub fn mark_ready(&self) -> bool {
      self
         .0
         .state
         .compare_exchange(AdapterState::Initializing, AdapterState::Ready)
         .is_ok()
   }

   pub fn is_valid(&self) -> bool {
      self.state() != AdapterState::Invalid
   }

   pub fn invalidate(&self) {
      self.set_state(AdapterState::Invalid);
      self.set_discovering(false);
   }

   /// Opens an HCI command channel to this adapter.
   pub fn hci(&self, backend: &dyn HciBackend, timeout: Duration) -> Result<HciChannel> {
      if !self.is_valid() {
         return Err(AccessorError::AdapterNotAvailable);
      }
      let id = self
         .id()
         .ok_or(AccessorError::InvalidArgument("adapter path has no device index"))?;
      HciChannel::open(backend, id, timeout)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::bluetooth::hci::testing::AckingHci;

   #[test]
   fn test_adapter_id_from_path() {
      assert_eq!(parse_adapter_id("/org/bluez/1234/hci0"), Some(0));
      assert_eq!(parse_adapter_id("/org/bluez/1234/hci12"), Some(12));
      assert_eq!(parse_adapter_id("/org/bluez/1234/any"), None);
   }

   #[test]
   fn test_any_adapter_path() {
      assert_eq!(any_adapter_path("/org/bluez/1234/hci0"), "/org/bluez/1234/any");
   }

   #[tokio::test]
   async fn test_invalid_adapter_refuses_hci() {
      let backend = AckingHci::new(true);
      let adapter = Adapter::new("/org/bluez/1/hci3");
      adapter.set_discovering(true);

      let hci = adapter.hci(backend.as_ref(), Duration::from_secs(1)).unwrap();
      assert!(hci.is_eir_capable().await.unwrap());
      assert_eq!(*backend.opened.lock(), vec![3]);

      adapter.invalidate();
      assert!(!adapter.is_discovering());
      assert!(matches!(
         adapter.hci(backend.as_ref(), Duration::from_secs(1)),
         Err(AccessorError::AdapterNotAvailable)
      ));
   }
}
