//! Bus endpoint descriptors shared by the SDP codec and the link layer.

use std::{collections::BTreeSet, fmt};

use bluer::Address;

/// PSM value meaning "no PSM".
pub const INVALID_PSM: u16 = 0;
/// PSM tag given to links we accepted; the peer's listening PSM is unknown.
pub const INCOMING_PSM: u16 = 1;
/// UUID revision meaning "seen but not classified".
pub const INVALID_UUID_REV: u32 = 0;

/// First dynamically assignable BR/EDR PSM.
pub const PSM_DYN_START: u16 = 0x1001;
/// Last dynamically assignable BR/EDR PSM.
pub const PSM_DYN_END: u16 = 0x8fff;

/// Whether `psm` is a PSM a bus listener may be bound to: odd and in the
/// dynamic range.
pub const fn is_bus_psm(psm: u16) -> bool {
   psm >= PSM_DYN_START && psm <= PSM_DYN_END && psm & 1 == 1
}

/// A Bluetooth device address paired with the L2CAP PSM the bus listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusAddress {
   pub addr: Address,
   pub psm: u16,
}

impl BusAddress {
   pub const fn new(addr: Address, psm: u16) -> Self {
      Self { addr, psm }
   }

   pub const fn is_valid(&self) -> bool {
      self.psm != INVALID_PSM
   }
}

impl fmt::Display for BusAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}-{:04x}", self.addr, self.psm)
   }
}

/// Packs an address into the 48-bit integer form used on the wire.
pub fn address_to_raw(addr: Address) -> u64 {
   addr.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Inverse of [`address_to_raw`]; bits above 48 are ignored.
pub fn address_from_raw(raw: u64) -> Address {
   let bytes = raw.to_be_bytes();
   Address::new([bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]])
}

/// One bus node reachable through a Bluetooth device, with the names it
/// advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedNode {
   pub guid: String,
   pub bus_addr: BusAddress,
   pub names: BTreeSet<String>,
}

impl AdvertisedNode {
   pub fn new(guid: impl Into<String>, bus_addr: BusAddress) -> Self {
      Self {
         guid: guid.into(),
         bus_addr,
         names: BTreeSet::new(),
      }
   }

   pub fn with_name(mut self, name: impl Into<String>) -> Self {
      self.names.insert(name.into());
      self
   }
}
