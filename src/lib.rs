//! Bluetooth transport accessor for a peer-to-peer message bus.
//!
//! The accessor discovers bus-capable devices, publishes this node's SDP
//! record, and opens L2CAP links that the bus transport wraps in its own
//! session protocol. BlueZ is reached over D-Bus and the radio over raw HCI
//! sockets.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod event;

pub use bluetooth::{
   accessor::BtAccessor,
   l2cap::{Connection, Direction},
   manager::DiscoveryManager,
   node::{AdvertisedNode, BusAddress},
   sdp::ServiceRecord,
};
pub use config::Config;
pub use error::{AccessorError, Result};
pub use event::{AccessorEvent, EventBus, EventProcessor, IncomingDecision, IncomingPolicy};
