//! Bluetooth link layer for the bus.
//!
//! HCI commands, L2CAP links, SDP records, the BlueZ daemon interface and
//! the discovery state machine that ties them together.

pub mod accessor;
pub mod adapter;
pub mod bluez;
pub mod dispatch;
pub mod hci;
pub mod l2cap;
pub mod manager;
pub mod node;
pub mod sdp;
