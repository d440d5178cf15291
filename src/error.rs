//! Error types for the Bluetooth accessor.
//!
//! Low-level failures from the HCI, L2CAP and SDP layers are reported
//! through a single error enum so the discovery manager can decide whether
//! to log, retry or report an availability change.

use bluer::Address;
use thiserror::Error;

/// Malformed data received from the radio, the daemon or a peer.
#[derive(Error, Debug)]
pub enum ProtoError {
   /// HCI event whose length byte disagrees with the bytes read
   #[error("HCI event size mismatch: header says {expected} bytes, got {actual}")]
   EventSizeMismatch { expected: usize, actual: usize },

   /// HCI packet that is not an event packet
   #[error("Unexpected HCI packet type 0x{packet_type:02x}")]
   UnexpectedPacketType { packet_type: u8 },

   /// Response payload too short for the command that produced it
   #[error("HCI response too short: expected at least {expected} bytes, got {actual}")]
   ResponseTooShort { expected: usize, actual: usize },

   /// Record XML that does not parse
   #[error("SDP XML: {0}")]
   Xml(#[from] roxmltree::Error),

   /// Well-formed record that is missing or misstates a required attribute
   #[error("Malformed SDP record: {reason}")]
   MalformedRecord { reason: &'static str },

   /// First byte of an accepted link was not the expected handshake
   #[error("Bad handshake byte 0x{byte:02x}")]
   Handshake { byte: u8 },
}

/// Main error type for the accessor.
#[derive(Error, Debug)]
pub enum AccessorError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("OS error: {0}")]
   Os(#[from] std::io::Error),

   #[error("Protocol error: {0}")]
   Protocol(#[from] ProtoError),

   #[error("Timed out waiting for {0}")]
   Timeout(&'static str),

   #[error("Connection from {0} rejected")]
   Rejected(Address),

   #[error("No free L2CAP PSM")]
   Exhausted,

   #[error("Could not connect to {0}")]
   ConnectFailed(crate::bluetooth::node::BusAddress),

   #[error("Not found: {0}")]
   NotFound(&'static str),

   #[error("HCI command 0x{opcode:04x} failed with status 0x{status:02x}")]
   CommandFailed { opcode: u16, status: u8 },

   #[error("Invalid argument: {0}")]
   InvalidArgument(&'static str),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Adapter not available")]
   AdapterNotAvailable,
}

/// Convenience type alias for Results with `AccessorError`.
pub type Result<T> = std::result::Result<T, AccessorError>;
