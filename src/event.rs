//! Notifications delivered to the owning transport.
//!
//! The accessor reports adapter availability and classified found devices
//! through an [`EventBus`], and asks the transport to vet incoming links
//! through an [`IncomingPolicy`].

use std::{sync::Arc, time::Duration};

use bluer::Address;
use crossbeam::queue::SegQueue;
use serde_json::json;
use tokio::{sync::Notify, time};

use crate::bluetooth::node::BusAddress;

/// Events that can be emitted by the accessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessorEvent {
   /// Bus-capable Bluetooth became usable or unusable.
   DeviceAvailable(bool),
   /// A found device was classified, or expired without classification.
   DeviceChange {
      addr: Address,
      uuid_rev: u32,
      eir_capable: bool,
   },
}

impl AccessorEvent {
   pub fn to_json(&self) -> serde_json::Value {
      match self {
         Self::DeviceAvailable(available) => json!({
            "event": "device_available",
            "available": available,
         }),
         Self::DeviceChange {
            addr,
            uuid_rev,
            eir_capable,
         } => json!({
            "event": "device_change",
            "address": addr.to_string(),
            "uuid_rev": format!("{uuid_rev:08x}"),
            "eir_capable": eir_capable,
         }),
      }
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   fn emit(&self, event: AccessorEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Outcome of vetting the remote end of an accepted link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingDecision {
   Allow,
   /// Accept, but tell the peer to reconnect to another address.
   Redirect(BusAddress),
   Reject,
}

/// Access check the transport supplies for inbound links.
pub trait IncomingPolicy: Send + Sync {
   fn check_incoming_address(&self, addr: Address) -> IncomingDecision;
}

pub type PolicyRef = Arc<dyn IncomingPolicy>;

/// Lock-free event queue that can be drained from an async task.
pub struct EventProcessor {
   queue: SegQueue<AccessorEvent>,
   notifier: Notify,
}

impl EventProcessor {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   pub fn try_recv(&self) -> Option<AccessorEvent> {
      self.queue.pop()
   }

   /// Waits for the next event. Returns `None` once every emitter is gone.
   pub async fn recv(self: &Arc<Self>) -> Option<AccessorEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: AccessorEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
