//! Deferred operation queue for the manager task.
//!
//! Operations fire one at a time in deadline order. Alarms can be cancelled
//! until they fire; a cancelled alarm never fires.

use std::{
   collections::BTreeMap,
   sync::atomic::{AtomicU64, Ordering},
   time::Duration,
};

use parking_lot::Mutex;
use tokio::{
   select,
   sync::Notify,
   time::{self, Instant},
};

/// Work the manager task defers to a later point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOp {
   StopDiscovery,
   StopDiscoverability,
   /// Finalize found devices whose expiry has elapsed.
   ExpireFoundDevices,
   /// Finalize every found device regardless of expiry.
   FlushFoundDevices,
}

/// Handle to a scheduled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AlarmId {
   deadline: Instant,
   seq: u64,
}

impl AlarmId {
   pub const fn deadline(&self) -> Instant {
      self.deadline
   }
}

#[derive(Debug, Default)]
pub struct DispatchQueue {
   pending: Mutex<BTreeMap<AlarmId, DispatchOp>>,
   seq: AtomicU64,
   changed: Notify,
}

impl DispatchQueue {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn schedule_at(&self, deadline: Instant, op: DispatchOp) -> AlarmId {
      let id = AlarmId {
         deadline,
         seq: self.seq.fetch_add(1, Ordering::Relaxed),
      };
      self.pending.lock().insert(id, op);
      self.changed.notify_one();
      id
   }

   pub fn schedule_in(&self, delay: Duration, op: DispatchOp) -> AlarmId {
      self.schedule_at(Instant::now() + delay, op)
   }

   pub fn dispatch_now(&self, op: DispatchOp) -> AlarmId {
      self.schedule_at(Instant::now(), op)
   }

   /// Removes a pending alarm. Returns false if it already fired.
   pub fn cancel(&self, id: AlarmId) -> bool {
      self.pending.lock().remove(&id).is_some()
   }

   pub fn is_pending(&self, id: AlarmId) -> bool {
      self.pending.lock().contains_key(&id)
   }

   pub fn len(&self) -> usize {
      self.pending.lock().len()
   }

   pub fn is_empty(&self) -> bool {
      self.pending.lock().is_empty()
   }

   pub fn next_deadline(&self) -> Option<Instant> {
      self.pending.lock().first_key_value().map(|(id, _)| id.deadline)
   }

   /// Pops the earliest operation if its deadline has passed.
   pub fn pop_due(&self, now: Instant) -> Option<DispatchOp> {
      let mut pending = self.pending.lock();
      let (id, _) = pending.first_key_value()?;
      if id.deadline > now {
         return None;
      }
      pending.pop_first().map(|(_, op)| op)
   }

   /// Waits for the next due operation.
   ///
   /// Cancel safe: an operation is only removed from the queue when this
   /// future completes.
   pub async fn next(&self) -> DispatchOp {
      loop {
         if let Some(op) = self.pop_due(Instant::now()) {
            return op;
         }
         match self.next_deadline() {
            Some(deadline) => {
               select! {
                   () = time::sleep_until(deadline) => {}
                   () = self.changed.notified() => {}
               }
            },
            None => self.changed.notified().await,
         }
      }
   }
}
