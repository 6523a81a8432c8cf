//! Bookkeeping for connection attempts and established links.

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;

use crate::{
   bluetooth::hci::{BdAddr, ConnectionHandle, DeviceAddress},
   peripheral::device::PeripheralId,
};

/// What [`ConnectQueue::request`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
   /// Nothing was in flight; the caller must issue the attempt now.
   Issue,
   /// Waiting behind the attempt in flight.
   Queued,
   /// The address is already queued or in flight.
   AlreadyPending,
}

/// Serializes connection attempts: the controller can only originate one
/// LE connection at a time.
///
/// Every address handed to [`request`](Self::request) is also recorded in
/// the requested set. Links to addresses outside that set are unsolicited.
///
/// A cancelled attempt keeps the slot until the controller confirms it, but
/// nobody can join it any more: a new request for the same address queues a
/// fresh attempt.
#[derive(Debug, Default)]
pub struct ConnectQueue {
   pending: VecDeque<DeviceAddress>,
   in_flight: Option<DeviceAddress>,
   cancelling: bool,
   requested: HashSet<BdAddr>,
}

impl ConnectQueue {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn request(&mut self, peer: DeviceAddress) -> Admission {
      self.requested.insert(peer.address);

      if self.is_queued(&peer.address) || (self.is_in_flight(&peer.address) && !self.cancelling) {
         return Admission::AlreadyPending;
      }
      if self.in_flight.is_none() {
         self.in_flight = Some(peer);
         Admission::Issue
      } else {
         self.pending.push_back(peer);
         debug!("Queued connection to {peer}, {} waiting", self.pending.len());
         Admission::Queued
      }
   }

   pub fn is_requested(&self, address: &BdAddr) -> bool {
      self.requested.contains(address)
   }

   pub fn in_flight(&self) -> Option<DeviceAddress> {
      self.in_flight
   }

   pub fn is_in_flight(&self, address: &BdAddr) -> bool {
      self.in_flight.is_some_and(|p| p.address == *address)
   }

   pub fn is_queued(&self, address: &BdAddr) -> bool {
      self.pending.iter().any(|p| p.address == *address)
   }

   /// Whether `address` is in flight and still wanted.
   pub fn is_live_attempt(&self, address: &BdAddr) -> bool {
      self.is_in_flight(address) && !self.cancelling
   }

   pub fn is_cancelling(&self) -> bool {
      self.cancelling
   }

   /// Marks the in-flight attempt as cancelled and returns it.
   pub fn cancel(&mut self) -> Option<DeviceAddress> {
      self.cancelling = self.in_flight.is_some();
      self.in_flight
   }

   pub fn pending_len(&self) -> usize {
      self.pending.len()
   }

   /// Drops the address from the requested set only.
   pub fn forget(&mut self, address: &BdAddr) -> bool {
      self.requested.remove(address)
   }

   /// Frees the in-flight slot and returns its occupant.
   pub fn complete(&mut self) -> Option<DeviceAddress> {
      self.cancelling = false;
      self.in_flight.take()
   }

   /// Moves the queue head into the free in-flight slot. Returns the
   /// address to issue, if any.
   pub fn advance(&mut self) -> Option<DeviceAddress> {
      if self.in_flight.is_some() {
         return None;
      }
      self.in_flight = self.pending.pop_front();
      self.in_flight
   }

   /// Removes a waiting address from the queue. With `forget` set it also
   /// leaves the requested set.
   pub fn remove_queued(&mut self, address: &BdAddr, forget: bool) -> bool {
      let before = self.pending.len();
      self.pending.retain(|p| p.address != *address);
      if forget {
         self.requested.remove(address);
      }
      self.pending.len() != before
   }

   /// Empties the queue, returning every address that was waiting or in
   /// flight.
   pub fn clear(&mut self) -> Vec<DeviceAddress> {
      self.requested.clear();
      self.cancelling = false;
      self.in_flight.take().into_iter().chain(self.pending.drain(..)).collect()
   }
}

/// Bidirectional handle ↔ identity map of established links.
#[derive(Debug, Default)]
pub struct LinkTable {
   by_handle: HashMap<ConnectionHandle, PeripheralId>,
   by_id: HashMap<PeripheralId, ConnectionHandle>,
}

impl LinkTable {
   pub fn new() -> Self {
      Self::default()
   }

   /// Records a link, replacing stale entries on either side.
   pub fn insert(&mut self, handle: ConnectionHandle, id: PeripheralId) {
      if let Some(old) = self.by_handle.remove(&handle) {
         self.by_id.remove(&old);
      }
      if let Some(old) = self.by_id.remove(&id) {
         self.by_handle.remove(&old);
      }
      self.by_handle.insert(handle, id.clone());
      self.by_id.insert(id, handle);
   }

   pub fn remove(&mut self, handle: ConnectionHandle) -> Option<PeripheralId> {
      let id = self.by_handle.remove(&handle)?;
      self.by_id.remove(&id);
      Some(id)
   }

   pub fn id(&self, handle: ConnectionHandle) -> Option<&PeripheralId> {
      self.by_handle.get(&handle)
   }

   pub fn handle(&self, id: &PeripheralId) -> Option<ConnectionHandle> {
      self.by_id.get(id).copied()
   }

   pub fn handles(&self) -> impl Iterator<Item = ConnectionHandle> + '_ {
      self.by_handle.keys().copied()
   }

   pub fn len(&self) -> usize {
      self.by_handle.len()
   }

   pub fn is_empty(&self) -> bool {
      self.by_handle.is_empty()
   }
}
