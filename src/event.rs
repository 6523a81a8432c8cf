//! Upward events of the link layer.
//!
//! Everything the connection manager reports without being asked (link
//! establishment and teardown, pairing progress, remote reads, advisories)
//! goes through an [`EventBus`]. [`EventQueue`] is a ready-made bus that
//! buffers events for a single async consumer.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use smol_str::SmolStr;
use tokio::{sync::Notify, time};

use crate::{
   bluetooth::{
      hci::{AdapterState, ConnectionHandle, ConnectionParams, DeviceAddress, Role},
      session::GattEvent,
      status::HciStatus,
   },
   peripheral::{
      device::PeripheralId,
      pairing::{PairingError, PairingOutcome},
      protocol::{AssociationModel, AuthType, FeatureBitmap, PairingResponse, VersionInfo},
   },
};

/// Events that can be emitted by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
   StateChanged(AdapterState),
   AddressChanged(DeviceAddress),
   Connected {
      id: PeripheralId,
      handle: ConnectionHandle,
      address: DeviceAddress,
      role: Role,
      params: ConnectionParams,
   },
   ConnectFailed {
      id: PeripheralId,
      status: HciStatus,
   },
   Disconnected {
      id: PeripheralId,
      handle: ConnectionHandle,
      reason: HciStatus,
   },
   ConnectionUpdated {
      id: PeripheralId,
      params: ConnectionParams,
   },
   EncryptionChanged {
      id: PeripheralId,
      encrypted: bool,
   },
   PairingResponse {
      id: PeripheralId,
      response: PairingResponse,
   },
   PairingProgress {
      id: PeripheralId,
      auth_type: AuthType,
      assoc_model: AssociationModel,
   },
   Paired {
      id: PeripheralId,
      outcome: PairingOutcome,
   },
   PairingFailed {
      id: PeripheralId,
      error: PairingError,
   },
   FeaturesRead {
      id: PeripheralId,
      features: FeatureBitmap,
   },
   VersionRead {
      id: PeripheralId,
      version: VersionInfo,
   },
   RssiRead {
      id: PeripheralId,
      rssi: i8,
   },
   Gatt {
      id: PeripheralId,
      event: GattEvent,
   },
   /// Advisory: an event or request referred to something unknown.
   Warning(SmolStr),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners. Must not block.
   fn emit(&self, event: LinkEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Lock-free event buffer with an async receiving side.
pub struct EventQueue {
   queue: SegQueue<LinkEvent>,
   notifier: Notify,
}

impl EventQueue {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   pub fn try_recv(&self) -> Option<LinkEvent> {
      self.queue.pop()
   }

   /// Waits for the next event. Returns `None` once every other reference to
   /// the queue is gone and it has been drained.
   pub async fn recv(self: &Arc<Self>) -> Option<LinkEvent> {
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

   pub fn len(&self) -> usize {
      self.queue.len()
   }

   pub fn is_empty(&self) -> bool {
      self.queue.is_empty()
   }
}

impl EventBus for EventQueue {
   fn emit(&self, event: LinkEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test]
   async fn test_queue_delivers_in_order() {
      let queue = EventQueue::new();
      let bus: EventSender = queue.clone();

      bus.emit(LinkEvent::StateChanged(AdapterState::PoweredOn));
      bus.emit(LinkEvent::Warning("unknown handle".into()));
      assert_eq!(queue.len(), 2);

      assert_eq!(
         queue.recv().await,
         Some(LinkEvent::StateChanged(AdapterState::PoweredOn))
      );
      assert_eq!(queue.recv().await, Some(LinkEvent::Warning("unknown handle".into())));

      drop(bus);
      assert_eq!(queue.recv().await, None);
   }

   #[tokio::test]
   async fn test_recv_wakes_on_emit() {
      let queue = EventQueue::new();
      let producer = queue.clone();

      let consumer = tokio::spawn(async move { queue.recv().await });
      tokio::task::yield_now().await;
      producer.emit(LinkEvent::StateChanged(AdapterState::PoweredOff));

      assert_eq!(
         consumer.await.unwrap(),
         Some(LinkEvent::StateChanged(AdapterState::PoweredOff))
      );
   }
}
