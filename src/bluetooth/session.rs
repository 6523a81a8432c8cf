//! Contracts of the per-connection collaborators.
//!
//! Every established link gets a GATT session, a signaling session and a
//! security (SMP) session, all built by the host's [`SessionFactory`] on top
//! of the link's [`AclStream`]. Collaborators report back through an
//! [`EventRelay`], which posts into the connection manager's mailbox and goes
//! quiet once the link is torn down.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use smol_str::SmolStr;

use crate::{
   bluetooth::{
      acl::AclStream,
      hci::{ConnectionHandle, DeviceAddress, Packet, ParameterUpdate},
   },
   error::Result,
   peripheral::protocol::{AssociationModel, AuthType, KeyMaterial, LongTermKey, PairingRequest},
};

/// Requests forwarded to a connection's GATT session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattRequest {
   DiscoverServices {
      uuids: Vec<SmolStr>,
   },
   DiscoverIncludedServices {
      service: SmolStr,
      uuids: Vec<SmolStr>,
   },
   DiscoverCharacteristics {
      service: SmolStr,
      uuids: Vec<SmolStr>,
   },
   DiscoverDescriptors {
      service: SmolStr,
      characteristic: SmolStr,
   },
   Read {
      service: SmolStr,
      characteristic: SmolStr,
   },
   Write {
      service: SmolStr,
      characteristic: SmolStr,
      data: Packet,
      without_response: bool,
   },
   Broadcast {
      service: SmolStr,
      characteristic: SmolStr,
      enable: bool,
   },
   Notify {
      service: SmolStr,
      characteristic: SmolStr,
      enable: bool,
   },
   ReadValue {
      service: SmolStr,
      characteristic: SmolStr,
      descriptor: SmolStr,
   },
   WriteValue {
      service: SmolStr,
      characteristic: SmolStr,
      descriptor: SmolStr,
      data: Packet,
   },
   ReadHandle {
      attribute: u16,
   },
   WriteHandle {
      attribute: u16,
      data: Packet,
      without_response: bool,
   },
}

/// Results reported by a GATT session. Relayed upward unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
   Mtu(u16),
   ServicesDiscovered {
      uuids: Vec<SmolStr>,
   },
   IncludedServicesDiscovered {
      service: SmolStr,
      uuids: Vec<SmolStr>,
   },
   CharacteristicsDiscovered {
      service: SmolStr,
      uuids: Vec<SmolStr>,
   },
   DescriptorsDiscovered {
      service: SmolStr,
      characteristic: SmolStr,
      uuids: Vec<SmolStr>,
   },
   /// A read response, or a notification when `notification` is set.
   Read {
      service: SmolStr,
      characteristic: SmolStr,
      data: Packet,
      notification: bool,
   },
   Write {
      service: SmolStr,
      characteristic: SmolStr,
   },
   Broadcast {
      service: SmolStr,
      characteristic: SmolStr,
      enabled: bool,
   },
   Notify {
      service: SmolStr,
      characteristic: SmolStr,
      enabled: bool,
   },
   ValueRead {
      service: SmolStr,
      characteristic: SmolStr,
      descriptor: SmolStr,
      data: Packet,
   },
   ValueWrite {
      service: SmolStr,
      characteristic: SmolStr,
      descriptor: SmolStr,
   },
   HandleRead {
      attribute: u16,
      data: Packet,
   },
   HandleWrite {
      attribute: u16,
   },
   HandleNotify {
      attribute: u16,
      data: Packet,
   },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingEvent {
   ConnectionParameterUpdateRequest(ParameterUpdate),
}

/// Events of the SMP engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityEvent {
   /// Short-term key ready; encryption must start right away.
   ShortTermKey(LongTermKey),
   /// Pairing finished, with the negotiated parameters or an SMP reason code.
   PairingComplete(std::result::Result<(AuthType, AssociationModel), u8>),
   /// Raw Pairing Response PDU received from the peer.
   PairingResponse(Packet),
   /// The peer distributed its long-term key.
   KeyDistributed(KeyMaterial),
   /// The engine is done; no further events will follow.
   End,
}

pub trait GattSession: Send {
   fn exchange_mtu(&mut self, mtu: u16) -> Result<()>;

   fn request(&mut self, request: GattRequest) -> Result<()>;

   /// Called once when the link goes away.
   fn close(&mut self) {}
}

pub trait SignalingSession: Send {
   /// Called once when the link goes away.
   fn close(&mut self) {}
}

pub trait SecuritySession: Send {
   fn send_pairing_request(&mut self) -> Result<()>;

   fn send_custom_pairing_request(&mut self, request: &PairingRequest) -> Result<()>;
}

/// Builds the collaborators of a freshly established link.
pub trait SessionFactory: Send + Sync {
   fn gatt(
      &self,
      peer: DeviceAddress,
      stream: AclStream,
      relay: EventRelay<GattEvent>,
   ) -> Box<dyn GattSession>;

   fn signaling(
      &self,
      handle: ConnectionHandle,
      stream: AclStream,
      relay: EventRelay<SignalingEvent>,
   ) -> Box<dyn SignalingSession>;

   fn security(
      &self,
      stream: AclStream,
      local: DeviceAddress,
      remote: DeviceAddress,
      relay: EventRelay<SecurityEvent>,
   ) -> Box<dyn SecuritySession>;
}

/// Type alias for a shareable session factory.
pub type SharedSessionFactory = Arc<dyn SessionFactory>;

type Sink<E> = Arc<dyn Fn(E) -> bool + Send + Sync>;

/// Sending side handed to a collaborator.
///
/// This type is cheaply cloneable. All clones go quiet together when the
/// paired [`RelayGuard`] is revoked or dropped.
pub struct EventRelay<E> {
   sink: Sink<E>,
   live: Arc<AtomicBool>,
}

impl<E> Clone for EventRelay<E> {
   fn clone(&self) -> Self {
      Self {
         sink: self.sink.clone(),
         live: self.live.clone(),
      }
   }
}

impl<E> std::fmt::Debug for EventRelay<E> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("EventRelay")
         .field("live", &self.is_live())
         .finish_non_exhaustive()
   }
}

impl<E> EventRelay<E> {
   /// Creates a relay around `sink`, which returns `false` once its
   /// receiver is gone.
   pub fn new<F>(sink: F) -> (Self, RelayGuard)
   where
      F: Fn(E) -> bool + Send + Sync + 'static,
   {
      let live = Arc::new(AtomicBool::new(true));
      let relay = Self {
         sink: Arc::new(sink),
         live: live.clone(),
      };
      (relay, RelayGuard { live })
   }

   pub fn is_live(&self) -> bool {
      self.live.load(Ordering::Acquire)
   }

   /// Posts an event. Returns `false` if the relay was revoked.
   pub fn send(&self, event: E) -> bool {
      self.is_live() && (self.sink)(event)
   }
}

/// Revokes its relay when dropped.
#[derive(Debug)]
pub struct RelayGuard {
   live: Arc<AtomicBool>,
}

impl RelayGuard {
   /// Returns `true` only for the call that actually revoked the relay.
   pub fn revoke(&self) -> bool {
      self.live.swap(false, Ordering::AcqRel)
   }
}

impl Drop for RelayGuard {
   fn drop(&mut self) {
      self.revoke();
   }
}

#[cfg(test)]
mod tests {
   use parking_lot::Mutex;

   use super::*;

   #[test]
   fn test_relay_goes_quiet_on_revoke() {
      let seen = Arc::new(Mutex::new(Vec::new()));
      let sink = seen.clone();
      let (relay, guard) = EventRelay::new(move |e: u8| {
         sink.lock().push(e);
         true
      });
      let clone = relay.clone();

      assert!(relay.send(1));
      assert!(guard.revoke());
      assert!(!guard.revoke());
      assert!(!clone.send(2));
      assert_eq!(*seen.lock(), vec![1]);
   }

   #[test]
   fn test_relay_dropped_guard() {
      let (relay, guard) = EventRelay::new(|_: ()| true);
      drop(guard);
      assert!(!relay.is_live());
      assert!(!relay.send(()));
   }
}
