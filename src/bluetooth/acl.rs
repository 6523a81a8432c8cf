//! ACL data multiplexing for one link.
//!
//! [`AclStream`] is the shared view of a link that collaborators receive:
//! they write channel-tagged data through it and subscribe to the inbound
//! side. [`AclMultiplexer`] is the manager-owned end that pushes controller
//! data into the stream and wires the link's security session.

use std::sync::{
   Arc, Weak,
   atomic::{AtomicBool, AtomicU64, Ordering},
};

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
   bluetooth::{
      hci::{ChannelId, ConnectionHandle, DeviceAddress, Packet, SharedController},
      session::{EventRelay, RelayGuard, SecurityEvent, SecuritySession, SessionFactory},
   },
   error::{LinkError, Result},
   peripheral::{
      parser::decode_pairing_response,
      protocol::{AssociationModel, AuthType, KeyMaterial, PairingRequest, PairingResponse},
   },
};

const ZERO_RANDOM: [u8; 8] = [0; 8];
const ZERO_DIVERSIFIER: [u8; 2] = [0; 2];

/// Inbound events delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclEvent {
   Data { channel: ChannelId, data: Packet },
   Encryption(bool),
   End,
}

struct Subscriber {
   id: u64,
   channel: Option<ChannelId>,
   tx: mpsc::UnboundedSender<AclEvent>,
}

impl Subscriber {
   fn wants(&self, event: &AclEvent) -> bool {
      match (event, self.channel) {
         (AclEvent::Data { channel, .. }, Some(filter)) => *channel == filter,
         _ => true,
      }
   }
}

struct StreamInner {
   handle: ConnectionHandle,
   controller: SharedController,
   subscribers: Mutex<Vec<Subscriber>>,
   next_id: AtomicU64,
   ended: AtomicBool,
}

/// Shared view of one ACL link.
///
/// This type is cheaply cloneable.
#[derive(Clone)]
pub struct AclStream {
   inner: Arc<StreamInner>,
}

impl std::fmt::Debug for AclStream {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("AclStream")
         .field("handle", &self.inner.handle)
         .field("ended", &self.is_ended())
         .finish_non_exhaustive()
   }
}

impl AclStream {
   pub fn new(handle: ConnectionHandle, controller: SharedController) -> Self {
      Self {
         inner: Arc::new(StreamInner {
            handle,
            controller,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            ended: AtomicBool::new(false),
         }),
      }
   }

   pub fn handle(&self) -> ConnectionHandle {
      self.inner.handle
   }

   pub fn is_ended(&self) -> bool {
      self.inner.ended.load(Ordering::Acquire)
   }

   /// Writes to the controller, tagged with this link's handle.
   pub fn write(&self, channel: ChannelId, data: &[u8]) -> Result<()> {
      if self.is_ended() {
         return Err(LinkError::ConnectionClosed);
      }
      debug!("→ {} [{channel}]: {}", self.inner.handle, hex::encode(data));
      self.inner.controller.write_acl(self.inner.handle, channel, data)
   }

   /// Subscribes to inbound data, optionally restricted to one channel.
   /// Encryption changes and end-of-stream reach every subscriber.
   pub fn subscribe(&self, channel: Option<ChannelId>) -> AclSubscription {
      let (tx, rx) = mpsc::unbounded_channel();
      let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

      if self.is_ended() {
         let _ = tx.send(AclEvent::End);
      } else {
         self.inner.subscribers.lock().push(Subscriber { id, channel, tx });
      }

      AclSubscription {
         id,
         rx,
         stream: Arc::downgrade(&self.inner),
      }
   }

   /// Pushes inbound data; `None` ends the stream.
   pub fn push(&self, channel: ChannelId, data: Option<Packet>) {
      if self.is_ended() {
         warn!("Dropping data for ended link {}", self.inner.handle);
         return;
      }

      match data {
         Some(data) => {
            debug!("← {} [{channel}]: {}", self.inner.handle, hex::encode(&data));
            self.broadcast(&AclEvent::Data { channel, data });
         },
         None => self.end(),
      }
   }

   /// Ends the stream. Subscribers receive [`AclEvent::End`] and are dropped.
   pub fn end(&self) {
      if self.inner.ended.swap(true, Ordering::AcqRel) {
         return;
      }
      debug!("Link {} ended", self.inner.handle);
      let subscribers = std::mem::take(&mut *self.inner.subscribers.lock());
      for sub in subscribers {
         let _ = sub.tx.send(AclEvent::End);
      }
   }

   pub fn push_encrypt(&self, encrypted: bool) {
      if self.is_ended() {
         return;
      }
      self.broadcast(&AclEvent::Encryption(encrypted));
   }

   fn broadcast(&self, event: &AclEvent) {
      self
         .inner
         .subscribers
         .lock()
         .retain(|sub| !sub.wants(event) || sub.tx.send(event.clone()).is_ok());
   }

   #[cfg(test)]
   pub(crate) fn subscriber_count(&self) -> usize {
      self.inner.subscribers.lock().len()
   }
}

/// Receiving side of [`AclStream::subscribe`]. Dropping it unsubscribes.
pub struct AclSubscription {
   id: u64,
   rx: mpsc::UnboundedReceiver<AclEvent>,
   stream: Weak<StreamInner>,
}

impl AclSubscription {
   /// Returns `None` after [`AclEvent::End`] has been delivered.
   pub async fn recv(&mut self) -> Option<AclEvent> {
      self.rx.recv().await
   }

   pub fn try_recv(&mut self) -> Option<AclEvent> {
      self.rx.try_recv().ok()
   }

   pub fn unsubscribe(self) {}
}

impl Drop for AclSubscription {
   fn drop(&mut self) {
      if let Some(stream) = self.stream.upgrade() {
         stream.subscribers.lock().retain(|sub| sub.id != self.id);
      }
   }
}

/// Security results relayed to the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecuritySignal {
   PairingOutcome(std::result::Result<(AuthType, AssociationModel), u8>),
   PairingResponse(PairingResponse),
   KeyDistributed(KeyMaterial),
}

/// Manager-owned end of a link: the stream plus its one security session.
pub struct AclMultiplexer {
   stream: AclStream,
   security: Box<dyn SecuritySession>,
   security_relay: Option<RelayGuard>,
}

impl AclMultiplexer {
   pub fn new(
      handle: ConnectionHandle,
      controller: SharedController,
      local: DeviceAddress,
      remote: DeviceAddress,
      factory: &dyn SessionFactory,
      relay: (EventRelay<SecurityEvent>, RelayGuard),
   ) -> Self {
      let stream = AclStream::new(handle, controller);
      let (relay, guard) = relay;
      let security = factory.security(stream.clone(), local, remote, relay);
      Self {
         stream,
         security,
         security_relay: Some(guard),
      }
   }

   pub fn handle(&self) -> ConnectionHandle {
      self.stream.handle()
   }

   pub fn stream(&self) -> &AclStream {
      &self.stream
   }

   pub fn push(&self, channel: ChannelId, data: Option<Packet>) {
      self.stream.push(channel, data);
   }

   pub fn push_encrypt(&self, encrypted: bool) {
      self.stream.push_encrypt(encrypted);
   }

   /// Tears the link down: ends the stream and detaches security.
   pub fn end(&mut self) {
      self.stream.end();
      self.detach();
   }

   /// Starts pairing with the security session's default request.
   pub fn encrypt(&mut self) -> Result<()> {
      debug!("Encrypting link {}", self.handle());
      self.security.send_pairing_request()
   }

   pub fn pair(&mut self, request: &PairingRequest) -> Result<()> {
      debug!(
         "Pairing link {} with {} ({})",
         self.handle(),
         hex::encode(request.pdu()),
         request.passkey_option
      );
      self.security.send_custom_pairing_request(request)
   }

   pub fn is_security_attached(&self) -> bool {
      self.security_relay.is_some()
   }

   /// Detaches the security relay. Only the first call has an effect.
   pub fn detach(&mut self) -> bool {
      self.security_relay.take().is_some_and(|guard| guard.revoke())
   }

   /// Handles an event of the security session.
   pub fn on_security_event(&mut self, event: SecurityEvent) -> Option<SecuritySignal> {
      if !self.is_security_attached() {
         debug!("Security event after detach on {}: {event:?}", self.handle());
         return None;
      }

      match event {
         SecurityEvent::ShortTermKey(stk) => {
            let handle = self.handle();
            if let Err(e) = self
               .stream
               .inner
               .controller
               .start_encryption(handle, ZERO_RANDOM, ZERO_DIVERSIFIER, &stk)
            {
               warn!("Failed to start encryption on {handle}: {e}");
            }
            None
         },
         SecurityEvent::PairingComplete(outcome) => Some(SecuritySignal::PairingOutcome(outcome)),
         SecurityEvent::PairingResponse(pdu) => match decode_pairing_response(&pdu) {
            Ok(response) => Some(SecuritySignal::PairingResponse(response)),
            Err(e) => {
               warn!("Ignoring pairing response on {}: {e}", self.handle());
               None
            },
         },
         SecurityEvent::KeyDistributed(keys) => Some(SecuritySignal::KeyDistributed(keys)),
         SecurityEvent::End => {
            debug!("Security session on {} ended", self.handle());
            self.detach();
            None
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      bluetooth::hci::AddressType,
      peripheral::protocol::LongTermKey,
      testing::{MockController, MockFactory, Sent},
   };

   const HANDLE: ConnectionHandle = ConnectionHandle::new(0x40);

   fn address(last: u8) -> DeviceAddress {
      DeviceAddress::new(
         crate::bluetooth::hci::BdAddr::new([0, 1, 2, 3, 4, last]),
         AddressType::Public,
      )
   }

   fn multiplexer(controller: &Arc<MockController>, factory: &MockFactory) -> AclMultiplexer {
      AclMultiplexer::new(
         HANDLE,
         controller.clone(),
         address(0),
         address(1),
         factory,
         EventRelay::new(|_| true),
      )
   }

   #[tokio::test]
   async fn test_channel_filtering_and_end() {
      let controller = MockController::new();
      let factory = MockFactory::default();
      let mux = multiplexer(&controller, &factory);

      let mut att = mux.stream().subscribe(Some(ChannelId::ATT));
      let mut all = mux.stream().subscribe(None);

      mux.push(ChannelId::SMP, Some(Packet::from_slice(&[0x0b])));
      mux.push(ChannelId::ATT, Some(Packet::from_slice(&[0x1b, 0x03])));
      mux.push_encrypt(true);
      mux.push(ChannelId::ATT, None);

      assert_eq!(
         att.recv().await,
         Some(AclEvent::Data {
            channel: ChannelId::ATT,
            data: Packet::from_slice(&[0x1b, 0x03])
         })
      );
      assert_eq!(att.recv().await, Some(AclEvent::Encryption(true)));
      assert_eq!(att.recv().await, Some(AclEvent::End));
      assert_eq!(att.recv().await, None);

      let mut seen = Vec::new();
      while let Some(event) = all.recv().await {
         seen.push(event);
      }
      assert_eq!(seen.len(), 4);
      assert!(matches!(seen[0], AclEvent::Data { channel: ChannelId::SMP, .. }));
   }

   #[tokio::test]
   async fn test_nothing_after_end() {
      let controller = MockController::new();
      let factory = MockFactory::default();
      let mux = multiplexer(&controller, &factory);

      mux.push(ChannelId::ATT, None);
      mux.push(ChannelId::ATT, Some(Packet::from_slice(&[1])));

      let mut late = mux.stream().subscribe(None);
      assert_eq!(late.recv().await, Some(AclEvent::End));
      assert_eq!(late.recv().await, None);

      assert!(matches!(
         mux.stream().write(ChannelId::ATT, &[1, 2]),
         Err(LinkError::ConnectionClosed)
      ));
   }

   #[test]
   fn test_unsubscribe_on_drop() {
      let controller = MockController::new();
      let factory = MockFactory::default();
      let mux = multiplexer(&controller, &factory);

      let sub = mux.stream().subscribe(None);
      let other = mux.stream().subscribe(Some(ChannelId::SMP));
      assert_eq!(mux.stream().subscriber_count(), 2);

      drop(sub);
      other.unsubscribe();
      assert_eq!(mux.stream().subscriber_count(), 0);
   }

   #[test]
   fn test_write_is_tagged() {
      let controller = MockController::new();
      let factory = MockFactory::default();
      let mux = multiplexer(&controller, &factory);

      mux.stream().write(ChannelId::ATT, &[0x02, 0x00, 0x01]).unwrap();
      assert_eq!(
         controller.sent(),
         vec![Sent::Acl(HANDLE, ChannelId::ATT, vec![0x02, 0x00, 0x01])]
      );
   }

   #[test]
   fn test_stk_starts_encryption_with_zeroes() {
      let controller = MockController::new();
      let factory = MockFactory::default();
      let mut mux = multiplexer(&controller, &factory);

      let stk = LongTermKey::new([0x5a; 16]);
      assert_eq!(mux.on_security_event(SecurityEvent::ShortTermKey(stk)), None);
      assert_eq!(
         controller.sent(),
         vec![Sent::StartEncryption(HANDLE, [0; 8], [0; 2], stk)]
      );
   }

   #[test]
   fn test_security_relays_and_one_shot_end() {
      let controller = MockController::new();
      let factory = MockFactory::default();
      let mut mux = multiplexer(&controller, &factory);

      let pdu = Packet::from_slice(&[0x02, 0x03, 0x00, 0x2d, 0x10, 0x07, 0x07]);
      let Some(SecuritySignal::PairingResponse(resp)) =
         mux.on_security_event(SecurityEvent::PairingResponse(pdu))
      else {
         panic!("expected decoded pairing response");
      };
      assert_eq!(resp.max_encryption_key_size, 16);

      assert_eq!(
         mux.on_security_event(SecurityEvent::PairingResponse(Packet::from_slice(&[0x02]))),
         None
      );
      assert_eq!(
         mux.on_security_event(SecurityEvent::PairingComplete(Err(0x03))),
         Some(SecuritySignal::PairingOutcome(Err(0x03)))
      );

      assert_eq!(mux.on_security_event(SecurityEvent::End), None);
      assert!(!mux.is_security_attached());
      assert!(!mux.detach());
      assert_eq!(
         mux.on_security_event(SecurityEvent::PairingComplete(Err(0x03))),
         None
      );
   }

   #[test]
   fn test_pairing_requests_reach_security() {
      let controller = MockController::new();
      let factory = MockFactory::default();
      let mut mux = multiplexer(&controller, &factory);

      mux.encrypt().unwrap();
      let req = PairingRequest::new(
         &[0x01, 0x03, 0x00, 0x01, 0x10, 0x07, 0x07],
         Default::default(),
         None,
      )
      .unwrap();
      mux.pair(&req).unwrap();

      let security = factory.security_log(HANDLE);
      assert_eq!(security, vec![None, Some(req)]);
   }
}
