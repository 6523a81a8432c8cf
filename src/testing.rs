//! Recording doubles for the controller and the collaborator factory.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{
   bluetooth::{
      acl::AclStream,
      hci::{ChannelId, ConnectionHandle, Controller, DeviceAddress, ParameterUpdate},
      session::{
         EventRelay, GattEvent, GattRequest, GattSession, SecurityEvent, SecuritySession,
         SessionFactory, SignalingEvent, SignalingSession,
      },
   },
   error::{LinkError, Result},
   peripheral::protocol::{LongTermKey, PairingRequest},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
   CreateConnection(DeviceAddress),
   CancelConnection,
   Disconnect(ConnectionHandle, u8),
   Acl(ConnectionHandle, ChannelId, Vec<u8>),
   StartEncryption(ConnectionHandle, [u8; 8], [u8; 2], LongTermKey),
   ReadRssi(ConnectionHandle),
   ReadRemoteVersion(ConnectionHandle),
   ReadRemoteFeatures(ConnectionHandle),
   UpdateParameters(ConnectionHandle, ParameterUpdate),
   StopScanning,
}

type Rejects = Box<dyn Fn(&Sent) -> bool + Send + Sync>;

/// Records every command. Commands matched by [`reject`](Self::reject) fail
/// and are not recorded.
#[derive(Default)]
pub struct MockController {
   sent: Mutex<Vec<Sent>>,
   rejects: Mutex<Option<Rejects>>,
}

impl MockController {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn sent(&self) -> Vec<Sent> {
      self.sent.lock().clone()
   }

   pub fn take(&self) -> Vec<Sent> {
      std::mem::take(&mut *self.sent.lock())
   }

   pub fn count(&self, pred: impl Fn(&Sent) -> bool) -> usize {
      self.sent.lock().iter().filter(|s| pred(s)).count()
   }

   pub fn reject(&self, pred: impl Fn(&Sent) -> bool + Send + Sync + 'static) {
      *self.rejects.lock() = Some(Box::new(pred));
   }

   fn record(&self, sent: Sent) -> Result<()> {
      if self.rejects.lock().as_ref().is_some_and(|reject| reject(&sent)) {
         return Err(LinkError::Controller("command disallowed".into()));
      }
      self.sent.lock().push(sent);
      Ok(())
   }
}

impl Controller for MockController {
   fn create_connection(&self, peer: DeviceAddress) -> Result<()> {
      self.record(Sent::CreateConnection(peer))
   }

   fn cancel_connection(&self) -> Result<()> {
      self.record(Sent::CancelConnection)
   }

   fn disconnect(&self, handle: ConnectionHandle, reason: u8) -> Result<()> {
      self.record(Sent::Disconnect(handle, reason))
   }

   fn write_acl(&self, handle: ConnectionHandle, channel: ChannelId, data: &[u8]) -> Result<()> {
      self.record(Sent::Acl(handle, channel, data.to_vec()))
   }

   fn start_encryption(
      &self,
      handle: ConnectionHandle,
      random: [u8; 8],
      diversifier: [u8; 2],
      key: &LongTermKey,
   ) -> Result<()> {
      self.record(Sent::StartEncryption(handle, random, diversifier, *key))
   }

   fn read_rssi(&self, handle: ConnectionHandle) -> Result<()> {
      self.record(Sent::ReadRssi(handle))
   }

   fn read_remote_version(&self, handle: ConnectionHandle) -> Result<()> {
      self.record(Sent::ReadRemoteVersion(handle))
   }

   fn read_remote_features(&self, handle: ConnectionHandle) -> Result<()> {
      self.record(Sent::ReadRemoteFeatures(handle))
   }

   fn update_connection_parameters(
      &self,
      handle: ConnectionHandle,
      update: ParameterUpdate,
   ) -> Result<()> {
      self.record(Sent::UpdateParameters(handle, update))
   }

   fn stop_scanning(&self) -> Result<()> {
      self.record(Sent::StopScanning)
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCall {
   Mtu(u16),
   Request(GattRequest),
   Close,
}

#[derive(Default)]
struct MockLink {
   stream: Option<AclStream>,
   gatt: Vec<GattCall>,
   gatt_relay: Option<EventRelay<GattEvent>>,
   signaling_relay: Option<EventRelay<SignalingEvent>>,
   signaling_closed: bool,
   security: Vec<Option<PairingRequest>>,
   security_relay: Option<EventRelay<SecurityEvent>>,
}

type Links = Arc<Mutex<HashMap<ConnectionHandle, MockLink>>>;

/// Session factory whose sessions record calls per handle and expose their
/// relays so tests can play the collaborator's part.
#[derive(Clone, Default)]
pub struct MockFactory {
   links: Links,
}

impl MockFactory {
   pub fn gatt_log(&self, handle: ConnectionHandle) -> Vec<GattCall> {
      self.links.lock().get(&handle).map(|l| l.gatt.clone()).unwrap_or_default()
   }

   pub fn security_log(&self, handle: ConnectionHandle) -> Vec<Option<PairingRequest>> {
      self
         .links
         .lock()
         .get(&handle)
         .map(|l| l.security.clone())
         .unwrap_or_default()
   }

   pub fn signaling_closed(&self, handle: ConnectionHandle) -> bool {
      self.links.lock().get(&handle).is_some_and(|l| l.signaling_closed)
   }

   pub fn stream(&self, handle: ConnectionHandle) -> Option<AclStream> {
      self.links.lock().get(&handle).and_then(|l| l.stream.clone())
   }

   pub fn gatt_relay(&self, handle: ConnectionHandle) -> EventRelay<GattEvent> {
      self.links.lock()[&handle].gatt_relay.clone().unwrap()
   }

   pub fn signaling_relay(&self, handle: ConnectionHandle) -> EventRelay<SignalingEvent> {
      self.links.lock()[&handle].signaling_relay.clone().unwrap()
   }

   pub fn security_relay(&self, handle: ConnectionHandle) -> EventRelay<SecurityEvent> {
      self.links.lock()[&handle].security_relay.clone().unwrap()
   }
}

struct MockGatt {
   handle: ConnectionHandle,
   links: Links,
}

impl GattSession for MockGatt {
   fn exchange_mtu(&mut self, mtu: u16) -> Result<()> {
      self.links.lock().entry(self.handle).or_default().gatt.push(GattCall::Mtu(mtu));
      Ok(())
   }

   fn request(&mut self, request: GattRequest) -> Result<()> {
      self
         .links
         .lock()
         .entry(self.handle)
         .or_default()
         .gatt
         .push(GattCall::Request(request));
      Ok(())
   }

   fn close(&mut self) {
      self.links.lock().entry(self.handle).or_default().gatt.push(GattCall::Close);
   }
}

struct MockSignaling {
   handle: ConnectionHandle,
   links: Links,
}

impl SignalingSession for MockSignaling {
   fn close(&mut self) {
      self.links.lock().entry(self.handle).or_default().signaling_closed = true;
   }
}

struct MockSecurity {
   handle: ConnectionHandle,
   links: Links,
}

impl SecuritySession for MockSecurity {
   fn send_pairing_request(&mut self) -> Result<()> {
      self.links.lock().entry(self.handle).or_default().security.push(None);
      Ok(())
   }

   fn send_custom_pairing_request(&mut self, request: &PairingRequest) -> Result<()> {
      self
         .links
         .lock()
         .entry(self.handle)
         .or_default()
         .security
         .push(Some(request.clone()));
      Ok(())
   }
}

impl SessionFactory for MockFactory {
   fn gatt(
      &self,
      _peer: DeviceAddress,
      stream: AclStream,
      relay: EventRelay<GattEvent>,
   ) -> Box<dyn GattSession> {
      let handle = stream.handle();
      let mut links = self.links.lock();
      let link = links.entry(handle).or_default();
      link.gatt_relay = Some(relay);
      link.stream = Some(stream);
      Box::new(MockGatt {
         handle,
         links: self.links.clone(),
      })
   }

   fn signaling(
      &self,
      handle: ConnectionHandle,
      _stream: AclStream,
      relay: EventRelay<SignalingEvent>,
   ) -> Box<dyn SignalingSession> {
      self.links.lock().entry(handle).or_default().signaling_relay = Some(relay);
      Box::new(MockSignaling {
         handle,
         links: self.links.clone(),
      })
   }

   fn security(
      &self,
      stream: AclStream,
      _local: DeviceAddress,
      _remote: DeviceAddress,
      relay: EventRelay<SecurityEvent>,
   ) -> Box<dyn SecuritySession> {
      let handle = stream.handle();
      self.links.lock().entry(handle).or_default().security_relay = Some(relay);
      Box::new(MockSecurity {
         handle,
         links: self.links.clone(),
      })
   }
}
