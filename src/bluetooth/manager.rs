//! Connection manager for LE links.
//!
//! This module serializes connection attempts against the controller, maps
//! controller handles to peripheral identities and owns every resource
//! derived from an established link. All state lives in a single actor task;
//! the public [`ConnectionManager`] only posts commands to it.

use std::{collections::HashMap, time::Duration};

use log::{debug, error, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
};

use crate::{
   bluetooth::{
      acl::{AclMultiplexer, SecuritySignal},
      hci::{
         AdapterState, BdAddr, ChannelId, ConnectionHandle, ConnectionParams, ControllerEvent,
         DeviceAddress, Packet, Role, SharedController,
      },
      links::{Admission, ConnectQueue, LinkTable},
      session::{
         EventRelay, GattEvent, GattRequest, GattSession, RelayGuard, SecurityEvent,
         SharedSessionFactory, SignalingEvent, SignalingSession,
      },
      status::HciStatus,
   },
   config::Config,
   error::{LinkError, Result},
   event::{EventSender, LinkEvent},
   peripheral::{
      device::{LinkState, PeripheralId, PeripheralInfo},
      pairing::{PairingCoordinator, PairingError, PairingOutcome, PairingResult},
      parser::decode_feature_bitmap,
      protocol::{FeatureBitmap, PairingRequest, VersionInfo},
   },
   timer::Timer,
};

/// Reason sent with every host-initiated disconnect.
const DISCONNECT_REASON: HciStatus = HciStatus::REMOTE_USER_TERMINATED;
/// Reported for a link the controller replaced without a disconnect event.
const LOST_LINK_REASON: HciStatus = HciStatus::CONNECTION_TIMEOUT;

type Reply<T> = oneshot::Sender<Result<T>>;

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   Connect(DeviceAddress, Reply<PeripheralId>),
   Disconnect(PeripheralId, Reply<()>),
   Encrypt(PeripheralId, Reply<()>),
   Pair {
      id: PeripheralId,
      request: Option<PairingRequest>,
      timeout: Option<Duration>,
      reply: Reply<PairingOutcome>,
   },
   StopPair(PeripheralId, Reply<()>),
   ReadRssi(PeripheralId, Reply<i8>),
   ReadRemoteVersion(PeripheralId, Reply<VersionInfo>),
   ReadRemoteFeatures(PeripheralId, Reply<FeatureBitmap>),
   Gatt(PeripheralId, GattRequest, Reply<()>),
   GetPeripheral(PeripheralId, oneshot::Sender<Option<PeripheralInfo>>),
   GetConnected(oneshot::Sender<Vec<PeripheralInfo>>),
   Shutdown(Reply<()>),
}

/// Identifies one established link. Handles are reused by the controller,
/// so relayed events also carry the serial of the link they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LinkKey {
   handle: ConnectionHandle,
   serial: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteRead {
   Rssi,
   Version,
   Features,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
   Connect,
   Disconnect,
   Pairing,
   Read(RemoteRead),
}

/// Messages the actor posts to itself: timer expiries and collaborator
/// events.
#[derive(Debug)]
enum Loopback {
   Timeout {
      id: PeripheralId,
      deadline: Deadline,
      token: u64,
   },
   /// The controller never confirmed a cancelled attempt.
   CancelExpired {
      token: u64,
   },
   Gatt {
      link: LinkKey,
      event: GattEvent,
   },
   Signaling {
      link: LinkKey,
      event: SignalingEvent,
   },
   Security {
      link: LinkKey,
      event: SecurityEvent,
   },
}

// === Main Manager ===

/// Handle to the connection manager actor.
///
/// This type is cheaply cloneable. Dropping every clone stops the actor,
/// which then tears down all links as [`shutdown`](Self::shutdown) would.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl ConnectionManager {
   /// Spawns the actor. Must be called from within a tokio runtime.
   ///
   /// `controller_rx` carries the parsed events of the HCI transport that
   /// `controller` sends commands to.
   pub fn new(
      config: Config,
      controller: SharedController,
      factory: SharedSessionFactory,
      event_tx: EventSender,
      controller_rx: mpsc::Receiver<ControllerEvent>,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(config.inbox_capacity.max(1));
      tokio::spawn(
         ManagerActor::new(config, controller, factory, event_tx, command_rx, controller_rx).run(),
      );
      Self { inbox: command_tx }
   }

   async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| LinkError::ManagerShutdown)?;
      rx.await.map_err(|_| LinkError::ManagerShutdown)?
   }

   /// Connects to a peripheral. Attempts run one at a time in request
   /// order; a second call for an address already pending joins the first.
   pub async fn connect(&self, address: DeviceAddress) -> Result<PeripheralId> {
      self
         .request(|tx| ManagerCommand::Connect(address, tx))
         .await
   }

   /// Disconnects a peripheral, or cancels its pending connection attempt.
   pub async fn disconnect(&self, id: &PeripheralId) -> Result<()> {
      let id = id.clone();
      self.request(|tx| ManagerCommand::Disconnect(id, tx)).await
   }

   /// Sends the security session's default pairing request.
   pub async fn encrypt(&self, id: &PeripheralId) -> Result<()> {
      let id = id.clone();
      self.request(|tx| ManagerCommand::Encrypt(id, tx)).await
   }

   /// Pairs with a peripheral and waits for the outcome.
   ///
   /// Without a `request` the default pairing request is sent. Without a
   /// `timeout` the configured pairing timeout applies.
   pub async fn pair(
      &self,
      id: &PeripheralId,
      request: Option<PairingRequest>,
      timeout: Option<Duration>,
   ) -> Result<PairingOutcome> {
      let id = id.clone();
      self
         .request(|reply| ManagerCommand::Pair {
            id,
            request,
            timeout,
            reply,
         })
         .await
   }

   /// Abandons a running pairing attempt. Calling it again is a no-op.
   pub async fn stop_pair(&self, id: &PeripheralId) -> Result<()> {
      let id = id.clone();
      self.request(|tx| ManagerCommand::StopPair(id, tx)).await
   }

   pub async fn read_rssi(&self, id: &PeripheralId) -> Result<i8> {
      let id = id.clone();
      self.request(|tx| ManagerCommand::ReadRssi(id, tx)).await
   }

   pub async fn read_remote_version(&self, id: &PeripheralId) -> Result<VersionInfo> {
      let id = id.clone();
      self
         .request(|tx| ManagerCommand::ReadRemoteVersion(id, tx))
         .await
   }

   pub async fn read_remote_features(&self, id: &PeripheralId) -> Result<FeatureBitmap> {
      let id = id.clone();
      self
         .request(|tx| ManagerCommand::ReadRemoteFeatures(id, tx))
         .await
   }

   /// Forwards a request to the peripheral's GATT session. Results arrive
   /// as [`LinkEvent::Gatt`].
   pub async fn gatt(&self, id: &PeripheralId, request: GattRequest) -> Result<()> {
      let id = id.clone();
      self
         .request(|tx| ManagerCommand::Gatt(id, request, tx))
         .await
   }

   pub async fn peripheral(&self, id: &PeripheralId) -> Result<PeripheralInfo> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::GetPeripheral(id.clone(), tx))
         .await
         .map_err(|_| LinkError::ManagerShutdown)?;

      rx.await
         .ok()
         .flatten()
         .ok_or_else(|| LinkError::DeviceNotFound(id.clone()))
   }

   pub async fn connected(&self) -> Vec<PeripheralInfo> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetConnected(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   /// Stops scanning, disconnects every link, fails every pending request
   /// and stops the actor.
   pub async fn shutdown(&self) -> Result<()> {
      self.request(ManagerCommand::Shutdown).await
   }
}

// === Manager Actor ===

/// Waiters of one kind of request, plus the deadline they share.
struct Pending<T> {
   waiters: Vec<Reply<T>>,
   timer: Timer,
   token: u64,
}

impl<T> Default for Pending<T> {
   fn default() -> Self {
      Self {
         waiters: Vec::new(),
         timer: Timer::default(),
         token: 0,
      }
   }
}

impl<T> Pending<T> {
   fn is_waiting(&self) -> bool {
      !self.waiters.is_empty()
   }

   fn arm(&mut self, mailbox: &mpsc::UnboundedSender<Loopback>, delay: Duration, msg: Loopback) {
      if let Loopback::Timeout { token, .. } = msg {
         self.token = token;
      }
      self.timer = Timer::arm(mailbox, delay, msg);
   }

   fn is_current(&self, token: u64) -> bool {
      self.is_waiting() && self.token == token
   }

   fn settle(&mut self, result: impl Fn() -> Result<T>) {
      self.timer.cancel();
      for waiter in self.waiters.drain(..) {
         let _ = waiter.send(result());
      }
   }

   fn fail(&mut self, err: impl Fn() -> LinkError) {
      self.settle(|| Err(err()));
   }
}

struct ManagedPeripheral {
   info: PeripheralInfo,
   pairing: PairingCoordinator,
   connect: Pending<PeripheralId>,
   disconnect: Pending<()>,
   pair: Pending<PairingOutcome>,
   rssi: Pending<i8>,
   version: Pending<VersionInfo>,
   features: Pending<FeatureBitmap>,
}

impl ManagedPeripheral {
   fn new(address: DeviceAddress) -> Self {
      Self {
         info: PeripheralInfo::new(address),
         pairing: PairingCoordinator::new(),
         connect: Pending::default(),
         disconnect: Pending::default(),
         pair: Pending::default(),
         rssi: Pending::default(),
         version: Pending::default(),
         features: Pending::default(),
      }
   }

   fn snapshot(&self) -> PeripheralInfo {
      let mut info = self.info.clone();
      info.pairing = self.pairing.status();
      info
   }

   fn fail_all(&mut self, err: impl Fn() -> LinkError) {
      self.pairing.reset();
      self.connect.fail(&err);
      self.disconnect.fail(&err);
      self.pair.fail(&err);
      self.rssi.fail(&err);
      self.version.fail(&err);
      self.features.fail(&err);
   }
}

/// Resources derived from one established link.
struct ConnectionSession {
   serial: u64,
   id: PeripheralId,
   mux: AclMultiplexer,
   gatt: Box<dyn GattSession>,
   signaling: Box<dyn SignalingSession>,
   relays: [RelayGuard; 2],
}

impl ConnectionSession {
   /// Ends the stream and silences every collaborator.
   fn release(mut self) {
      self.mux.end();
      for relay in &self.relays {
         relay.revoke();
      }
      self.gatt.close();
      self.signaling.close();
   }
}

struct ManagerActor {
   config: Config,
   controller: SharedController,
   factory: SharedSessionFactory,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   controller_rx: mpsc::Receiver<ControllerEvent>,
   loopback_rx: mpsc::UnboundedReceiver<Loopback>,
   loopback_tx: mpsc::UnboundedSender<Loopback>,

   // State
   adapter_state: AdapterState,
   local_address: DeviceAddress,
   queue: ConnectQueue,
   links: LinkTable,
   connections: HashMap<ConnectionHandle, ConnectionSession>,
   peripherals: HashMap<PeripheralId, ManagedPeripheral>,
   cancel_guard: Timer,
   cancel_token: u64,
   next_token: u64,
}

impl ManagerActor {
   fn new(
      config: Config,
      controller: SharedController,
      factory: SharedSessionFactory,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
      controller_rx: mpsc::Receiver<ControllerEvent>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
      Self {
         config,
         controller,
         factory,
         event_tx,
         command_rx,
         controller_rx,
         loopback_rx,
         loopback_tx,
         adapter_state: AdapterState::Unknown,
         local_address: DeviceAddress::default(),
         queue: ConnectQueue::new(),
         links: LinkTable::new(),
         connections: HashMap::new(),
         peripherals: HashMap::new(),
         cancel_guard: Timer::default(),
         cancel_token: 0,
         next_token: 0,
      }
   }

   async fn run(mut self) {
      info!("Connection manager starting up");

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Connection manager shutting down");
                     break;
                 };
                 if !self.handle_command(cmd) {
                     return;
                 }
             }
             Some(event) = self.controller_rx.recv() => {
                 self.handle_controller_event(event);
             }
             Some(msg) = self.loopback_rx.recv() => {
                 self.handle_loopback(msg);
             }
         }
      }

      self.cleanup();
   }

   fn token(&mut self) -> u64 {
      self.next_token = self.next_token.wrapping_add(1);
      self.next_token
   }

   fn emit(&self, event: LinkEvent) {
      self.event_tx.emit(event);
   }

   /// Logs an advisory and reports it upward.
   fn advise(&self, message: String) {
      warn!("{message}");
      self.emit(LinkEvent::Warning(message.into()));
   }

   fn connected_handle(&self, id: &PeripheralId) -> Result<ConnectionHandle> {
      self.links.handle(id).ok_or_else(|| {
         if self.peripherals.contains_key(id) {
            LinkError::DeviceNotConnected
         } else {
            LinkError::DeviceNotFound(id.clone())
         }
      })
   }

   fn connection(&mut self, link: LinkKey) -> Option<&mut ConnectionSession> {
      self
         .connections
         .get_mut(&link.handle)
         .filter(|c| c.serial == link.serial)
   }

   fn relay<E: Send + 'static>(
      &self,
      wrap: impl Fn(E) -> Loopback + Send + Sync + 'static,
   ) -> (EventRelay<E>, RelayGuard) {
      let loopback = self.loopback_tx.clone();
      EventRelay::new(move |event| loopback.send(wrap(event)).is_ok())
   }

   fn handle_command(&mut self, cmd: ManagerCommand) -> bool {
      match cmd {
         ManagerCommand::Connect(address, reply) => {
            self.handle_connect(address, reply);
         },
         ManagerCommand::Disconnect(id, reply) => {
            self.handle_disconnect(id, reply);
         },
         ManagerCommand::Encrypt(id, reply) => {
            let result = self.encrypt(&id);
            let _ = reply.send(result);
         },
         ManagerCommand::Pair {
            id,
            request,
            timeout,
            reply,
         } => {
            self.handle_pair(id, request, timeout, reply);
         },
         ManagerCommand::StopPair(id, reply) => {
            let result = self.stop_pair(&id);
            let _ = reply.send(result);
         },
         ManagerCommand::ReadRssi(id, reply) => {
            self.begin_read(id, RemoteRead::Rssi, reply, |p| &mut p.rssi);
         },
         ManagerCommand::ReadRemoteVersion(id, reply) => {
            self.begin_read(id, RemoteRead::Version, reply, |p| &mut p.version);
         },
         ManagerCommand::ReadRemoteFeatures(id, reply) => {
            self.begin_read(id, RemoteRead::Features, reply, |p| &mut p.features);
         },
         ManagerCommand::Gatt(id, request, reply) => {
            let result = self.gatt_request(&id, request);
            let _ = reply.send(result);
         },
         ManagerCommand::GetPeripheral(id, reply) => {
            let info = self.peripherals.get(&id).map(ManagedPeripheral::snapshot);
            let _ = reply.send(info);
         },
         ManagerCommand::GetConnected(reply) => {
            let infos = self
               .links
               .handles()
               .filter_map(|h| self.links.id(h))
               .filter_map(|id| self.peripherals.get(id))
               .map(ManagedPeripheral::snapshot)
               .collect();
            let _ = reply.send(infos);
         },
         ManagerCommand::Shutdown(reply) => {
            self.cleanup();
            let _ = reply.send(Ok(()));
            return false;
         },
      }
      true
   }

   // === Connection attempts ===

   fn handle_connect(&mut self, address: DeviceAddress, reply: Reply<PeripheralId>) {
      let id = PeripheralId::from_address(&address.address);
      if self.links.handle(&id).is_some() {
         let _ = reply.send(Err(LinkError::AlreadyConnected));
         return;
      }

      if self.adapter_state != AdapterState::PoweredOn {
         debug!("Connecting to {id} while adapter is {}", self.adapter_state);
      }

      let admission = self.queue.request(address);
      let token = self.token();
      let timeout = self.config.connect_timeout();
      let peripheral = self
         .peripherals
         .entry(id.clone())
         .or_insert_with(|| ManagedPeripheral::new(address));
      peripheral.info.address = address;
      peripheral.info.state = LinkState::Connecting;
      peripheral.connect.waiters.push(reply);

      match admission {
         Admission::AlreadyPending => {
            debug!("Joining pending connection attempt to {id}");
         },
         Admission::Queued | Admission::Issue => {
            peripheral.connect.arm(
               &self.loopback_tx,
               timeout,
               Loopback::Timeout {
                  id,
                  deadline: Deadline::Connect,
                  token,
               },
            );
            if admission == Admission::Issue && !self.issue(address) {
               self.advance_queue();
            }
         },
      }
   }

   /// Sends the create-connection command for the in-flight address.
   /// On failure the slot is freed and `false` returned.
   fn issue(&mut self, peer: DeviceAddress) -> bool {
      info!("Connecting to {peer}");
      let Err(e) = self.controller.create_connection(peer) else {
         return true;
      };

      error!("Failed to create connection to {peer}: {e}");
      self.complete_in_flight();
      self.queue.forget(&peer.address);
      let reason: SmolStr = e.to_string().into();
      let id = PeripheralId::from_address(&peer.address);
      if let Some(peripheral) = self.peripherals.get_mut(&id) {
         peripheral.info.state = LinkState::Disconnected;
         peripheral.connect.fail(|| LinkError::Controller(reason.clone()));
      }
      false
   }

   /// Frees the in-flight slot.
   fn complete_in_flight(&mut self) -> Option<DeviceAddress> {
      self.cancel_guard.cancel();
      self.queue.complete()
   }

   /// Cancels the attempt in flight. Its slot is freed by the controller's
   /// completion event, by a guard timer when that event never comes, or at
   /// once when the cancel cannot be sent.
   fn cancel_in_flight(&mut self) {
      let Some(peer) = self.queue.cancel() else {
         return;
      };
      if let Err(e) = self.controller.cancel_connection() {
         error!("Failed to cancel connection to {peer}: {e}");
         self.complete_in_flight();
         self.advance_queue();
         return;
      }

      let token = self.token();
      self.cancel_token = token;
      self.cancel_guard = Timer::arm(
         &self.loopback_tx,
         self.config.connect_timeout(),
         Loopback::CancelExpired { token },
      );
   }

   fn on_cancel_expired(&mut self, token: u64) {
      if token != self.cancel_token || !self.queue.is_cancelling() {
         return;
      }
      if let Some(peer) = self.complete_in_flight() {
         warn!("Cancel of {peer} was never confirmed, releasing the slot");
      }
      self.advance_queue();
   }

   fn advance_queue(&mut self) {
      while let Some(next) = self.queue.advance() {
         if self.issue(next) {
            return;
         }
      }
      debug!("Connection queue is empty");
   }

   fn on_connection_complete(
      &mut self,
      status: u8,
      handle: ConnectionHandle,
      role: Role,
      peer: DeviceAddress,
      params: ConnectionParams,
   ) {
      let status = HciStatus(status);
      if !status.is_success() {
         if peer.address != BdAddr::any()
            && self
               .queue
               .in_flight()
               .is_some_and(|p| p.address != peer.address)
         {
            debug!("Ignoring failure for {peer}, another attempt is in flight");
            return;
         }

         let cancelled = self.queue.is_cancelling();
         match self.complete_in_flight() {
            Some(target) if cancelled => {
               debug!("Cancelled attempt to {target} ended: {status}");
            },
            Some(target) => {
               self.queue.forget(&target.address);
               let id = PeripheralId::from_address(&target.address);
               warn!("Connection to {target} failed: {status}");
               if let Some(peripheral) = self.peripherals.get_mut(&id) {
                  peripheral.info.state = LinkState::Disconnected;
                  peripheral.connect.fail(|| LinkError::Hci(status));
               }
               self.emit(LinkEvent::ConnectFailed { id, status });
            },
            None => warn!("Connection failure with no attempt in flight: {status}"),
         }
         self.advance_queue();
         return;
      }

      let completes_attempt = self.queue.is_in_flight(&peer.address);
      if !self.queue.is_requested(&peer.address) {
         warn!("Connection with {peer} was not requested, disconnecting");
         if let Err(e) = self.controller.disconnect(handle, DISCONNECT_REASON.code()) {
            error!("Failed to disconnect {handle}: {e}");
         }
         if completes_attempt {
            self.complete_in_flight();
            self.advance_queue();
         }
         return;
      }

      // A retry queued behind a cancelled attempt is satisfied by this link.
      self.queue.forget(&peer.address);
      self.queue.remove_queued(&peer.address, false);
      if completes_attempt {
         self.complete_in_flight();
      }

      self.establish(handle, role, peer, params);

      if completes_attempt {
         self.advance_queue();
      }
   }

   fn establish(
      &mut self,
      handle: ConnectionHandle,
      role: Role,
      peer: DeviceAddress,
      params: ConnectionParams,
   ) {
      let id = PeripheralId::from_address(&peer.address);
      if self.links.id(handle).is_some() {
         warn!("Handle {handle} reused before its disconnect was reported");
         self.teardown(handle, LOST_LINK_REASON);
      }

      let link = LinkKey {
         handle,
         serial: self.token(),
      };

      let mux = AclMultiplexer::new(
         handle,
         self.controller.clone(),
         self.local_address,
         peer,
         self.factory.as_ref(),
         self.relay(move |event| Loopback::Security { link, event }),
      );
      let (gatt_relay, gatt_guard) = self.relay(move |event| Loopback::Gatt { link, event });
      let mut gatt = self.factory.gatt(peer, mux.stream().clone(), gatt_relay);
      let (signaling_relay, signaling_guard) =
         self.relay(move |event| Loopback::Signaling { link, event });
      let signaling = self
         .factory
         .signaling(handle, mux.stream().clone(), signaling_relay);

      if let Err(e) = gatt.exchange_mtu(self.config.att_mtu) {
         warn!("MTU exchange with {peer} failed: {e}");
      }

      self.links.insert(handle, id.clone());
      self.connections.insert(
         handle,
         ConnectionSession {
            serial: link.serial,
            id: id.clone(),
            mux,
            gatt,
            signaling,
            relays: [gatt_guard, signaling_guard],
         },
      );

      let peripheral = self
         .peripherals
         .entry(id.clone())
         .or_insert_with(|| ManagedPeripheral::new(peer));
      peripheral.info.address = peer;
      peripheral.info.state = LinkState::Connected;
      peripheral.info.handle = Some(handle);
      peripheral.info.encrypted = false;
      peripheral.connect.settle(|| Ok(id.clone()));

      info!("Connected to {peer} as {id} on {handle}");
      self.emit(LinkEvent::Connected {
         id,
         handle,
         address: peer,
         role,
         params,
      });
   }

   // === Teardown ===

   fn handle_disconnect(&mut self, id: PeripheralId, reply: Reply<()>) {
      let token = self.token();
      let Some(peripheral) = self.peripherals.get_mut(&id) else {
         let _ = reply.send(Err(LinkError::DeviceNotFound(id)));
         return;
      };
      let address = peripheral.info.address.address;

      if let Some(handle) = self.links.handle(&id) {
         if let Err(e) = self.controller.disconnect(handle, DISCONNECT_REASON.code()) {
            let _ = reply.send(Err(e));
            return;
         }
         peripheral.info.state = LinkState::Disconnecting;
         peripheral.disconnect.waiters.push(reply);
         if !peripheral.disconnect.timer.is_armed() {
            peripheral.disconnect.arm(
               &self.loopback_tx,
               self.config.disconnect_timeout(),
               Loopback::Timeout {
                  id,
                  deadline: Deadline::Disconnect,
                  token,
               },
            );
         }
         return;
      }

      if self.queue.remove_queued(&address, true) {
         debug!("Dropped queued connection attempt to {id}");
      } else if self.queue.is_live_attempt(&address) {
         info!("Cancelling connection attempt to {id}");
         self.queue.forget(&address);
         self.cancel_in_flight();
      } else {
         let _ = reply.send(Err(LinkError::DeviceNotConnected));
         return;
      }

      if let Some(peripheral) = self.peripherals.get_mut(&id) {
         peripheral.info.state = LinkState::Disconnected;
         peripheral.connect.fail(|| LinkError::Cancelled);
      }
      let _ = reply.send(Ok(()));
   }

   fn on_disconnect_complete(&mut self, handle: ConnectionHandle, reason: u8) {
      let reason = HciStatus(reason);
      if !self.teardown(handle, reason) {
         self.advise(format!("Unknown handle {handle} disconnected ({reason})"));
      }
   }

   /// Releases everything derived from the link on `handle`, settles the
   /// peripheral's waiters and reports the link gone. Returns `false` for an
   /// unknown handle.
   fn teardown(&mut self, handle: ConnectionHandle, reason: HciStatus) -> bool {
      let Some(id) = self.links.remove(handle) else {
         return false;
      };

      if let Some(connection) = self.connections.remove(&handle) {
         connection.release();
      }

      let mut pairing = None;
      if let Some(peripheral) = self.peripherals.get_mut(&id) {
         self.queue.forget(&peripheral.info.address.address);
         peripheral.info.state = LinkState::Disconnected;
         peripheral.info.handle = None;
         peripheral.info.encrypted = false;

         if let Some(result) = peripheral.pairing.on_disconnect() {
            peripheral.pair.settle(|| result.map_err(LinkError::from));
            pairing = Some(result);
         }
         peripheral.rssi.fail(|| LinkError::ConnectionClosed);
         peripheral.version.fail(|| LinkError::ConnectionClosed);
         peripheral.features.fail(|| LinkError::ConnectionClosed);
         peripheral.disconnect.settle(|| Ok(()));
      }

      if let Some(result) = pairing {
         self.emit_pairing(&id, result);
      }
      info!("{id} disconnected from {handle}: {reason}");
      self.emit(LinkEvent::Disconnected { id, handle, reason });
      true
   }

   fn cleanup(&mut self) {
      info!("Cleaning up connection manager");

      if let Err(e) = self.controller.stop_scanning() {
         error!("Failed to stop scanning: {e}");
      }
      let in_flight = self.queue.in_flight().filter(|_| !self.queue.is_cancelling());
      let abandoned = self.queue.clear();
      self.cancel_guard.cancel();
      if !abandoned.is_empty() {
         debug!("Abandoning {} connection attempts", abandoned.len());
      }
      if let Some(peer) = in_flight
         && let Err(e) = self.controller.cancel_connection()
      {
         error!("Failed to cancel connection to {peer}: {e}");
      }

      for peripheral in self.peripherals.values_mut() {
         peripheral.fail_all(|| LinkError::ManagerShutdown);
      }
      for handle in self.links.handles().collect::<Vec<_>>() {
         if let Err(e) = self.controller.disconnect(handle, DISCONNECT_REASON.code()) {
            error!("Failed to disconnect {handle}: {e}");
         }
         self.teardown(handle, HciStatus::LOCAL_HOST_TERMINATED);
      }
   }

   // === Controller events ===

   fn handle_controller_event(&mut self, event: ControllerEvent) {
      match event {
         ControllerEvent::StateChange(state) => {
            info!("Adapter state: {state}");
            if matches!(state, AdapterState::Unauthorized | AdapterState::Unsupported) {
               warn!("Adapter is {state}, links cannot be established");
            }
            self.adapter_state = state;
            self.emit(LinkEvent::StateChanged(state));
         },
         ControllerEvent::AddressChange(address) => {
            debug!("Local address: {address}");
            self.local_address = address;
            self.emit(LinkEvent::AddressChanged(address));
         },
         ControllerEvent::ConnectionComplete {
            status,
            handle,
            role,
            peer,
            params,
         } => {
            self.on_connection_complete(status, handle, role, peer, params);
         },
         ControllerEvent::ConnectionUpdateComplete {
            status,
            handle,
            params,
         } => {
            self.on_connection_update(HciStatus(status), handle, params);
         },
         ControllerEvent::RemoteFeaturesComplete {
            status,
            handle,
            features,
         } => {
            self.on_remote_features(HciStatus(status), handle, &features);
         },
         ControllerEvent::RemoteVersionInfo {
            status,
            handle,
            version,
            subversion,
            manufacturer,
            raw,
         } => {
            let info = VersionInfo {
               version,
               subversion,
               manufacturer,
               raw,
            };
            self.on_remote_version(HciStatus(status), handle, info);
         },
         ControllerEvent::RssiRead {
            status,
            handle,
            rssi,
         } => {
            self.on_rssi(HciStatus(status), handle, rssi);
         },
         ControllerEvent::DisconnectComplete { handle, reason } => {
            self.on_disconnect_complete(handle, reason);
         },
         ControllerEvent::EncryptionChange { handle, encrypted } => {
            self.on_encryption_change(handle, encrypted);
         },
         ControllerEvent::AclData {
            handle,
            channel,
            data,
         } => {
            self.on_acl_data(handle, channel, data);
         },
      }
   }

   fn on_connection_update(
      &mut self,
      status: HciStatus,
      handle: ConnectionHandle,
      params: ConnectionParams,
   ) {
      if !status.is_success() {
         debug!("Connection update on {handle} failed: {status}");
         return;
      }
      let Some(id) = self.links.id(handle).cloned() else {
         debug!("Connection update for unknown handle {handle}");
         return;
      };
      debug!("Connection {handle} updated: {params:?}");
      self.emit(LinkEvent::ConnectionUpdated { id, params });
   }

   fn on_encryption_change(&mut self, handle: ConnectionHandle, encrypted: bool) {
      let Some(connection) = self.connections.get(&handle) else {
         self.advise(format!("Encryption change for unknown handle {handle}"));
         return;
      };
      connection.mux.push_encrypt(encrypted);
      let id = connection.id.clone();
      if let Some(peripheral) = self.peripherals.get_mut(&id) {
         peripheral.info.encrypted = encrypted;
      }
      info!("{id} encryption {}", if encrypted { "on" } else { "off" });
      self.emit(LinkEvent::EncryptionChanged { id, encrypted });
   }

   fn on_acl_data(&mut self, handle: ConnectionHandle, channel: ChannelId, data: Packet) {
      match self.connections.get(&handle) {
         Some(connection) => connection.mux.push(channel, Some(data)),
         None => debug!("Dropping data for unknown handle {handle}"),
      }
   }

   // === Remote reads ===

   fn begin_read<T>(
      &mut self,
      id: PeripheralId,
      read: RemoteRead,
      reply: Reply<T>,
      slot: fn(&mut ManagedPeripheral) -> &mut Pending<T>,
   ) {
      let handle = match self.connected_handle(&id) {
         Ok(handle) => handle,
         Err(e) => {
            let _ = reply.send(Err(e));
            return;
         },
      };
      let token = self.token();
      let timeout = self.config.remote_info_timeout();
      let Some(peripheral) = self.peripherals.get_mut(&id) else {
         let _ = reply.send(Err(LinkError::DeviceNotFound(id)));
         return;
      };
      let pending = slot(peripheral);
      if pending.is_waiting() {
         pending.waiters.push(reply);
         return;
      }

      let sent = match read {
         RemoteRead::Rssi => self.controller.read_rssi(handle),
         RemoteRead::Version => self.controller.read_remote_version(handle),
         RemoteRead::Features => self.controller.read_remote_features(handle),
      };
      if let Err(e) = sent {
         let _ = reply.send(Err(e));
         return;
      }

      debug!("Reading {read:?} of {id}");
      pending.waiters.push(reply);
      pending.arm(
         &self.loopback_tx,
         timeout,
         Loopback::Timeout {
            id,
            deadline: Deadline::Read(read),
            token,
         },
      );
   }

   fn read_target(&self, handle: ConnectionHandle, what: &str) -> Option<PeripheralId> {
      let id = self.links.id(handle).cloned();
      if id.is_none() {
         self.advise(format!("{what} for unknown handle {handle}"));
      }
      id
   }

   fn on_remote_features(&mut self, status: HciStatus, handle: ConnectionHandle, raw: &[u8]) {
      let Some(id) = self.read_target(handle, "Remote features") else {
         return;
      };
      let Some(peripheral) = self.peripherals.get_mut(&id) else {
         return;
      };

      if !status.is_success() {
         warn!("Reading features of {id} failed: {status}");
         peripheral.features.fail(|| LinkError::Hci(status));
         return;
      }
      match decode_feature_bitmap(raw) {
         Ok(features) => {
            peripheral.info.features = Some(features);
            peripheral.features.settle(|| Ok(features));
            self.emit(LinkEvent::FeaturesRead { id, features });
         },
         Err(e) => {
            warn!("Malformed features from {id}: {e}");
            peripheral.features.fail(|| LinkError::Proto(e.clone()));
         },
      }
   }

   fn on_remote_version(&mut self, status: HciStatus, handle: ConnectionHandle, version: VersionInfo) {
      let Some(id) = self.read_target(handle, "Remote version") else {
         return;
      };
      let Some(peripheral) = self.peripherals.get_mut(&id) else {
         return;
      };

      if !status.is_success() {
         warn!("Reading version of {id} failed: {status}");
         peripheral.version.fail(|| LinkError::Hci(status));
         return;
      }
      peripheral.info.version = Some(version.clone());
      peripheral.version.settle(|| Ok(version.clone()));
      self.emit(LinkEvent::VersionRead { id, version });
   }

   fn on_rssi(&mut self, status: HciStatus, handle: ConnectionHandle, rssi: i8) {
      let Some(id) = self.read_target(handle, "RSSI") else {
         return;
      };
      let Some(peripheral) = self.peripherals.get_mut(&id) else {
         return;
      };

      if !status.is_success() {
         warn!("Reading RSSI of {id} failed: {status}");
         peripheral.rssi.fail(|| LinkError::Hci(status));
         return;
      }
      peripheral.info.rssi = Some(rssi);
      peripheral.rssi.settle(|| Ok(rssi));
      self.emit(LinkEvent::RssiRead { id, rssi });
   }

   // === Pairing ===

   fn encrypt(&mut self, id: &PeripheralId) -> Result<()> {
      let handle = self.connected_handle(id)?;
      let connection = self
         .connections
         .get_mut(&handle)
         .ok_or(LinkError::DeviceNotConnected)?;
      connection.mux.encrypt()
   }

   fn handle_pair(
      &mut self,
      id: PeripheralId,
      request: Option<PairingRequest>,
      timeout: Option<Duration>,
      reply: Reply<PairingOutcome>,
   ) {
      let handle = match self.connected_handle(&id) {
         Ok(handle) => handle,
         Err(e) => {
            let _ = reply.send(Err(e));
            return;
         },
      };
      let timeout = timeout.unwrap_or_else(|| self.config.pairing_timeout());
      let (Some(peripheral), Some(connection)) =
         (self.peripherals.get_mut(&id), self.connections.get_mut(&handle))
      else {
         let _ = reply.send(Err(LinkError::DeviceNotConnected));
         return;
      };

      let token = match peripheral.pairing.start(request, timeout) {
         Ok(token) => token,
         Err(e) => {
            let _ = reply.send(Err(e.into()));
            return;
         },
      };

      let sent = match peripheral.pairing.request() {
         Some(request) => connection.mux.pair(request),
         None => connection.mux.encrypt(),
      };
      if let Err(e) = sent {
         peripheral.pairing.reset();
         let _ = reply.send(Err(e));
         return;
      }

      let deadline = peripheral.pairing.timeout().unwrap_or(timeout);
      info!("Pairing with {id}, deadline {deadline:?}");
      peripheral.pair.waiters.push(reply);
      peripheral.pair.arm(
         &self.loopback_tx,
         deadline,
         Loopback::Timeout {
            id,
            deadline: Deadline::Pairing,
            token,
         },
      );
   }

   fn stop_pair(&mut self, id: &PeripheralId) -> Result<()> {
      let peripheral = self
         .peripherals
         .get_mut(id)
         .ok_or_else(|| LinkError::DeviceNotFound(id.clone()))?;
      if peripheral.pairing.stop() {
         info!("Pairing with {id} stopped");
         peripheral.pair.fail(|| LinkError::Cancelled);
      }
      Ok(())
   }

   fn on_security_signal(&mut self, id: PeripheralId, signal: SecuritySignal) {
      let Some(peripheral) = self.peripherals.get_mut(&id) else {
         return;
      };
      let attempt = peripheral.pairing.is_pairing();

      let resolved = match signal {
         SecuritySignal::PairingResponse(response) => {
            peripheral.info.pairing_response = Some(response);
            self.emit(LinkEvent::PairingResponse { id, response });
            return;
         },
         SecuritySignal::PairingOutcome(Ok((auth_type, assoc_model))) => {
            peripheral.pairing.on_pairing_outcome(Ok((auth_type, assoc_model)));
            self.emit(LinkEvent::PairingProgress {
               id,
               auth_type,
               assoc_model,
            });
            return;
         },
         SecuritySignal::PairingOutcome(Err(code)) if attempt => {
            peripheral.pairing.on_pairing_outcome(Err(code))
         },
         SecuritySignal::PairingOutcome(Err(code)) => Some(Err(PairingError::from_smp_code(code))),
         SecuritySignal::KeyDistributed(keys) if attempt => peripheral.pairing.on_key_delivered(keys),
         SecuritySignal::KeyDistributed(keys) => Some(Ok(PairingOutcome::Paired {
            auth_type: None,
            assoc_model: None,
            keys,
         })),
      };

      if let Some(result) = resolved {
         if attempt {
            peripheral.pair.settle(|| result.map_err(LinkError::from));
         }
         self.emit_pairing(&id, result);
      }
   }

   fn emit_pairing(&self, id: &PeripheralId, result: PairingResult) {
      let id = id.clone();
      match result {
         Ok(outcome) => {
            info!("Paired with {id}");
            self.emit(LinkEvent::Paired { id, outcome });
         },
         Err(error) => {
            warn!("Pairing with {id} failed: {error}");
            self.emit(LinkEvent::PairingFailed { id, error });
         },
      }
   }

   // === Loopback ===

   fn handle_loopback(&mut self, msg: Loopback) {
      match msg {
         Loopback::Timeout {
            id,
            deadline,
            token,
         } => {
            self.on_timeout(id, deadline, token);
         },
         Loopback::CancelExpired { token } => {
            self.on_cancel_expired(token);
         },
         Loopback::Gatt { link, event } => {
            let Some(connection) = self.connection(link) else {
               debug!("Dropping GATT event of a closed link: {event:?}");
               return;
            };
            let id = connection.id.clone();
            if let GattEvent::Mtu(mtu) = event {
               debug!("MTU with {id} is {mtu}");
            }
            self.emit(LinkEvent::Gatt { id, event });
         },
         Loopback::Signaling { link, event } => {
            if self.connection(link).is_none() {
               debug!("Dropping signaling event of a closed link: {event:?}");
               return;
            }
            match event {
               SignalingEvent::ConnectionParameterUpdateRequest(update) => {
                  debug!("Parameter update requested on {}: {update:?}", link.handle);
                  if let Err(e) = self
                     .controller
                     .update_connection_parameters(link.handle, update)
                  {
                     error!("Failed to update parameters of {}: {e}", link.handle);
                  }
               },
            }
         },
         Loopback::Security { link, event } => {
            let Some(connection) = self.connection(link) else {
               debug!("Dropping security event of a closed link: {event:?}");
               return;
            };
            let id = connection.id.clone();
            if let Some(signal) = connection.mux.on_security_event(event) {
               self.on_security_signal(id, signal);
            }
         },
      }
   }

   fn on_timeout(&mut self, id: PeripheralId, deadline: Deadline, token: u64) {
      let Some(peripheral) = self.peripherals.get_mut(&id) else {
         return;
      };

      match deadline {
         Deadline::Connect => {
            if !peripheral.connect.is_current(token) {
               debug!("Stale connect timer for {id}");
               return;
            }
            warn!("Connection to {id} timed out");
            let address = peripheral.info.address.address;
            peripheral.info.state = LinkState::Disconnected;
            peripheral.connect.fail(|| LinkError::RequestTimeout);

            self.queue.forget(&address);
            if !self.queue.remove_queued(&address, true) && self.queue.is_live_attempt(&address) {
               self.cancel_in_flight();
            }
         },
         Deadline::Disconnect => {
            if !peripheral.disconnect.is_current(token) {
               return;
            }
            warn!("Disconnecting {id} timed out");
            if peripheral.info.state == LinkState::Disconnecting {
               peripheral.info.state = LinkState::Connected;
            }
            peripheral.disconnect.fail(|| LinkError::RequestTimeout);
         },
         Deadline::Pairing => {
            let Some(result) = peripheral.pairing.on_timer(token, peripheral.info.state) else {
               return;
            };
            peripheral.pair.settle(|| result.map_err(LinkError::from));
            self.emit_pairing(&id, result);
         },
         Deadline::Read(read) => {
            let pending_token = match read {
               RemoteRead::Rssi => peripheral.rssi.is_current(token),
               RemoteRead::Version => peripheral.version.is_current(token),
               RemoteRead::Features => peripheral.features.is_current(token),
            };
            if !pending_token {
               return;
            }
            warn!("Reading {read:?} of {id} timed out");
            match read {
               RemoteRead::Rssi => peripheral.rssi.fail(|| LinkError::RequestTimeout),
               RemoteRead::Version => peripheral.version.fail(|| LinkError::RequestTimeout),
               RemoteRead::Features => peripheral.features.fail(|| LinkError::RequestTimeout),
            }
         },
      }
   }

   // === GATT ===

   fn gatt_request(&mut self, id: &PeripheralId, request: GattRequest) -> Result<()> {
      let connection = self
         .links
         .handle(id)
         .and_then(|handle| self.connections.get_mut(&handle));
      let Some(connection) = connection else {
         self.advise(format!("GATT request for unknown peripheral {id}"));
         return Err(LinkError::DeviceNotFound(id.clone()));
      };
      debug!("GATT request to {id}: {request:?}");
      connection.gatt.request(request)
   }
}
