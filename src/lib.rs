//! BLE link and pairing orchestration above a raw HCI transport.
//!
//! The [`ConnectionManager`] serializes outgoing connection attempts,
//! rejects links nobody asked for, maps controller handles to peripheral
//! identities and drives pairing to one of its terminal outcomes. Socket
//! I/O, ATT and SMP engines plug in through the [`Controller`] and
//! [`SessionFactory`] traits; results surface on an [`EventBus`].

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod event;
pub mod peripheral;
pub mod timer;

#[cfg(test)]
mod testing;

pub use crate::{
   bluetooth::{
      acl::{AclEvent, AclStream, AclSubscription},
      hci::{
         BdAddr, ChannelId, ConnectionHandle, Controller, ControllerEvent, DeviceAddress, Packet,
         SharedController,
      },
      manager::ConnectionManager,
      session::{
         EventRelay, GattEvent, GattRequest, GattSession, SecurityEvent, SecuritySession,
         SessionFactory, SharedSessionFactory, SignalingEvent, SignalingSession,
      },
      status::HciStatus,
   },
   config::Config,
   error::{LinkError, Result},
   event::{EventBus, EventQueue, EventSender, LinkEvent},
   peripheral::{
      device::{LinkState, PeripheralId, PeripheralInfo},
      pairing::{PairingError, PairingOutcome, PairingStatus},
      protocol::{FeatureBitmap, PairingRequest, VersionInfo},
   },
};
