//! Controller-facing types and the HCI transport contract.
//!
//! The transport itself (socket I/O, packet encoding and event parsing) lives
//! outside this crate. It hands parsed [`ControllerEvent`]s to the connection
//! manager and accepts commands through the [`Controller`] trait.

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::SmolStr;
use thiserror::Error;

use crate::{error::Result, peripheral::protocol::LongTermKey};

/// Payload of a single link-layer data packet.
pub type Packet = SmallVec<[u8; 32]>;

/// A 48-bit Bluetooth device address, stored most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BdAddr([u8; 6]);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid Bluetooth address: {0:?}")]
pub struct AddrParseError(pub SmolStr);

impl BdAddr {
   pub const fn new(bytes: [u8; 6]) -> Self {
      Self(bytes)
   }

   pub const fn any() -> Self {
      Self([0; 6])
   }

   pub const fn bytes(&self) -> [u8; 6] {
      self.0
   }
}

impl fmt::Display for BdAddr {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let [a, b, c, d, e, g] = self.0;
      write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
   }
}

impl FromStr for BdAddr {
   type Err = AddrParseError;

   /// Accepts `aa:bb:cc:dd:ee:ff`, `AA-BB-CC-DD-EE-FF` and bare `aabbccddeeff`.
   fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
      let digits: heapless::String<12> = s
         .chars()
         .filter(|c| !matches!(c, ':' | '-'))
         .try_fold(heapless::String::new(), |mut acc, c| {
            acc.push(c).map(|()| acc)
         })
         .map_err(|_| AddrParseError(s.into()))?;

      let mut bytes = [0u8; 6];
      hex::decode_to_slice(digits.as_str(), &mut bytes).map_err(|_| AddrParseError(s.into()))?;
      Ok(Self(bytes))
   }
}

/// Link-layer address type reported alongside every address.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
   #[default]
   #[strum(serialize = "public")]
   Public = 0x00,
   #[strum(serialize = "random")]
   Random = 0x01,
}

/// An address together with its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceAddress {
   pub address: BdAddr,
   pub kind: AddressType,
}

impl DeviceAddress {
   pub const fn new(address: BdAddr, kind: AddressType) -> Self {
      Self { address, kind }
   }
}

impl fmt::Display for DeviceAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{} ({})", self.address, self.kind)
   }
}

/// Controller-assigned identifier of an open link.
///
/// Only meaningful while the link is up: the controller reuses values after
/// a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct ConnectionHandle(u16);

impl ConnectionHandle {
   pub const fn new(raw: u16) -> Self {
      Self(raw & 0x0fff)
   }

   pub const fn raw(self) -> u16 {
      self.0
   }
}

impl fmt::Display for ConnectionHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "0x{:03x}", self.0)
   }
}

/// Logical channel multiplexed over one ACL link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ChannelId(u16);

impl ChannelId {
   pub const ATT: Self = Self(0x0004);
   pub const SIGNALING: Self = Self(0x0005);
   pub const SMP: Self = Self(0x0006);

   pub const fn new(raw: u16) -> Self {
      Self(raw)
   }

   pub const fn raw(self) -> u16 {
      self.0
   }
}

impl fmt::Display for ChannelId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "0x{:04x}", self.0)
   }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::FromRepr, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum Role {
   #[strum(serialize = "central")]
   Central = 0x00,
   #[strum(serialize = "peripheral")]
   Peripheral = 0x01,
}

/// Parameters reported in a connection-complete event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionParams {
   pub interval: u16,
   pub latency: u16,
   pub supervision_timeout: u16,
   pub clock_accuracy: u8,
}

/// Connection parameters proposed by the peer over the signaling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterUpdate {
   pub min_interval: u16,
   pub max_interval: u16,
   pub latency: u16,
   pub supervision_timeout: u16,
}

/// Power/permission state of the local adapter.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum AdapterState {
   #[default]
   Unknown,
   Resetting,
   Unsupported,
   Unauthorized,
   PoweredOff,
   PoweredOn,
}

/// Events produced by the HCI transport, already parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
   StateChange(AdapterState),
   AddressChange(DeviceAddress),
   ConnectionComplete {
      status: u8,
      handle: ConnectionHandle,
      role: Role,
      peer: DeviceAddress,
      params: ConnectionParams,
   },
   ConnectionUpdateComplete {
      status: u8,
      handle: ConnectionHandle,
      params: ConnectionParams,
   },
   RemoteFeaturesComplete {
      status: u8,
      handle: ConnectionHandle,
      features: Packet,
   },
   RemoteVersionInfo {
      status: u8,
      handle: ConnectionHandle,
      version: u8,
      subversion: u16,
      manufacturer: u16,
      raw: Packet,
   },
   RssiRead {
      status: u8,
      handle: ConnectionHandle,
      rssi: i8,
   },
   DisconnectComplete {
      handle: ConnectionHandle,
      reason: u8,
   },
   EncryptionChange {
      handle: ConnectionHandle,
      encrypted: bool,
   },
   AclData {
      handle: ConnectionHandle,
      channel: ChannelId,
      data: Packet,
   },
}

/// Commands the link layer issues to the controller.
///
/// Implementations must not block: each call queues the command and returns.
/// Completion arrives later as a [`ControllerEvent`].
pub trait Controller: Send + Sync {
   fn create_connection(&self, peer: DeviceAddress) -> Result<()>;

   /// Cancels the outstanding connection-creation request, if any.
   fn cancel_connection(&self) -> Result<()>;

   fn disconnect(&self, handle: ConnectionHandle, reason: u8) -> Result<()>;

   fn write_acl(&self, handle: ConnectionHandle, channel: ChannelId, data: &[u8]) -> Result<()>;

   fn start_encryption(
      &self,
      handle: ConnectionHandle,
      random: [u8; 8],
      diversifier: [u8; 2],
      key: &LongTermKey,
   ) -> Result<()>;

   fn read_rssi(&self, handle: ConnectionHandle) -> Result<()>;

   fn read_remote_version(&self, handle: ConnectionHandle) -> Result<()>;

   fn read_remote_features(&self, handle: ConnectionHandle) -> Result<()>;

   fn update_connection_parameters(
      &self,
      handle: ConnectionHandle,
      update: ParameterUpdate,
   ) -> Result<()>;

   fn stop_scanning(&self) -> Result<()> {
      Ok(())
   }
}

/// Type alias for a shareable controller handle.
pub type SharedController = Arc<dyn Controller>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_address_parsing() {
      let expected = BdAddr::new([0xaa, 0xbb, 0xcc, 0x01, 0x02, 0x03]);
      assert_eq!("AA:BB:CC:01:02:03".parse::<BdAddr>().unwrap(), expected);
      assert_eq!("aa-bb-cc-01-02-03".parse::<BdAddr>().unwrap(), expected);
      assert_eq!("aabbcc010203".parse::<BdAddr>().unwrap(), expected);
      assert_eq!(expected.to_string(), "aa:bb:cc:01:02:03");
   }

   #[test]
   fn test_address_rejects_bad_input() {
      assert!("aa:bb:cc".parse::<BdAddr>().is_err());
      assert!("aa:bb:cc:dd:ee:zz".parse::<BdAddr>().is_err());
      assert!("aa:bb:cc:dd:ee:ff:00".parse::<BdAddr>().is_err());
   }

   #[test]
   fn test_handle_masks_flags() {
      assert_eq!(ConnectionHandle::new(0x2040).raw(), 0x040);
   }

   #[test]
   fn test_adapter_state_names() {
      assert_eq!(AdapterState::PoweredOn.to_string(), "poweredOn");
      assert_eq!("unauthorized".parse::<AdapterState>().unwrap(), AdapterState::Unauthorized);
   }
}
