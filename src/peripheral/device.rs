//! Peripheral identity and state snapshots.
//!
//! A peripheral is keyed by a [`PeripheralId`] derived from its address,
//! which stays stable across reconnects while connection handles do not.

use std::{fmt, str::FromStr};

use serde::Serialize;
use serde_json::{Value, json};
use smol_str::SmolStr;

use crate::{
   bluetooth::hci::{AddrParseError, BdAddr, ConnectionHandle, DeviceAddress},
   peripheral::{
      pairing::PairingStatus,
      protocol::{FeatureBitmap, PairingResponse, VersionInfo},
   },
};

/// Normalized peripheral identity: the address as lowercase hex without
/// separators (`aa:bb:cc:dd:ee:ff` becomes `aabbccddeeff`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct PeripheralId(SmolStr);

impl PeripheralId {
   pub fn from_address(address: &BdAddr) -> Self {
      Self(hex::encode(address.bytes()).into())
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl From<&BdAddr> for PeripheralId {
   fn from(address: &BdAddr) -> Self {
      Self::from_address(address)
   }
}

impl FromStr for PeripheralId {
   type Err = AddrParseError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      s.parse::<BdAddr>().map(|addr| Self::from_address(&addr))
   }
}

impl fmt::Display for PeripheralId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

/// Link state of a tracked peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
   #[default]
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

/// Point-in-time view of a peripheral, as tracked by the connection manager.
#[derive(Debug, Clone)]
pub struct PeripheralInfo {
   pub id: PeripheralId,
   pub address: DeviceAddress,
   pub state: LinkState,
   pub handle: Option<ConnectionHandle>,
   pub pairing: PairingStatus,
   pub encrypted: bool,
   pub rssi: Option<i8>,
   pub features: Option<FeatureBitmap>,
   pub version: Option<VersionInfo>,
   pub pairing_response: Option<PairingResponse>,
}

impl PeripheralInfo {
   pub fn new(address: DeviceAddress) -> Self {
      Self {
         id: PeripheralId::from_address(&address.address),
         address,
         state: LinkState::Disconnected,
         handle: None,
         pairing: PairingStatus::Idle,
         encrypted: false,
         rssi: None,
         features: None,
         version: None,
         pairing_response: None,
      }
   }

   /// Converts the snapshot to JSON, leaving out unknown fields.
   pub fn to_json(&self) -> Value {
      let mut info = json!({
          "id": self.id.as_str(),
          "address": self.address.address.to_string(),
          "address_type": self.address.kind,
          "state": self.state,
          "pairing": self.pairing,
          "encrypted": self.encrypted,
      });

      if let Some(handle) = self.handle {
         info["handle"] = json!(handle.raw());
      }
      if let Some(rssi) = self.rssi {
         info["rssi"] = json!(rssi);
      }
      if let Some(features) = &self.features {
         info["le_features"] = features.to_json();
      }
      if let Some(version) = &self.version {
         info["version_info"] = version.to_json();
      }
      if let Some(resp) = &self.pairing_response {
         info["pairing_response"] = json!(resp);
      }
      info
   }
}
