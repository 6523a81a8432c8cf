//! Link-layer and SMP records exchanged with peripherals.
//!
//! This module contains the decoded controller/SMP records, the SMP value
//! types the pairing flow passes around, and the constants of the fixed
//! layouts they are decoded from.

use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};

use crate::{
   bluetooth::hci::Packet,
   error::{LinkError, Result},
};

/// SMP opcode of a Pairing Request PDU.
pub const SMP_PAIRING_REQUEST: u8 = 0x01;

/// Length of the SMP Pairing Request/Response PDUs, opcode included.
pub const PAIRING_PDU_LEN: usize = 7;
/// Length of the LE feature field in a remote-features event.
pub const FEATURE_FIELD_LEN: usize = 8;

const MAX_PASSKEY: u32 = 999_999;

fn serialize_hex<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
   s.serialize_str(&hex::encode(bytes))
}

/// LE link-layer features, by bit offset in the feature field.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   strum::FromRepr,
   strum::Display,
   strum::EnumIter,
   strum::IntoStaticStr,
)]
pub enum LeFeature {
   #[strum(serialize = "LEEncryption")]
   LeEncryption = 0,
   ConnectionParametersRequestProcedure = 1,
   ExtendedRejectIndication = 2,
   SlaveInitiatedFeaturesExchange = 3,
   #[strum(serialize = "LEPing")]
   LePing = 4,
   #[strum(serialize = "LEDataPacketLengthExtension")]
   LeDataPacketLengthExtension = 5,
   #[strum(serialize = "LLPrivacy")]
   LlPrivacy = 6,
   ExtendedScannerFilterPolicies = 7,
   #[strum(serialize = "LE2MPHY")]
   Le2MPhy = 8,
   StableModulationIndexTransmitter = 9,
   StableModulationIndexReceiver = 10,
   #[strum(serialize = "LECodedPHY")]
   LeCodedPhy = 11,
   #[strum(serialize = "LEExtendedAdvertising")]
   LeExtendedAdvertising = 12,
   #[strum(serialize = "LEPeriodicAdvertising")]
   LePeriodicAdvertising = 13,
   ChannelSelectionAlgorithm2 = 14,
   #[strum(serialize = "LEPowerClass1")]
   LePowerClass1 = 15,
   #[strum(serialize = "MinimumNumberofUsedChannelsProcedure")]
   MinimumNumberOfUsedChannelsProcedure = 16,
}

impl LeFeature {
   pub const COUNT: u8 = 17;

   pub const fn mask(self) -> u32 {
      1 << self as u8
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Decoded LE feature field.
///
/// Only the 17 defined flags are kept; reserved bits are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeatureBitmap {
   pub(crate) flags: u32,
   #[serde(serialize_with = "serialize_hex")]
   pub(crate) raw: [u8; FEATURE_FIELD_LEN],
}

impl FeatureBitmap {
   pub const fn contains(&self, feature: LeFeature) -> bool {
      self.flags & feature.mask() != 0
   }

   pub const fn raw(&self) -> [u8; FEATURE_FIELD_LEN] {
      self.raw
   }

   /// Iterates over the flags that are set, in bit order.
   pub fn iter(&self) -> impl Iterator<Item = LeFeature> + '_ {
      <LeFeature as strum::IntoEnumIterator>::iter().filter(|f| self.contains(*f))
   }

   /// Renders the set flags only, e.g. `{"LEEncryption": true}`.
   pub fn to_json(&self) -> Value {
      let flags: Map<String, Value> = self
         .iter()
         .map(|f| (f.to_str().to_owned(), Value::Bool(true)))
         .collect();
      Value::Object(flags)
   }
}

/// SMP IO capability values.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::FromRepr, strum::Display)]
pub enum IoCapability {
   DisplayOnly = 0x00,
   DisplayYesNo = 0x01,
   KeyboardOnly = 0x02,
   NoInputNoOutput = 0x03,
   KeyboardDisplay = 0x04,
}

/// Decoded AuthReq octet of a pairing PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AuthReq {
   pub bonding_flags: u8,
   pub mitm: bool,
   pub secure_connections: bool,
   pub keypress: bool,
   pub ct2: bool,
}

/// Decoded SMP Pairing Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PairingResponse {
   pub io_capability: u8,
   pub oob_data_flag: u8,
   pub auth_req: AuthReq,
   pub max_encryption_key_size: u8,
   pub initiator_key_distribution: u8,
   pub responder_key_distribution: u8,
   #[serde(serialize_with = "serialize_hex")]
   pub(crate) raw: [u8; PAIRING_PDU_LEN],
}

impl PairingResponse {
   pub fn io_capability(&self) -> Option<IoCapability> {
      IoCapability::from_repr(self.io_capability)
   }

   pub const fn raw(&self) -> [u8; PAIRING_PDU_LEN] {
      self.raw
   }
}

/// Remote version information reported by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
   pub version: u8,
   pub subversion: u16,
   pub manufacturer: u16,
   #[serde(serialize_with = "serialize_hex")]
   pub raw: Packet,
}

impl VersionInfo {
   pub fn to_json(&self) -> Value {
      json!({
          "version": self.version,
          "subversion": self.subversion,
          "manufacturer": self.manufacturer,
          "raw": hex::encode(&self.raw),
      })
   }
}

/// SMP Pairing Failed reasons.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::FromRepr, strum::Display)]
pub enum SmpReason {
   #[strum(to_string = "Passkey entry canceled or failed")]
   PasskeyEntryFailed = 0x01,
   #[strum(to_string = "Out-of-band data not available")]
   OobNotAvailable = 0x02,
   #[strum(to_string = "Authentication requirements not met")]
   AuthenticationRequirements = 0x03,
   #[strum(to_string = "Confirm value does not match")]
   ConfirmValueFailed = 0x04,
   #[strum(to_string = "Pairing not supported")]
   PairingNotSupported = 0x05,
   #[strum(to_string = "Encryption key size is not long enough")]
   EncryptionKeySize = 0x06,
   #[strum(to_string = "SMP command not supported")]
   CommandNotSupported = 0x07,
   #[strum(to_string = "Unspecified reason")]
   UnspecifiedReason = 0x08,
   #[strum(to_string = "Repeated attempts")]
   RepeatedAttempts = 0x09,
   #[strum(to_string = "Command and/or parameter invalid")]
   InvalidParameters = 0x0a,
   #[strum(to_string = "DH key check value does not match")]
   DhKeyCheckFailed = 0x0b,
   #[strum(to_string = "Numeric comparison values do not match")]
   NumericComparisonFailed = 0x0c,
   #[strum(to_string = "Pairing in progress over BR/EDR")]
   BrEdrPairingInProgress = 0x0d,
   #[strum(to_string = "Cross-transport key generation not allowed")]
   GenerationNotAllowed = 0x0e,
   #[strum(to_string = "Distributed key rejected")]
   KeyRejected = 0x0f,
   #[strum(to_string = "Device busy")]
   Busy = 0x10,
}

/// How keys were authenticated during pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum AuthType {
   Legacy,
   SecureConnections,
}

/// Association model chosen by the SMP engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum AssociationModel {
   JustWorks,
   PasskeyEntry,
   NumericComparison,
   OutOfBand,
}

/// How the passkey of a custom pairing request is disclosed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
pub enum PasskeyOption {
   /// The SMP engine picks the passkey itself.
   #[default]
   Auto,
   /// The local side shows the supplied passkey.
   Display,
   /// The supplied passkey was read off the peer's display.
   Input,
}

/// A caller-built SMP Pairing Request with its passkey choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
   pdu: heapless::Vec<u8, PAIRING_PDU_LEN>,
   pub passkey_option: PasskeyOption,
   pub passkey: Option<u32>,
}

impl PairingRequest {
   pub fn new(pdu: &[u8], passkey_option: PasskeyOption, passkey: Option<u32>) -> Result<Self> {
      if pdu.len() != PAIRING_PDU_LEN {
         return Err(LinkError::InvalidRequest("pairing request must be 7 bytes"));
      }
      if pdu[0] != SMP_PAIRING_REQUEST {
         return Err(LinkError::InvalidRequest("not a pairing request PDU"));
      }
      if passkey.is_some_and(|p| p > MAX_PASSKEY) {
         return Err(LinkError::InvalidRequest("passkey out of range"));
      }
      if passkey_option != PasskeyOption::Auto && passkey.is_none() {
         return Err(LinkError::InvalidRequest("passkey option requires a value"));
      }
      let pdu = heapless::Vec::from_slice(pdu)
         .map_err(|()| LinkError::InvalidRequest("pairing request must be 7 bytes"))?;
      Ok(Self {
         pdu,
         passkey_option,
         passkey,
      })
   }

   pub fn pdu(&self) -> &[u8] {
      &self.pdu
   }
}

/// A 128-bit link key (STK or LTK).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LongTermKey([u8; 16]);

impl LongTermKey {
   pub const fn new(bytes: [u8; 16]) -> Self {
      Self(bytes)
   }

   pub const fn bytes(&self) -> &[u8; 16] {
      &self.0
   }
}

impl fmt::Debug for LongTermKey {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str("LongTermKey(..)")
   }
}

/// Key material distributed by the peer at the end of pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMaterial {
   pub ediv: u16,
   pub rand: [u8; 8],
   pub ltk: LongTermKey,
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_feature_names_match_bit_order() {
      assert_eq!(LeFeature::from_repr(0), Some(LeFeature::LeEncryption));
      assert_eq!(LeFeature::from_repr(16), Some(LeFeature::MinimumNumberOfUsedChannelsProcedure));
      assert_eq!(LeFeature::from_repr(LeFeature::COUNT), None);
      assert_eq!(LeFeature::Le2MPhy.to_string(), "LE2MPHY");
      assert_eq!(LeFeature::LePing.mask(), 0x10);
   }

   #[test]
   fn test_pairing_request_validation() {
      let pdu = [0x01, 0x03, 0x00, 0x0d, 0x10, 0x07, 0x07];
      let req = PairingRequest::new(&pdu, PasskeyOption::Display, Some(123_456)).unwrap();
      assert_eq!(req.pdu(), &pdu);

      assert!(PairingRequest::new(&pdu[..6], PasskeyOption::Auto, None).is_err());
      assert!(PairingRequest::new(&[0x02; 7], PasskeyOption::Auto, None).is_err());
      assert!(PairingRequest::new(&pdu, PasskeyOption::Input, Some(1_000_000)).is_err());
      assert!(PairingRequest::new(&pdu, PasskeyOption::Input, None).is_err());
   }

   #[test]
   fn test_key_debug_is_redacted() {
      let key = LongTermKey::new([0xab; 16]);
      assert_eq!(format!("{key:?}"), "LongTermKey(..)");
   }

   #[test]
   fn test_smp_reason_table() {
      assert_eq!(SmpReason::from_repr(0x05), Some(SmpReason::PairingNotSupported));
      assert_eq!(SmpReason::from_repr(0x11), None);
      assert_eq!(SmpReason::Busy.to_string(), "Device busy");
   }
}
