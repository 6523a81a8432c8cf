//! Fixed-layout field decoders.
//!
//! This module decodes the LE feature field of a remote-features event and
//! the octets of an SMP Pairing Response. Both layouts are fixed: input
//! shorter than the layout fails, trailing bytes are ignored.

use log::debug;
use thiserror::Error;

use crate::peripheral::protocol::{
   AuthReq, FEATURE_FIELD_LEN, FeatureBitmap, LeFeature, PAIRING_PDU_LEN, PairingResponse,
};

/// Error type for field decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
   /// Field is too short for the expected layout
   #[error("{field} too short: expected at least {expected} bytes, got {actual}")]
   TooShort {
      field: &'static str,
      expected: usize,
      actual: usize,
   },
}

fn require(field: &'static str, data: &[u8], expected: usize) -> Result<(), ProtoError> {
   if data.len() < expected {
      return Err(ProtoError::TooShort {
         field,
         expected,
         actual: data.len(),
      });
   }
   Ok(())
}

/// Decodes the 8-byte little-endian LE feature field.
pub fn decode_feature_bitmap(data: &[u8]) -> Result<FeatureBitmap, ProtoError> {
   require("LE feature field", data, FEATURE_FIELD_LEN)?;

   let mut raw = [0u8; FEATURE_FIELD_LEN];
   raw.copy_from_slice(&data[..FEATURE_FIELD_LEN]);
   let decoded = u64::from_le_bytes(raw);
   let defined = (1u64 << LeFeature::COUNT) - 1;

   debug!("LE features: {}", hex::encode(raw));
   Ok(FeatureBitmap {
      flags: (decoded & defined) as u32,
      raw,
   })
}

/// Decodes the AuthReq octet shared by pairing request and response.
pub const fn decode_auth_req(auth_req: u8) -> AuthReq {
   AuthReq {
      bonding_flags: auth_req & 0b11,
      mitm: (auth_req >> 2) & 1 != 0,
      secure_connections: (auth_req >> 3) & 1 != 0,
      keypress: (auth_req >> 4) & 1 != 0,
      ct2: (auth_req >> 5) & 1 != 0,
   }
}

/// Decodes an SMP Pairing Response. Byte 0 is the opcode and is not checked.
pub fn decode_pairing_response(data: &[u8]) -> Result<PairingResponse, ProtoError> {
   require("pairing response", data, PAIRING_PDU_LEN)?;

   let mut raw = [0u8; PAIRING_PDU_LEN];
   raw.copy_from_slice(&data[..PAIRING_PDU_LEN]);

   debug!("Pairing response: {}", hex::encode(raw));
   Ok(PairingResponse {
      io_capability: raw[1],
      oob_data_flag: raw[2],
      auth_req: decode_auth_req(raw[3]),
      max_encryption_key_size: raw[4],
      initiator_key_distribution: raw[5],
      responder_key_distribution: raw[6],
      raw,
   })
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::peripheral::protocol::IoCapability;

   #[test]
   fn test_only_encryption_bit() {
      let bitmap = decode_feature_bitmap(&[0x01, 0, 0, 0, 0, 0, 0, 0]).unwrap();
      let set: Vec<_> = bitmap.iter().collect();
      assert_eq!(set, vec![LeFeature::LeEncryption]);
      assert!(bitmap.contains(LeFeature::LeEncryption));
      assert!(!bitmap.contains(LeFeature::LePing));
      assert_eq!(bitmap.to_json().to_string(), r#"{"LEEncryption":true}"#);
   }

   #[test]
   fn test_feature_bits_across_bytes() {
      // bits 8 (2M PHY), 11 (coded PHY), 16 (min used channels)
      let bitmap = decode_feature_bitmap(&[0x00, 0x09, 0x01, 0, 0, 0, 0, 0]).unwrap();
      let set: Vec<_> = bitmap.iter().collect();
      assert_eq!(
         set,
         vec![
            LeFeature::Le2MPhy,
            LeFeature::LeCodedPhy,
            LeFeature::MinimumNumberOfUsedChannelsProcedure
         ]
      );
   }

   #[test]
   fn test_reserved_feature_bits_ignored() {
      let bitmap = decode_feature_bitmap(&[0, 0, 0xfe, 0xff, 0xff, 0xff, 0xff, 0xff]).unwrap();
      assert_eq!(bitmap.iter().count(), 0);
      assert_eq!(bitmap.raw()[7], 0xff);
   }

   #[test]
   fn test_feature_field_length() {
      assert_eq!(
         decode_feature_bitmap(&[0x01; 7]),
         Err(ProtoError::TooShort {
            field: "LE feature field",
            expected: 8,
            actual: 7
         })
      );
      let long = decode_feature_bitmap(&[0x01, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]).unwrap();
      assert_eq!(long.iter().count(), 1);
   }

   #[test]
   fn test_pairing_response() {
      let resp = decode_pairing_response(&[0x02, 0x03, 0x00, 0x2d, 0x10, 0x07, 0x07]).unwrap();
      assert_eq!(resp.io_capability, 3);
      assert_eq!(resp.io_capability(), Some(IoCapability::NoInputNoOutput));
      assert_eq!(resp.oob_data_flag, 0);
      assert_eq!(resp.auth_req.bonding_flags, 1);
      assert!(resp.auth_req.mitm);
      assert!(resp.auth_req.secure_connections);
      assert!(!resp.auth_req.keypress);
      assert!(resp.auth_req.ct2);
      assert_eq!(resp.max_encryption_key_size, 16);
      assert_eq!(resp.initiator_key_distribution, 7);
      assert_eq!(resp.responder_key_distribution, 7);
   }

   #[test]
   fn test_auth_req_all_bits() {
      let auth = decode_auth_req(0xff);
      assert_eq!(auth.bonding_flags, 3);
      assert!(auth.mitm && auth.secure_connections && auth.keypress && auth.ct2);
      assert_eq!(decode_auth_req(0x00), AuthReq::default());
   }

   #[test]
   fn test_auth_req_keypress_only() {
      let auth = decode_auth_req(0x10);
      assert!(auth.keypress);
      assert_eq!(auth.bonding_flags, 0);
      assert!(!auth.mitm && !auth.secure_connections && !auth.ct2);
   }

   #[test]
   fn test_pairing_response_length() {
      assert!(decode_pairing_response(&[0x02, 0x03, 0x00, 0x2d, 0x10, 0x07]).is_err());
      assert!(decode_pairing_response(&[]).is_err());
      let resp = decode_pairing_response(&[0x02, 0x04, 0x01, 0x08, 0x07, 0x01, 0x03, 0xaa]).unwrap();
      assert_eq!(resp.raw(), [0x02, 0x04, 0x01, 0x08, 0x07, 0x01, 0x03]);
      assert!(resp.auth_req.secure_connections);
   }
}
