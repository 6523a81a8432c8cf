//! Controller status codes.
//!
//! Bluetooth Core Vol 1 Part F: every non-zero status the controller reports
//! maps to a fixed reason string.

use std::fmt;

use serde::Serialize;

/// Human-readable reasons for codes `0x01..=0x44`, indexed by `code - 1`.
const REASONS: [&str; 0x44] = [
   "Unknown HCI Command",
   "Unknown Connection Identifier",
   "Hardware Failure",
   "Page Timeout",
   "Authentication Failure",
   "PIN or Key Missing",
   "Memory Capacity Exceeded",
   "Connection Timeout",
   "Connection Limit Exceeded",
   "Synchronous Connection Limit to a Device Exceeded",
   "ACL Connection Already Exists",
   "Command Disallowed",
   "Connection Rejected due to Limited Resources",
   "Connection Rejected due to Security Reasons",
   "Connection Rejected due to Unacceptable BD_ADDR",
   "Connection Accept Timeout Exceeded",
   "Unsupported Feature or Parameter Value",
   "Invalid HCI Command Parameters",
   "Remote User Terminated Connection",
   "Remote Device Terminated Connection due to Low Resources",
   "Remote Device Terminated Connection due to Power Off",
   "Connection Terminated By Local Host",
   "Repeated Attempts",
   "Pairing Not Allowed",
   "Unknown LMP PDU",
   "Unsupported Remote Feature / Unsupported LMP Feature",
   "SCO Offset Rejected",
   "SCO Interval Rejected",
   "SCO Air Mode Rejected",
   "Invalid LMP Parameters / Invalid LL Parameters",
   "Unspecified Error",
   "Unsupported LMP Parameter Value / Unsupported LL Parameter Value",
   "Role Change Not Allowed",
   "LMP Response Timeout / LL Response Timeout",
   "LMP Error Transaction Collision",
   "LMP PDU Not Allowed",
   "Encryption Mode Not Acceptable",
   "Link Key cannot be Changed",
   "Requested QoS Not Supported",
   "Instant Passed",
   "Pairing With Unit Key Not Supported",
   "Different Transaction Collision",
   "Reserved",
   "QoS Unacceptable Parameter",
   "QoS Rejected",
   "Channel Classification Not Supported",
   "Insufficient Security",
   "Parameter Out Of Mandatory Range",
   "Reserved",
   "Role Switch Pending",
   "Reserved",
   "Reserved Slot Violation",
   "Role Switch Failed",
   "Extended Inquiry Response Too Large",
   "Secure Simple Pairing Not Supported By Host",
   "Host Busy - Pairing",
   "Connection Rejected due to No Suitable Channel Found",
   "Controller Busy",
   "Unacceptable Connection Parameters",
   "Directed Advertising Timeout",
   "Connection Terminated due to MIC Failure",
   "Connection Failed to be Established",
   "MAC Connection Failed",
   "Coarse Clock Adjustment Rejected but Will Try to Adjust Using Clock Dragging",
   "Type0 Submap Not Defined",
   "Unknown Advertising Identifier",
   "Limit Reached",
   "Operation Cancelled by Host",
];

/// A raw controller status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
pub struct HciStatus(pub u8);

impl HciStatus {
   pub const SUCCESS: Self = Self(0x00);
   pub const UNKNOWN_CONNECTION_ID: Self = Self(0x02);
   pub const CONNECTION_TIMEOUT: Self = Self(0x08);
   pub const REMOTE_USER_TERMINATED: Self = Self(0x13);
   pub const LOCAL_HOST_TERMINATED: Self = Self(0x16);
   pub const CONNECTION_FAILED_TO_ESTABLISH: Self = Self(0x3e);

   pub const fn code(self) -> u8 {
      self.0
   }

   pub const fn is_success(self) -> bool {
      self.0 == 0
   }

   /// The mapped reason, or `None` for success and unassigned codes.
   pub fn reason(self) -> Option<&'static str> {
      let idx = usize::from(self.0).checked_sub(1)?;
      REASONS.get(idx).copied()
   }
}

impl fmt::Display for HciStatus {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self.reason() {
         Some(reason) => write!(f, "{reason} (0x{:02x})", self.0),
         None if self.is_success() => f.write_str("Success"),
         None => write!(f, "Unknown HCI Error (0x{:02x})", self.0),
      }
   }
}
