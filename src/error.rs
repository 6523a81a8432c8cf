//! Error types for the link layer.
//!
//! This module defines every error a caller of the connection manager can
//! observe: controller failures, connection and pairing outcomes, malformed
//! controller fields and configuration problems.

use smol_str::SmolStr;
use thiserror::Error;

use crate::{
   bluetooth::status::HciStatus,
   peripheral::{device::PeripheralId, pairing::PairingError, parser::ProtoError},
};

/// Main error type for the link layer.
#[derive(Error, Debug)]
pub enum LinkError {
   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Controller rejected command: {0}")]
   Controller(SmolStr),

   #[error("{0}")]
   Hci(HciStatus),

   #[error("Peripheral not found: {0}")]
   DeviceNotFound(PeripheralId),

   #[error("Peripheral not connected")]
   DeviceNotConnected,

   #[error("Peripheral already connected")]
   AlreadyConnected,

   #[error("Connection attempt cancelled")]
   Cancelled,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Pairing failed: {0}")]
   Pairing(#[from] PairingError),

   #[error("Malformed field: {0}")]
   Proto(#[from] ProtoError),

   #[error("Invalid pairing request: {0}")]
   InvalidRequest(&'static str),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `LinkError`.
pub type Result<T> = std::result::Result<T, LinkError>;
