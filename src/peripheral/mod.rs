//! Peripheral state, pairing and field decoding.
//!
//! This module contains the per-peripheral view kept by the connection
//! manager, the pairing coordinator and the decoders for controller and SMP
//! bit fields.

pub mod device;
pub mod pairing;
pub mod parser;
pub mod protocol;
