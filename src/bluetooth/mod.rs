//! Link layer above the HCI transport.
//!
//! This module provides the controller contract, ACL multiplexing per link,
//! the collaborator contracts and the connection manager tying them together.

pub mod acl;
pub mod hci;
pub mod links;
pub mod manager;
pub mod session;
pub mod status;
