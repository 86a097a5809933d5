//! Radio link layer.
//!
//! This module provides peer discovery, link establishment and the
//! reader/writer loops that relay bytes over an established link.

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod channel;
pub mod establish;
pub mod manager;
pub mod radio;
pub mod scanner;
