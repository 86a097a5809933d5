//! Error types for the board-link manager.
//!
//! Establishment and write failures have their own enums so callers can
//! match on them; everything else lands in [`LinkError`].

use thiserror::Error;
use uuid::Uuid;

use crate::capability::{Capability, Denied};

/// Why a link could not be established.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
   #[error("{0} not granted")]
   PermissionDenied(Capability),

   #[error("Bluetooth is not supported on this device")]
   UnsupportedHardware,

   #[error("Peer unreachable: {0}")]
   PeerUnreachable(String),

   #[error("Service {0} not found")]
   ServiceNotFound(Uuid),

   #[error("Characteristic {0} not found")]
   CharacteristicNotFound(Uuid),

   #[error("Socket creation failed: {0}")]
   SocketCreateFailed(String),

   #[error("Connection timed out")]
   ConnectTimeout,

   #[error("I/O error: {0}")]
   IoFailure(String),
}

impl From<Denied> for ConnectError {
   fn from(Denied(capability): Denied) -> Self {
      Self::PermissionDenied(capability)
   }
}

/// Why an outbound payload was not delivered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
   #[error("Not connected")]
   NotConnected,

   #[error("{0} not granted")]
   PermissionDenied(Capability),

   #[error("I/O error: {0}")]
   IoFailure(String),
}

impl From<Denied> for WriteError {
   fn from(Denied(capability): Denied) -> Self {
      Self::PermissionDenied(capability)
   }
}

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum LinkError {
   #[error("{0} not granted")]
   PermissionDenied(Capability),

   #[error("Bluetooth is not supported on this device")]
   UnsupportedHardware,

   #[error("Link operation already in progress")]
   AlreadyInProgress,

   #[error(transparent)]
   Connect(#[from] ConnectError),

   #[error(transparent)]
   Write(#[from] WriteError),

   #[error("Radio error: {0}")]
   Radio(String),

   #[cfg(feature = "bluez")]
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

impl From<Denied> for LinkError {
   fn from(Denied(capability): Denied) -> Self {
      Self::PermissionDenied(capability)
   }
}

/// Convenience type alias for Results with `LinkError`.
pub type Result<T> = std::result::Result<T, LinkError>;
