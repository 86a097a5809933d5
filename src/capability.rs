//! Capability gate.
//!
//! Every radio-facing operation asks the radio for a fresh grant right
//! before touching it. Grants are never cached: the host may revoke them at
//! any moment.

use strum::{Display, EnumIter};
use thiserror::Error;

use crate::bluetooth::radio::Radio;

/// A named permission that gates radio operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum Capability {
   /// Needed to start and stop discovery.
   #[strum(to_string = "Bluetooth scan permission")]
   Scan,
   /// Needed to open, use and close a link, and to list bonded peers.
   #[strum(to_string = "Bluetooth connect permission")]
   Connect,
}

/// A capability was not granted at the time of the check.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{0} not granted")]
pub struct Denied(pub Capability);

/// Queries the current grant state. No side effects.
pub fn check(radio: &dyn Radio, capability: Capability) -> bool {
   radio.check_permission(capability)
}

/// Like [`check`], but as a `Result` so callers can bail out with `?`.
pub fn require(radio: &dyn Radio, capability: Capability) -> Result<(), Denied> {
   if check(radio, capability) {
      Ok(())
   } else {
      log::warn!("{capability} not granted");
      Err(Denied(capability))
   }
}
