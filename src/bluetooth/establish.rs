//! Link establishment strategies.
//!
//! A deployment picks one [`LinkStrategy`] in its configuration. Both
//! variants honour the same contract, so the manager does not care which
//! one it was given.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
   bluetooth::{channel::Channel, radio::Radio},
   capability::{self, Capability},
   error::ConnectError,
   peer::Peer,
};

/// HM-10 serial service.
pub const HM10_SERVICE: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
/// HM-10 serial characteristic (notify + write without response).
pub const HM10_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);
/// Serial Port Profile.
pub const SPP_SERVICE: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb);

const fn default_service() -> Uuid {
   HM10_SERVICE
}

const fn default_characteristic() -> Uuid {
   HM10_CHARACTERISTIC
}

const fn default_stream_service() -> Uuid {
   SPP_SERVICE
}

/// How a link to a peer is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkStrategy {
   /// Service discovery, then notifications on one characteristic.
   Negotiated {
      #[serde(default = "default_service")]
      service: Uuid,
      #[serde(default = "default_characteristic")]
      characteristic: Uuid,
   },
   /// Direct stream socket to a well-known service.
   Streaming {
      #[serde(default = "default_stream_service")]
      service: Uuid,
   },
}

impl Default for LinkStrategy {
   fn default() -> Self {
      Self::Negotiated {
         service: HM10_SERVICE,
         characteristic: HM10_CHARACTERISTIC,
      }
   }
}

impl LinkStrategy {
   /// Opens a channel to `peer`.
   ///
   /// The connect capability is re-checked immediately before the radio is
   /// touched. A failed attempt leaves nothing open behind it.
   pub async fn establish(&self, radio: &dyn Radio, peer: &Peer) -> Result<Channel, ConnectError> {
      if !radio.is_supported() {
         return Err(ConnectError::UnsupportedHardware);
      }
      capability::require(radio, Capability::Connect)?;

      let result = match *self {
         Self::Negotiated {
            service,
            characteristic,
         } => {
            debug!("{}: negotiating {service}/{characteristic}", peer.id());
            radio
               .open_negotiated_link(peer, service, characteristic)
               .await
         },
         Self::Streaming { service } => {
            debug!("{}: opening stream to {service}", peer.id());
            radio.open_streaming_link(peer, service).await
         },
      };

      match &result {
         Ok(channel) => info!("{}: link established ({:?})", peer.id(), channel.strategy()),
         Err(e) => warn!("{}: link failed: {e}", peer.id()),
      }
      result
   }
}
