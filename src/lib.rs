//! Board-link manager.
//!
//! Finds nearby boards over a short-range radio, opens a single
//! bidirectional byte link to one of them and relays bytes both ways.
//! Everything the manager observes is reported through an [`EventSink`].
//!
//! The radio itself sits behind the [`Radio`] trait; enable the `bluez`
//! feature for the BlueZ backend.

pub mod bluetooth;
pub mod capability;
pub mod config;
pub mod error;
pub mod event;
pub mod peer;

pub use bluetooth::{
   channel::{Channel, Chunk, StrategyKind},
   establish::{HM10_CHARACTERISTIC, HM10_SERVICE, LinkStrategy, SPP_SERVICE},
   manager::{LinkManager, LinkSnapshot, LinkStatus},
   radio::{Radio, ScanReporter},
};
pub use capability::Capability;
pub use config::Config;
pub use error::{ConnectError, LinkError, Result, WriteError};
pub use event::{EventBus, EventDispatcher, EventSender, EventSink, LinkEvent};
pub use peer::{Peer, PeerId};
