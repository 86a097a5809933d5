//! Boundary to the host radio stack.
//!
//! The manager never talks to hardware directly; it drives a [`Radio`]
//! which exposes permission checks, discovery and the two link-opening
//! primitives. Reading, writing and closing happen on the stream halves of
//! the returned [`Channel`].

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
   bluetooth::channel::Channel,
   capability::Capability,
   error::{ConnectError, Result},
   peer::Peer,
};

/// Callback handed to [`Radio::start_scan`] for each peer-found notification.
///
/// Safe to call from any thread; it only enqueues a message for the manager.
/// Returns `false` once the manager is gone and reporting can stop.
#[derive(Clone)]
pub struct ScanReporter(Arc<dyn Fn(Peer) -> bool + Send + Sync>);

impl ScanReporter {
   pub fn new(report: impl Fn(Peer) -> bool + Send + Sync + 'static) -> Self {
      Self(Arc::new(report))
   }

   pub fn report(&self, peer: Peer) -> bool {
      (self.0)(peer)
   }
}

impl fmt::Debug for ScanReporter {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str("ScanReporter")
   }
}

/// Capability surface of the platform radio.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
   /// Whether the host has radio hardware at all.
   fn is_supported(&self) -> bool;

   /// Whether the radio is currently powered.
   async fn is_enabled(&self) -> bool;

   /// Current grant state of `capability`. Must not cache.
   fn check_permission(&self, capability: Capability) -> bool;

   /// Begins delivering peer-found notifications to `reporter`.
   async fn start_scan(&self, reporter: ScanReporter) -> Result<()>;

   /// Halts notifications started by [`Radio::start_scan`].
   async fn stop_scan(&self);

   /// Opens a service/characteristic link with notifications armed.
   async fn open_negotiated_link(
      &self,
      peer: &Peer,
      service: Uuid,
      characteristic: Uuid,
   ) -> std::result::Result<Channel, ConnectError>;

   /// Opens a stream socket to `service` on the peer.
   async fn open_streaming_link(
      &self,
      peer: &Peer,
      service: Uuid,
   ) -> std::result::Result<Channel, ConnectError>;

   /// Peers already paired with this host.
   async fn bonded_peers(&self) -> Result<Vec<Peer>>;
}
