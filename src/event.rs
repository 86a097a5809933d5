//! Event delivery to the external listener.
//!
//! The manager emits [`LinkEvent`]s through an [`EventBus`]. The
//! [`EventDispatcher`] queues them and replays them, in order and exactly
//! once, on a single task that owns the consumer's [`EventSink`], so the
//! sink never has to be reentrant.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::debug;
use smol_str::SmolStr;
use tokio::{
   sync::{Notify, mpsc},
   task::JoinHandle,
   time,
};

use crate::{bluetooth::channel::Chunk, peer::Peer};

/// How often an idle dispatcher re-checks whether its producers are gone.
const IDLE_RECHECK: Duration = Duration::from_secs(1);

/// Events surfaced by the link manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
   PeerDiscovered(Peer),
   Connected(SmolStr),
   Disconnected(SmolStr),
   DataReceived(Chunk),
   Error(String),
}

/// The consumer-facing listener.
pub trait EventSink: Send + Sync {
   fn on_peer_discovered(&self, peer: &Peer);
   fn on_connected(&self, name: &str);
   fn on_disconnected(&self, name: &str);
   fn on_data_received(&self, data: &[u8]);
   fn on_error(&self, message: &str);
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   fn emit(&self, event: LinkEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Lets a consumer drain events from its own context.
impl EventBus for mpsc::UnboundedSender<LinkEvent> {
   fn emit(&self, event: LinkEvent) {
      if self.send(event).is_err() {
         debug!("Event receiver dropped");
      }
   }
}

/// Queue that marshals events onto one consumer task.
pub struct EventDispatcher {
   queue: SegQueue<LinkEvent>,
   notifier: Notify,
}

impl EventDispatcher {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   /// Waits for the next event.
   ///
   /// Returns `None` once the queue is drained and every other handle to
   /// the dispatcher has been dropped.
   pub async fn recv(self: &Arc<Self>) -> Option<LinkEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(IDLE_RECHECK, self.notifier.notified()).await;
      }
   }

   /// Spawns the task that feeds `sink`.
   pub fn spawn(self: Arc<Self>, sink: Arc<dyn EventSink>) -> JoinHandle<()> {
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            Self::dispatch(sink.as_ref(), event);
         }
         debug!("Event dispatcher finished");
      })
   }

   pub fn dispatch(sink: &dyn EventSink, event: LinkEvent) {
      match event {
         LinkEvent::PeerDiscovered(peer) => sink.on_peer_discovered(&peer),
         LinkEvent::Connected(name) => sink.on_connected(&name),
         LinkEvent::Disconnected(name) => sink.on_disconnected(&name),
         LinkEvent::DataReceived(data) => sink.on_data_received(&data),
         LinkEvent::Error(message) => sink.on_error(&message),
      }
   }
}

impl EventBus for EventDispatcher {
   fn emit(&self, event: LinkEvent) {
      self.queue.push(event);
      self.notifier.notify_one();
   }
}
