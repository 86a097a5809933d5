//! Board-link manager.
//!
//! A single actor owns the link state and serializes every transition:
//! scanning, connecting, the established link and its teardown. Callbacks
//! from the radio, the scan timer, establishment attempts and the reader
//! loop never touch that state; they post messages to the actor's loopback
//! channel and the actor decides what they mean.

use std::{fmt::Display, mem, sync::Arc, time::Duration};

use log::{debug, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot, watch},
   task::JoinHandle,
   time,
};

use crate::{
   bluetooth::{
      channel::{self, Channel, Inbound, LinkSender},
      establish::LinkStrategy,
      radio::{Radio, ScanReporter},
      scanner::ScanSession,
   },
   capability::{self, Capability},
   config::Config,
   error::{ConnectError, LinkError, Result, WriteError},
   event::{LinkEvent, EventSender},
   peer::{Peer, PeerId},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;
/// How long teardown waits for an in-flight write before aborting it
const WRITER_GRACE: Duration = Duration::from_secs(1);

// === Link State ===

/// Externally visible link state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
   Idle,
   Scanning,
   Connecting(PeerId),
   Connected(PeerId),
   Disconnecting,
}

/// Link state plus whether a reader loop is live.
///
/// A reader that has already been told to stop is not counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
   pub status: LinkStatus,
   pub reader_running: bool,
}

struct Attempt {
   id: u64,
   peer: Peer,
   handle: JoinHandle<()>,
}

struct ActiveLink {
   id: u64,
   peer: Peer,
   sender: LinkSender,
   stop: watch::Sender<bool>,
   reader: JoinHandle<()>,
   writer: JoinHandle<()>,
}

struct Teardown {
   id: u64,
   peer: Peer,
}

enum LinkState {
   Idle,
   Scanning(ScanSession),
   Connecting(Attempt),
   Connected(ActiveLink),
   Disconnecting(Teardown),
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // User commands
   StartScan(oneshot::Sender<()>),
   StopScan(oneshot::Sender<()>),
   Connect(PeerId, oneshot::Sender<()>),
   Close(oneshot::Sender<()>),
   Sender(oneshot::Sender<std::result::Result<LinkSender, WriteError>>),
   Snapshot(oneshot::Sender<LinkSnapshot>),
   DiscoveredPeers(oneshot::Sender<Vec<Peer>>),
   BondedPeers(oneshot::Sender<Vec<Peer>>),
   RadioEnabled(oneshot::Sender<bool>),

   // Internal signals, tagged with the id of the unit that raised them
   PeerFound(u64, Peer),
   ScanExpired(u64),
   Established(u64, std::result::Result<Channel, ConnectError>),
   Inbound(u64, Inbound),
   TeardownComplete(u64),
}

// === Main Manager ===

/// Handle to the link manager.
///
/// Commands return once the manager has acted on them; outcomes, including
/// failures, are reported through the event sender. The only error a
/// command itself returns is [`LinkError::ManagerShutdown`]. Dropping the
/// last handle shuts the manager down and closes any open link.
pub struct LinkManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl LinkManager {
   /// Spawns the manager on the current tokio runtime.
   pub fn new(radio: Arc<dyn Radio>, config: &Config, event_tx: EventSender) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ManagerActor::new(radio, config, event_tx, command_rx).run());
      Self { inbox: command_tx }
   }

   async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(command(tx))
         .await
         .map_err(|_| LinkError::ManagerShutdown)?;
      rx.await.map_err(|_| LinkError::ManagerShutdown)
   }

   /// Starts a timed scan. No-op while already scanning.
   pub async fn start_scan(&self) -> Result<()> {
      self.request(ManagerCommand::StartScan).await
   }

   /// Stops the current scan. No-op when not scanning.
   pub async fn stop_scan(&self) -> Result<()> {
      self.request(ManagerCommand::StopScan).await
   }

   /// Starts connecting to `peer`, implicitly stopping any scan.
   ///
   /// Rejected with an error event while another attempt or link exists.
   pub async fn connect(&self, peer: impl Into<PeerId>) -> Result<()> {
      let peer = peer.into();
      self.request(|tx| ManagerCommand::Connect(peer, tx)).await
   }

   /// Tears down whatever is in progress. Idempotent.
   ///
   /// Returns as soon as teardown has begun; `Disconnected` follows once
   /// both stream handles are closed.
   pub async fn close(&self) -> Result<()> {
      self.request(ManagerCommand::Close).await
   }

   /// Writes `data` to the connected peer.
   pub async fn send(&self, data: &[u8]) -> std::result::Result<(), WriteError> {
      let sender = self
         .request(ManagerCommand::Sender)
         .await
         .map_err(|_| WriteError::NotConnected)??;
      sender.send(data).await
   }

   pub async fn snapshot(&self) -> Result<LinkSnapshot> {
      self.request(ManagerCommand::Snapshot).await
   }

   pub async fn status(&self) -> Result<LinkStatus> {
      Ok(self.snapshot().await?.status)
   }

   /// Peers found by the most recent scan.
   pub async fn discovered_peers(&self) -> Vec<Peer> {
      self
         .request(ManagerCommand::DiscoveredPeers)
         .await
         .unwrap_or_default()
   }

   /// Peers paired with this host. Empty when the connect capability is
   /// not granted.
   pub async fn bonded_peers(&self) -> Vec<Peer> {
      self
         .request(ManagerCommand::BondedPeers)
         .await
         .unwrap_or_default()
   }

   pub async fn radio_enabled(&self) -> bool {
      self
         .request(ManagerCommand::RadioEnabled)
         .await
         .unwrap_or_default()
   }
}

// === Manager Actor ===

struct ManagerActor {
   radio: Arc<dyn Radio>,
   strategy: LinkStrategy,
   scan_window: Duration,
   read_buffer_size: usize,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::UnboundedReceiver<ManagerCommand>,
   loopback_tx: mpsc::UnboundedSender<ManagerCommand>,

   // State
   state: LinkState,
   discovered: Vec<Peer>,
   last_id: u64,
}

impl ManagerActor {
   fn new(
      radio: Arc<dyn Radio>,
      config: &Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
      Self {
         radio,
         strategy: config.strategy,
         scan_window: config.scan_window(),
         read_buffer_size: config.read_buffer_size,
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         state: LinkState::Idle,
         discovered: Vec::new(),
         last_id: 0,
      }
   }

   async fn run(mut self) {
      info!("Link manager starting up ({:?})", self.strategy);

      if !self.radio.is_supported() {
         self.emit_error(LinkError::UnsupportedHardware);
      }

      loop {
         select! {
            // Internal signals first: anything raised before a command
            // was sent is handled before that command.
            biased;
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd).await;
            }
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Link manager shutting down");
                  break;
               };
               self.handle_command(cmd).await;
            }
         }
      }

      self.cleanup().await;
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::StartScan(reply) => {
            self.start_scan().await;
            let _ = reply.send(());
         },
         ManagerCommand::StopScan(reply) => {
            self.stop_scan().await;
            let _ = reply.send(());
         },
         ManagerCommand::Connect(peer, reply) => {
            self.connect(peer).await;
            let _ = reply.send(());
         },
         ManagerCommand::Close(reply) => {
            self.close().await;
            let _ = reply.send(());
         },
         ManagerCommand::Sender(reply) => {
            let _ = reply.send(self.link_sender());
         },
         ManagerCommand::Snapshot(reply) => {
            let _ = reply.send(self.snapshot());
         },
         ManagerCommand::DiscoveredPeers(reply) => {
            let _ = reply.send(self.discovered.clone());
         },
         ManagerCommand::BondedPeers(reply) => {
            let _ = reply.send(self.bonded_peers().await);
         },
         ManagerCommand::RadioEnabled(reply) => {
            let _ = reply.send(self.radio.is_enabled().await);
         },
         ManagerCommand::PeerFound(scan, peer) => {
            self.handle_peer_found(scan, peer);
         },
         ManagerCommand::ScanExpired(scan) => {
            if matches!(&self.state, LinkState::Scanning(session) if session.id() == scan) {
               info!("Scan window elapsed");
               self.stop_scan().await;
            }
         },
         ManagerCommand::Established(attempt, result) => {
            self.handle_established(attempt, result);
         },
         ManagerCommand::Inbound(link, inbound) => {
            self.handle_inbound(link, inbound);
         },
         ManagerCommand::TeardownComplete(link) => {
            self.handle_teardown_complete(link);
         },
      }
   }

   fn next_id(&mut self) -> u64 {
      self.last_id += 1;
      self.last_id
   }

   fn emit(&self, event: LinkEvent) {
      self.event_tx.emit(event);
   }

   fn emit_error(&self, err: impl Display) {
      let message = err.to_string();
      warn!("{message}");
      self.emit(LinkEvent::Error(message));
   }

   /// Capability check; a denial is reported and nothing else happens.
   fn gate(&self, capability: Capability) -> bool {
      match capability::require(self.radio.as_ref(), capability) {
         Ok(()) => true,
         Err(denied) => {
            self.emit_error(denied);
            false
         },
      }
   }

   fn snapshot(&self) -> LinkSnapshot {
      let (status, reader_running) = match &self.state {
         LinkState::Idle => (LinkStatus::Idle, false),
         LinkState::Scanning(_) => (LinkStatus::Scanning, false),
         LinkState::Connecting(attempt) => (LinkStatus::Connecting(attempt.peer.id().clone()), false),
         LinkState::Connected(link) => (
            LinkStatus::Connected(link.peer.id().clone()),
            !link.reader.is_finished(),
         ),
         LinkState::Disconnecting(_) => (LinkStatus::Disconnecting, false),
      };
      LinkSnapshot {
         status,
         reader_running,
      }
   }

   // === Scanning ===

   async fn start_scan(&mut self) {
      match self.state {
         LinkState::Scanning(_) => return,
         LinkState::Idle => {},
         _ => {
            self.emit_error(LinkError::AlreadyInProgress);
            return;
         },
      }
      if !self.radio.is_supported() {
         self.emit_error(LinkError::UnsupportedHardware);
         return;
      }
      if !self.gate(Capability::Scan) {
         return;
      }

      let id = self.next_id();
      let loopback = self.loopback_tx.clone();
      let reporter = ScanReporter::new(move |peer| {
         loopback
            .send(ManagerCommand::PeerFound(id, peer))
            .is_ok()
      });
      if let Err(e) = self.radio.start_scan(reporter).await {
         self.emit_error(e);
         return;
      }

      self.discovered.clear();
      let loopback = self.loopback_tx.clone();
      let session = ScanSession::start(id, self.scan_window, async move {
         let _ = loopback.send(ManagerCommand::ScanExpired(id));
      });
      info!("Scan {id} started for {:?}", self.scan_window);
      self.state = LinkState::Scanning(session);
   }

   /// Returns `false` if a scan is still running afterwards.
   async fn stop_scan(&mut self) -> bool {
      let LinkState::Scanning(session) = &self.state else {
         return true;
      };
      let (id, found) = (session.id(), session.len());
      if !self.gate(Capability::Scan) {
         return false;
      }

      self.radio.stop_scan().await;
      // Dropping the session cancels its timer.
      self.state = LinkState::Idle;
      info!("Scan {id} stopped, {found} peers found");
      true
   }

   fn handle_peer_found(&mut self, scan: u64, peer: Peer) {
      let LinkState::Scanning(session) = &mut self.state else {
         debug!("Ignoring {peer}: not scanning");
         return;
      };
      if session.id() != scan || !session.admit(&peer) {
         return;
      }

      info!("Discovered {peer}");
      self.discovered.push(peer.clone());
      self.emit(LinkEvent::PeerDiscovered(peer));
   }

   async fn bonded_peers(&self) -> Vec<Peer> {
      if !self.gate(Capability::Connect) {
         return Vec::new();
      }
      match self.radio.bonded_peers().await {
         Ok(peers) => peers,
         Err(e) => {
            self.emit_error(e);
            Vec::new()
         },
      }
   }

   // === Connecting ===

   async fn connect(&mut self, peer_id: PeerId) {
      match &self.state {
         LinkState::Idle | LinkState::Scanning(_) => {},
         _ => {
            warn!("Rejecting connect to {peer_id}: link busy");
            self.emit_error(LinkError::AlreadyInProgress);
            return;
         },
      }
      if !self.radio.is_supported() {
         self.emit_error(LinkError::UnsupportedHardware);
         return;
      }
      if !self.gate(Capability::Connect) {
         return;
      }
      if !self.stop_scan().await {
         return;
      }

      let peer = self
         .discovered
         .iter()
         .find(|p| p.id() == &peer_id)
         .cloned()
         .unwrap_or_else(|| Peer::unnamed(peer_id));

      let id = self.next_id();
      let radio = self.radio.clone();
      let strategy = self.strategy;
      let loopback = self.loopback_tx.clone();
      let target = peer.clone();
      let handle = tokio::spawn(async move {
         let result = strategy.establish(radio.as_ref(), &target).await;
         let _ = loopback.send(ManagerCommand::Established(id, result));
      });

      info!("Connecting to {peer}");
      self.state = LinkState::Connecting(Attempt { id, peer, handle });
   }

   fn handle_established(
      &mut self,
      attempt: u64,
      result: std::result::Result<Channel, ConnectError>,
   ) {
      let current = match &self.state {
         LinkState::Connecting(current) => Some(current.id),
         _ => None,
      };
      if current != Some(attempt) {
         // Dropping the channel closes whatever the attempt opened.
         debug!("Discarding result of cancelled attempt {attempt}");
         return;
      }

      match result {
         Ok(channel) => self.install(attempt, channel),
         Err(e) => {
            self.state = LinkState::Idle;
            self.emit_error(e);
         },
      }
   }

   fn install(&mut self, id: u64, channel: Channel) {
      let (peer, reader, writer) = channel.into_parts();
      let (stop, stop_rx) = watch::channel(false);

      let loopback = self.loopback_tx.clone();
      let reader = channel::spawn_reader(
         peer.clone(),
         reader,
         self.read_buffer_size,
         stop_rx.clone(),
         move |inbound| {
            loopback
               .send(ManagerCommand::Inbound(id, inbound))
               .is_ok()
         },
      );
      let (sender, writer) = channel::spawn_writer(peer.clone(), writer, stop_rx);

      info!("Connected to {peer}");
      let name = peer.display_name();
      self.state = LinkState::Connected(ActiveLink {
         id,
         peer,
         sender,
         stop,
         reader,
         writer,
      });
      self.emit(LinkEvent::Connected(name));
   }

   // === Connected ===

   fn link_sender(&self) -> std::result::Result<LinkSender, WriteError> {
      let LinkState::Connected(link) = &self.state else {
         return Err(WriteError::NotConnected);
      };
      if let Err(denied) = capability::require(self.radio.as_ref(), Capability::Connect) {
         self.emit_error(denied);
         return Err(denied.into());
      }
      Ok(link.sender.clone())
   }

   fn handle_inbound(&mut self, link: u64, inbound: Inbound) {
      let LinkState::Connected(active) = &self.state else {
         debug!("Dropping inbound from link {link}: not connected");
         return;
      };
      if active.id != link {
         return;
      }

      match inbound {
         Inbound::Data(chunk) => self.emit(LinkEvent::DataReceived(chunk)),
         Inbound::Closed(reason) => {
            match reason {
               Some(e) => warn!("Link to {} lost: {e}", active.peer),
               None => info!("Link to {} closed by peer", active.peer),
            }
            self.begin_teardown();
         },
      }
   }

   // === Teardown ===

   async fn close(&mut self) {
      match &self.state {
         LinkState::Idle | LinkState::Disconnecting(_) => {},
         LinkState::Scanning(_) => {
            self.stop_scan().await;
         },
         LinkState::Connecting(_) => {
            if !self.gate(Capability::Connect) {
               return;
            }
            if let LinkState::Connecting(attempt) = mem::replace(&mut self.state, LinkState::Idle) {
               attempt.handle.abort();
               info!("Cancelled connection attempt to {}", attempt.peer);
            }
         },
         LinkState::Connected(_) => {
            if self.gate(Capability::Connect) {
               self.begin_teardown();
            }
         },
      }
   }

   /// Stops the reader and writer, then reports `TeardownComplete` once
   /// both have let go of their stream halves.
   fn begin_teardown(&mut self) {
      let state = mem::replace(&mut self.state, LinkState::Idle);
      let LinkState::Connected(link) = state else {
         self.state = state;
         return;
      };
      let ActiveLink {
         id,
         peer,
         sender,
         stop,
         reader,
         mut writer,
      } = link;

      drop(sender);
      stop.send_replace(true);
      info!("Closing link to {peer}");

      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let _ = reader.await;
         if time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
            warn!("Writer did not finish in {WRITER_GRACE:?}, aborting");
            writer.abort();
            let _ = writer.await;
         }
         drop(stop);
         let _ = loopback.send(ManagerCommand::TeardownComplete(id));
      });

      self.state = LinkState::Disconnecting(Teardown { id, peer });
   }

   fn handle_teardown_complete(&mut self, link: u64) {
      if !matches!(&self.state, LinkState::Disconnecting(t) if t.id == link) {
         return;
      }
      if let LinkState::Disconnecting(teardown) = mem::replace(&mut self.state, LinkState::Idle) {
         info!("Disconnected from {}", teardown.peer);
         self.emit(LinkEvent::Disconnected(teardown.peer.display_name()));
      }
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up link manager");

      let peer = match mem::replace(&mut self.state, LinkState::Idle) {
         LinkState::Idle => None,
         LinkState::Scanning(session) => {
            drop(session);
            self.radio.stop_scan().await;
            None
         },
         LinkState::Connecting(attempt) => {
            attempt.handle.abort();
            None
         },
         LinkState::Connected(link) => {
            let ActiveLink {
               peer,
               sender,
               stop,
               reader,
               mut writer,
               ..
            } = link;
            drop(sender);
            stop.send_replace(true);
            let _ = time::timeout(WRITER_GRACE, reader).await;
            if time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
               writer.abort();
            }
            Some(peer)
         },
         LinkState::Disconnecting(teardown) => {
            // Give the teardown task its chance to finish.
            while let Ok(Some(cmd)) = time::timeout(WRITER_GRACE * 2, self.loopback_rx.recv()).await {
               if matches!(cmd, ManagerCommand::TeardownComplete(id) if id == teardown.id) {
                  break;
               }
            }
            Some(teardown.peer)
         },
      };

      if let Some(peer) = peer {
         info!("Disconnected from {peer}");
         self.emit(LinkEvent::Disconnected(peer.display_name()));
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::Ordering;

   use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

   use super::*;
   use crate::bluetooth::{
      channel::Chunk,
      establish::{HM10_SERVICE, SPP_SERVICE},
      radio::mock::{LinkPlan, MockRadio},
   };

   const BUSY: &str = "Link operation already in progress";

   struct Harness {
      radio: Arc<MockRadio>,
      manager: LinkManager,
      events: mpsc::UnboundedReceiver<LinkEvent>,
   }

   impl Harness {
      fn new() -> Self {
         Self::with_radio(MockRadio::new())
      }

      fn with_radio(radio: MockRadio) -> Self {
         Self::with_config(radio, Config::default())
      }

      fn with_config(radio: MockRadio, config: Config) -> Self {
         let _ = env_logger::builder().is_test(true).try_init();
         let radio = Arc::new(radio);
         let (tx, events) = mpsc::unbounded_channel();
         let manager = LinkManager::new(radio.clone(), &config, Arc::new(tx));
         Self {
            radio,
            manager,
            events,
         }
      }

      async fn next_event(&mut self) -> LinkEvent {
         time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
      }

      /// Round-trips through the actor, then checks nothing was emitted.
      async fn assert_quiet(&mut self) {
         self.manager.snapshot().await.unwrap();
         if let Ok(event) = self.events.try_recv() {
            panic!("unexpected event: {event:?}");
         }
      }

      async fn status(&self) -> LinkStatus {
         self.manager.status().await.unwrap()
      }

      async fn connect(&mut self, id: &str) -> DuplexStream {
         self.manager.connect(id).await.unwrap();
         assert_eq!(self.next_event().await, LinkEvent::Connected(id.into()));
         self.radio.take_far_end().expect("no link was opened")
      }
   }

   #[tokio::test]
   async fn test_scan_connect_data_eof_scenario() {
      let mut h = Harness::new();

      h.manager.start_scan().await.unwrap();
      assert_eq!(h.status().await, LinkStatus::Scanning);
      assert!(h.radio.is_scanning());

      h.radio.discover(Peer::unnamed("AA:BB"));
      h.radio.discover(Peer::unnamed("AA:BB"));
      assert_eq!(
         h.next_event().await,
         LinkEvent::PeerDiscovered(Peer::unnamed("AA:BB"))
      );
      h.assert_quiet().await;

      let mut far = h.connect("AA:BB").await;
      assert!(!h.radio.is_scanning());
      h.radio.discover(Peer::unnamed("EE:FF"));
      h.assert_quiet().await;

      far.write_all(&[0x41, 0x42]).await.unwrap();
      assert_eq!(
         h.next_event().await,
         LinkEvent::DataReceived(Chunk::from_slice(&[0x41, 0x42]))
      );

      drop(far);
      assert_eq!(h.next_event().await, LinkEvent::Disconnected("AA:BB".into()));
      let snapshot = h.manager.snapshot().await.unwrap();
      assert_eq!(snapshot.status, LinkStatus::Idle);
      assert!(!snapshot.reader_running);
      h.assert_quiet().await;
   }

   #[tokio::test]
   async fn test_connect_uses_discovered_name() {
      let mut h = Harness::new();
      h.manager.start_scan().await.unwrap();
      h.radio.discover(Peer::new("AA:BB", Some("HMSoft")));
      h.next_event().await;

      h.manager.connect("AA:BB").await.unwrap();
      assert_eq!(h.next_event().await, LinkEvent::Connected("HMSoft".into()));
   }

   #[tokio::test(start_paused = true)]
   async fn test_scan_stops_after_window() {
      let mut h = Harness::new();
      h.manager.start_scan().await.unwrap();

      time::sleep(Duration::from_secs(9)).await;
      assert_eq!(h.status().await, LinkStatus::Scanning);

      time::sleep(Duration::from_secs(2)).await;
      assert_eq!(h.status().await, LinkStatus::Idle);
      assert!(!h.radio.is_scanning());
      h.assert_quiet().await;
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_preempts_scan_timer() {
      let mut h = Harness::new();
      h.manager.start_scan().await.unwrap();
      let _far = h.connect("AA:BB").await;

      time::sleep(Duration::from_secs(20)).await;
      assert_eq!(h.status().await, LinkStatus::Connected("AA:BB".into()));
      h.assert_quiet().await;
   }

   #[tokio::test]
   async fn test_rescan_clears_discovered() {
      let mut h = Harness::new();
      h.manager.start_scan().await.unwrap();
      for id in ["AA:BB", "CC:DD", "AA:BB", "CC:DD", "AA:BB"] {
         h.radio.discover(Peer::unnamed(id));
      }
      h.manager.stop_scan().await.unwrap();

      assert_eq!(
         h.manager.discovered_peers().await,
         vec![Peer::unnamed("AA:BB"), Peer::unnamed("CC:DD")]
      );
      h.next_event().await;
      h.next_event().await;
      h.assert_quiet().await;

      h.manager.start_scan().await.unwrap();
      assert!(h.manager.discovered_peers().await.is_empty());
      h.radio.discover(Peer::unnamed("AA:BB"));
      assert_eq!(
         h.next_event().await,
         LinkEvent::PeerDiscovered(Peer::unnamed("AA:BB"))
      );
   }

   #[tokio::test]
   async fn test_start_scan_twice_is_noop() {
      let mut h = Harness::new();
      h.manager.start_scan().await.unwrap();
      h.radio.discover(Peer::unnamed("AA:BB"));
      h.manager.start_scan().await.unwrap();
      h.radio.discover(Peer::unnamed("AA:BB"));

      h.next_event().await;
      h.assert_quiet().await;
      assert_eq!(h.manager.discovered_peers().await.len(), 1);
   }

   #[tokio::test]
   async fn test_scan_denied_changes_nothing() {
      let mut h = Harness::new();
      h.radio.deny(Capability::Scan);

      h.manager.start_scan().await.unwrap();
      assert_eq!(
         h.next_event().await,
         LinkEvent::Error("Bluetooth scan permission not granted".into())
      );
      assert_eq!(h.status().await, LinkStatus::Idle);
      assert!(!h.radio.is_scanning());
   }

   #[tokio::test]
   async fn test_stop_scan_denied_keeps_scanning() {
      let mut h = Harness::new();
      h.manager.start_scan().await.unwrap();
      h.radio.deny(Capability::Scan);

      h.manager.stop_scan().await.unwrap();
      assert_eq!(
         h.next_event().await,
         LinkEvent::Error("Bluetooth scan permission not granted".into())
      );
      assert_eq!(h.status().await, LinkStatus::Scanning);
      assert!(h.radio.is_scanning());
   }

   #[tokio::test]
   async fn test_scan_radio_failure() {
      let radio = MockRadio::new();
      radio.fail_scans();
      let mut h = Harness::with_radio(radio);

      h.manager.start_scan().await.unwrap();
      assert_eq!(
         h.next_event().await,
         LinkEvent::Error("Radio error: adapter busy".into())
      );
      assert_eq!(h.status().await, LinkStatus::Idle);
   }

   #[tokio::test]
   async fn test_connect_denied_never_enters_connecting() {
      let mut h = Harness::new();
      h.radio.deny(Capability::Connect);

      h.manager.connect("AA:BB").await.unwrap();
      assert_eq!(
         h.next_event().await,
         LinkEvent::Error("Bluetooth connect permission not granted".into())
      );
      assert_eq!(h.status().await, LinkStatus::Idle);
      assert_eq!(h.radio.opened.load(Ordering::SeqCst), 0);
   }

   #[tokio::test]
   async fn test_connect_failure_returns_to_idle() {
      let mut h = Harness::new();
      h.radio
         .plan(LinkPlan::Fail(ConnectError::ServiceNotFound(HM10_SERVICE)));

      h.manager.connect("AA:BB").await.unwrap();
      assert_eq!(
         h.next_event().await,
         LinkEvent::Error(ConnectError::ServiceNotFound(HM10_SERVICE).to_string())
      );
      assert_eq!(h.status().await, LinkStatus::Idle);

      // Recoverable by trying again.
      let _far = h.connect("AA:BB").await;
   }

   #[tokio::test]
   async fn test_connect_rejected_while_connecting() {
      let mut h = Harness::new();
      h.radio.plan(LinkPlan::Hold);

      h.manager.connect("AA:BB").await.unwrap();
      assert_eq!(h.status().await, LinkStatus::Connecting("AA:BB".into()));

      h.manager.connect("CC:DD").await.unwrap();
      assert_eq!(h.next_event().await, LinkEvent::Error(BUSY.into()));
      assert_eq!(h.status().await, LinkStatus::Connecting("AA:BB".into()));

      h.radio.release();
      assert_eq!(h.next_event().await, LinkEvent::Connected("AA:BB".into()));
      assert_eq!(h.radio.opened.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn test_connect_rejected_while_connected() {
      let mut h = Harness::new();
      let _far = h.connect("AA:BB").await;

      h.manager.connect("CC:DD").await.unwrap();
      assert_eq!(h.next_event().await, LinkEvent::Error(BUSY.into()));
      assert_eq!(h.status().await, LinkStatus::Connected("AA:BB".into()));

      h.manager.start_scan().await.unwrap();
      assert_eq!(h.next_event().await, LinkEvent::Error(BUSY.into()));
      assert_eq!(h.status().await, LinkStatus::Connected("AA:BB".into()));
   }

   #[tokio::test]
   async fn test_close_twice_emits_once() {
      let mut h = Harness::new();
      let mut far = h.connect("AA:BB").await;

      h.manager.close().await.unwrap();
      assert_eq!(h.next_event().await, LinkEvent::Disconnected("AA:BB".into()));
      assert_eq!(h.status().await, LinkStatus::Idle);

      // Both halves are closed once Disconnected has been seen.
      let mut buf = [0u8; 8];
      assert_eq!(far.read(&mut buf).await.unwrap(), 0);

      h.manager.close().await.unwrap();
      h.assert_quiet().await;
      assert_eq!(h.status().await, LinkStatus::Idle);
   }

   #[tokio::test]
   async fn test_close_while_connecting_discards_result() {
      let mut h = Harness::new();
      h.radio.plan(LinkPlan::Hold);

      h.manager.connect("AA:BB").await.unwrap();
      h.manager.close().await.unwrap();
      assert_eq!(h.status().await, LinkStatus::Idle);

      h.radio.release();
      tokio::task::yield_now().await;
      h.assert_quiet().await;
      assert!(h.radio.take_far_end().is_none());

      let _far = h.connect("CC:DD").await;
   }

   #[tokio::test]
   async fn test_close_while_scanning_stops_scan() {
      let mut h = Harness::new();
      h.manager.start_scan().await.unwrap();
      h.manager.close().await.unwrap();

      assert_eq!(h.status().await, LinkStatus::Idle);
      assert!(!h.radio.is_scanning());
      h.assert_quiet().await;
   }

   #[tokio::test]
   async fn test_send_then_stream_closed() {
      let mut h = Harness::new();
      let mut far = h.connect("AA:BB").await;

      h.manager.send(b"21.5").await.unwrap();
      let mut got = [0u8; 4];
      far.read_exact(&mut got).await.unwrap();
      assert_eq!(&got, b"21.5");

      drop(far);
      assert_eq!(h.next_event().await, LinkEvent::Disconnected("AA:BB".into()));
      h.assert_quiet().await;
      assert_eq!(h.status().await, LinkStatus::Idle);
   }

   #[tokio::test]
   async fn test_send_requires_connection() {
      let mut h = Harness::new();
      assert_eq!(h.manager.send(b"x").await, Err(WriteError::NotConnected));
      h.assert_quiet().await;
   }

   #[tokio::test]
   async fn test_send_denied_reports_error() {
      let mut h = Harness::new();
      let _far = h.connect("AA:BB").await;
      h.radio.deny(Capability::Connect);

      assert_eq!(
         h.manager.send(b"x").await,
         Err(WriteError::PermissionDenied(Capability::Connect))
      );
      assert_eq!(
         h.next_event().await,
         LinkEvent::Error("Bluetooth connect permission not granted".into())
      );
      assert_eq!(h.status().await, LinkStatus::Connected("AA:BB".into()));
   }

   #[tokio::test]
   async fn test_reader_runs_only_while_connected() {
      let mut h = Harness::new();
      for round in 0..3 {
         let snapshot = h.manager.snapshot().await.unwrap();
         assert_eq!(snapshot.status, LinkStatus::Idle, "round {round}");
         assert!(!snapshot.reader_running);

         let far = h.connect("AA:BB").await;
         let snapshot = h.manager.snapshot().await.unwrap();
         assert_eq!(snapshot.status, LinkStatus::Connected("AA:BB".into()));
         assert!(snapshot.reader_running);

         if round % 2 == 0 {
            h.manager.close().await.unwrap();
            let snapshot = h.manager.snapshot().await.unwrap();
            assert!(!snapshot.reader_running);
         } else {
            drop(far);
         }
         assert_eq!(h.next_event().await, LinkEvent::Disconnected("AA:BB".into()));
      }
   }

   #[tokio::test]
   async fn test_unsupported_hardware() {
      let mut h = Harness::with_radio(MockRadio::unsupported());
      const UNSUPPORTED: &str = "Bluetooth is not supported on this device";

      assert_eq!(h.next_event().await, LinkEvent::Error(UNSUPPORTED.into()));
      h.manager.start_scan().await.unwrap();
      assert_eq!(h.next_event().await, LinkEvent::Error(UNSUPPORTED.into()));
      h.manager.connect("AA:BB").await.unwrap();
      assert_eq!(h.next_event().await, LinkEvent::Error(UNSUPPORTED.into()));
      assert!(!h.manager.radio_enabled().await);
      assert_eq!(h.status().await, LinkStatus::Idle);
   }

   #[tokio::test]
   async fn test_bonded_peers_gated() {
      let mut h = Harness::new();
      h.radio
         .bonded
         .lock()
         .push(Peer::new("AA:BB", Some("HMSoft")));

      assert_eq!(
         h.manager.bonded_peers().await,
         vec![Peer::unnamed("AA:BB")]
      );

      h.radio.deny(Capability::Connect);
      assert!(h.manager.bonded_peers().await.is_empty());
      assert_eq!(
         h.next_event().await,
         LinkEvent::Error("Bluetooth connect permission not granted".into())
      );
   }

   #[tokio::test]
   async fn test_dropping_manager_closes_link() {
      let mut h = Harness::new();
      let mut far = h.connect("AA:BB").await;

      drop(h.manager);
      assert_eq!(
         time::timeout(Duration::from_secs(5), h.events.recv())
            .await
            .unwrap(),
         Some(LinkEvent::Disconnected("AA:BB".into()))
      );

      let mut buf = [0u8; 8];
      assert_eq!(far.read(&mut buf).await.unwrap(), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_oversized_scan_window_keeps_manager_alive() {
      let config = Config {
         scan_window_secs: u64::MAX,
         ..Config::default()
      };
      let mut h = Harness::with_config(MockRadio::new(), config);

      h.manager.start_scan().await.unwrap();
      assert_eq!(h.status().await, LinkStatus::Scanning);

      time::sleep(Duration::from_secs(3600)).await;
      assert_eq!(h.status().await, LinkStatus::Scanning);

      h.manager.stop_scan().await.unwrap();
      assert_eq!(h.status().await, LinkStatus::Idle);
      assert!(!h.radio.is_scanning());
      h.assert_quiet().await;
   }

   #[tokio::test]
   async fn test_connect_abandoned_when_scan_stop_denied() {
      let mut h = Harness::new();
      h.manager.start_scan().await.unwrap();
      h.radio.deny(Capability::Scan);

      h.manager.connect("AA:BB").await.unwrap();
      assert_eq!(
         h.next_event().await,
         LinkEvent::Error("Bluetooth scan permission not granted".into())
      );
      assert_eq!(h.status().await, LinkStatus::Scanning);
      assert!(h.radio.is_scanning());
      assert_eq!(h.radio.opened.load(Ordering::SeqCst), 0);
      h.assert_quiet().await;
   }

   #[tokio::test]
   async fn test_data_after_close_is_dropped() {
      let mut h = Harness::new();
      let mut far = h.connect("AA:BB").await;

      far.write_all(b"early").await.unwrap();
      h.manager.close().await.unwrap();
      let _ = far.write_all(b"late").await;

      // Whatever was read before close began may still arrive, nothing after.
      let mut seen = Vec::new();
      loop {
         match h.next_event().await {
            LinkEvent::DataReceived(chunk) => seen.extend_from_slice(&chunk),
            LinkEvent::Disconnected(name) => {
               assert_eq!(name.as_str(), "AA:BB");
               break;
            },
            other => panic!("unexpected event: {other:?}"),
         }
      }
      assert!(b"early".starts_with(&seen), "got {seen:?}");

      let _ = far.write_all(b"after").await;
      h.assert_quiet().await;
      assert_eq!(h.status().await, LinkStatus::Idle);
   }

   #[tokio::test]
   async fn test_streaming_strategy_end_to_end() {
      let config = Config {
         strategy: LinkStrategy::Streaming {
            service: SPP_SERVICE,
         },
         ..Config::default()
      };
      let mut h = Harness::with_config(MockRadio::new(), config);

      let mut far = h.connect("AA:BB").await;
      assert_eq!(
         *h.radio.last_target.lock(),
         Some(("streaming", SPP_SERVICE, None))
      );

      far.write_all(b"T=21").await.unwrap();
      assert_eq!(
         h.next_event().await,
         LinkEvent::DataReceived(Chunk::from_slice(b"T=21"))
      );

      h.manager.send(b"ok").await.unwrap();
      let mut got = [0u8; 2];
      far.read_exact(&mut got).await.unwrap();
      assert_eq!(&got, b"ok");

      drop(far);
      assert_eq!(h.next_event().await, LinkEvent::Disconnected("AA:BB".into()));
      assert_eq!(h.status().await, LinkStatus::Idle);
      h.assert_quiet().await;
   }
}
