//! Established links and the tasks that move their bytes.
//!
//! A [`Channel`] is a readable half and a writable half for one peer,
//! whichever strategy produced it. Once installed, the reader half is lent
//! to a reader loop and the writer half to a writer task; both stop when
//! the shared stop token fires.

use std::fmt;

use log::{debug, info, warn};
use smallvec::SmallVec;
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
   select,
   sync::{mpsc, oneshot, watch},
   task::JoinHandle,
};

use crate::{error::WriteError, peer::Peer};

/// One inbound read, verbatim.
pub type Chunk = SmallVec<[u8; 32]>;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Outbound queue depth per link.
const WRITE_QUEUE: usize = 128;

/// Which establishment strategy produced a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
   Negotiated,
   Streaming,
}

/// An established bidirectional byte stream to exactly one peer.
pub struct Channel {
   peer: Peer,
   strategy: StrategyKind,
   reader: BoxReader,
   writer: BoxWriter,
}

impl Channel {
   pub fn new(
      peer: Peer,
      strategy: StrategyKind,
      reader: impl AsyncRead + Send + Unpin + 'static,
      writer: impl AsyncWrite + Send + Unpin + 'static,
   ) -> Self {
      Self {
         peer,
         strategy,
         reader: Box::new(reader),
         writer: Box::new(writer),
      }
   }

   /// Splits a full-duplex stream into the two halves.
   pub fn from_stream<S>(peer: Peer, strategy: StrategyKind, stream: S) -> Self
   where
      S: AsyncRead + AsyncWrite + Send + 'static,
   {
      let (reader, writer) = tokio::io::split(stream);
      Self::new(peer, strategy, reader, writer)
   }

   pub fn peer(&self) -> &Peer {
      &self.peer
   }

   pub const fn strategy(&self) -> StrategyKind {
      self.strategy
   }

   pub(crate) fn into_parts(self) -> (Peer, BoxReader, BoxWriter) {
      (self.peer, self.reader, self.writer)
   }
}

impl fmt::Debug for Channel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Channel")
         .field("peer", &self.peer)
         .field("strategy", &self.strategy)
         .finish_non_exhaustive()
   }
}

/// What the reader loop reports to its owner.
#[derive(Debug)]
pub enum Inbound {
   Data(Chunk),
   /// End of stream, or the I/O error that ended it.
   Closed(Option<String>),
}

/// Spawns the reader loop.
///
/// Each read of `n > 0` bytes is reported as one [`Inbound::Data`]. A zero
/// read or an error is reported once as [`Inbound::Closed`] and ends the
/// loop. Observing `stop` ends the loop without reporting anything.
/// `report` returns `false` when its receiver is gone.
pub fn spawn_reader<F>(
   peer: Peer,
   mut reader: BoxReader,
   buffer_size: usize,
   mut stop: watch::Receiver<bool>,
   report: F,
) -> JoinHandle<()>
where
   F: Fn(Inbound) -> bool + Send + 'static,
{
   tokio::spawn(async move {
      let id = peer.id();
      let mut buf = vec![0u8; buffer_size.max(1)];
      loop {
         select! {
            biased;
            _ = stop.changed() => {
               debug!("{id}: reader stopped");
               return;
            }
            res = reader.read(&mut buf) => match res {
               Ok(0) => {
                  info!("{id}: stream closed by peer");
                  report(Inbound::Closed(None));
                  return;
               },
               Ok(n) => {
                  let recvd = &buf[..n];
                  debug!("← {id}: {}", hex::encode(recvd));
                  if !report(Inbound::Data(Chunk::from_slice(recvd))) {
                     warn!("{id}: link owner gone, reader exiting");
                     return;
                  }
               },
               Err(e) => {
                  warn!("{id}: read failed: {e}");
                  report(Inbound::Closed(Some(e.to_string())));
                  return;
               },
            }
         }
      }
   })
}

enum Command {
   Send {
      data: Chunk,
      then: oneshot::Sender<Result<(), WriteError>>,
   },
}

/// Handle for queueing writes on a link. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct LinkSender {
   tx: mpsc::Sender<Command>,
}

impl fmt::Debug for Command {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Send { data, .. } => write!(f, "Send({} bytes)", data.len()),
      }
   }
}

impl LinkSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   /// Writes the whole payload, or reports why it could not.
   pub async fn send(&self, data: &[u8]) -> Result<(), WriteError> {
      if !self.is_connected() {
         return Err(WriteError::NotConnected);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Chunk::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| WriteError::NotConnected)?;

      rx.await.map_err(|_| WriteError::NotConnected)?
   }
}

/// Spawns the writer task; it shuts the writer half down on exit.
pub fn spawn_writer(
   peer: Peer,
   writer: BoxWriter,
   stop: watch::Receiver<bool>,
) -> (LinkSender, JoinHandle<()>) {
   let (tx, rx) = mpsc::channel(WRITE_QUEUE);
   let handle = tokio::spawn(send_thread(peer, writer, rx, stop));
   (LinkSender { tx }, handle)
}

async fn send_thread(
   peer: Peer,
   mut writer: BoxWriter,
   mut rx: mpsc::Receiver<Command>,
   mut stop: watch::Receiver<bool>,
) {
   let id = peer.id();
   loop {
      let cmd = select! {
         biased;
         _ = stop.changed() => break,
         cmd = rx.recv() => cmd,
      };
      let Some(Command::Send { data, then }) = cmd else {
         break;
      };

      debug!("→ {id}: {}", hex::encode(&data));
      let result = write_fully(&mut writer, &data).await;
      if let Err(e) = &result {
         warn!("{id}: failed to send data: {e}");
      }
      let _ = then.send(result);
   }

   if let Err(e) = writer.shutdown().await {
      debug!("{id}: writer shutdown: {e}");
   }
   debug!("{id}: writer closed");
}

async fn write_fully(writer: &mut BoxWriter, data: &[u8]) -> Result<(), WriteError> {
   // write_all keeps going across partial writes
   writer
      .write_all(data)
      .await
      .map_err(|e| WriteError::IoFailure(e.to_string()))?;
   writer
      .flush()
      .await
      .map_err(|e| WriteError::IoFailure(e.to_string()))
}
