//! Scan session bookkeeping.
//!
//! A session lives from `start_scan` to the matching stop (explicit or
//! timer). It deduplicates peers by identifier and owns the one-shot timer
//! that ends it.

use std::{collections::HashSet, future::Future, time::Duration};

use tokio::{task::JoinHandle, time::Instant};

use crate::peer::{Peer, PeerId};

/// Deadline used when the window does not fit on the clock (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[derive(Debug)]
pub struct ScanSession {
   id: u64,
   seen: HashSet<PeerId>,
   deadline: Instant,
   timer: JoinHandle<()>,
}

impl ScanSession {
   /// Starts a session and arms its timer. `on_expiry` runs once `window`
   /// has elapsed unless the session is dropped first.
   pub fn start<F>(id: u64, window: Duration, on_expiry: F) -> Self
   where
      F: Future<Output = ()> + Send + 'static,
   {
      let now = Instant::now();
      let deadline = now
         .checked_add(window)
         .unwrap_or_else(|| now + FAR_FUTURE);
      let timer = tokio::spawn(async move {
         tokio::time::sleep_until(deadline).await;
         on_expiry.await;
      });
      Self {
         id,
         seen: HashSet::new(),
         deadline,
         timer,
      }
   }

   pub const fn id(&self) -> u64 {
      self.id
   }

   pub const fn deadline(&self) -> Instant {
      self.deadline
   }

   /// Records `peer`; `true` only the first time its identifier is seen.
   pub fn admit(&mut self, peer: &Peer) -> bool {
      self.seen.insert(peer.id().clone())
   }

   pub fn len(&self) -> usize {
      self.seen.len()
   }
}

impl Drop for ScanSession {
   fn drop(&mut self) {
      self.timer.abort();
   }
}

#[cfg(test)]
mod tests {
   use std::sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   };

   use super::*;

   #[tokio::test]
   async fn test_admit_deduplicates_by_id() {
      let mut session = ScanSession::start(1, Duration::from_secs(10), async {});

      assert!(session.admit(&Peer::new("AA:BB", Some("HMSoft"))));
      assert!(!session.admit(&Peer::unnamed("AA:BB")));
      assert!(session.admit(&Peer::new("CC:DD", Some("HMSoft"))));
      assert!(!session.admit(&Peer::new("CC:DD", Some("Other"))));
      assert_eq!(session.len(), 2);
   }

   #[tokio::test(start_paused = true)]
   async fn test_timer_fires_at_deadline() {
      let fired = Arc::new(AtomicBool::new(false));
      let flag = fired.clone();
      let session = ScanSession::start(7, Duration::from_secs(10), async move {
         flag.store(true, Ordering::SeqCst);
      });
      assert_eq!(session.id(), 7);

      tokio::time::sleep(Duration::from_secs(9)).await;
      assert!(!fired.load(Ordering::SeqCst));
      tokio::time::sleep(Duration::from_secs(2)).await;
      assert!(fired.load(Ordering::SeqCst));
   }

   #[tokio::test(start_paused = true)]
   async fn test_oversized_window_never_expires() {
      let fired = Arc::new(AtomicBool::new(false));
      let flag = fired.clone();
      let session = ScanSession::start(1, Duration::from_secs(u64::MAX), async move {
         flag.store(true, Ordering::SeqCst);
      });
      assert!(session.deadline() > Instant::now());

      tokio::time::sleep(Duration::from_secs(86400 * 365)).await;
      assert!(!fired.load(Ordering::SeqCst));
   }

   #[tokio::test(start_paused = true)]
   async fn test_drop_cancels_timer() {
      let fired = Arc::new(AtomicBool::new(false));
      let flag = fired.clone();
      let session = ScanSession::start(1, Duration::from_secs(10), async move {
         flag.store(true, Ordering::SeqCst);
      });
      drop(session);

      tokio::time::sleep(Duration::from_secs(20)).await;
      assert!(!fired.load(Ordering::SeqCst));
   }
}
