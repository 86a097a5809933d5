//! Board-link console.
//!
//! Scans for boards, or connects straight to the address given on the
//! command line, then relays stdin lines to the board and prints whatever
//! comes back.

use std::sync::Arc;

use log::{info, warn};
use tokio::{
   io::{AsyncBufReadExt, BufReader},
   signal,
};

use boardlink::{
   Config, EventDispatcher, EventSink, LinkManager, Peer, Result, bluetooth::bluez::BluezRadio,
};

struct ConsoleSink;

impl EventSink for ConsoleSink {
   fn on_peer_discovered(&self, peer: &Peer) {
      println!("found     {:<20} {}", peer.id().as_str(), peer.display_name());
   }

   fn on_connected(&self, name: &str) {
      println!("connected {name}");
   }

   fn on_disconnected(&self, name: &str) {
      println!("closed    {name}");
   }

   fn on_data_received(&self, data: &[u8]) {
      println!("<- {}", String::from_utf8_lossy(data));
   }

   fn on_error(&self, message: &str) {
      println!("error     {message}");
   }
}

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   let config = Config::load()?;
   info!("Loaded configuration ({:?})", config.strategy);

   let radio = Arc::new(BluezRadio::new(&config.bluez).await?);
   let events = EventDispatcher::new();
   let manager = LinkManager::new(radio, &config, events.clone());
   let dispatcher = events.spawn(Arc::new(ConsoleSink));

   match std::env::args().nth(1) {
      Some(address) => manager.connect(address).await?,
      None => manager.start_scan().await?,
   }

   let mut lines = BufReader::new(tokio::io::stdin()).lines();
   loop {
      tokio::select! {
         _ = signal::ctrl_c() => break,
         line = lines.next_line() => {
            let Some(line) = line? else { break };
            if let Err(e) = manager.send(line.as_bytes()).await {
               warn!("Send failed: {e}");
            }
         }
      }
   }

   info!("Shutting down...");
   manager.close().await?;
   drop(manager);
   let _ = dispatcher.await;
   Ok(())
}
