// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! TCP endpoint: accept loop, framing, and the scheduler tick.
//!
//! One logical owner holds all state. Connections may be accepted at any
//! time but requests are handled one at a time, so matching and reservation
//! are atomic with respect to other requests. The select loop waits on a
//! new client or the tick timer; the tick drives refresh. Queue mutation is
//! committed before the response send, so a failed send at worst loses the
//! acknowledgement.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, DEFAULT_BUFFSIZE};
use crate::dispatch::Dispatcher;
use crate::error::Result;

/// The work-queue server: a dispatcher behind a TCP socket.
pub struct Server {
    config: ServerConfig,
    dispatcher: Dispatcher,
}

impl Server {
    /// Wire a dispatcher to a config
    pub fn new(config: ServerConfig, dispatcher: Dispatcher) -> Self {
        Self { config, dispatcher }
    }

    /// Run forever. A top-level failure logs, sleeps the restart delay,
    /// and rebinds; queue state survives in the spool.
    pub async fn run(mut self) -> Result<()> {
        loop {
            if let Err(err) = self.serve().await {
                error!(
                    "server loop failed: {err}; restarting in {}s",
                    self.config.restart_delay
                );
                tokio::time::sleep(Duration::from_secs(self.config.restart_delay)).await;
            }
        }
    }

    async fn serve(&mut self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        info!("listening on port {}", self.config.port);

        let mut tick = interval(Duration::from_secs(self.config.tick_interval.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!("connected by {addr}");
                    // per-client faults never take the server down
                    if let Err(err) = self.handle_client(stream).await {
                        warn!("client {addr}: {err}");
                    }
                }
                _ = tick.tick() => {
                    debug!("refreshing queue");
                    self.dispatcher.refresh();
                }
            }
        }
    }

    async fn handle_client(&mut self, mut stream: TcpStream) -> Result<()> {
        let raw = read_frame(&mut stream).await?;
        if raw.trim().is_empty() {
            debug!("client sent no request");
            return Ok(());
        }
        let response = self.dispatcher.handle_raw(&raw);
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// Length-tolerant framing: read fixed-size chunks until a short read ends
/// the frame.
async fn read_frame(stream: &mut TcpStream) -> Result<String> {
    let mut data = Vec::new();
    let mut chunk = vec![0u8; DEFAULT_BUFFSIZE];
    loop {
        let n = stream.read(&mut chunk).await?;
        data.extend_from_slice(&chunk[..n]);
        if n < chunk.len() {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&data).into_owned())
}
