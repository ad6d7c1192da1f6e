// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Server configuration.
//!
//! All tunables live in one explicit record constructed by the entry point;
//! nothing is read at module-load time. The defaults below are the single
//! place they are documented.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default TCP port (arbitrary non-privileged)
pub const DEFAULT_PORT: u16 = 51093;

/// Socket read chunk size; a read shorter than this ends the frame
pub const DEFAULT_BUFFSIZE: usize = 4096;

/// Seconds of socket idle before the queue is refreshed
pub const DEFAULT_TICK_SECS: u64 = 30;

/// Seconds a client should sleep between polls of its spool file
pub const DEFAULT_SPOOL_WAIT_SECS: u64 = 10;

/// Seconds to wait before reopening the socket after a fatal error
pub const DEFAULT_RESTART_DELAY_SECS: u64 = 60;

/// Everything the server needs to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Cluster description file, one `hostname cores mem [group,...]` per line
    pub cluster_file: PathBuf,
    /// Directory holding one file per live job plus `users.yaml`
    pub spool_dir: PathBuf,
    /// TCP port to listen on
    pub port: u16,
    /// Seconds between scheduler ticks
    pub tick_interval: u64,
    /// Client spool-poll hint returned with submit responses, in seconds
    pub spool_wait: u64,
    /// Seconds to sleep before rebinding after a top-level failure
    pub restart_delay: u64,
}

impl ServerConfig {
    /// Config with the documented defaults for everything but the two paths.
    pub fn new(cluster_file: impl Into<PathBuf>, spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            cluster_file: cluster_file.into(),
            spool_dir: spool_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    /// The documented defaults. The paths are placeholders: no cluster
    /// file, and a `wqspool` directory the entry point normally resolves
    /// under the user's home.
    fn default() -> Self {
        Self {
            cluster_file: PathBuf::new(),
            spool_dir: PathBuf::from("wqspool"),
            port: DEFAULT_PORT,
            tick_interval: DEFAULT_TICK_SECS,
            spool_wait: DEFAULT_SPOOL_WAIT_SECS,
            restart_delay: DEFAULT_RESTART_DELAY_SECS,
        }
    }
}
