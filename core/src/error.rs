// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types for the work-queue core.

use thiserror::Error;

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to clients or to the server loop.
///
/// Invariant violations (reserving past capacity, unreserving below zero)
/// are deliberately not represented here: those are scheduler bugs whose
/// only recovery is a process restart plus spool replay, so they panic.
#[derive(Debug, Error)]
pub enum Error {
    /// A request was well-formed but invalid (missing field, bad value,
    /// wrong owner). No state change has happened.
    #[error("{0}")]
    BadRequest(String),

    /// A submission can never be satisfied by this cluster.
    #[error("{0}")]
    Rejected(String),

    /// Host not present in the cluster description
    #[error("host '{0}' does not exist")]
    UnknownHost(String),

    /// No queue entry for this pid
    #[error("pid {0} not found")]
    UnknownPid(u32),

    /// No queue entries for this user
    #[error("no jobs for user '{0}' in queue")]
    NoJobsForUser(String),

    /// Malformed request or response payload
    #[error("could not parse request: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Unusable cluster description file
    #[error("cluster description error: {0}")]
    ClusterDescription(String),

    /// Spool directory fault
    #[error("spool error: {0}")]
    Spool(String),

    /// I/O fault
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
