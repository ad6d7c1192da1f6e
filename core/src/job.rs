// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Job records, requirements, and the status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Scheduling priority. The refresh sweep scans tiers in the order listed;
/// a waiting `block` job freezes new starts on the groups it requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Admitted first; blocks its requested groups while waiting
    Block,
    /// High
    High,
    /// Medium (the default)
    Med,
    /// Low
    Low,
}

impl Priority {
    /// Fixed refresh scan order
    pub const SCAN_ORDER: [Priority; 4] =
        [Priority::Block, Priority::High, Priority::Med, Priority::Low];
}

impl Default for Priority {
    fn default() -> Self {
        Self::Med
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::High => write!(f, "high"),
            Self::Med => write!(f, "med"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// How a requirement selects its grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Collect `N` cores across any hosts
    #[default]
    ByCore,
    /// Collect `N` cores, all on one host
    ByCore1,
    /// `N` whole, fully idle nodes
    ByNode,
    /// `N` cores on one named host
    ByHost,
    /// Every core of every host carrying one group tag
    ByGroup,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByCore => write!(f, "by_core"),
            Self::ByCore1 => write!(f, "by_core1"),
            Self::ByNode => write!(f, "by_node"),
            Self::ByHost => write!(f, "by_host"),
            Self::ByGroup => write!(f, "by_group"),
        }
    }
}

/// Job status. Legal transitions are `wait <-> ready -> run -> done`,
/// `wait -> nevermatch`, and `done` from any live state; they are enforced
/// at assignment by [`Job::set_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Feasible but not currently satisfiable
    Wait,
    /// Matched; about to be spooled as running
    Ready,
    /// Hosts reserved, user counters bumped, spooled as `.run`
    Run,
    /// Left the queue; resources released
    Done,
    /// Structurally impossible request; terminal
    Nevermatch,
}

impl Status {
    /// Whether `self -> to` is a legal transition
    pub fn can_transition(self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Wait, Ready)
                | (Ready, Wait)
                | (Ready, Run)
                | (Wait, Nevermatch)
                | (Wait, Done)
                | (Ready, Done)
                | (Run, Done)
        )
    }

    /// Spool-file extension label
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::Ready => "ready",
            Self::Run => "run",
            Self::Done => "done",
            Self::Nevermatch => "nevermatch",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A string-or-list wire field: `group: grpA` and `group: [grpA, grpB]`
/// both decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    /// A single scalar
    One(String),
    /// A sequence
    Many(Vec<String>),
}

impl OneOrMany {
    /// View as a slice regardless of wire shape
    pub fn as_slice(&self) -> &[String] {
        match self {
            Self::One(s) => std::slice::from_ref(s),
            Self::Many(v) => v.as_slice(),
        }
    }

    /// True when no tags were given
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl Default for OneOrMany {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl From<&str> for OneOrMany {
    fn from(s: &str) -> Self {
        Self::One(s.to_string())
    }
}

impl From<Vec<String>> for OneOrMany {
    fn from(v: Vec<String>) -> Self {
        Self::Many(v)
    }
}

fn default_n() -> u32 {
    1
}

fn default_threads() -> u32 {
    1
}

/// Resource requirements attached to a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    /// Selection mode
    #[serde(default)]
    pub mode: Mode,
    /// Cores or nodes, depending on mode
    #[serde(default = "default_n", rename = "N")]
    pub n: u32,
    /// Grant granularity for `by_core`: every per-node grant is a multiple
    /// of this and `N` must divide by it. Ignored by the other modes.
    #[serde(default = "default_threads")]
    pub threads: u32,
    /// Per-node memory floor
    #[serde(default)]
    pub min_mem: f64,
    /// Per-node core floor (`by_node` only)
    #[serde(default)]
    pub min_cores: u32,
    /// Restrict to hosts carrying any of these tags; the sole selector for
    /// `by_group`
    #[serde(default)]
    pub group: OneOrMany,
    /// Exclude hosts carrying any of these tags
    #[serde(default)]
    pub not_group: OneOrMany,
    /// Target host (`by_host` only)
    #[serde(default)]
    pub host: Option<String>,
    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,
    /// Cosmetic name shown in listings
    #[serde(default)]
    pub job_name: Option<String>,
}

impl Default for Requirement {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            n: 1,
            threads: 1,
            min_mem: 0.0,
            min_cores: 0,
            group: OneOrMany::default(),
            not_group: OneOrMany::default(),
            host: None,
            priority: Priority::default(),
            job_name: None,
        }
    }
}

/// One queued job. The submitting client's process identity is the job's
/// key; its continued existence is the proxy for "still running".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Submitter process id
    pub pid: u32,
    /// Hostname the submitting client runs on
    #[serde(default)]
    pub submit_host: String,
    /// Submitting user
    pub user: String,
    /// The command the client will run
    pub commandline: String,
    /// Resource requirements
    pub require: Requirement,
    /// Submission time
    pub time_sub: DateTime<Utc>,
    /// Set when the job transitions to run
    #[serde(default)]
    pub time_run: Option<DateTime<Utc>>,
    status: Status,
    /// Assigned grant: one entry per core, so a host granted k cores
    /// appears k times
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Current spool file, if any
    #[serde(default)]
    pub spool_fname: Option<PathBuf>,
    /// Why the job is not running
    #[serde(default)]
    pub reason: String,
}

impl Job {
    /// A fresh waiting job.
    pub fn new(
        pid: u32,
        submit_host: impl Into<String>,
        user: impl Into<String>,
        commandline: impl Into<String>,
        require: Requirement,
        time_sub: DateTime<Utc>,
    ) -> Self {
        Self {
            pid,
            submit_host: submit_host.into(),
            user: user.into(),
            commandline: commandline.into(),
            require,
            time_sub,
            time_run: None,
            status: Status::Wait,
            hosts: Vec::new(),
            spool_fname: None,
            reason: String::new(),
        }
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.status
    }

    /// Move to `to`, panicking on an illegal transition: status corruption
    /// is a scheduler bug, not user input.
    pub fn set_status(&mut self, to: Status) {
        assert!(
            self.status.can_transition(to),
            "illegal status transition {} -> {} for pid {}",
            self.status,
            to,
            self.pid
        );
        self.status = to;
    }

    /// Restore a status from the spool without transition checks; the file
    /// extension is authoritative at rest.
    pub(crate) fn restore_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Priority shorthand
    pub fn priority(&self) -> Priority {
        self.require.priority
    }

    /// Cores held: one per grant entry
    pub fn ncores(&self) -> usize {
        self.hosts.len()
    }

    /// Distinct hosts in the grant
    pub fn nhosts(&self) -> usize {
        let mut hosts: Vec<&String> = self.hosts.iter().collect();
        hosts.sort();
        hosts.dedup();
        hosts.len()
    }
}
