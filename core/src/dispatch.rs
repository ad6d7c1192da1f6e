// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Message dispatch: typed request verbs mapped onto queue operations.
//!
//! The wire carries one YAML mapping per direction. Requests are tagged by
//! `command`; responses carry either `response` (success) or `error`
//! (failure). Unknown verbs and malformed payloads become error responses
//! without touching queue state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::ClusterStatus;
use crate::error::{Error, Result};
use crate::job::{Job, Priority, Requirement, Status};
use crate::queue::{JobQueue, UserInfo};
use crate::users::{LimitAction, Limits};

/// A decoded client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Request {
    /// Submit a job
    #[serde(rename = "sub")]
    Sub(SubRequest),
    /// Assigned hosts for a pid
    #[serde(rename = "gethosts", alias = "get_hosts")]
    GetHosts {
        /// Submitter pid
        pid: u32,
    },
    /// Compact per-job listing
    #[serde(rename = "ls")]
    Ls,
    /// Full job records
    #[serde(rename = "lsfull")]
    LsFull,
    /// Cluster snapshot
    #[serde(rename = "stat")]
    Stat,
    /// All user records
    #[serde(rename = "users")]
    Users,
    /// One user record
    #[serde(rename = "user")]
    User {
        /// Username
        user: String,
    },
    /// Set or clear a user's limits
    #[serde(rename = "limit")]
    Limit(LimitRequest),
    /// Ask which pids to kill
    #[serde(rename = "rm")]
    Rm(RmRequest),
    /// Completion or refresh notification
    #[serde(rename = "notify")]
    Notify(NotifyRequest),
    /// Online or offline a host
    #[serde(rename = "node")]
    Node(NodeRequest),
    /// Explicit refresh
    #[serde(rename = "refresh")]
    Refresh,
}

/// Fields of a `sub` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubRequest {
    /// Submitter process id; its liveness stands in for the job's
    pub pid: u32,
    /// Hostname the client runs on
    #[serde(default)]
    pub host: String,
    /// Submitting user
    pub user: String,
    /// The command the client will run
    pub commandline: String,
    /// Resource requirements
    pub require: Requirement,
}

/// Fields of a `limit` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRequest {
    /// Target user
    pub user: String,
    /// Set or clear
    pub action: LimitAction,
    /// Ceilings to apply when setting
    #[serde(default)]
    pub limits: Limits,
}

/// `rm` target: one pid, or every job of the requesting user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RmTarget {
    /// One pid
    Pid(u32),
    /// The literal string `all`
    All(String),
}

/// Fields of an `rm` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmRequest {
    /// One pid or `all`
    pub pid: RmTarget,
    /// Requesting user; must own the pid unless `root`
    pub user: String,
}

/// What a `notify` request announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Notification {
    /// The job finished; release its resources
    Done,
    /// Sweep the queue now
    Refresh,
}

/// Fields of a `notify` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyRequest {
    /// What happened
    pub notification: Notification,
    /// Required for `done`
    #[serde(default)]
    pub pid: Option<u32>,
}

/// Admission state for the `node` verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Visible to matching
    Online,
    /// Invisible to matching
    Offline,
}

/// Fields of a `node` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRequest {
    /// Target host
    pub host: String,
    /// Desired admission state
    pub state: NodeState,
}

/// Error reply: `{error: ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// What went wrong
    pub error: String,
}

/// Plain acknowledgement: `{response: OK}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    /// Always `OK`
    pub response: String,
}

impl OkResponse {
    fn new() -> Self {
        Self {
            response: "OK".to_string(),
        }
    }
}

/// Reply to `sub`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubResponse {
    /// `run` or `wait`
    pub response: Status,
    /// The grant, present when running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,
    /// Why the job waits, when it does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The `.run` filename the client should watch for
    pub spool_fname: String,
    /// Seconds to sleep between polls of `spool_fname`
    pub spool_wait: u64,
}

/// Reply to `gethosts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHostsResponse {
    /// Always `OK`
    pub response: String,
    /// The grant
    pub hosts: Vec<String>,
}

/// One row of the compact `ls` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    /// Submitter pid
    pub pid: u32,
    /// Submitting user
    pub user: String,
    /// Current status
    pub status: Status,
    /// Priority
    pub priority: Priority,
    /// Cores held (zero while waiting)
    pub ncores: usize,
    /// Distinct hosts in the grant
    pub nhosts: usize,
    /// First host of the grant, if running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host0: Option<String>,
    /// Job name, falling back to the commandline
    pub job_name: String,
    /// Submission time
    pub time_sub: DateTime<Utc>,
    /// Run start time, if running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_run: Option<DateTime<Utc>>,
    /// Why the job is not running
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl JobSummary {
    fn from_job(job: &Job) -> Self {
        Self {
            pid: job.pid,
            user: job.user.clone(),
            status: job.status(),
            priority: job.priority(),
            ncores: job.ncores(),
            nhosts: job.nhosts(),
            host0: job.hosts.first().cloned(),
            job_name: job
                .require
                .job_name
                .clone()
                .unwrap_or_else(|| job.commandline.clone()),
            time_sub: job.time_sub,
            time_run: job.time_run,
            reason: job.reason.clone(),
        }
    }
}

/// Reply to `rm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmResponse {
    /// Always `OK`
    pub response: String,
    /// Pids the client should signal-kill; resources come back when a
    /// later refresh sees them gone
    pub pids_to_kill: Vec<u32>,
}

/// Any reply the dispatcher can produce.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Response {
    /// Failure
    Error(ErrorResponse),
    /// `sub`
    Sub(SubResponse),
    /// `gethosts`
    Hosts(GetHostsResponse),
    /// `ls`
    Listing {
        /// Compact rows
        response: Vec<JobSummary>,
    },
    /// `lsfull`
    FullListing {
        /// Full records
        response: Vec<Job>,
    },
    /// `stat`
    Stat {
        /// Cluster snapshot
        response: ClusterStatus,
    },
    /// `users` / `user`
    Users {
        /// Per-user records
        response: BTreeMap<String, UserInfo>,
    },
    /// `rm`
    Rm(RmResponse),
    /// Acknowledgement
    Ok(OkResponse),
}

impl Response {
    fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorResponse {
            error: message.into(),
        })
    }
}

/// Maps request verbs onto queue operations and builds replies.
pub struct Dispatcher {
    queue: JobQueue,
}

impl Dispatcher {
    /// Wrap a queue
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    /// The wrapped queue
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Scheduler tick entry point
    pub fn refresh(&mut self) {
        self.queue.refresh();
    }

    /// Decode one raw payload, handle it, and encode the reply. Never
    /// fails: protocol problems become `{error: ...}` replies.
    pub fn handle_raw(&mut self, raw: &str) -> String {
        let response = match serde_yaml::from_str::<Request>(raw) {
            Ok(request) => self.handle(request),
            Err(err) => Response::error(Error::Parse(err).to_string()),
        };
        serde_yaml::to_string(&response)
            .unwrap_or_else(|_| "error: could not encode response\n".to_string())
    }

    /// Handle one decoded request.
    pub fn handle(&mut self, request: Request) -> Response {
        debug!("handling {request:?}");
        match self.dispatch(request) {
            Ok(response) => response,
            Err(err) => Response::error(err.to_string()),
        }
    }

    fn dispatch(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::Sub(sub) => self.submit(sub),
            Request::GetHosts { pid } => {
                let hosts = self.queue.gethosts(pid)?;
                Ok(Response::Hosts(GetHostsResponse {
                    response: "OK".to_string(),
                    hosts,
                }))
            }
            Request::Ls => Ok(Response::Listing {
                response: self.queue.jobs().iter().map(JobSummary::from_job).collect(),
            }),
            Request::LsFull => Ok(Response::FullListing {
                response: self.queue.jobs().to_vec(),
            }),
            Request::Stat => Ok(Response::Stat {
                response: self.queue.cluster_status(),
            }),
            Request::Users => Ok(Response::Users {
                response: self.queue.users_info(),
            }),
            Request::User { user } => {
                let mut response = BTreeMap::new();
                match self.queue.user_info(&user) {
                    Some(info) => {
                        response.insert(user, info);
                    }
                    None => {
                        return Err(Error::BadRequest(format!("unknown user '{user}'")));
                    }
                }
                Ok(Response::Users { response })
            }
            Request::Limit(limit) => {
                self.queue
                    .set_limits(&limit.user, limit.limits, limit.action)?;
                Ok(Response::Ok(OkResponse::new()))
            }
            Request::Rm(rm) => self.remove(rm),
            Request::Notify(notify) => match notify.notification {
                Notification::Done => {
                    let pid = notify.pid.ok_or_else(|| {
                        Error::BadRequest(
                            "notify 'done' requires the 'pid' field".to_string(),
                        )
                    })?;
                    self.queue.notify_done(pid)?;
                    Ok(Response::Ok(OkResponse::new()))
                }
                Notification::Refresh => {
                    self.queue.refresh();
                    Ok(Response::Ok(OkResponse::new()))
                }
            },
            Request::Node(node) => {
                self.queue
                    .set_node_online(&node.host, node.state == NodeState::Online)?;
                Ok(Response::Ok(OkResponse::new()))
            }
            Request::Refresh => {
                self.queue.refresh();
                Ok(Response::Ok(OkResponse::new()))
            }
        }
    }

    fn submit(&mut self, sub: SubRequest) -> Result<Response> {
        let job = Job::new(
            sub.pid,
            sub.host,
            sub.user,
            sub.commandline,
            sub.require,
            Utc::now(),
        );
        let spool_fname = self.queue.spool().run_fname(job.pid);
        let job = self.queue.submit(job)?;
        Ok(Response::Sub(SubResponse {
            response: job.status(),
            hosts: (job.status() == Status::Run).then(|| job.hosts.clone()),
            reason: (job.status() == Status::Wait).then(|| job.reason.clone()),
            spool_fname: spool_fname.display().to_string(),
            spool_wait: self.queue.spool_wait(),
        }))
    }

    /// `rm` refreshes first, then names the pids the client must kill. It
    /// never releases resources itself: the next refresh observes the
    /// killed pids gone and reclaims.
    fn remove(&mut self, rm: RmRequest) -> Result<Response> {
        self.queue.refresh();
        let pids_to_kill = match rm.pid {
            RmTarget::All(ref word) => {
                if word != "all" {
                    return Err(Error::BadRequest(format!(
                        "pid must be a number or 'all', not '{word}'"
                    )));
                }
                let pids = self.queue.pids_for_user(&rm.user);
                if pids.is_empty() {
                    return Err(Error::NoJobsForUser(rm.user));
                }
                pids
            }
            RmTarget::Pid(pid) => {
                let job = self.queue.find(pid).ok_or(Error::UnknownPid(pid))?;
                if job.user != rm.user && rm.user != "root" {
                    return Err(Error::BadRequest(format!(
                        "pid {pid} belongs to user {}",
                        job.user
                    )));
                }
                vec![pid]
            }
        };
        Ok(Response::Rm(RmResponse {
            response: "OK".to_string(),
            pids_to_kill,
        }))
    }
}
