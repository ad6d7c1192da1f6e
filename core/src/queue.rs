// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The job queue and its refresh sweep.
//!
//! The queue is the single owner of cluster, user, and spool state. Refresh
//! is the heartbeat: it walks priorities block -> high -> med -> low (FIFO
//! within a tier), reaps jobs whose submitter died, and promotes waiting
//! jobs whose requirements now match. Blocked-group tags are computed once
//! per sweep, after the block tier has been given first pick.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::{Cluster, ClusterStatus};
use crate::error::{Error, Result};
use crate::job::{Job, Priority, Status};
use crate::liveness::ProcessLiveness;
use crate::matcher::{match_require, BlockedGroups};
use crate::spool::Spool;
use crate::users::{LimitAction, Limits, Users};

/// Reason set on jobs held back by their user's ceilings
pub const REASON_USER_LIMITS: &str = "user limits exceeded";

/// One user's view in the `users`/`user` responses: live counters plus the
/// total number of queue entries (running and waiting).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    /// Username
    pub user: String,
    /// Jobs in the queue, any status
    pub total: u64,
    /// Jobs running
    pub run: u64,
    /// Cores held
    pub cores: u64,
    /// Configured ceilings
    pub limits: Limits,
}

/// Insertion-ordered job queue plus the state it arbitrates.
pub struct JobQueue {
    cluster: Cluster,
    users: Users,
    spool: Spool,
    liveness: Box<dyn ProcessLiveness>,
    spool_wait: u64,
    jobs: Vec<Job>,
}

/// Reserve, account, flip to run, and respool. The grant has already been
/// accepted; failures here are spool I/O only.
fn start_job(
    cluster: &mut Cluster,
    users: &mut Users,
    spool: &Spool,
    job: &mut Job,
    hosts: Vec<String>,
) -> Result<()> {
    cluster.reserve(&hosts);
    users.increment(&job.user, &hosts);
    job.hosts = hosts;
    job.set_status(Status::Ready);
    job.set_status(Status::Run);
    job.time_run = Some(Utc::now());
    job.reason.clear();
    spool.write(job)
}

/// True when the cluster can still absorb a replayed grant.
fn grant_fits(cluster: &Cluster, hosts: &[String]) -> bool {
    let mut counts: BTreeMap<&str, u32> = BTreeMap::new();
    for host in hosts {
        *counts.entry(host.as_str()).or_default() += 1;
    }
    counts.iter().all(|(host, count)| {
        cluster
            .get(host)
            .is_some_and(|node| node.used + count <= node.cores)
    })
}

/// Unspool and, for running jobs, give back the reservation and counters.
fn release_job(cluster: &mut Cluster, users: &mut Users, spool: &Spool, job: &mut Job) {
    if let Err(err) = spool.remove(job) {
        warn!("could not unspool pid {}: {err}", job.pid);
    }
    if job.status() == Status::Run {
        cluster.unreserve(&job.hosts);
        users.decrement(&job.user, &job.hosts);
    }
    job.set_status(Status::Done);
}

impl JobQueue {
    /// Build the queue, replaying the spool: running jobs re-reserve the
    /// cluster and re-increment their user; waiting jobs just rejoin.
    pub fn new(
        cluster: Cluster,
        users: Users,
        spool: Spool,
        liveness: Box<dyn ProcessLiveness>,
        spool_wait: u64,
    ) -> Result<Self> {
        let mut queue = Self {
            cluster,
            users,
            spool,
            liveness,
            spool_wait,
            jobs: Vec::new(),
        };
        for mut job in queue.spool.replay()? {
            if job.status() == Status::Run {
                // the description may have changed across the restart; a
                // grant that no longer fits must not wedge the boot
                if !grant_fits(&queue.cluster, &job.hosts) {
                    warn!(
                        "dropping spooled job {}: grant no longer fits the cluster",
                        job.pid
                    );
                    if let Err(err) = queue.spool.remove(&mut job) {
                        warn!("could not unspool pid {}: {err}", job.pid);
                    }
                    continue;
                }
                queue.cluster.reserve(&job.hosts);
                queue.users.increment(&job.user, &job.hosts);
            }
            queue.jobs.push(job);
        }
        if !queue.jobs.is_empty() {
            info!("replayed {} jobs from spool", queue.jobs.len());
        }
        Ok(queue)
    }

    /// Seconds clients should sleep between spool polls
    pub fn spool_wait(&self) -> u64 {
        self.spool_wait
    }

    /// The spool, for building submit responses
    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    /// All queue entries, insertion order
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// The entry for `pid`, if queued
    pub fn find(&self, pid: u32) -> Option<&Job> {
        self.jobs.iter().find(|j| j.pid == pid)
    }

    /// Cluster snapshot for the `stat` verb
    pub fn cluster_status(&self) -> ClusterStatus {
        self.cluster.status()
    }

    /// Toggle admission for one host
    pub fn set_node_online(&mut self, host: &str, online: bool) -> Result<()> {
        self.cluster.set_online(host, online)
    }

    /// Set or clear a user's limits; persisted immediately
    pub fn set_limits(&mut self, user: &str, limits: Limits, action: LimitAction) -> Result<()> {
        self.users.set_limits(user, limits, action)
    }

    /// Group tags frozen by waiting block-priority jobs. A blocking job
    /// with no group is a global block and freezes every group in the
    /// cluster description.
    pub fn blocked_groups(&self) -> BlockedGroups {
        let mut bgroups = BlockedGroups::new();
        let mut global = false;
        for job in &self.jobs {
            if job.priority() != Priority::Block || job.status() != Status::Wait {
                continue;
            }
            let groups = job.require.group.as_slice();
            if groups.is_empty() {
                global = true;
            } else {
                bgroups.extend(groups.iter().cloned());
            }
        }
        if global {
            bgroups.extend(self.cluster.all_groups());
        }
        bgroups
    }

    /// Admit one submission. Matching happens once, against the blocked
    /// groups the live queue implies (block-priority submissions see an
    /// empty set: block jobs do not block each other). A structurally
    /// impossible request is rejected and never enters the queue.
    pub fn submit(&mut self, mut job: Job) -> Result<Job> {
        if self.find(job.pid).is_some() {
            return Err(Error::BadRequest(format!(
                "pid {} is already queued",
                job.pid
            )));
        }

        let bgroups = if job.priority() == Priority::Block {
            BlockedGroups::new()
        } else {
            self.blocked_groups()
        };
        let verdict = match_require(&job.require, &self.cluster, &bgroups);
        if !verdict.pmatch {
            return Err(Error::Rejected(verdict.reason));
        }

        if !self.users.within_limits(&job.user) {
            job.reason = REASON_USER_LIMITS.to_string();
            self.spool.write(&mut job)?;
        } else if verdict.matched {
            start_job(
                &mut self.cluster,
                &mut self.users,
                &self.spool,
                &mut job,
                verdict.hosts,
            )?;
        } else {
            job.reason = verdict.reason;
            self.spool.write(&mut job)?;
        }

        info!(
            "job {} ({}, {}): {}",
            job.pid,
            job.user,
            job.require.mode,
            job.status()
        );
        let submitted = job.clone();
        self.jobs.push(job);
        Ok(submitted)
    }

    /// The heartbeat sweep. Priorities are scanned in fixed order and FIFO
    /// within a tier; dead submitters are reaped first, then waiting jobs
    /// are gated on user limits and matched. The blocked-group set is
    /// computed once per sweep, after the block tier has been admitted.
    pub fn refresh(&mut self) {
        let mut removed = vec![false; self.jobs.len()];
        let empty = BlockedGroups::new();
        let mut bgroups = BlockedGroups::new();
        let mut bgroups_computed = false;

        for priority in Priority::SCAN_ORDER {
            if priority != Priority::Block && !bgroups_computed {
                bgroups = self.blocked_groups();
                bgroups_computed = true;
            }
            let tier_bgroups = if priority == Priority::Block {
                &empty
            } else {
                &bgroups
            };

            for i in 0..self.jobs.len() {
                if removed[i] || self.jobs[i].priority() != priority {
                    continue;
                }

                if !self.liveness.is_alive(self.jobs[i].pid) {
                    info!("removing job {}, pid no longer valid", self.jobs[i].pid);
                    let job = &mut self.jobs[i];
                    release_job(&mut self.cluster, &mut self.users, &self.spool, job);
                    removed[i] = true;
                    continue;
                }

                if self.jobs[i].status() == Status::Run {
                    continue;
                }

                if !self.users.within_limits(&self.jobs[i].user) {
                    self.jobs[i].reason = REASON_USER_LIMITS.to_string();
                    continue;
                }

                let verdict =
                    match_require(&self.jobs[i].require, &self.cluster, tier_bgroups);
                if !verdict.pmatch {
                    // the cluster changed under the job (host offlined or
                    // description shrunk on restart); retire it
                    warn!(
                        "retiring job {}: {}",
                        self.jobs[i].pid, verdict.reason
                    );
                    let job = &mut self.jobs[i];
                    if let Err(err) = self.spool.remove(job) {
                        warn!("could not unspool pid {}: {err}", job.pid);
                    }
                    job.set_status(Status::Nevermatch);
                    removed[i] = true;
                } else if verdict.matched {
                    let job = &mut self.jobs[i];
                    debug!("promoting job {} to run", job.pid);
                    if let Err(err) = start_job(
                        &mut self.cluster,
                        &mut self.users,
                        &self.spool,
                        job,
                        verdict.hosts,
                    ) {
                        warn!("could not respool pid {}: {err}", job.pid);
                    }
                } else {
                    self.jobs[i].reason = verdict.reason;
                }
            }
        }

        if removed.iter().any(|r| *r) {
            let mut kept = Vec::with_capacity(self.jobs.len());
            for (i, job) in self.jobs.drain(..).enumerate() {
                if !removed[i] {
                    kept.push(job);
                }
            }
            self.jobs = kept;
        }
    }

    /// The client says its job is finished: release, drop, and resweep so
    /// freed cores are handed out immediately.
    pub fn notify_done(&mut self, pid: u32) -> Result<()> {
        let idx = self
            .jobs
            .iter()
            .position(|j| j.pid == pid)
            .ok_or(Error::UnknownPid(pid))?;
        {
            let job = &mut self.jobs[idx];
            release_job(&mut self.cluster, &mut self.users, &self.spool, job);
        }
        self.jobs.remove(idx);
        self.refresh();
        Ok(())
    }

    /// Assigned hosts for a running submission
    pub fn gethosts(&self, pid: u32) -> Result<Vec<String>> {
        self.find(pid)
            .map(|j| j.hosts.clone())
            .ok_or(Error::UnknownPid(pid))
    }

    /// Every pid belonging to `user`, insertion order
    pub fn pids_for_user(&self, user: &str) -> Vec<u32> {
        self.jobs
            .iter()
            .filter(|j| j.user == user)
            .map(|j| j.pid)
            .collect()
    }

    /// Per-user view: registry counters plus queue totals. Users that only
    /// have limits configured still appear, with zero totals.
    pub fn users_info(&self) -> BTreeMap<String, UserInfo> {
        let mut info: BTreeMap<String, UserInfo> = self
            .users
            .iter()
            .map(|r| {
                (
                    r.user.clone(),
                    UserInfo {
                        user: r.user.clone(),
                        total: 0,
                        run: r.run,
                        cores: r.cores,
                        limits: r.limits,
                    },
                )
            })
            .collect();
        for job in &self.jobs {
            let entry = info.entry(job.user.clone()).or_insert_with(|| UserInfo {
                user: job.user.clone(),
                total: 0,
                run: 0,
                cores: 0,
                limits: Limits::default(),
            });
            entry.total += 1;
        }
        info
    }

    /// One user's view, if known to the registry or the queue
    pub fn user_info(&self, user: &str) -> Option<UserInfo> {
        self.users_info().remove(user)
    }
}
