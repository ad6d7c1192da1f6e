// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Request matching against the cluster.
//!
//! Each mode produces a [`Verdict`]. `pmatch = false` means the cluster can
//! never satisfy the request even fully idle; the job is retired as
//! `nevermatch`. `pmatch = true, matched = false` means feasible but blocked
//! now; the job waits. `matched = true` means `hosts` is the exact grant to
//! reserve. Matching never mutates cluster state; the queue commits the
//! reservation only after accepting the verdict. Hosts are always walked in
//! ascending hostname order.

use std::collections::BTreeSet;

use crate::cluster::{Cluster, Node};
use crate::job::{Mode, Requirement};

/// Group tags currently frozen by waiting block-priority jobs. A host in
/// any blocked group has its free-core count treated as zero.
pub type BlockedGroups = BTreeSet<String>;

/// Outcome of matching one requirement.
#[derive(Debug, Clone, Default)]
pub struct Verdict {
    /// The cluster could satisfy this request if it were fully idle
    pub pmatch: bool,
    /// The request can run right now on `hosts`
    pub matched: bool,
    /// Exact grant, one entry per core
    pub hosts: Vec<String>,
    /// Why the request is waiting or impossible
    pub reason: String,
}

impl Verdict {
    fn never(reason: impl Into<String>) -> Self {
        Self {
            pmatch: false,
            matched: false,
            hosts: Vec::new(),
            reason: reason.into(),
        }
    }

    fn wait(reason: impl Into<String>) -> Self {
        Self {
            pmatch: true,
            matched: false,
            hosts: Vec::new(),
            reason: reason.into(),
        }
    }

    fn run(hosts: Vec<String>) -> Self {
        Self {
            pmatch: true,
            matched: true,
            hosts,
            reason: String::new(),
        }
    }
}

/// Match `req` against the cluster with the given blocked-group set.
pub fn match_require(req: &Requirement, cluster: &Cluster, bgroups: &BlockedGroups) -> Verdict {
    if req.n == 0 {
        return Verdict::never("N must be positive");
    }
    match req.mode {
        Mode::ByCore => by_core(req, cluster, bgroups),
        Mode::ByCore1 => by_core1(req, cluster, bgroups),
        Mode::ByNode => by_node(req, cluster, bgroups),
        Mode::ByHost => by_host(req, cluster, bgroups),
        Mode::ByGroup => by_group(req, cluster, bgroups),
    }
}

/// Shared host filter: online, group any-of, not_group none-of, memory floor.
fn node_passes(req: &Requirement, node: &Node) -> bool {
    if !node.online {
        return false;
    }
    if !req.group.is_empty() && !node.in_any_group(req.group.as_slice()) {
        return false;
    }
    if !req.not_group.is_empty() && node.in_any_group(req.not_group.as_slice()) {
        return false;
    }
    node.mem >= req.min_mem
}

fn is_blocked(node: &Node, bgroups: &BlockedGroups) -> bool {
    node.groups.iter().any(|g| bgroups.contains(g))
}

/// Free cores for allocation; zero when the host sits in a blocked group.
fn free_cores(node: &Node, bgroups: &BlockedGroups) -> u32 {
    if is_blocked(node, bgroups) {
        0
    } else {
        node.free()
    }
}

fn block_reason(hit: &BTreeSet<String>) -> String {
    format!(
        "waiting for block-priority job on group(s) {}",
        hit.iter().cloned().collect::<Vec<_>>().join(",")
    )
}

/// Record which blocked tags actually got in this request's way, so the
/// wait reason can name them.
fn note_blocked(node: &Node, bgroups: &BlockedGroups, hit: &mut BTreeSet<String>) {
    for g in &node.groups {
        if bgroups.contains(g) {
            hit.insert(g.clone());
        }
    }
}

fn by_core(req: &Requirement, cluster: &Cluster, bgroups: &BlockedGroups) -> Verdict {
    if req.threads == 0 {
        return Verdict::never("threads must be positive");
    }
    let th = req.threads;
    if req.n % th != 0 {
        return Verdict::never(format!(
            "N={} is not a multiple of threads={}",
            req.n, th
        ));
    }

    // feasibility cursor counts whole-thread blocks of total capacity
    let mut needed = i64::from(req.n);
    let mut remaining = req.n;
    let mut hosts = Vec::new();
    let mut blocked_hit = BTreeSet::new();

    for node in cluster.nodes() {
        if !node_passes(req, node) {
            continue;
        }

        needed -= i64::from((node.cores / th) * th);

        if remaining > 0 {
            note_blocked(node, bgroups, &mut blocked_hit);
            let free = (free_cores(node, bgroups) / th) * th;
            let take = free.min(remaining);
            for _ in 0..take {
                hosts.push(node.hostname.clone());
            }
            remaining -= take;
        }
    }

    if needed > 0 {
        return Verdict::never("Not enough total cores satisfying condition.");
    }
    if remaining > 0 {
        if !blocked_hit.is_empty() {
            return Verdict::wait(block_reason(&blocked_hit));
        }
        return Verdict::wait("Not enough free cores.");
    }
    Verdict::run(hosts)
}

fn by_core1(req: &Requirement, cluster: &Cluster, bgroups: &BlockedGroups) -> Verdict {
    let mut pmatch = false;
    let mut blocked_hit = BTreeSet::new();

    for node in cluster.nodes() {
        if !node_passes(req, node) {
            continue;
        }
        if node.cores >= req.n {
            pmatch = true;
        }
        note_blocked(node, bgroups, &mut blocked_hit);
        if free_cores(node, bgroups) >= req.n {
            return Verdict::run(vec![node.hostname.clone(); req.n as usize]);
        }
    }

    if !pmatch {
        return Verdict::never("Not a node with that many cores.");
    }
    if !blocked_hit.is_empty() {
        return Verdict::wait(block_reason(&blocked_hit));
    }
    Verdict::wait("Not enough free cores on any one node.")
}

fn by_node(req: &Requirement, cluster: &Cluster, bgroups: &BlockedGroups) -> Verdict {
    let mut passing = 0u32;
    let mut accepted = 0u32;
    let mut hosts = Vec::new();
    let mut blocked_hit = BTreeSet::new();

    for node in cluster.nodes() {
        if !node_passes(req, node) {
            continue;
        }
        if node.cores < req.min_cores {
            continue;
        }
        passing += 1;

        if accepted < req.n {
            if is_blocked(node, bgroups) {
                note_blocked(node, bgroups, &mut blocked_hit);
                continue;
            }
            // whole nodes only: a partially used node does not count
            if node.used == 0 {
                accepted += 1;
                for _ in 0..node.cores {
                    hosts.push(node.hostname.clone());
                }
            }
        }
    }

    if passing < req.n {
        return Verdict::never("Not enough nodes satisfying condition.");
    }
    if accepted < req.n {
        if !blocked_hit.is_empty() {
            return Verdict::wait(block_reason(&blocked_hit));
        }
        return Verdict::wait("Not enough idle nodes.");
    }
    Verdict::run(hosts)
}

fn by_host(req: &Requirement, cluster: &Cluster, bgroups: &BlockedGroups) -> Verdict {
    let Some(host) = req.host.as_deref() else {
        return Verdict::never("'host' field not in requirements");
    };
    let Some(node) = cluster.get(host) else {
        return Verdict::never(format!("host '{host}' does not exist"));
    };
    if !node.online {
        return Verdict::never(format!("host '{host}' is offline"));
    }
    if is_blocked(node, bgroups) {
        return Verdict::never(format!(
            "host '{host}' is held by a block-priority job"
        ));
    }
    if node.mem < req.min_mem {
        return Verdict::never(format!("host '{host}' mem too small"));
    }
    if node.cores < req.n {
        return Verdict::never(format!("host '{host}' cores too few"));
    }
    if node.free() >= req.n {
        return Verdict::run(vec![node.hostname.clone(); req.n as usize]);
    }
    Verdict::wait(format!("Not enough free cores on {host}"))
}

fn by_group(req: &Requirement, cluster: &Cluster, bgroups: &BlockedGroups) -> Verdict {
    let groups = req.group.as_slice();
    let [group] = groups else {
        return Verdict::never("Need to specify a single group");
    };

    let mut tagged_any = false;
    let mut online_any = false;
    let mut hosts = Vec::new();

    for node in cluster.nodes() {
        if !node.groups.contains(group) {
            continue;
        }
        tagged_any = true;
        // offline hosts are invisible: they neither join the grant nor
        // hold the group back
        if !node.online {
            continue;
        }
        online_any = true;
        if is_blocked(node, bgroups) {
            let mut hit = BTreeSet::new();
            note_blocked(node, bgroups, &mut hit);
            return Verdict::wait(block_reason(&hit));
        }
        // the entire group is demanded
        if node.used > 0 {
            return Verdict::wait(format!("Host {} not entirely free.", node.hostname));
        }
        for _ in 0..node.cores {
            hosts.push(node.hostname.clone());
        }
    }

    if !tagged_any {
        return Verdict::never(format!("No node in group '{group}'"));
    }
    if !online_any {
        return Verdict::wait(format!("All hosts in group '{group}' are offline."));
    }
    Verdict::run(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{OneOrMany, Priority};

    // n1: 4 cores grpA, n2: 4 cores grpA+grpB, n3: 8 cores grpB
    fn cluster() -> Cluster {
        Cluster::from_description(
            "test.desc",
            "n1 4 32.0 grpA\nn2 4 64.0 grpA,grpB\nn3 8 128.0 grpB\n",
        )
        .unwrap()
    }

    fn req(mode: Mode, n: u32) -> Requirement {
        Requirement {
            mode,
            n,
            ..Requirement::default()
        }
    }

    fn none() -> BlockedGroups {
        BlockedGroups::new()
    }

    #[test]
    fn test_by_core_fill_then_spill() {
        let v = match_require(&req(Mode::ByCore, 6), &cluster(), &none());
        assert!(v.matched);
        assert_eq!(v.hosts, vec!["n1", "n1", "n1", "n1", "n2", "n2"]);
    }

    #[test]
    fn test_by_core_not_enough_free() {
        let mut c = cluster();
        c.reserve(&vec!["n1".to_string(); 4]);
        c.reserve(&vec!["n2".to_string(); 4]);
        c.reserve(&vec!["n3".to_string(); 3]);
        let v = match_require(&req(Mode::ByCore, 6), &c, &none());
        assert!(v.pmatch);
        assert!(!v.matched);
        assert!(v.reason.contains("Not enough free cores"));
    }

    #[test]
    fn test_by_core_never_when_total_too_small() {
        let v = match_require(&req(Mode::ByCore, 17), &cluster(), &none());
        assert!(!v.pmatch);
        assert!(v.reason.contains("Not enough total cores"));
    }

    #[test]
    fn test_by_core_threads_must_divide_n() {
        let mut r = req(Mode::ByCore, 6);
        r.threads = 4;
        let v = match_require(&r, &cluster(), &none());
        assert!(!v.pmatch);
        assert!(v.reason.contains("multiple of threads"));
    }

    #[test]
    fn test_by_core_threads_rounding() {
        // th=4: n3 contributes 8, n1/n2 4 each; one core used on n1 drops
        // its usable block count to zero
        let mut c = cluster();
        c.reserve(&["n1".to_string()]);
        let mut r = req(Mode::ByCore, 8);
        r.threads = 4;
        let v = match_require(&r, &c, &none());
        assert!(v.matched);
        assert_eq!(v.hosts[..4], vec!["n2"; 4][..]);
        assert_eq!(v.hosts[4..], vec!["n3"; 4][..]);
    }

    #[test]
    fn test_by_core_group_filter() {
        let mut r = req(Mode::ByCore, 8);
        r.group = OneOrMany::from("grpB");
        let v = match_require(&r, &cluster(), &none());
        assert!(v.matched);
        assert!(v.hosts.iter().all(|h| h == "n2" || h == "n3"));
    }

    #[test]
    fn test_by_core_not_group_filter() {
        let mut r = req(Mode::ByCore, 8);
        r.not_group = OneOrMany::from("grpA");
        let v = match_require(&r, &cluster(), &none());
        assert!(v.matched);
        assert_eq!(v.hosts, vec!["n3"; 8]);
    }

    #[test]
    fn test_by_core_min_mem_filter() {
        let mut r = req(Mode::ByCore, 12);
        r.min_mem = 64.0;
        // only n2 (64) and n3 (128) qualify
        let v = match_require(&r, &cluster(), &none());
        assert!(v.matched);
        assert_eq!(v.hosts[..4], vec!["n2"; 4][..]);
    }

    #[test]
    fn test_by_core_offline_host_invisible() {
        let mut c = cluster();
        c.set_online("n1", false).unwrap();
        let v = match_require(&req(Mode::ByCore, 16), &c, &none());
        assert!(!v.pmatch);

        let v = match_require(&req(Mode::ByCore, 12), &c, &none());
        assert!(v.matched);
        assert!(!v.hosts.contains(&"n1".to_string()));
    }

    #[test]
    fn test_by_core_blocked_group_waits_with_reason() {
        let bg: BlockedGroups = ["grpA".to_string()].into();
        let v = match_require(&req(Mode::ByCore, 12), &cluster(), &bg);
        assert!(v.pmatch);
        assert!(!v.matched);
        assert!(v.reason.contains("block-priority"));
        assert!(v.reason.contains("grpA"));
    }

    #[test]
    fn test_by_core1_single_host() {
        let v = match_require(&req(Mode::ByCore1, 6), &cluster(), &none());
        assert!(v.matched);
        assert_eq!(v.hosts, vec!["n3"; 6]);
    }

    #[test]
    fn test_by_core1_never_when_no_host_big_enough() {
        let v = match_require(&req(Mode::ByCore1, 9), &cluster(), &none());
        assert!(!v.pmatch);
        assert!(v.reason.contains("Not a node with that many cores"));
    }

    #[test]
    fn test_by_core1_waits_when_fragmented() {
        let mut c = cluster();
        c.reserve(&vec!["n3".to_string(); 3]);
        let v = match_require(&req(Mode::ByCore1, 6), &c, &none());
        assert!(v.pmatch);
        assert!(!v.matched);
        assert!(v.reason.contains("any one node"));
    }

    #[test]
    fn test_by_node_takes_whole_nodes() {
        let mut r = req(Mode::ByNode, 1);
        r.group = OneOrMany::from("grpB");
        let mut c = cluster();
        c.reserve(&["n2".to_string()]);
        let v = match_require(&r, &c, &none());
        assert!(v.matched);
        assert_eq!(v.hosts, vec!["n3"; 8]);
    }

    #[test]
    fn test_by_node_partially_used_does_not_count() {
        let mut c = cluster();
        c.reserve(&["n1".to_string()]);
        c.reserve(&["n2".to_string()]);
        c.reserve(&["n3".to_string()]);
        let v = match_require(&req(Mode::ByNode, 1), &c, &none());
        assert!(v.pmatch);
        assert!(!v.matched);
        assert!(v.reason.contains("idle"));
    }

    #[test]
    fn test_by_node_min_cores_floor() {
        let mut r = req(Mode::ByNode, 2);
        r.min_cores = 8;
        // only n3 has 8 cores, so two such nodes can never exist
        let v = match_require(&r, &cluster(), &none());
        assert!(!v.pmatch);
    }

    #[test]
    fn test_by_node_blocked_group() {
        let bg: BlockedGroups = ["grpB".to_string()].into();
        let mut r = req(Mode::ByNode, 1);
        r.group = OneOrMany::from("grpB");
        let v = match_require(&r, &cluster(), &bg);
        assert!(v.pmatch);
        assert!(!v.matched);
        assert!(v.reason.contains("block-priority"));
    }

    #[test]
    fn test_by_host_runs() {
        let mut r = req(Mode::ByHost, 2);
        r.host = Some("n1".to_string());
        let v = match_require(&r, &cluster(), &none());
        assert!(v.matched);
        assert_eq!(v.hosts, vec!["n1", "n1"]);
    }

    #[test]
    fn test_by_host_cores_too_few() {
        let mut r = req(Mode::ByHost, 10);
        r.host = Some("n1".to_string());
        let v = match_require(&r, &cluster(), &none());
        assert!(!v.pmatch);
        assert!(v.reason.contains("cores too few"));
    }

    #[test]
    fn test_by_host_unknown_offline_blocked() {
        let mut r = req(Mode::ByHost, 1);
        r.host = Some("n9".to_string());
        assert!(!match_require(&r, &cluster(), &none()).pmatch);

        let mut c = cluster();
        c.set_online("n1", false).unwrap();
        r.host = Some("n1".to_string());
        assert!(!match_require(&r, &c, &none()).pmatch);

        let bg: BlockedGroups = ["grpA".to_string()].into();
        let v = match_require(&r, &cluster(), &bg);
        assert!(!v.pmatch);
        assert!(v.reason.contains("block-priority"));
    }

    #[test]
    fn test_by_host_missing_field() {
        let v = match_require(&req(Mode::ByHost, 1), &cluster(), &none());
        assert!(!v.pmatch);
        assert!(v.reason.contains("'host' field"));
    }

    #[test]
    fn test_by_host_waits_when_busy() {
        let mut c = cluster();
        c.reserve(&vec!["n1".to_string(); 3]);
        let mut r = req(Mode::ByHost, 2);
        r.host = Some("n1".to_string());
        let v = match_require(&r, &c, &none());
        assert!(v.pmatch);
        assert!(!v.matched);
        assert!(v.reason.contains("free cores on n1"));
    }

    #[test]
    fn test_by_group_grants_every_core() {
        let mut r = req(Mode::ByGroup, 1);
        r.group = OneOrMany::from("grpA");
        let v = match_require(&r, &cluster(), &none());
        assert!(v.matched);
        assert_eq!(v.hosts, vec!["n1", "n1", "n1", "n1", "n2", "n2", "n2", "n2"]);
    }

    #[test]
    fn test_by_group_demands_entirely_free() {
        let mut c = cluster();
        c.reserve(&["n2".to_string()]);
        let mut r = req(Mode::ByGroup, 1);
        r.group = OneOrMany::from("grpA");
        let v = match_require(&r, &c, &none());
        assert!(v.pmatch);
        assert!(!v.matched);
        assert!(v.reason.contains("not entirely free"));
    }

    #[test]
    fn test_by_group_requires_single_tag() {
        let mut r = req(Mode::ByGroup, 1);
        r.group = OneOrMany::from(vec!["grpA".to_string(), "grpB".to_string()]);
        assert!(!match_require(&r, &cluster(), &none()).pmatch);

        r.group = OneOrMany::default();
        assert!(!match_require(&r, &cluster(), &none()).pmatch);
    }

    #[test]
    fn test_by_group_unknown_tag_never_matches() {
        let mut r = req(Mode::ByGroup, 1);
        r.group = OneOrMany::from("grpZ");
        let v = match_require(&r, &cluster(), &none());
        assert!(!v.pmatch);
    }

    #[test]
    fn test_by_group_offline_member_is_skipped() {
        let mut c = cluster();
        c.set_online("n2", false).unwrap();
        let mut r = req(Mode::ByGroup, 1);
        r.group = OneOrMany::from("grpA");
        // the online subset of the group is granted whole
        let v = match_require(&r, &c, &none());
        assert!(v.matched);
        assert_eq!(v.hosts, vec!["n1"; 4]);
    }

    #[test]
    fn test_by_group_waits_when_every_member_is_offline() {
        let mut c = cluster();
        c.set_online("n1", false).unwrap();
        c.set_online("n2", false).unwrap();
        let mut r = req(Mode::ByGroup, 1);
        r.group = OneOrMany::from("grpA");
        let v = match_require(&r, &c, &none());
        assert!(v.pmatch);
        assert!(!v.matched);
        assert!(v.reason.contains("offline"));
    }

    #[test]
    fn test_block_priority_request_sees_empty_bgroups() {
        // the queue passes an empty set for block jobs; nothing special in
        // the matcher, but the requirement priority must not leak in
        let mut r = req(Mode::ByCore, 4);
        r.priority = Priority::Block;
        let v = match_require(&r, &cluster(), &none());
        assert!(v.matched);
    }

    #[test]
    fn test_zero_n_rejected() {
        let v = match_require(&req(Mode::ByCore, 0), &cluster(), &none());
        assert!(!v.pmatch);
    }
}
