// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Cluster model: nodes, reservation counters, and status snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// A physical host in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique hostname
    pub hostname: String,
    /// Total cores
    pub cores: u32,
    /// Memory, in the units of the description file
    pub mem: f64,
    /// Group tags, in description-file order
    pub groups: Vec<String>,
    /// Cores currently granted to running jobs
    pub used: u32,
    /// Offline hosts are invisible to matching
    pub online: bool,
}

impl Node {
    /// Parse one description line: `hostname cores mem [group1,group2,...]`.
    fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            return Err(Error::ClusterDescription(format!(
                "expected 'hostname cores mem [groups]', got '{line}'"
            )));
        }
        let cores: u32 = fields[1].parse().map_err(|_| {
            Error::ClusterDescription(format!("bad core count '{}' for host {}", fields[1], fields[0]))
        })?;
        if cores == 0 {
            return Err(Error::ClusterDescription(format!(
                "host {} has zero cores",
                fields[0]
            )));
        }
        let mem: f64 = fields[2].parse().map_err(|_| {
            Error::ClusterDescription(format!("bad memory '{}' for host {}", fields[2], fields[0]))
        })?;
        let groups = match fields.get(3) {
            Some(g) => g.split(',').map(str::to_string).collect(),
            None => Vec::new(),
        };
        Ok(Self {
            hostname: fields[0].to_string(),
            cores,
            mem,
            groups,
            used: 0,
            online: true,
        })
    }

    /// Cores not currently granted
    pub fn free(&self) -> u32 {
        self.cores - self.used
    }

    /// True if the node carries any of the listed tags
    pub fn in_any_group(&self, groups: &[String]) -> bool {
        groups.iter().any(|g| self.groups.contains(g))
    }

    fn reserve_one(&mut self) {
        self.used += 1;
        assert!(
            self.used <= self.cores,
            "reserved past capacity on {}: {}/{} cores",
            self.hostname,
            self.used,
            self.cores
        );
    }

    fn unreserve_one(&mut self) {
        assert!(
            self.used > 0,
            "unreserved below zero on {}",
            self.hostname
        );
        self.used -= 1;
    }
}

/// Per-node slice of a [`ClusterStatus`] snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Hostname
    pub hostname: String,
    /// Cores granted
    pub used: u32,
    /// Total cores
    pub ncores: u32,
    /// Memory
    pub mem: f64,
    /// Group tags
    pub grps: Vec<String>,
    /// Admission flag
    pub online: bool,
}

/// Deterministic snapshot of the whole cluster, hosts sorted by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatus {
    /// Cores granted across all hosts
    pub used: u32,
    /// Total cores across all hosts
    pub ncores: u32,
    /// Number of hosts
    pub nnodes: usize,
    /// Per-host detail
    pub nodes: Vec<NodeStatus>,
}

/// The in-memory cluster: hostname -> node, plus the source filename.
///
/// Mutated only through [`Cluster::reserve`], [`Cluster::unreserve`] and
/// [`Cluster::set_online`]. Reservation overflow or underflow indicates a
/// scheduler bug and panics; restart plus spool replay is the recovery path.
#[derive(Debug, Clone)]
pub struct Cluster {
    filename: String,
    nodes: BTreeMap<String, Node>,
}

impl Cluster {
    /// Load a cluster from a description file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let cluster = Self::from_description(&path.display().to_string(), &text)?;
        info!(
            "loaded cluster from {}: {} hosts, {} cores",
            cluster.filename,
            cluster.nodes.len(),
            cluster.nodes.values().map(|n| n.cores).sum::<u32>()
        );
        Ok(cluster)
    }

    /// Parse a description text: one host per line, blank lines skipped.
    pub fn from_description(filename: &str, text: &str) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let node = Node::parse(line)?;
            if nodes.insert(node.hostname.clone(), node).is_some() {
                return Err(Error::ClusterDescription(format!(
                    "duplicate host in {filename}: {line}"
                )));
            }
        }
        Ok(Self {
            filename: filename.to_string(),
            nodes,
        })
    }

    /// The description file this cluster was built from
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Look up one node
    pub fn get(&self, hostname: &str) -> Option<&Node> {
        self.nodes.get(hostname)
    }

    /// Nodes in ascending hostname order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Every group tag present in the description
    pub fn all_groups(&self) -> BTreeSet<String> {
        self.nodes
            .values()
            .flat_map(|n| n.groups.iter().cloned())
            .collect()
    }

    /// Increment `used` once per grant entry. Panics on an unknown host or
    /// on overflow; both mean the matcher handed out a grant the cluster
    /// cannot hold.
    pub fn reserve(&mut self, hosts: &[String]) {
        for host in hosts {
            self.nodes
                .get_mut(host)
                .unwrap_or_else(|| panic!("reserve on unknown host {host}"))
                .reserve_one();
        }
    }

    /// Decrement `used` once per grant entry. Panics on underflow.
    pub fn unreserve(&mut self, hosts: &[String]) {
        for host in hosts {
            self.nodes
                .get_mut(host)
                .unwrap_or_else(|| panic!("unreserve on unknown host {host}"))
                .unreserve_one();
        }
    }

    /// Toggle admission for one host. Running grants are unaffected; the
    /// host just stops being considered for new matches.
    pub fn set_online(&mut self, hostname: &str, online: bool) -> Result<()> {
        match self.nodes.get_mut(hostname) {
            Some(node) => {
                node.online = online;
                info!(
                    "host {} set {}",
                    hostname,
                    if online { "online" } else { "offline" }
                );
                Ok(())
            }
            None => Err(Error::UnknownHost(hostname.to_string())),
        }
    }

    /// Snapshot for the dispatcher, hosts sorted by name.
    pub fn status(&self) -> ClusterStatus {
        let nodes: Vec<NodeStatus> = self
            .nodes
            .values()
            .map(|n| NodeStatus {
                hostname: n.hostname.clone(),
                used: n.used,
                ncores: n.cores,
                mem: n.mem,
                grps: n.groups.clone(),
                online: n.online,
            })
            .collect();
        ClusterStatus {
            used: nodes.iter().map(|n| n.used).sum(),
            ncores: nodes.iter().map(|n| n.ncores).sum(),
            nnodes: nodes.len(),
            nodes,
        }
    }
}
