// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! On-disk mirror of live job state.
//!
//! One YAML file per live job, named `<pid>.<status>` with status `wait` or
//! `run`. The file extension is the authoritative status at rest; the
//! embedded record may be stale in any field except `pid`. At most one file
//! exists per pid. Records carry a small version integer so the format can
//! evolve.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::job::{Job, Status};

/// Spool record format version
pub const SPOOL_VERSION: u32 = 1;

/// What a spool file holds: the format version and the job itself.
#[derive(Debug, Serialize, Deserialize)]
struct SpoolRecord {
    version: u32,
    job: Job,
}

/// A spool directory on stable storage.
#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    /// Open (creating if absent) a spool directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The directory path
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The `.run` filename for a pid; returned to clients, which watch for
    /// it to appear.
    pub fn run_fname(&self, pid: u32) -> PathBuf {
        self.dir.join(format!("{pid}.run"))
    }

    /// Serialize `job` to `<pid>.<status>`, replacing any previous file for
    /// this pid. The write goes to a temp file first so a crash never
    /// leaves a half-written record behind.
    pub fn write(&self, job: &mut Job) -> Result<()> {
        let fname = self.dir.join(format!("{}.{}", job.pid, job.status()));
        let prev = job.spool_fname.take();

        job.spool_fname = Some(fname.clone());
        let record = SpoolRecord {
            version: SPOOL_VERSION,
            job: job.clone(),
        };
        let text = serde_yaml::to_string(&record)
            .map_err(|e| Error::Spool(format!("encoding pid {}: {e}", job.pid)))?;

        let tmp = self.dir.join(format!("{}.tmp", job.pid));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &fname)?;
        debug!("spooled {}", fname.display());

        if let Some(prev) = prev {
            if prev != fname && prev.exists() {
                fs::remove_file(&prev)?;
            }
        }
        Ok(())
    }

    /// Remove the job's spool file, if any.
    pub fn remove(&self, job: &mut Job) -> Result<()> {
        if let Some(fname) = job.spool_fname.take() {
            if fname.exists() {
                fs::remove_file(&fname)?;
                debug!("unspooled {}", fname.display());
            }
        }
        Ok(())
    }

    /// Replay the directory at boot: ascending filename order, only `.run`
    /// and `.wait` files, extension wins over the embedded status. An
    /// unreadable or corrupt file is logged and skipped, never fatal.
    pub fn replay(&self) -> Result<Vec<Job>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("run") | Some("wait")
                )
            })
            .collect();
        paths.sort();

        let mut jobs = Vec::new();
        for path in paths {
            match read_record(&path) {
                Ok(job) => jobs.push(job),
                Err(err) => warn!("skipping spool file {}: {err}", path.display()),
            }
        }
        Ok(jobs)
    }
}

fn read_record(path: &Path) -> Result<Job> {
    let text = fs::read_to_string(path)?;
    let record: SpoolRecord = serde_yaml::from_str(&text)
        .map_err(|e| Error::Spool(format!("corrupt record: {e}")))?;
    if record.version != SPOOL_VERSION {
        return Err(Error::Spool(format!(
            "unsupported spool version {}",
            record.version
        )));
    }

    let mut job = record.job;
    let status = match path.extension().and_then(|e| e.to_str()) {
        Some("run") => Status::Run,
        Some("wait") => Status::Wait,
        other => return Err(Error::Spool(format!("bad extension {other:?}"))),
    };
    job.restore_status(status);
    job.spool_fname = Some(path.to_path_buf());
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Requirement;
    use chrono::Utc;
    use tempfile::TempDir;

    fn job(pid: u32) -> Job {
        Job::new(pid, "client1", "bob", "sleep 60", Requirement::default(), Utc::now())
    }

    #[test]
    fn test_write_names_file_by_status() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();

        let mut j = job(100);
        spool.write(&mut j).unwrap();
        assert!(dir.path().join("100.wait").exists());
        assert_eq!(j.spool_fname, Some(dir.path().join("100.wait")));
    }

    #[test]
    fn test_rewrite_replaces_previous_file() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();

        let mut j = job(100);
        spool.write(&mut j).unwrap();

        j.set_status(Status::Ready);
        j.set_status(Status::Run);
        spool.write(&mut j).unwrap();

        assert!(!dir.path().join("100.wait").exists());
        assert!(dir.path().join("100.run").exists());
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();

        let mut j = job(100);
        spool.write(&mut j).unwrap();
        spool.remove(&mut j).unwrap();
        assert!(!dir.path().join("100.wait").exists());
        assert!(j.spool_fname.is_none());
    }

    #[test]
    fn test_replay_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();

        let mut j2 = job(200);
        spool.write(&mut j2).unwrap();
        let mut j1 = job(100);
        j1.hosts = vec!["n1".to_string(); 2];
        j1.set_status(Status::Ready);
        j1.set_status(Status::Run);
        spool.write(&mut j1).unwrap();

        // noise the replay must ignore
        fs::write(dir.path().join("users.yaml"), "{}").unwrap();
        fs::write(dir.path().join("junk.txt"), "junk").unwrap();

        let jobs = spool.replay().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].pid, 100);
        assert_eq!(jobs[0].status(), Status::Run);
        assert_eq!(jobs[0].hosts.len(), 2);
        assert_eq!(jobs[1].pid, 200);
        assert_eq!(jobs[1].status(), Status::Wait);
    }

    #[test]
    fn test_replay_skips_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();

        let mut good = job(100);
        spool.write(&mut good).unwrap();
        fs::write(dir.path().join("200.wait"), "{not yaml: [").unwrap();

        let jobs = spool.replay().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].pid, 100);
    }

    #[test]
    fn test_extension_overrides_embedded_status() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();

        let mut j = job(100);
        spool.write(&mut j).unwrap();
        // a crash between rename and rewrite can leave the record behind
        // under the other name; the extension must win
        fs::rename(dir.path().join("100.wait"), dir.path().join("100.run")).unwrap();

        let jobs = spool.replay().unwrap();
        assert_eq!(jobs[0].status(), Status::Run);
    }

    #[test]
    fn test_replay_rejects_future_version() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();

        let mut j = job(100);
        spool.write(&mut j).unwrap();
        let text = fs::read_to_string(dir.path().join("100.wait")).unwrap();
        let bumped = text.replace("version: 1", "version: 99");
        fs::write(dir.path().join("100.wait"), bumped).unwrap();

        assert!(spool.replay().unwrap().is_empty());
    }

    #[test]
    fn test_run_fname() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        assert_eq!(spool.run_fname(42), dir.path().join("42.run"));
    }
}
