//! A handle to one control-group directory.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{CgroupError, Result};

/// A (subsystem, relative path) handle over a cgroup-v1 directory.
///
/// The handle is pure data; it owns no kernel resource until [`Cgroup::create`]
/// runs, and dropping it leaves the directory alone. The mount root is
/// carried explicitly so tests can point the whole adapter at a scratch
/// directory instead of `/sys/fs/cgroup`.
#[derive(Debug, Clone)]
pub struct Cgroup {
    subsystem: String,
    path: PathBuf,
    relpath: String,
}

impl Cgroup {
    /// Builds a handle for `relpath` under `mount` (the subsystem mount
    /// point, e.g. `/sys/fs/cgroup/freezer`).
    pub fn new(subsystem: impl Into<String>, mount: &Path, relpath: impl Into<String>) -> Self {
        let relpath = relpath.into();
        Self {
            subsystem: subsystem.into(),
            path: mount.join(relpath.trim_start_matches('/')),
            relpath,
        }
    }

    /// The subsystem this handle belongs to.
    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    /// Absolute directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path relative to the subsystem mount.
    pub fn relpath(&self) -> &str {
        &self.relpath
    }

    /// Path of the `cgroup.procs` knob, for writers that attach themselves.
    pub fn procs_path(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    /// Returns whether the directory exists.
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Creates the directory (and any missing ancestors).
    pub fn create(&self) -> Result<()> {
        debug!(cgroup = %self.path.display(), "create cgroup");
        fs::create_dir_all(&self.path).map_err(|e| CgroupError::io(&self.path, e))
    }

    /// Removes the directory.
    ///
    /// At this point every task in the container should have terminated
    /// gracefully; anything still alive is SIGKILLed, retrying at `interval`
    /// up to `attempts` times before the directory itself is unlinked.
    pub async fn remove(&self, attempts: u32, interval: Duration) -> Result<()> {
        if !self.exists() {
            return Ok(());
        }

        for _ in 0..attempts {
            if self.is_empty() {
                break;
            }
            if let Err(e) = self.kill_all(libc::SIGKILL) {
                warn!(cgroup = %self.path.display(), error = %e, "kill inside cgroup failed");
            }
            tokio::time::sleep(interval).await;
        }

        if !self.is_empty() {
            warn!(cgroup = %self.path.display(), "can't kill all tasks in cgroup");
        }

        debug!(cgroup = %self.path.display(), "remove cgroup");
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
                // On cgroupfs the knob files vanish with the directory; a
                // plain filesystem backing needs the recursive path.
                fs::remove_dir_all(&self.path).map_err(|e| CgroupError::io(&self.path, e))
            }
            Err(e) => Err(CgroupError::io(&self.path, e)),
        }
    }

    /// Attaches `pid` by appending it to `cgroup.procs`.
    pub fn attach(&self, pid: i32) -> Result<()> {
        self.append_knob("cgroup.procs", &pid.to_string())
    }

    /// Reads a knob as a string.
    pub fn get_knob(&self, knob: &str) -> Result<String> {
        let path = self.path.join(knob);
        fs::read_to_string(&path).map_err(|e| CgroupError::io(&path, e))
    }

    /// Reads a knob as individual non-empty lines.
    pub fn knob_lines(&self, knob: &str) -> Result<Vec<String>> {
        Ok(self
            .get_knob(knob)?
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// Reads a knob as an unsigned integer.
    pub fn knob_u64(&self, knob: &str) -> Result<u64> {
        let raw = self.get_knob(knob)?;
        raw.trim().parse().map_err(|_| CgroupError::Parse {
            knob: knob.to_owned(),
            value: raw.trim().to_owned(),
        })
    }

    /// Overwrites a knob.
    pub fn set_knob(&self, knob: &str, value: &str) -> Result<()> {
        let path = self.path.join(knob);
        fs::write(&path, value).map_err(|e| CgroupError::io(&path, e))
    }

    /// Appends a line to a knob (the write mode `cgroup.procs` expects).
    pub fn append_knob(&self, knob: &str, value: &str) -> Result<()> {
        let path = self.path.join(knob);
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| CgroupError::io(&path, e))?;
        writeln!(file, "{value}").map_err(|e| CgroupError::io(&path, e))
    }

    /// Enumerates the process ids attached to this cgroup.
    pub fn procs(&self) -> Result<Vec<i32>> {
        self.pids_of("cgroup.procs")
    }

    /// Enumerates the task (thread) ids in this cgroup.
    pub fn tasks(&self) -> Result<Vec<i32>> {
        self.pids_of("tasks")
    }

    /// Whether no task remains. A missing knob reads as empty.
    pub fn is_empty(&self) -> bool {
        self.tasks().map_or(true, |tasks| tasks.is_empty())
    }

    /// Signals every task in the cgroup.
    pub fn kill_all(&self, signal: i32) -> Result<()> {
        for pid in self.tasks()? {
            // A task may exit between enumeration and the kill; ESRCH is fine.
            let ret = unsafe { libc::kill(pid, signal) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    warn!(pid, error = %err, "can't signal task");
                }
            }
        }
        Ok(())
    }

    fn pids_of(&self, knob: &str) -> Result<Vec<i32>> {
        let mut pids = Vec::new();
        for line in self.knob_lines(knob)? {
            let pid = line.trim().parse().map_err(|_| CgroupError::Parse {
                knob: knob.to_owned(),
                value: line.clone(),
            })?;
            pids.push(pid);
        }
        Ok(pids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, Cgroup) {
        let dir = TempDir::new().unwrap();
        let cg = Cgroup::new("freezer", dir.path(), "corral/test");
        (dir, cg)
    }

    #[test]
    fn create_builds_nested_directories() {
        let (_dir, cg) = scratch();
        assert!(!cg.exists());
        cg.create().unwrap();
        assert!(cg.exists());
        assert!(cg.path().ends_with("corral/test"));
    }

    #[test]
    fn knob_roundtrip_and_u64_parse() {
        let (_dir, cg) = scratch();
        cg.create().unwrap();

        cg.set_knob("memory.limit_in_bytes", "1048576").unwrap();
        assert_eq!(cg.get_knob("memory.limit_in_bytes").unwrap(), "1048576");
        assert_eq!(cg.knob_u64("memory.limit_in_bytes").unwrap(), 1_048_576);

        cg.set_knob("memory.limit_in_bytes", "junk").unwrap();
        assert!(matches!(
            cg.knob_u64("memory.limit_in_bytes"),
            Err(CgroupError::Parse { .. })
        ));
    }

    #[test]
    fn attach_appends_pids() {
        let (_dir, cg) = scratch();
        cg.create().unwrap();

        cg.attach(100).unwrap();
        cg.attach(200).unwrap();
        assert_eq!(cg.procs().unwrap(), vec![100, 200]);
    }

    #[test]
    fn missing_tasks_knob_reads_as_empty() {
        let (_dir, cg) = scratch();
        cg.create().unwrap();
        assert!(cg.is_empty());
        assert!(cg.get_knob("tasks").is_err());
    }

    #[tokio::test]
    async fn remove_unlinks_an_empty_cgroup() {
        let (_dir, cg) = scratch();
        cg.create().unwrap();

        cg.remove(3, Duration::from_millis(1)).await.unwrap();
        assert!(!cg.exists());
    }

    #[tokio::test]
    async fn remove_of_absent_cgroup_is_a_no_op() {
        let (_dir, cg) = scratch();
        cg.remove(3, Duration::from_millis(1)).await.unwrap();
    }
}
