//! End-to-end behaviour of the container engine against a scratch
//! filesystem: hierarchy rules, lifecycle traces, persistence round-trips
//! and boot-time reconciliation.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use corral_config::Config;
use corral_container::{
    ContainerHolder, ContainerState, Cred, Env, Error, PayloadLauncher, PayloadSpec,
};

/// A launcher that never forks: it hands out pids and lets the test script
/// payload exits.
#[derive(Clone, Default)]
struct FakeLauncher {
    state: Arc<Mutex<FakeState>>,
}

#[derive(Default)]
struct FakeState {
    next_pid: i32,
    launched: Vec<PayloadSpec>,
    /// pid -> pending wait status, once the payload "exited".
    exited: HashMap<i32, i32>,
    alive: Vec<i32>,
    fail_launch: bool,
}

impl FakeLauncher {
    fn new() -> Self {
        let launcher = Self::default();
        launcher.state.lock().unwrap().next_pid = 1000;
        launcher
    }

    fn fail_next_launch(&self) {
        self.state.lock().unwrap().fail_launch = true;
    }

    fn exit(&self, pid: i32, status: i32) {
        let mut state = self.state.lock().unwrap();
        state.alive.retain(|p| *p != pid);
        state.exited.insert(pid, status);
    }

    fn last_pid(&self) -> i32 {
        self.state.lock().unwrap().next_pid - 1
    }

    fn launch_count(&self) -> usize {
        self.state.lock().unwrap().launched.len()
    }
}

#[async_trait]
impl PayloadLauncher for FakeLauncher {
    async fn launch(&self, spec: &PayloadSpec) -> io::Result<i32> {
        let mut state = self.state.lock().unwrap();
        if state.fail_launch {
            state.fail_launch = false;
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        state.launched.push(spec.clone());
        state.alive.push(pid);
        Ok(pid)
    }

    fn kill(&self, pid: i32, sig: i32) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.alive.contains(&pid) {
            // The fake payload dies of any signal.
            state.alive.retain(|p| *p != pid);
            state.exited.insert(pid, sig);
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ESRCH))
        }
    }

    fn try_reap(&self, pid: i32) -> io::Result<Option<i32>> {
        Ok(self.state.lock().unwrap().exited.remove(&pid))
    }
}

struct Fixture {
    _dir: TempDir,
    config: Config,
    launcher: FakeLauncher,
    holder: ContainerHolder,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.daemon.data_dir = dir.path().join("data");
        config.container.cgroup_root = dir.path().join("cgroup");
        config.volumes.pool_dir = dir.path().join("volumes");
        config.container.grace_period_ms = 50;
        config.container.freezer_wait_interval_ms = 1;
        config.container.freezer_wait_timeout_ms = 100;
        config.container.remove_kill_attempts = 3;

        let launcher = FakeLauncher::new();
        let env = Env::new(config.clone(), Box::new(launcher.clone())).unwrap();
        let holder = ContainerHolder::new(env);
        Self {
            _dir: dir,
            config,
            launcher,
            holder,
        }
    }

    /// A second daemon generation over the same on-disk state.
    fn restart(&self) -> ContainerHolder {
        let env = Env::new(self.config.clone(), Box::new(self.launcher.clone())).unwrap();
        ContainerHolder::new(env)
    }

    fn set(&mut self, name: &str, prop: &str, value: &str) {
        self.holder.set_property(name, prop, value, true).unwrap();
    }

    fn cgroup_dir(&self, subsystem: &str, name: &str) -> std::path::PathBuf {
        self.config
            .container
            .cgroup_root
            .join(subsystem)
            .join("corral")
            .join(name)
    }
}

#[tokio::test]
async fn hierarchy_blocks_destroy_until_children_are_gone() {
    let mut fx = Fixture::new();
    let cred = Cred::root();

    fx.holder.create("a", cred).unwrap();
    fx.holder.create("a/b", cred).unwrap();

    let err = fx.holder.destroy("a").await.unwrap_err();
    assert!(matches!(err, Error::Busy(_)));
    // Both containers unchanged.
    assert_eq!(fx.holder.get("a").unwrap().state(), ContainerState::Stopped);
    assert_eq!(fx.holder.get("a/b").unwrap().state(), ContainerState::Stopped);

    fx.holder.destroy("a/b").await.unwrap();
    fx.holder.destroy("a").await.unwrap();
    assert!(fx.holder.list().is_empty());
}

#[tokio::test]
async fn create_requires_a_live_parent() {
    let mut fx = Fixture::new();
    let err = fx.holder.create("a/b", Cred::root()).unwrap_err();
    assert!(matches!(err, Error::ContainerDoesNotExist(_)));
}

#[tokio::test]
async fn properties_survive_a_daemon_restart() {
    let mut fx = Fixture::new();
    fx.holder.create("x", Cred::new(1000, 1000)).unwrap();
    fx.set("x", "cpu_limit", "50");

    let mut second = fx.restart();
    second.restore_all().await.unwrap();

    assert_eq!(second.list(), vec!["x".to_owned()]);
    assert_eq!(second.get_property("x", "cpu_limit").unwrap(), "50");
    assert_eq!(second.get("x").unwrap().state(), ContainerState::Stopped);
    // Ownership came back through the hidden bookkeeping pairs.
    assert_eq!(second.get("x").unwrap().owner().uid, 1000);
}

#[tokio::test]
async fn restore_orders_parents_before_children() {
    let mut fx = Fixture::new();
    let cred = Cred::root();
    fx.holder.create("p", cred).unwrap();
    fx.holder.create("p/c", cred).unwrap();
    fx.holder.create("p/c/d", cred).unwrap();

    let mut second = fx.restart();
    second.restore_all().await.unwrap();

    assert_eq!(
        second.list(),
        vec!["p".to_owned(), "p/c".to_owned(), "p/c/d".to_owned()]
    );
    assert_eq!(second.get("p/c/d").unwrap().parent(), Some("p/c"));
}

#[tokio::test]
async fn parent_default_properties_inherit_without_touching_the_slot() {
    let mut fx = Fixture::new();
    let cred = Cred::root();
    fx.holder.create("p", cred).unwrap();
    fx.holder.create("p/c", cred).unwrap();

    fx.set("p", "memory_limit", "1G");

    assert_eq!(fx.holder.get_property("p/c", "memory_limit").unwrap(), "1G");
    assert!(fx.holder.is_default("p/c", "memory_limit").unwrap());

    // An explicit child slot wins over the ancestor.
    fx.set("p/c", "memory_limit", "512M");
    assert_eq!(
        fx.holder.get_property("p/c", "memory_limit").unwrap(),
        "512M"
    );
    assert!(!fx.holder.is_default("p/c", "memory_limit").unwrap());

    // Non-parent-default properties fall back to the static default.
    fx.set("p", "cpu_limit", "50");
    assert_eq!(fx.holder.get_property("p/c", "cpu_limit").unwrap(), "0");
}

#[tokio::test]
async fn lifecycle_trace_and_cgroup_projection() {
    let mut fx = Fixture::new();
    fx.holder.create("t", Cred::root()).unwrap();
    fx.set("t", "command", "sleep 1000");

    assert_eq!(fx.holder.get_data("t", "state").unwrap(), "stopped");
    assert!(!fx.cgroup_dir("freezer", "t").exists());

    fx.holder.start("t").await.unwrap();
    assert_eq!(fx.holder.get_data("t", "state").unwrap(), "running");
    assert!(fx.cgroup_dir("freezer", "t").is_dir());
    assert!(fx.cgroup_dir("memory", "t").is_dir());
    assert_eq!(
        std::fs::read_to_string(fx.cgroup_dir("memory", "t").join("memory.use_hierarchy"))
            .unwrap(),
        "1"
    );
    let pid = fx.launcher.last_pid();
    assert_eq!(fx.holder.get_data("t", "root_pid").unwrap(), pid.to_string());
    let mut subsystems = fx.holder.get("t").unwrap().cgroup_subsystems();
    subsystems.sort();
    assert_eq!(subsystems, vec!["cpu", "cpuacct", "freezer", "memory"]);

    fx.holder.pause("t").await.unwrap();
    assert_eq!(fx.holder.get_data("t", "state").unwrap(), "paused");
    assert!(fx.cgroup_dir("freezer", "t").is_dir());

    // Pause is not legal twice.
    let err = fx.holder.pause("t").await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert_eq!(fx.holder.get_data("t", "state").unwrap(), "paused");

    fx.holder.resume("t").await.unwrap();
    assert_eq!(fx.holder.get_data("t", "state").unwrap(), "running");

    fx.holder.stop("t").await.unwrap();
    assert_eq!(fx.holder.get_data("t", "state").unwrap(), "stopped");
    // Invariant: no cgroup handle survives a stop.
    assert!(fx.holder.get("t").unwrap().cgroup_subsystems().is_empty());
    for subsystem in ["memory", "freezer", "cpu", "cpuacct"] {
        assert!(!fx.cgroup_dir(subsystem, "t").exists(), "{subsystem} left behind");
    }
}

#[tokio::test]
async fn start_failure_unwinds_the_projection() {
    let mut fx = Fixture::new();
    fx.holder.create("u", Cred::root()).unwrap();
    fx.set("u", "command", "doomed");

    fx.launcher.fail_next_launch();
    let err = fx.holder.start("u").await.unwrap_err();
    assert!(matches!(err, Error::Unknown(_)));

    assert_eq!(fx.holder.get("u").unwrap().state(), ContainerState::Stopped);
    for subsystem in ["memory", "freezer", "cpu", "cpuacct"] {
        assert!(!fx.cgroup_dir(subsystem, "u").exists());
    }
    assert_eq!(fx.holder.get_data("u", "start_errno").unwrap(), libc::ENOENT.to_string());
}

#[tokio::test]
async fn empty_command_yields_a_meta_container() {
    let mut fx = Fixture::new();
    fx.holder.create("m", Cred::root()).unwrap();

    fx.holder.start("m").await.unwrap();
    assert_eq!(fx.holder.get_data("m", "state").unwrap(), "meta");
    assert_eq!(fx.launcher.launch_count(), 0);
    assert!(fx.cgroup_dir("memory", "m").is_dir());

    // Observed data still works against the projection.
    std::fs::write(
        fx.cgroup_dir("memory", "m").join("memory.usage_in_bytes"),
        "4096",
    )
    .unwrap();
    assert_eq!(fx.holder.get_data("m", "memory_usage").unwrap(), "4096");

    fx.holder.stop("m").await.unwrap();
    assert_eq!(fx.holder.get_data("m", "state").unwrap(), "stopped");
}

#[tokio::test]
async fn payload_exit_drives_dead_and_stop_recovers() {
    let mut fx = Fixture::new();
    fx.holder.create("d", Cred::root()).unwrap();
    fx.set("d", "command", "sleep 1000");
    fx.holder.start("d").await.unwrap();
    let pid = fx.launcher.last_pid();

    fx.holder.kill("d", libc::SIGKILL).unwrap();
    fx.holder.reconcile_exits();

    assert_eq!(fx.holder.get_data("d", "state").unwrap(), "dead");
    assert_eq!(
        fx.holder.get_data("d", "exit_status").unwrap(),
        libc::SIGKILL.to_string()
    );
    assert_eq!(fx.holder.get_data("d", "root_pid").unwrap(), pid.to_string());

    // Kill is only legal while running.
    let err = fx.holder.kill("d", libc::SIGTERM).unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    fx.holder.stop("d").await.unwrap();
    assert_eq!(fx.holder.get_data("d", "state").unwrap(), "stopped");
}

#[tokio::test]
async fn freezer_timeout_leaves_the_container_running() {
    let mut fx = Fixture::new();
    fx.holder.create("f", Cred::root()).unwrap();
    fx.set("f", "command", "sleep 1000");
    fx.holder.start("f").await.unwrap();

    // Point the state knob at a sink that swallows writes, so the poll
    // loop never observes the transition.
    let state_knob = fx.cgroup_dir("freezer", "f").join("freezer.state");
    std::fs::remove_file(&state_knob).ok();
    std::os::unix::fs::symlink("/dev/null", &state_knob).unwrap();

    let err = fx.holder.pause("f").await.unwrap_err();
    assert!(matches!(err, Error::FreezerTimeout(_)));
    assert_eq!(fx.holder.get_data("f", "state").unwrap(), "running");
}

#[tokio::test]
async fn property_writes_are_gated_by_state() {
    let mut fx = Fixture::new();
    fx.holder.create("s", Cred::root()).unwrap();
    fx.set("s", "command", "sleep 1000");
    fx.holder.start("s").await.unwrap();

    let err = fx
        .holder
        .set_property("s", "command", "something else", true)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert_eq!(fx.holder.get_property("s", "command").unwrap(), "sleep 1000");

    // memory_limit stays writable while running.
    fx.set("s", "memory_limit", "2G");
    assert_eq!(fx.holder.get_property("s", "memory_limit").unwrap(), "2G");

    fx.holder.stop("s").await.unwrap();
}

#[tokio::test]
async fn destroy_drops_the_persistence_node() {
    let mut fx = Fixture::new();
    fx.holder.create("gone", Cred::root()).unwrap();
    fx.set("gone", "private", "marker");
    assert!(fx.holder.env().kv.exists("gone"));

    fx.holder.destroy("gone").await.unwrap();
    assert!(fx.holder.get("gone").is_none());
    assert!(!fx.holder.env().kv.exists("gone"));
}

#[tokio::test]
async fn destroy_stops_a_running_container_first() {
    let mut fx = Fixture::new();
    fx.holder.create("r", Cred::root()).unwrap();
    fx.set("r", "command", "sleep 1000");
    fx.holder.start("r").await.unwrap();

    fx.holder.destroy("r").await.unwrap();
    assert!(fx.holder.get("r").is_none());
    assert!(!fx.cgroup_dir("freezer", "r").exists());
}

#[tokio::test]
async fn restore_cleans_residual_cgroups() {
    let fx = Fixture::new();

    // A previous daemon generation left cgroups behind.
    let stray = fx.cgroup_dir("freezer", "ghost/child");
    std::fs::create_dir_all(&stray).unwrap();

    let mut second = fx.restart();
    second.restore_all().await.unwrap();

    assert!(!stray.exists());
    assert!(!fx.cgroup_dir("freezer", "ghost").exists());
}

#[tokio::test]
async fn spec_resolution_feeds_the_launcher() {
    let mut fx = Fixture::new();
    fx.holder.create("spec", Cred::root()).unwrap();
    fx.set("spec", "command", "worker --serve");
    fx.set("spec", "user", "1000");
    fx.set("spec", "group", "1000");
    fx.set("spec", "cwd", "/srv");
    fx.set("spec", "env", "MODE=prod;DEBUG=");
    fx.set("spec", "ulimit", "nofile: 1024 2048");

    fx.holder.start("spec").await.unwrap();

    let state = fx.launcher.state.lock().unwrap();
    let spec = state.launched.last().unwrap();
    assert_eq!(spec.command, "worker --serve");
    assert_eq!(spec.cred.uid, 1000);
    assert_eq!(spec.cwd, std::path::PathBuf::from("/srv"));
    assert_eq!(spec.env_vars.len(), 2);
    assert_eq!(spec.rlimits.len(), 1);
    // One attach path per active subsystem.
    assert_eq!(spec.cgroup_procs.len(), 4);
}
