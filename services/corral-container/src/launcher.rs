//! Payload launcher seam.
//!
//! The container engine treats process creation as an opaque callable: it
//! hands over a fully-resolved [`PayloadSpec`] and receives a pid. The
//! production [`ProcessLauncher`] forks through `std::process::Command`
//! with a `pre_exec` that attaches to the prepared cgroups and drops
//! credentials; tests install a recording fake instead.

use std::fs::File;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::state::Cred;
use crate::value::{BindMapping, NetSetup, RlimitSpec};

/// Everything the launcher needs to start a payload.
#[derive(Debug, Clone, Default)]
pub struct PayloadSpec {
    pub command: String,
    pub cred: Cred,
    pub cwd: PathBuf,
    pub root: PathBuf,
    pub hostname: String,
    pub env_vars: Vec<(String, String)>,
    pub rlimits: Vec<RlimitSpec>,
    pub binds: Vec<BindMapping>,
    pub net: NetSetup,
    /// `cgroup.procs` paths the child attaches itself to before exec.
    pub cgroup_procs: Vec<PathBuf>,
    pub stdin_path: Option<PathBuf>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

/// Trait for payload process management.
///
/// All methods speak `io::Error`; the engine converts at its boundary.
#[async_trait]
pub trait PayloadLauncher: Send + Sync {
    /// Forks and execs the payload, returning its pid.
    async fn launch(&self, spec: &PayloadSpec) -> io::Result<i32>;

    /// Sends `sig` to `pid`.
    fn kill(&self, pid: i32, sig: i32) -> io::Result<()>;

    /// Non-blocking reap; returns the raw wait status once the payload
    /// exited.
    fn try_reap(&self, pid: i32) -> io::Result<Option<i32>>;
}

/// Production launcher backed by fork/exec.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl PayloadLauncher for ProcessLauncher {
    async fn launch(&self, spec: &PayloadSpec) -> io::Result<i32> {
        let mut argv = spec.command.split_whitespace();
        let Some(program) = argv.next() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty command",
            ));
        };

        let mut command = Command::new(program);
        command.args(argv);
        command.env_clear();
        command.env("PATH", "/usr/sbin:/usr/bin:/sbin:/bin");
        for (key, value) in &spec.env_vars {
            command.env(key, value);
        }
        if spec.root == PathBuf::from("/") {
            command.current_dir(&spec.cwd);
        }

        command.stdin(stream(spec.stdin_path.as_ref(), false)?);
        command.stdout(stream(spec.stdout_path.as_ref(), true)?);
        command.stderr(stream(spec.stderr_path.as_ref(), true)?);

        let setup = ChildSetup {
            cred: spec.cred,
            root: spec.root.clone(),
            cwd: spec.cwd.clone(),
            hostname: spec.hostname.clone(),
            rlimits: spec.rlimits.clone(),
            binds: spec.binds.clone(),
            net: spec.net,
            cgroup_procs: spec.cgroup_procs.clone(),
        };
        unsafe {
            command.pre_exec(move || setup.apply());
        }

        let child = command.spawn()?;
        let pid = child.id() as i32;
        debug!(pid, command = %spec.command, "payload launched");
        // The pid is reaped via waitpid; the handle itself is not used.
        drop(child);
        Ok(pid)
    }

    fn kill(&self, pid: i32, sig: i32) -> io::Result<()> {
        let ret = unsafe { libc::kill(pid, sig) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn try_reap(&self, pid: i32) -> io::Result<Option<i32>> {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        match ret {
            0 => Ok(None),
            r if r == pid => Ok(Some(status)),
            _ => {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ECHILD) {
                    // Someone else reaped it; report a clean exit.
                    warn!(pid, "payload already reaped");
                    return Ok(Some(0));
                }
                Err(err)
            }
        }
    }
}

fn stream(path: Option<&PathBuf>, write: bool) -> io::Result<Stdio> {
    match path {
        None => Ok(Stdio::null()),
        Some(path) => {
            let file = if write {
                File::options().create(true).append(true).open(path)?
            } else {
                File::open(path)?
            };
            Ok(Stdio::from(file))
        }
    }
}

/// Work done between fork and exec, in the child.
struct ChildSetup {
    cred: Cred,
    root: PathBuf,
    cwd: PathBuf,
    hostname: String,
    rlimits: Vec<RlimitSpec>,
    binds: Vec<BindMapping>,
    net: NetSetup,
    cgroup_procs: Vec<PathBuf>,
}

impl ChildSetup {
    /// Only async-signal-safe calls are allowed here.
    fn apply(&self) -> io::Result<()> {
        check(unsafe { libc::setsid() } as i32)?;

        // Attach to the prepared cgroups while still privileged; writing
        // "0" attaches the writer itself.
        for procs in &self.cgroup_procs {
            std::fs::write(procs, "0")?;
        }

        if self.net == NetSetup::None {
            check(unsafe { libc::unshare(libc::CLONE_NEWNET) })?;
        }

        let isolate_fs = self.root != PathBuf::from("/") || !self.binds.is_empty();
        if isolate_fs {
            check(unsafe { libc::unshare(libc::CLONE_NEWNS) })?;
            self.apply_mounts()?;
        }

        if !self.hostname.is_empty() {
            check(unsafe { libc::unshare(libc::CLONE_NEWUTS) })?;
            let name = self.hostname.as_bytes();
            check(unsafe { libc::sethostname(name.as_ptr().cast(), name.len()) })?;
        }

        for limit in &self.rlimits {
            let rlim = libc::rlimit {
                rlim_cur: limit.soft,
                rlim_max: limit.hard,
            };
            #[allow(clippy::cast_sign_loss)]
            check(unsafe { libc::setrlimit(limit.resource as u32, &rlim) })?;
        }

        if self.cred.gid != 0 || self.cred.uid != 0 {
            check(unsafe { libc::setgid(self.cred.gid) })?;
            check(unsafe { libc::setgroups(0, std::ptr::null()) })?;
            check(unsafe { libc::setuid(self.cred.uid) })?;
        }

        Ok(())
    }

    fn apply_mounts(&self) -> io::Result<()> {
        // Stop mount propagation back to the host.
        check(unsafe {
            libc::mount(
                std::ptr::null(),
                c"/".as_ptr(),
                std::ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            )
        })?;

        for bind in &self.binds {
            let target = if self.root == PathBuf::from("/") {
                bind.target.clone()
            } else {
                self.root
                    .join(bind.target.strip_prefix("/").unwrap_or(bind.target.as_path()))
            };
            let src = path_cstring(&bind.source)?;
            let dst = path_cstring(&target)?;

            check(unsafe {
                libc::mount(
                    src.as_ptr(),
                    dst.as_ptr(),
                    std::ptr::null(),
                    libc::MS_BIND | libc::MS_REC,
                    std::ptr::null(),
                )
            })?;
            if bind.read_only {
                check(unsafe {
                    libc::mount(
                        src.as_ptr(),
                        dst.as_ptr(),
                        std::ptr::null(),
                        libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
                        std::ptr::null(),
                    )
                })?;
            }
        }

        if self.root != PathBuf::from("/") {
            let new_root = path_cstring(&self.root)?;
            check(unsafe { libc::chroot(new_root.as_ptr()) })?;
            let cwd = path_cstring(&self.cwd)?;
            check(unsafe { libc::chdir(cwd.as_ptr()) })?;
        }

        Ok(())
    }
}

fn path_cstring(path: &std::path::Path) -> io::Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

fn check(ret: i32) -> io::Result<()> {
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
