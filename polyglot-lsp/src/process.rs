use crate::{Error, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{Pid, Process, ProcessesToUpdate, Signal, System};
use tokio::{
    io::{BufReader, BufWriter},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    time::timeout,
};

/// How long to wait for the child to exit after a graceful terminate.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long to wait after escalating to kill.
const KILL_TIMEOUT: Duration = Duration::from_secs(2);
/// Grace interval after teardown so the OS releases the pipe handles.
const HANDLE_RELEASE_GRACE: Duration = Duration::from_millis(500);

/// Everything needed to launch a language server process.
#[derive(Debug, Clone)]
pub struct ProcessLaunchInfo {
    /// Path to the server binary.
    pub command: PathBuf,
    pub args: Vec<String>,
    /// Environment overlay, applied on top of the inherited environment.
    pub env: HashMap<String, String>,
    /// Working directory, normally the workspace root.
    pub cwd: PathBuf,
    /// Capacity for the stdout/stderr read buffers.
    pub read_buffer_limit: Option<usize>,
}

impl ProcessLaunchInfo {
    pub fn new(command: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: cwd.into(),
            read_buffer_limit: None,
        }
    }
}

/// The piped streams of a freshly spawned server.
#[derive(Debug)]
pub struct ServerIo {
    pub stdin: BufWriter<ChildStdin>,
    pub stdout: BufReader<ChildStdout>,
    pub stderr: BufReader<ChildStderr>,
}

/// Owns the spawned server process and tears it down together with every
/// descendant it forked. Process-group semantics alone are not enough: many
/// servers fork build tools and indexers that survive a plain kill of the
/// direct child, so descendants are enumerated at signal time.
#[derive(Debug)]
pub struct ProcessSupervisor {
    child: Option<Child>,
    pid: Option<u32>,
    name: String,
}

impl ProcessSupervisor {
    /// Spawn the server with all three stdio streams piped. When
    /// `independent` is set (the default configuration) the child is started
    /// in its own process group so the controlling terminal's signals do not
    /// propagate to it.
    pub fn spawn(info: &ProcessLaunchInfo, independent: bool, name: &str) -> Result<(Self, ServerIo)> {
        let mut command = Command::new(&info.command);
        command
            .args(&info.args)
            .envs(&info.env)
            .current_dir(&info.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // last-resort reaping if the supervisor is dropped without teardown
            .kill_on_drop(true);

        #[cfg(unix)]
        if independent {
            command.process_group(0);
        }
        #[cfg(not(unix))]
        let _ = independent;

        let mut child = command
            .spawn()
            .map_err(|err| Error::Spawn(info.command.display().to_string(), err))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("server stdin was not piped")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("server stdout was not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("server stderr was not piped")))?;

        let io = match info.read_buffer_limit {
            Some(limit) => ServerIo {
                stdin: BufWriter::new(stdin),
                stdout: BufReader::with_capacity(limit, stdout),
                stderr: BufReader::with_capacity(limit, stderr),
            },
            None => ServerIo {
                stdin: BufWriter::new(stdin),
                stdout: BufReader::new(stdout),
                stderr: BufReader::new(stderr),
            },
        };

        let pid = child.id();
        debug!("{name}: spawned {} (pid {pid:?})", info.command.display());

        Ok((
            Self {
                child: Some(child),
                pid,
                name: name.to_string(),
            },
            io,
        ))
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Graceful-then-forceful teardown of the process tree.
    ///
    /// The transport loops must already have been stopped (which closes the
    /// child's stdin and unblocks a server stuck on a read). Terminate the
    /// tree and wait, escalate to kill if it lingers, then give the OS a
    /// moment to release the handles.
    pub async fn teardown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if child.try_wait().ok().flatten().is_none() {
            signal_process_tree(self.pid, TreeSignal::Terminate, &self.name);
            if timeout(TERMINATE_TIMEOUT, child.wait()).await.is_err() {
                warn!(
                    "{}: server did not terminate within {:?}, killing it",
                    self.name, TERMINATE_TIMEOUT
                );
                signal_process_tree(self.pid, TreeSignal::Kill, &self.name);
                let _ = timeout(KILL_TIMEOUT, child.wait()).await;
            }
        }

        drop(child);
        tokio::time::sleep(HANDLE_RELEASE_GRACE).await;
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Teardown was skipped (caller panicked or bailed); make sure the
        // tree still goes away.
        if let Some(mut child) = self.child.take() {
            if child.try_wait().ok().flatten().is_none() {
                signal_process_tree(self.pid, TreeSignal::Kill, &self.name);
                let _ = child.start_kill();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeSignal {
    Terminate,
    Kill,
}

/// Deliver `signal` to the process and all of its live descendants,
/// children first. Descendants are discovered by walking the process table
/// at signal time rather than trusting process-group membership.
fn signal_process_tree(pid: Option<u32>, signal: TreeSignal, name: &str) {
    let Some(pid) = pid else { return };
    let root = Pid::from_u32(pid);

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let processes = system.processes();

    let mut victims = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in processes {
            if process.parent() == Some(parent) {
                frontier.push(*pid);
                victims.push(*pid);
            }
        }
    }

    debug!(
        "{name}: delivering {signal:?} to pid {root} and {} descendant(s)",
        victims.len()
    );

    for victim in &victims {
        deliver(processes.get(victim), signal);
    }
    deliver(processes.get(&root), signal);
}

fn deliver(process: Option<&Process>, signal: TreeSignal) {
    let Some(process) = process else { return };
    match signal {
        TreeSignal::Terminate => {
            // platforms without SIGTERM fall back to a hard kill
            if process.kill_with(Signal::Term).is_none() {
                process.kill();
            }
        }
        TreeSignal::Kill => {
            process.kill();
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    fn sh(script: &str, cwd: &std::path::Path) -> ProcessLaunchInfo {
        let mut info = ProcessLaunchInfo::new("sh", cwd);
        info.args = vec!["-c".to_string(), script.to_string()];
        info
    }

    #[tokio::test]
    async fn teardown_kills_a_live_child() {
        let dir = tempfile::tempdir().unwrap();
        let info = sh("exec sleep 30", dir.path());
        let (mut supervisor, _io) = ProcessSupervisor::spawn(&info, true, "test").unwrap();
        let pid = supervisor.id().unwrap();

        supervisor.teardown().await;

        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        assert!(
            system.processes().get(&Pid::from_u32(pid)).is_none(),
            "pid {pid} should be gone after teardown"
        );
    }

    #[tokio::test]
    async fn teardown_reaps_descendants_too() {
        let dir = tempfile::tempdir().unwrap();
        // the forked sleeper would outlive a naive kill of the direct child
        let marker = "31337.031337";
        let info = sh(&format!("sleep {marker} & exec sleep 30"), dir.path());
        let (mut supervisor, _io) = ProcessSupervisor::spawn(&info, true, "test").unwrap();

        // give the shell a moment to fork
        tokio::time::sleep(Duration::from_millis(200)).await;
        supervisor.teardown().await;

        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let survivor = system.processes().values().any(|process| {
            process
                .cmd()
                .iter()
                .any(|arg| arg.to_string_lossy().contains(marker))
        });
        assert!(!survivor, "forked sleeper should be gone after teardown");
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let info = ProcessLaunchInfo::new("definitely-not-a-real-binary", dir.path());
        let err = ProcessSupervisor::spawn(&info, true, "test").unwrap_err();
        assert!(matches!(err, Error::Spawn(_, _)));
    }
}
