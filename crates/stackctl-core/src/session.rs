use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    time::{timeout, Duration},
};

use crate::exec;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(
        "kubectl not found\n\n\
         Port forwarding needs kubectl on PATH.\n\
         Install it: https://kubernetes.io/docs/tasks/tools/"
    )]
    NotFound,

    #[error(
        "port-forward '{label}' did not start within {secs} seconds.\n\
         Check that the target exists and its pods are running."
    )]
    Timeout { label: String, secs: u64 },

    #[error(
        "port-forward '{label}' exited unexpectedly.\n\
         Try running manually: kubectl port-forward {target} {local_port}:{remote_port} -n {namespace}\n\
         {stderr}"
    )]
    ExitedEarly {
        label: String,
        target: String,
        namespace: String,
        local_port: u16,
        remote_port: u16,
        stderr: String,
    },

    #[error("process error: {0}")]
    Process(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

/// What a session forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub namespace: String,
    /// `svc/name`, `pod/name`, `deploy/name`.
    pub resource: String,
}

/// Builds the background process behind a session.
pub trait Launcher: Send + Sync {
    fn command(&self, target: &ForwardTarget, local_port: u16, remote_port: u16) -> Command;

    /// A stdout fragment announcing the forward is listening. `None` means the
    /// process is considered up as soon as it spawns.
    fn ready_marker(&self) -> Option<&str>;

    /// Command name of the processes this launcher starts. A listener on a
    /// forward port is only terminated when its command matches; `None`
    /// leaves every untracked listener alone.
    fn process_name(&self) -> Option<&str> {
        None
    }
}

/// `kubectl port-forward`.
#[derive(Debug, Clone)]
pub struct KubectlPortForward {
    binary: PathBuf,
    context: Option<String>,
}

impl KubectlPortForward {
    pub fn new(binary: PathBuf, context: Option<String>) -> Self {
        Self { binary, context }
    }

    pub fn locate(context: Option<String>) -> Result<Self, SessionError> {
        let binary = which::which("kubectl").map_err(|_| SessionError::NotFound)?;
        Ok(Self::new(binary, context))
    }
}

impl Launcher for KubectlPortForward {
    fn command(&self, target: &ForwardTarget, local_port: u16, remote_port: u16) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(ctx) = &self.context {
            cmd.args(["--context", ctx]);
        }
        cmd.args([
            "port-forward",
            "-n",
            &target.namespace,
            &target.resource,
            &format!("{local_port}:{remote_port}"),
        ]);
        cmd
    }

    fn ready_marker(&self) -> Option<&str> {
        Some("Forwarding from")
    }

    fn process_name(&self) -> Option<&str> {
        self.binary.file_name().and_then(|n| n.to_str())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A running background forward. The process is killed when the session is
/// stopped or dropped (`kill_on_drop`).
#[derive(Debug)]
pub struct Session {
    pub label: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub target: ForwardTarget,
    pub started_at: DateTime<Utc>,
    process: Child,
}

impl Session {
    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.local_port)
    }

    /// Kill the process and reap it. An already-exited process is fine.
    pub async fn stop(mut self) {
        let _ = self.process.kill().await;
        let _ = self.process.wait().await;
    }

    fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Registry of background sessions, keyed by local port. At most one session
/// holds a given port; opening on a taken port replaces the old session.
pub struct SessionManager {
    sessions: BTreeMap<u16, Session>,
    launcher: Box<dyn Launcher>,
    ready_timeout: Duration,
    reclaim_os_ports: bool,
}

impl SessionManager {
    pub fn new(launcher: Box<dyn Launcher>) -> Self {
        let ready_timeout = std::env::var("STACKCTL_FORWARD_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));
        Self {
            sessions: BTreeMap::new(),
            launcher,
            ready_timeout,
            reclaim_os_ports: true,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Whether [`open`](Self::open) also frees a port held by a forward this
    /// manager does not track, such as one left over from an earlier run.
    pub fn reclaim_os_ports(mut self, enabled: bool) -> Self {
        self.reclaim_os_ports = enabled;
        self
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, local_port: u16) -> Option<&Session> {
        self.sessions.get(&local_port)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Start a forward on `local_port`, replacing whatever holds it.
    pub async fn open(
        &mut self,
        label: &str,
        target: &ForwardTarget,
        local_port: u16,
        remote_port: u16,
    ) -> Result<&Session, SessionError> {
        if let Some(old) = self.sessions.remove(&local_port) {
            tracing::info!(port = local_port, old = %old.label, new = label, "replacing session");
            old.stop().await;
        }
        if self.reclaim_os_ports {
            release_port(local_port, self.launcher.process_name()).await;
        }

        let mut child = self
            .launcher
            .command(target, local_port, remote_port)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            SessionError::Process(std::io::Error::other("stdout was not captured"))
        })?;
        let stderr = child.stderr.take();

        match self.launcher.ready_marker() {
            None => {
                drain(stdout);
                if let Some(err) = stderr {
                    drain(err);
                }
            }
            Some(marker) => {
                match timeout(self.ready_timeout, wait_for_marker(stdout, marker)).await {
                    Ok(Some(remaining)) => {
                        drain(remaining);
                        if let Some(err) = stderr {
                            drain(err);
                        }
                    }
                    Ok(None) => {
                        let stderr = match stderr {
                            Some(err) => read_all(err).await,
                            None => String::new(),
                        };
                        let _ = child.kill().await;
                        let _ = child.wait().await;
                        return Err(SessionError::ExitedEarly {
                            label: label.to_string(),
                            target: target.resource.clone(),
                            namespace: target.namespace.clone(),
                            local_port,
                            remote_port,
                            stderr,
                        });
                    }
                    Err(_elapsed) => {
                        let _ = child.kill().await;
                        let _ = child.wait().await;
                        return Err(SessionError::Timeout {
                            label: label.to_string(),
                            secs: self.ready_timeout.as_secs(),
                        });
                    }
                }
            }
        }

        let session = Session {
            label: label.to_string(),
            local_port,
            remote_port,
            target: target.clone(),
            started_at: Utc::now(),
            process: child,
        };
        tracing::info!(
            label,
            url = %session.url(),
            target = %target.resource,
            "session open"
        );
        Ok(self.sessions.entry(local_port).or_insert(session))
    }

    /// Stop and forget the session on `local_port`, if any.
    pub async fn close(&mut self, local_port: u16) -> bool {
        match self.sessions.remove(&local_port) {
            Some(session) => {
                session.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop every tracked session. Returns how many were tracked.
    pub async fn close_all(&mut self) -> usize {
        let sessions = std::mem::take(&mut self.sessions);
        let count = sessions.len();
        for (port, session) in sessions {
            tracing::debug!(port, label = %session.label, "closing session");
            session.stop().await;
        }
        count
    }

    /// Drop sessions whose process has exited. Returns their labels.
    pub fn reap_exited(&mut self) -> Vec<String> {
        let dead: Vec<u16> = self
            .sessions
            .iter_mut()
            .filter_map(|(port, s)| (!s.is_running()).then_some(*port))
            .collect();
        dead.into_iter()
            .filter_map(|port| self.sessions.remove(&port).map(|s| s.label))
            .collect()
    }

    /// Free `ports` at the OS level: stale forwards still listening on them
    /// are terminated. Other programs on those ports are left running.
    pub async fn release_ports(&mut self, ports: &[u16]) {
        for port in ports {
            self.close(*port).await;
            if self.reclaim_os_ports {
                release_port(*port, self.launcher.process_name()).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Read stdout until a line containing `marker`; `None` if the stream ends
/// first. The reader is handed back so the pipe stays open.
async fn wait_for_marker(stdout: ChildStdout, marker: &str) -> Option<BufReader<ChildStdout>> {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.contains(marker) {
            return Some(lines.into_inner());
        }
    }
    None
}

/// Keep reading a pipe in the background so the child never blocks or gets
/// SIGPIPE on a full or closed pipe.
fn drain<R: AsyncRead + Unpin + Send + 'static>(mut reader: R) {
    tokio::spawn(async move {
        let mut sink = tokio::io::sink();
        let _ = tokio::io::copy(&mut reader, &mut sink).await;
    });
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = String::new();
    let _ = timeout(Duration::from_secs(2), reader.read_to_string(&mut buf)).await;
    buf.trim().to_string()
}

/// Terminate stale forwards listening on `port`, found via `lsof`. Only
/// processes whose command is `process` are touched. Best-effort: without
/// lsof, or with nothing listening, this does nothing.
async fn release_port(port: u16, process: Option<&str>) {
    let Some(process) = process else {
        return;
    };
    let Ok(lsof) = which::which("lsof") else {
        tracing::debug!(port, "lsof not found; not checking for stray listeners");
        return;
    };
    let port_arg = format!("tcp:{port}");
    let Ok(out) = exec::output(&lsof, ["-F", "pc", "-s", "TCP:LISTEN", "-i", &port_arg]).await
    else {
        return;
    };
    let listeners = parse_listeners(&String::from_utf8_lossy(&out.stdout));
    let (stale, foreign) = split_listeners(listeners, process, std::process::id());
    for listener in foreign {
        tracing::warn!(
            port,
            pid = listener.pid,
            command = %listener.command,
            "port held by another program; leaving it running"
        );
    }
    for listener in stale {
        tracing::info!(port, pid = listener.pid, "terminating stale forward holding port");
        if let Err(e) = terminate(listener.pid).await {
            tracing::warn!(port, pid = listener.pid, error = %e, "could not terminate process");
        }
    }
}

/// Split listeners into stale forwards (command is `process`) and anything
/// else. This process never appears in either.
fn split_listeners(
    listeners: Vec<Listener>,
    process: &str,
    own: u32,
) -> (Vec<Listener>, Vec<Listener>) {
    listeners
        .into_iter()
        .filter(|l| l.pid != own)
        .partition(|l| l.command == process)
}

/// A process listening on a port.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Listener {
    pid: u32,
    command: String,
}

/// Parse `lsof -F pc` output: a `p<pid>` line, then that process's
/// `c<command>` line. Other field lines are ignored.
fn parse_listeners(stdout: &str) -> Vec<Listener> {
    let mut listeners: Vec<Listener> = Vec::new();
    for line in exec::lines(stdout) {
        if let Some(pid) = line.strip_prefix('p') {
            if let Ok(pid) = pid.parse() {
                listeners.push(Listener {
                    pid,
                    command: String::new(),
                });
            }
        } else if let Some(command) = line.strip_prefix('c') {
            if let Some(last) = listeners.last_mut() {
                last.command = command.to_string();
            }
        }
    }
    listeners.sort_by_key(|l| l.pid);
    listeners.dedup_by_key(|l| l.pid);
    listeners
}

/// Send SIGTERM to a process (`kill -TERM {pid}`).
async fn terminate(pid: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let status = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(std::io::Error::other(format!(
                "kill -TERM {pid} failed with exit code {:?}",
                status.code()
            )));
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(std::io::Error::other("terminating processes is only supported on Unix"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
