//! Ownership of the running ssh client.

use std::io;
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STDERR_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Owns a spawned ssh process from the moment it exists.
///
/// Both output pipes are read from spawn onward so the client can never
/// block on a full pipe. Dropping the guard kills the process and, inside a
/// runtime, reaps it in the background, so a setup future that is cancelled
/// after the spawn still takes the process down with it.
pub(crate) struct ChildGuard {
    // Only `None` once `drop` has handed the child to the reaper.
    child: Option<Child>,
    pid: Option<u32>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    ready_tx: Option<oneshot::Sender<()>>,
}

impl ChildGuard {
    pub(crate) fn new(mut child: Child) -> Self {
        let pid = child.id();
        let (ready_tx, ready_rx) = oneshot::channel();

        let stderr = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_stderr(stderr, ready_rx, pid)));

        if let Some(mut stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
            });
        }

        ChildGuard {
            child: Some(child),
            pid,
            stderr,
            ready_tx: Some(ready_tx),
        }
    }

    fn child(&mut self) -> &mut Child {
        self.child.as_mut().expect("child is only taken on drop")
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child().try_wait()
    }

    pub(crate) async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child().wait().await
    }

    /// Everything the process wrote to stderr. Only meaningful once it has
    /// exited; bounded in case something else holds the pipe.
    pub(crate) async fn stderr_output(&mut self) -> String {
        let Some(collector) = self.stderr.take() else {
            return String::new();
        };
        let buf = match tokio::time::timeout(STDERR_READ_TIMEOUT, collector).await {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => {
                debug!("ssh stderr reader failed: {}", e);
                Vec::new()
            }
            Err(_) => {
                debug!("Timed out reading ssh stderr");
                Vec::new()
            }
        };
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// The tunnel is up: stop buffering stderr and log it line by line for
    /// the rest of the session.
    pub(crate) fn mark_ready(&mut self) {
        if let Some(ready_tx) = self.ready_tx.take() {
            let _ = ready_tx.send(());
        }
        self.stderr = None;
    }

    /// Kill the process and wait up to `wait` for it to be reaped. Never
    /// fails; calling it on an exited process is a no-op.
    pub(crate) async fn terminate(&mut self, wait: Duration) {
        let pid = self.pid;
        let child = self.child();
        if let Ok(Some(status)) = child.try_wait() {
            debug!("ssh process {:?} already exited: {}", pid, status);
            return;
        }
        if let Err(e) = child.start_kill() {
            debug!("Failed to kill ssh process {:?}: {}", pid, e);
        }
        match tokio::time::timeout(wait, child.wait()).await {
            Ok(Ok(status)) => debug!("ssh process {:?} exited: {}", pid, status),
            Ok(Err(e)) => debug!("Failed to wait for ssh process {:?}: {}", pid, e),
            Err(_) => warn!("ssh process {:?} did not exit within {:?}", pid, wait),
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if !matches!(child.try_wait(), Ok(None)) {
            return;
        }
        let _ = child.start_kill();
        // Outside a runtime `kill_on_drop` leaves reaping to tokio's orphan
        // queue.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let pid = self.pid;
            runtime.spawn(async move {
                if let Ok(status) = child.wait().await {
                    debug!("Reaped dropped ssh process {:?}: {}", pid, status);
                }
            });
        }
    }
}

/// Buffer stderr until the tunnel is ready, then switch to logging lines.
/// Returns the buffered bytes when the pipe closes first.
async fn collect_stderr(
    stderr: ChildStderr,
    mut ready: oneshot::Receiver<()>,
    pid: Option<u32>,
) -> Vec<u8> {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = &mut ready => break,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => return buf,
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read ssh stderr: {}", e);
                    return buf;
                }
            },
        }
    }

    for line in String::from_utf8_lossy(&buf).lines() {
        debug!("ssh[{}]: {}", pid.unwrap_or_default(), line);
    }
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("ssh[{}]: {}", pid.unwrap_or_default(), line);
    }
    Vec::new()
}

/// A ready tunnel: the local endpoint plus the ssh process serving it.
///
/// Call [`ForwardHandle::release`] when done. Dropping the handle without
/// releasing still kills the process but does not wait for it.
pub struct ForwardHandle {
    process: ChildGuard,
    local_addr: SocketAddr,
    release_wait: Duration,
}

impl ForwardHandle {
    pub(crate) fn new(process: ChildGuard, local_addr: SocketAddr, release_wait: Duration) -> Self {
        ForwardHandle {
            process,
            local_addr,
            release_wait,
        }
    }

    /// Loopback address the tunnel listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Pid of the ssh process, if the OS reported one at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    /// Wait for the tunnel to end on its own: the remote sleep elapsed and
    /// every forwarded connection closed, or ssh died.
    pub async fn closed(&mut self) -> io::Result<ExitStatus> {
        self.process.wait().await
    }

    /// Terminate the tunnel. Safe to call more than once and after the
    /// process has already exited.
    pub async fn release(&mut self) {
        info!("Releasing port forward on {}", self.local_addr);
        self.process.terminate(self.release_wait).await;
    }
}

impl std::fmt::Debug for ForwardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardHandle")
            .field("local_addr", &self.local_addr)
            .field("pid", &self.process.pid())
            .finish()
    }
}
