use std::ffi::OsString;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

use crate::config::ForwardConfig;
use crate::error::ForwardError;
use crate::handle::{ChildGuard, ForwardHandle};
use crate::port;

pub const DEFAULT_PROGRAM: &str = "ssh";
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RELEASE_WAIT: Duration = Duration::from_secs(5);

/// Arguments for an ssh invocation that forwards `127.0.0.1:<local_port>`
/// to the configured remote endpoint and keeps the session open for the
/// configured timeout.
pub fn ssh_args(config: &ForwardConfig, local_port: u16) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();

    if !config.allow_password_prompt {
        args.push("-oBatchMode=yes".into());
    }

    if let Some(user) = config.user.as_deref().filter(|u| !u.is_empty()) {
        args.push("-l".into());
        args.push(user.into());
    }

    if let Some(identity) = config
        .identity_file
        .as_deref()
        .filter(|p| !p.as_os_str().is_empty())
    {
        args.push("-i".into());
        args.push(identity.into());
    }

    args.push("-L".into());
    args.push(format!("127.0.0.1:{}:{}", local_port, config.remote_endpoint).into());

    args.push(config.host.as_str().into());

    args.push("sleep".into());
    args.push(config.timeout_secs().to_string().into());

    args
}

/// Starts ssh port forwards.
///
/// The defaults fit real use; tests shorten the probe interval and point
/// `program` at a stand-in client.
#[derive(Debug, Clone)]
pub struct Forwarder {
    program: PathBuf,
    probe_interval: Duration,
    probe_timeout: Duration,
    release_wait: Duration,
}

impl Default for Forwarder {
    fn default() -> Self {
        Forwarder {
            program: PathBuf::from(DEFAULT_PROGRAM),
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            release_wait: DEFAULT_RELEASE_WAIT,
        }
    }
}

impl Forwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client executable to run instead of `ssh` from `PATH`.
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Pause between readiness probes.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Upper bound on a single probe connect.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// How long release waits for the killed process to be reaped.
    pub fn release_wait(mut self, wait: Duration) -> Self {
        self.release_wait = wait;
        self
    }

    pub fn program_path(&self) -> &Path {
        &self.program
    }

    fn command(&self, args: &[OsString]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Open a tunnel and wait until it accepts connections.
    ///
    /// Fails without spawning anything when the config is invalid or no
    /// local port can be allocated. Once ssh is running, every failure kills
    /// and reaps it before returning, and dropping the returned future kills
    /// it too.
    pub async fn forward(&self, config: &ForwardConfig) -> Result<ForwardHandle, ForwardError> {
        config.validate()?;

        let local_port = port::allocate_free_local_port().map_err(ForwardError::Allocation)?;
        let local_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));

        let args = ssh_args(config, local_port);
        debug!("Starting ssh tunnel: {} {:?}", self.program.display(), args);

        let child = self.command(&args).spawn().map_err(ForwardError::Spawn)?;
        let mut process = ChildGuard::new(child);

        match self.wait_ready(&mut process, local_addr, config).await {
            Ok(()) => {
                info!(
                    "Port forward ready: {} -> {}:{}",
                    local_addr, config.host, config.remote_endpoint
                );
                process.mark_ready();
                Ok(ForwardHandle::new(process, local_addr, self.release_wait))
            }
            Err(e) => {
                warn!("Port forward to {} failed: {}", config.host, e);
                process.terminate(self.release_wait).await;
                Err(e)
            }
        }
    }

    /// Probe the local port until it connects or ssh exits. There is no
    /// deadline here: the remote `sleep` makes ssh exit eventually.
    async fn wait_ready(
        &self,
        process: &mut ChildGuard,
        local_addr: SocketAddr,
        config: &ForwardConfig,
    ) -> Result<(), ForwardError> {
        let mut attempts: u32 = 0;
        loop {
            if let Some(status) = process.try_wait().map_err(ForwardError::Process)? {
                return Err(classify_exit(process, status, config).await);
            }

            attempts += 1;
            match probe(local_addr, self.probe_timeout).await {
                Probe::Connected => {
                    debug!("Tunnel on {} accepted probe {}", local_addr, attempts);
                    return Ok(());
                }
                Probe::Refused(e) => trace!("Probe {} to {} failed: {}", attempts, local_addr, e),
                Probe::Stalled => trace!("Probe {} to {} timed out", attempts, local_addr),
            }

            tokio::time::sleep(self.probe_interval).await;
        }
    }
}

#[derive(Debug)]
enum Probe {
    Connected,
    Refused(io::Error),
    Stalled,
}

/// One connect attempt against the forwarded port, closed right away.
async fn probe(addr: SocketAddr, timeout: Duration) -> Probe {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Probe::Connected,
        Ok(Err(e)) => Probe::Refused(e),
        Err(_) => Probe::Stalled,
    }
}

/// A clean exit before any probe got through means the remote sleep ran
/// out; anything else is ssh failing to set the tunnel up.
async fn classify_exit(
    process: &mut ChildGuard,
    status: ExitStatus,
    config: &ForwardConfig,
) -> ForwardError {
    if status.success() {
        return ForwardError::TimedOut {
            timeout: config.timeout,
        };
    }
    ForwardError::SetupFailed {
        code: status.code(),
        stderr: process.stderr_output().await,
    }
}

/// Open a tunnel with the default [`Forwarder`].
pub async fn forward(config: &ForwardConfig) -> Result<ForwardHandle, ForwardError> {
    Forwarder::default().forward(config).await
}

/// Parse `[<user>@]<host>:<remote-endpoint>`, let `configure` adjust the
/// result, then open the tunnel.
pub async fn forward_remote(
    remote: &str,
    configure: impl FnOnce(&mut ForwardConfig),
) -> Result<ForwardHandle, ForwardError> {
    let mut config = ForwardConfig::parse(remote)?;
    configure(&mut config);
    forward(&config).await
}
