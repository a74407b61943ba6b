use std::time::Duration;

use thiserror::Error;

use crate::config::whole_secs;

/// Invalid forward configuration. Raised before any process is spawned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Host cannot be empty")]
    MissingHost,

    #[error("Remote end point cannot be empty")]
    MissingRemoteEndpoint,

    #[error("Missing remote end point in '{0}', expected [<user>@]<host>:<remote-endpoint>")]
    MissingSeparator(String),
}

/// Everything that can go wrong while setting up a forward.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to allocate a local port: {0}")]
    Allocation(#[source] std::io::Error),

    #[error("Failed to start ssh: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to poll ssh process: {0}")]
    Process(#[source] std::io::Error),

    /// The client exited with a nonzero status before the tunnel came up.
    #[error("{}", setup_failed_message(.code, .stderr))]
    SetupFailed { code: Option<i32>, stderr: String },

    /// The client exited cleanly before anything connected, meaning the
    /// remote sleep ran out.
    #[error("Port forward process timed out after {}s", timed_out_secs(.timeout))]
    TimedOut { timeout: Duration },
}

impl ForwardError {
    /// Exit code of the ssh client, when the error came from it exiting.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ForwardError::SetupFailed { code, .. } => *code,
            ForwardError::TimedOut { .. } => Some(0),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ForwardError::TimedOut { .. })
    }
}

/// Matches the seconds handed to the remote `sleep`.
fn timed_out_secs(timeout: &Duration) -> u64 {
    whole_secs(*timeout)
}

fn setup_failed_message(code: &Option<i32>, stderr: &str) -> String {
    let status = match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    };
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("ssh terminated with {}", status)
    } else {
        format!("ssh terminated with {}: {}", status, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_reports_zero_exit_code() {
        let err = ForwardError::TimedOut {
            timeout: Duration::from_secs(10),
        };
        assert!(err.is_timeout());
        assert_eq!(err.exit_code(), Some(0));
        assert_eq!(err.to_string(), "Port forward process timed out after 10s");
    }

    #[test]
    fn timeout_message_uses_remote_sleep_seconds() {
        let err = ForwardError::TimedOut {
            timeout: Duration::from_millis(200),
        };
        assert_eq!(err.to_string(), "Port forward process timed out after 1s");
    }

    #[test]
    fn setup_failure_message_includes_stderr() {
        let err = ForwardError::SetupFailed {
            code: Some(255),
            stderr: "Permission denied (publickey).\n".into(),
        };
        assert!(!err.is_timeout());
        assert_eq!(err.exit_code(), Some(255));
        assert_eq!(
            err.to_string(),
            "ssh terminated with exit code 255: Permission denied (publickey)."
        );
    }

    #[test]
    fn signal_termination_has_no_code() {
        let err = ForwardError::SetupFailed {
            code: None,
            stderr: String::new(),
        };
        assert_eq!(err.exit_code(), None);
        assert_eq!(err.to_string(), "ssh terminated with a signal");
    }

    #[test]
    fn config_errors_convert() {
        let err: ForwardError = ConfigError::MissingHost.into();
        assert!(matches!(err, ForwardError::Config(ConfigError::MissingHost)));
        assert_eq!(err.exit_code(), None);
    }
}
