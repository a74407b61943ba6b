use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::error::ConfigError;

/// What to forward and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardConfig {
    /// Login name passed with `-l`.
    pub user: Option<String>,
    pub host: String,
    /// Destination as seen from `host`: `addr:port`, a bare port or a unix
    /// socket path. Handed to ssh untouched.
    pub remote_endpoint: String,
    /// How long the remote side keeps the session open waiting for a
    /// consumer.
    pub timeout: Duration,
    /// Let ssh prompt for passwords instead of running in batch mode.
    pub allow_password_prompt: bool,
    pub identity_file: Option<PathBuf>,
}

impl ForwardConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(host: impl Into<String>, remote_endpoint: impl Into<String>) -> Self {
        ForwardConfig {
            user: None,
            host: host.into(),
            remote_endpoint: remote_endpoint.into(),
            timeout: Self::DEFAULT_TIMEOUT,
            allow_password_prompt: false,
            identity_file: None,
        }
    }

    /// Parse `[<user>@]<host>:<remote-endpoint>`.
    ///
    /// The host ends at the first `:`, everything after it is the remote
    /// endpoint. A `@` before that colon separates the user.
    pub fn parse(remote: &str) -> Result<Self, ConfigError> {
        let (destination, remote_endpoint) = remote
            .split_once(':')
            .ok_or_else(|| ConfigError::MissingSeparator(remote.to_string()))?;

        let (user, host) = match destination.split_once('@') {
            Some((user, host)) => (Some(user), host),
            None => (None, destination),
        };

        let mut config = ForwardConfig::new(host, remote_endpoint);
        config.user = user.filter(|u| !u.is_empty()).map(str::to_string);
        Ok(config)
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn with_password_prompt(mut self, allow: bool) -> Self {
        self.allow_password_prompt = allow;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_endpoint.is_empty() {
            return Err(ConfigError::MissingRemoteEndpoint);
        }
        if self.host.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        Ok(())
    }

    /// Timeout in whole seconds for the remote `sleep`, rounded up.
    pub fn timeout_secs(&self) -> u64 {
        whole_secs(self.timeout)
    }
}

pub(crate) fn whole_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

impl FromStr for ForwardConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ForwardConfig::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_host_and_socket_path() {
        let config = ForwardConfig::parse("alice@host.example:/tmp/sock").unwrap();
        assert_eq!(config.user.as_deref(), Some("alice"));
        assert_eq!(config.host, "host.example");
        assert_eq!(config.remote_endpoint, "/tmp/sock");
    }

    #[test]
    fn parses_host_and_port_without_user() {
        let config: ForwardConfig = "host.example:5432".parse().unwrap();
        assert_eq!(config.user, None);
        assert_eq!(config.host, "host.example");
        assert_eq!(config.remote_endpoint, "5432");
    }

    #[test]
    fn keeps_endpoint_verbatim() {
        let config = ForwardConfig::parse("db:10.0.0.5:5432").unwrap();
        assert_eq!(config.host, "db");
        assert_eq!(config.remote_endpoint, "10.0.0.5:5432");

        let config = ForwardConfig::parse("db:user@weird").unwrap();
        assert_eq!(config.user, None);
        assert_eq!(config.remote_endpoint, "user@weird");
    }

    #[test]
    fn missing_colon_is_rejected() {
        let err = ForwardConfig::parse("alice@host.example").unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingSeparator("alice@host.example".to_string())
        );
    }

    #[test]
    fn empty_user_is_dropped() {
        let config = ForwardConfig::parse("@host:22").unwrap();
        assert_eq!(config.user, None);
        assert_eq!(config.host, "host");
    }

    #[test]
    fn defaults() {
        let config = ForwardConfig::new("host", "5432");
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(!config.allow_password_prompt);
        assert_eq!(config.identity_file, None);
        assert_eq!(config.user, None);
    }

    #[test]
    fn validate_requires_host_and_endpoint() {
        assert_eq!(
            ForwardConfig::new("", "5432").validate(),
            Err(ConfigError::MissingHost)
        );
        assert_eq!(
            ForwardConfig::new("host", "").validate(),
            Err(ConfigError::MissingRemoteEndpoint)
        );
        // parse accepts empty parts, start-up rejects them
        let config = ForwardConfig::parse(":5432").unwrap();
        assert_eq!(config.validate(), Err(ConfigError::MissingHost));
        assert!(ForwardConfig::new("host", "5432").validate().is_ok());
    }

    #[test]
    fn timeout_rounds_up_to_whole_seconds() {
        let config = ForwardConfig::new("h", "1").with_timeout(Duration::from_millis(1500));
        assert_eq!(config.timeout_secs(), 2);
        let config = ForwardConfig::new("h", "1").with_timeout(Duration::from_secs(30));
        assert_eq!(config.timeout_secs(), 30);
        let config = ForwardConfig::new("h", "1").with_timeout(Duration::ZERO);
        assert_eq!(config.timeout_secs(), 0);
    }
}
