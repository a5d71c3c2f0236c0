use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/kadre-unix-socket";

/// Daemon-side endpoint configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub start_entry: Option<String>,
    pub dry_run: bool,
    /// Interval clients are expected to ping at.
    pub keepalive_interval: Duration,
    /// Missed intervals before a peer is declared dead.
    pub keepalive_misses: u32,
    /// Grace window between cancellation and forced teardown.
    pub cancel_grace: Duration,
    pub write_channel_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            start_entry: None,
            dry_run: false,
            keepalive_interval: Duration::from_secs(15),
            keepalive_misses: 3,
            cancel_grace: Duration::from_secs(3),
            write_channel_capacity: 1024,
        }
    }
}

impl DaemonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_start_entry(mut self, entry: impl Into<String>) -> Self {
        self.start_entry = Some(entry.into());
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration, misses: u32) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_misses = misses;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

/// Client-side endpoint configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    /// Peer username sent during auth; `USER` from the environment when
    /// unset.
    pub user: Option<String>,
    /// None disables the background keepalive task.
    pub keepalive_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            user: None,
            keepalive_interval: Some(Duration::from_secs(15)),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn without_keepalive(mut self) -> Self {
        self.keepalive_interval = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_defaults_and_builders() {
        let config = DaemonConfig::new()
            .with_socket_path("/run/kadre.sock")
            .with_start_entry("operator")
            .with_dry_run(true)
            .with_keepalive(Duration::from_secs(5), 2);
        assert_eq!(config.socket_path, PathBuf::from("/run/kadre.sock"));
        assert_eq!(config.start_entry.as_deref(), Some("operator"));
        assert!(config.dry_run);
        assert_eq!(config.keepalive_misses, 2);
        assert_eq!(DaemonConfig::default().cancel_grace, Duration::from_secs(3));
    }

    #[test]
    fn client_defaults_and_builders() {
        let config = ClientConfig::new().with_user("operator").without_keepalive();
        assert_eq!(config.user.as_deref(), Some("operator"));
        assert!(config.keepalive_interval.is_none());
        assert_eq!(
            ClientConfig::default().socket_path,
            PathBuf::from(DEFAULT_SOCKET_PATH)
        );
    }
}
