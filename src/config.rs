//! Tunables shared by connectors, binders and the aggregates they produce.

use std::time::Duration;

use crate::{Error, Result};

/// Default size of a single striped fragment.
pub const DEFAULT_FRAGMENT_SIZE: usize = 8192;

/// Default upper bound for a fragment announced by a peer.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Multipath configuration.
#[derive(Debug, Clone)]
pub struct MultipathConfig {
    /// Pause between two passes of a background completion task.
    pub retry_interval: Duration,

    /// Connect timeout applied to background connection retries.
    /// The caller's timeout only bounds the first, synchronous pass.
    pub retry_connect_timeout: Duration,

    /// How long a single receive waits for readiness before re-checking
    /// for newly completed paths.
    pub receive_poll_interval: Duration,

    /// Pause between one-pass accepts in `accept_timeout`.
    pub accept_poll_interval: Duration,

    /// Largest payload written to a single path in one frame.
    pub fragment_size: usize,

    /// Largest frame payload accepted from a peer.
    pub max_frame_len: usize,
}

impl Default for MultipathConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(50),
            retry_connect_timeout: Duration::from_secs(1),
            receive_poll_interval: Duration::from_millis(20),
            accept_poll_interval: Duration::from_millis(10),
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl MultipathConfig {
    /// Same as `Default::default()`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pause between background retry passes.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Sets the connect timeout used by background retries.
    pub fn with_retry_connect_timeout(mut self, timeout: Duration) -> Self {
        self.retry_connect_timeout = timeout;
        self
    }

    /// Sets the receive readiness wait.
    pub fn with_receive_poll_interval(mut self, interval: Duration) -> Self {
        self.receive_poll_interval = interval;
        self
    }

    /// Sets the pause between accept passes.
    pub fn with_accept_poll_interval(mut self, interval: Duration) -> Self {
        self.accept_poll_interval = interval;
        self
    }

    /// Sets the fragment size.
    pub fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size;
        self
    }

    /// Sets the largest frame payload a receiver accepts.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Checks that the values can actually drive a transport.
    pub fn validate(&self) -> Result<()> {
        if self.fragment_size == 0 {
            return Err(Error::Config("fragment_size must be positive".into()));
        }
        if self.fragment_size > u32::MAX as usize {
            return Err(Error::Config("fragment_size must fit in a u32".into()));
        }
        if self.max_frame_len < self.fragment_size {
            return Err(Error::Config(format!(
                "max_frame_len ({}) is smaller than fragment_size ({})",
                self.max_frame_len, self.fragment_size
            )));
        }
        if self.retry_connect_timeout.is_zero() {
            return Err(Error::Config("retry_connect_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(MultipathConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_fragment() {
        let config = MultipathConfig::new().with_fragment_size(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_frame_limit_below_fragment() {
        let config = MultipathConfig::new()
            .with_fragment_size(4096)
            .with_max_frame_len(1024);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(config.with_max_frame_len(4096).validate().is_ok());
    }
}
