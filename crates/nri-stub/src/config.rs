//! stub config
//!
//! Identity of the plugin and how it reaches the runtime.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;

use crate::error::StubError;
use crate::error::StubResult;

/// Socket the runtime listens on for externally started plugins.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/nri/nri.sock";

/// Plugin stub config.
#[derive(Debug, Clone)]
pub struct StubConfig {
    /// plugin name reported at registration
    pub plugin_name: String,
    /// two digit index ordering this plugin among others
    pub plugin_idx: String,
    /// runtime socket to dial
    pub socket_path: PathBuf,
    /// already connected socket handed over by the runtime
    pub socket_fd: Option<RawFd>,
    /// how long to wait for the registration reply
    pub registration_timeout: Duration,
    /// deadline attached to requests sent to the runtime
    pub request_timeout: Duration,
}

impl StubConfig {
    /// create new stub config with default parameters.
    pub fn new(plugin_name: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            plugin_idx: "10".to_string(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_fd: None,
            registration_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(2),
        }
    }

    /// set plugin index.
    pub fn with_plugin_idx(mut self, idx: impl Into<String>) -> Self {
        self.plugin_idx = idx.into();
        self
    }

    /// set runtime socket path.
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// use a pre-connected socket instead of dialing.
    pub fn with_socket_fd(mut self, fd: Option<RawFd>) -> Self {
        self.socket_fd = fd;
        self
    }

    /// set registration timeout.
    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    /// set request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Check the identity and timeouts before talking to the runtime.
    ///
    /// # Errors
    ///
    /// - [`StubError::Configuration`] if the name is empty, the index is not
    ///   exactly two ASCII digits, the socket fd is negative or a timeout is zero
    pub fn validate(&self) -> StubResult<()> {
        if self.plugin_name.trim().is_empty() {
            return Err(Report::new(StubError::Configuration {
                message: "plugin name must not be empty".into(),
            }));
        }

        if self.plugin_idx.len() != 2 || !self.plugin_idx.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Report::new(StubError::Configuration {
                message: format!(
                    "plugin index must be two digits (00-99), got {:?}",
                    self.plugin_idx
                ),
            }));
        }

        if let Some(fd) = self.socket_fd.filter(|fd| *fd < 0) {
            return Err(Report::new(StubError::Configuration {
                message: format!("socket fd must not be negative, got {fd}"),
            }));
        }

        if self.registration_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(Report::new(StubError::Configuration {
                message: "timeouts must be positive".into(),
            }));
        }

        Ok(())
    }
}
