//! Engine configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::mode::Mode;
use crate::protocol::decoder::{DEFAULT_FRAME_DEADLINE, DEFAULT_MAX_LINE};
use crate::protocol::frame::MAX_PAYLOAD;

/// Offset and length fields of a data request.
const DATA_OVERHEAD: usize = 4;

/// Largest upgrade chunk that fits one data request.
pub const MAX_CHUNK_SIZE: usize = MAX_PAYLOAD - DATA_OVERHEAD;

/// Reconnect backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial: Duration,
    /// Upper bound for the delay.
    pub max: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

/// Timing, retry and upgrade settings of an [`crate::Engine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Response deadline of one binary request attempt.
    pub request_timeout: Duration,
    /// Retransmissions after the first attempt.
    pub max_retries: u32,
    /// Deadline for a text command acknowledgement.
    pub command_timeout: Duration,
    /// Deadline for the whole parameter listing.
    pub schema_timeout: Duration,
    /// Silence tolerated in binary modes; `None` disables heartbeats.
    pub heartbeat: Option<Duration>,
    /// Inter-byte deadline inside a binary frame.
    pub frame_deadline: Duration,
    /// Longest accepted text line.
    pub max_line: usize,
    /// Image bytes per data request.
    pub chunk_size: usize,
    /// Ask the device to validate the image before commit.
    pub validate_image: bool,
    /// Mode entered right after connecting.
    pub initial_mode: Mode,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            max_retries: 2,
            command_timeout: Duration::from_secs(1),
            schema_timeout: Duration::from_secs(3),
            heartbeat: Some(Duration::from_secs(2)),
            frame_deadline: DEFAULT_FRAME_DEADLINE,
            max_line: DEFAULT_MAX_LINE,
            chunk_size: 256,
            validate_image: false,
            initial_mode: Mode::Cli,
            backoff: BackoffConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Set the per-attempt request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the retry count.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the text command timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set or disable the heartbeat window.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: Option<Duration>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the upgrade chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Enable or disable image validation.
    #[must_use]
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate_image = validate;
        self
    }

    /// Set the mode entered after connecting.
    #[must_use]
    pub fn with_initial_mode(mut self, mode: Mode) -> Self {
        self.initial_mode = mode;
        self
    }

    /// Set the reconnect backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Reject settings the protocol cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "chunk size must be 1..={MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request timeout must be non-zero".to_string()));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "backoff multiplier must be >= 1, got {}",
                self.backoff.multiplier
            )));
        }
        if self.backoff.initial > self.backoff.max {
            return Err(Error::Config(
                "initial backoff exceeds maximum backoff".to_string(),
            ));
        }
        Ok(())
    }
}
