//! Error types for the plugin stub.

use core::error::Error;

use derive_more::Display;
use error_stack::Report;

/// Result type for stub operations.
pub type StubResult<T> = Result<T, Report<StubError>>;

/// Errors that end or prevent the plugin's session with the runtime.
#[derive(Debug, Display)]
pub enum StubError {
    /// Socket could not be opened or adopted
    #[display("Connection error: {message}")]
    Connection { message: String },

    /// Runtime refused or never answered the registration
    #[display("Registration failed: {message}")]
    Registration { message: String },

    /// Peer violated the ttrpc or NRI protocol
    #[display("Protocol error: {message}")]
    Protocol { message: String },

    /// Wire framing failed
    #[display("Codec error: {message}")]
    Codec { message: String },

    /// Invalid stub configuration
    #[display("Configuration error: {message}")]
    Configuration { message: String },

    /// Timeout errors
    #[display("Operation timed out after {millis}ms")]
    Timeout { millis: u128 },
}

impl Error for StubError {}
