//! Error types for client operations and command continuations

use std::io;

use bytes::Bytes;
use thiserror::Error;

/// Result type for client operations
pub type RedisResult<T> = Result<T, RedisError>;

/// Errors surfaced by the synchronous client API and the `on_error` handler
#[derive(Error, Debug)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection establishment failed
    #[error("connect error: {0}")]
    Connect(String),

    /// Automatic reconnection failed
    #[error("reconnect error: {0}")]
    Reconnect(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A command was submitted without a command name
    #[error("empty command")]
    EmptyCommand,

    /// No connection is active and no reconnect is in progress
    #[error("not connected")]
    NotConnected,

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,
}

/// Errors delivered to command continuations.
///
/// The `Display` strings are part of the public API: `"skipped"`,
/// `"waiting timeout"`, `"disconnected"` and the `"connect error: "`,
/// `"reconnect error: "` and `"command failed"` prefixes are stable and may
/// be matched on. Server error replies surface their original text with no
/// prefix.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The command was cancelled before a reply arrived
    #[error("skipped")]
    Skipped,

    /// The command expired in the waiting queue
    #[error("waiting timeout")]
    WaitingTimeout,

    /// The connection was lost or closed before a reply arrived
    #[error("disconnected")]
    Disconnected,

    /// Connection establishment failed
    #[error("connect error: {0}")]
    Connect(String),

    /// Automatic reconnection failed
    #[error("reconnect error: {0}")]
    Reconnect(String),

    /// The command could not be completed on the live connection
    #[error("command failed: {0}")]
    Failed(String),

    /// The server answered with an error reply; the original error text is
    /// carried verbatim
    #[error("{}", String::from_utf8_lossy(.0))]
    Server(Bytes),
}
