//! Configuration types for the client connection

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::error::{RedisError, RedisResult};

/// Upper bound for user-supplied timeouts and delays, in milliseconds.
pub const MAX_TIMEOUT_MS: u64 = 2_000_000_000;

/// Where the client connects to. TCP and Unix-domain endpoints are mutually
/// exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP endpoint, optionally wrapped in TLS
    Tcp {
        /// Server hostname or address
        host: String,
        /// Server port
        port: u16,
    },
    /// Unix-domain socket endpoint
    Unix {
        /// Socket path
        path: PathBuf,
    },
}

/// Address-family preference applied when resolving a TCP host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpPreference {
    /// Only connect over IPv4
    V4,
    /// Only connect over IPv6
    V6,
}

/// Automatic reconnection policy
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection after a non-intentional disconnect
    pub enabled: bool,
    /// Delay between reconnect attempts
    pub delay: Duration,
    /// Maximum number of attempts (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay: Duration::from_secs(1),
            max_attempts: 0,
        }
    }
}

/// TLS settings for TCP endpoints
#[cfg(feature = "tls")]
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Override the server name used for SNI and certificate validation;
    /// defaults to the endpoint host
    pub server_name: Option<String>,
}

/// Configuration for a client connection.
///
/// Socket options apply at the next connection attempt; flow-control and
/// timeout knobs take effect immediately.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TCP keepalive time and interval in seconds (0 = keepalive off)
    pub keepalive_secs: u32,
    /// `TCP_USER_TIMEOUT` in milliseconds (0 = OS default)
    pub tcp_user_timeout_ms: u32,
    /// Close-on-exec on the socket descriptor
    pub cloexec: bool,
    /// `SO_REUSEADDR` on the socket
    pub reuseaddr: bool,
    /// Address-family preference for hostname resolution
    pub ip_preference: Option<IpPreference>,
    /// Local address to bind before connecting
    pub source_addr: Option<IpAddr>,
    /// Connection establishment timeout
    pub connect_timeout: Option<Duration>,
    /// Per-command timeout, measured from the send instant of the oldest
    /// in-flight command; expiry is connection-fatal
    pub command_timeout: Option<Duration>,
    /// Maximum number of non-persistent in-flight commands (0 = unlimited)
    pub max_pending: u32,
    /// Maximum time a command may sit in the waiting queue
    pub waiting_timeout: Option<Duration>,
    /// Keep buffered waiting commands across a non-intentional disconnect
    /// when a reconnect will be attempted
    pub resume_waiting_on_reconnect: bool,
    /// Event-loop priority for this connection, clamped to `[-2, 2]`
    pub priority: i8,
    /// Reconnection policy
    pub reconnect: ReconnectConfig,
    /// TLS settings; requires a TCP endpoint
    #[cfg(feature = "tls")]
    pub tls: Option<TlsOptions>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: 0,
            tcp_user_timeout_ms: 0,
            cloexec: true,
            reuseaddr: false,
            ip_preference: None,
            source_addr: None,
            connect_timeout: None,
            command_timeout: None,
            max_pending: 0,
            waiting_timeout: None,
            resume_waiting_on_reconnect: false,
            priority: 0,
            reconnect: ReconnectConfig::default(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

/// Clamp an event-loop priority into the supported `[-2, 2]` range.
pub fn clamp_priority(priority: i32) -> i8 {
    priority.clamp(-2, 2) as i8
}

/// Validate a user-supplied timeout in milliseconds and convert it to a
/// `Duration`. Zero is accepted and means "disabled" to callers that treat
/// it that way.
pub(crate) fn duration_from_ms(ms: u64) -> RedisResult<Duration> {
    if ms > MAX_TIMEOUT_MS {
        return Err(RedisError::Config(format!(
            "timeout {ms}ms exceeds the {MAX_TIMEOUT_MS}ms limit"
        )));
    }
    Ok(Duration::from_millis(ms))
}
