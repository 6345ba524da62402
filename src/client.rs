//! The public client handle.
//!
//! A [`Client`] multiplexes many in-flight commands over one connection and
//! surfaces every reply through a per-command continuation. All methods are
//! synchronous: they either complete immediately or schedule work on the
//! driver task and return. Continuations run on the event loop's thread and
//! may re-enter the client freely — submit, cancel, disconnect, reconnect,
//! or drop the handle.
//!
//! The client is single-threaded (`!Send`). [`Client::connect`] spawns the
//! connection driver with `tokio::task::spawn_local`, so it must be called
//! from within a [`tokio::task::LocalSet`] running on a current-thread
//! runtime.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use redis_mux::Client;
//!
//! # async fn demo() -> redis_mux::RedisResult<()> {
//! let client = Client::new();
//! client.connect("127.0.0.1", 6379)?;
//! client.submit(
//!     vec![Bytes::from_static(b"GET"), Bytes::from_static(b"key")],
//!     |result| match result {
//!         Ok(reply) => println!("reply: {reply:?}"),
//!         Err(err) => eprintln!("failed: {err}"),
//!     },
//! )?;
//! # Ok(())
//! # }
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::rc::Rc;

use bytes::Bytes;
use tracing::debug;

use crate::connection::{self, ConnState, Shared};
use crate::core::config::{clamp_priority, duration_from_ms, ConnectionConfig, Endpoint, IpPreference};
#[cfg(feature = "tls")]
use crate::core::config::TlsOptions;
use crate::core::error::{CommandError, RedisError, RedisResult};
use crate::core::value::Reply;
use crate::dispatch;
use crate::protocol;
use crate::queue::{self, ReplyCallback};

/// Default Redis port.
pub const DEFAULT_PORT: u16 = 6379;

/// Handler for connection-level errors.
pub type ErrorHandler = Box<dyn FnMut(RedisError)>;
/// Handler for connection-established and connection-lost events.
pub type EventHandler = Box<dyn FnMut()>;
/// Handler for RESP3 out-of-band push messages.
pub type PushHandler = Box<dyn FnMut(Reply)>;

/// An asynchronous multiplexing Redis client on a single connection.
///
/// The handle owns the connection: dropping it cancels every outstanding
/// command with a `"disconnected"` error and releases all resources. A drop
/// from inside a continuation is deferred until that continuation returns.
///
/// Continuations that capture the client handle keep it alive through the
/// client's own queues; prefer capturing nothing, or a weak holder, and
/// clear installed handlers before dropping if you close the cycle anyway.
pub struct Client {
    shared: Rc<Shared>,
}

impl Client {
    /// Create an idle client with default options.
    pub fn new() -> Self {
        Self {
            shared: Shared::new(),
        }
    }

    /// Create an idle client from a prepared configuration. The priority is
    /// clamped; timeouts are taken as given (the setters validate bounds).
    pub fn with_config(mut cfg: ConnectionConfig) -> Self {
        cfg.priority = clamp_priority(i32::from(cfg.priority));
        let client = Self::new();
        client.shared.inner.borrow_mut().cfg = cfg;
        client
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    /// Start connecting to `host:port`. Returns immediately; the
    /// `on_connect` handler fires once the connection is live.
    ///
    /// Fails if the client is already connected or connecting. Must be
    /// called from within a `LocalSet`.
    pub fn connect(&self, host: impl Into<String>, port: u16) -> RedisResult<()> {
        self.start_connect(Endpoint::Tcp {
            host: host.into(),
            port,
        })
    }

    /// Start connecting to a Unix-domain socket.
    pub fn connect_unix(&self, path: impl Into<PathBuf>) -> RedisResult<()> {
        #[cfg(feature = "tls")]
        if self.shared.inner.borrow().cfg.tls.is_some() {
            return Err(RedisError::Config(
                "TLS requires a TCP endpoint".into(),
            ));
        }
        self.start_connect(Endpoint::Unix { path: path.into() })
    }

    fn start_connect(&self, endpoint: Endpoint) -> RedisResult<()> {
        if self.shared.guard.closed() {
            return Err(RedisError::NotConnected);
        }
        let generation = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.state != ConnState::Idle {
                return Err(RedisError::Connection("already connected".into()));
            }
            inner.endpoint = Some(endpoint);
            inner.intentional_disconnect = false;
            inner.attempts = 0;
            inner.state = ConnState::Connecting;
            inner.generation = inner.generation.wrapping_add(1);
            inner.generation
        };
        tokio::task::spawn_local(connection::run(Rc::clone(&self.shared), generation));
        Ok(())
    }

    /// Disconnect intentionally. Suppresses automatic reconnection, fails
    /// every outstanding command with `"disconnected"`, and is idempotent:
    /// when already disconnected only a residual waiting queue is cleared.
    pub fn disconnect(&self) -> RedisResult<()> {
        let shared = &self.shared;
        if shared.guard.closed() {
            return Ok(());
        }
        let prior = {
            let mut inner = shared.inner.borrow_mut();
            let prior = inner.state;
            if prior != ConnState::Idle {
                inner.intentional_disconnect = true;
                inner.state = ConnState::Disconnecting;
                inner.generation = inner.generation.wrapping_add(1);
                inner.attempts = 0;
                inner.outbox.clear();
                inner.state = ConnState::Idle;
            }
            prior
        };
        match prior {
            ConnState::Idle => {
                dispatch::fail_waiting(shared, &CommandError::Disconnected);
            }
            _ => {
                shared.wake.notify_one();
                debug!("intentional disconnect");
                if prior == ConnState::Connected {
                    dispatch::fire_disconnect(shared);
                }
                dispatch::fail_pending(shared, &CommandError::Disconnected);
                dispatch::fail_waiting(shared, &CommandError::Disconnected);
            }
        }
        Ok(())
    }

    /// Whether a connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.shared.inner.borrow().state == ConnState::Connected
    }

    // ── Command submission ──────────────────────────────────────────────

    /// Submit a command. `args[0]` is the command name; every element is an
    /// opaque byte string. The continuation is invoked exactly once with
    /// the reply or an error — except for persistent commands (`SUBSCRIBE`,
    /// `PSUBSCRIBE`, `SSUBSCRIBE`, `MONITOR`), whose continuation fires for
    /// every reply until the subscription ends or the connection is lost.
    ///
    /// The command is admitted into the in-flight queue, or buffered
    /// locally when the client is throttled by `max_pending` or currently
    /// reconnecting. Admission failures are synchronous; an admitted
    /// command is never silently dropped.
    ///
    /// Unsubscribe-family commands are special: the server acknowledges
    /// them through unsubscribe markers delivered to the matching subscribe
    /// continuation, so they carry no reply entry of their own and their
    /// continuation is invoked once immediately with a nil reply.
    pub fn submit<C>(&self, args: Vec<Bytes>, cb: C) -> RedisResult<()>
    where
        C: FnMut(Result<Reply, CommandError>) + 'static,
    {
        let shared = &self.shared;
        if args.is_empty() {
            return Err(RedisError::EmptyCommand);
        }
        if shared.guard.closed() {
            return Err(RedisError::NotConnected);
        }

        if queue::is_unsubscribe_command(&args[0]) {
            return self.submit_unsubscribe(args, Box::new(cb));
        }

        let persist = queue::is_persistent_command(&args[0]);
        let sub_count = if persist {
            queue::initial_sub_count(&args)
        } else {
            0
        };

        {
            let mut inner = shared.inner.borrow_mut();
            match inner.state {
                ConnState::Connected => {
                    let max = inner.cfg.max_pending;
                    if max > 0 && inner.queue.pending_count >= max as usize {
                        inner.queue.push_waiting(args, Box::new(cb), persist, sub_count);
                    } else {
                        protocol::encode_command(&args, &mut inner.outbox);
                        inner.queue.push_pending(Box::new(cb), persist, sub_count);
                    }
                }
                ConnState::Connecting | ConnState::ReconnectPending => {
                    inner.queue.push_waiting(args, Box::new(cb), persist, sub_count);
                }
                ConnState::Idle | ConnState::Disconnecting => {
                    return Err(RedisError::NotConnected);
                }
            }
        }
        shared.wake.notify_one();
        Ok(())
    }

    fn submit_unsubscribe(&self, args: Vec<Bytes>, mut cb: ReplyCallback) -> RedisResult<()> {
        let shared = &self.shared;
        let send = {
            let mut inner = shared.inner.borrow_mut();
            match inner.state {
                ConnState::Connected => {
                    protocol::encode_command(&args, &mut inner.outbox);
                    true
                }
                ConnState::Connecting | ConnState::ReconnectPending => false,
                ConnState::Idle | ConnState::Disconnecting => {
                    return Err(RedisError::NotConnected);
                }
            }
        };
        if send {
            shared.wake.notify_one();
        }
        dispatch::invoke_callback(shared, &mut cb, Ok(Reply::Nil));
        Ok(())
    }

    /// Fail every waiting command with `"skipped"` and stop the waiting
    /// timer. Idempotent and safe from inside any continuation.
    pub fn cancel_waiting(&self) {
        dispatch::fail_waiting(&self.shared, &CommandError::Skipped);
    }

    /// Cancel both queues: waiting commands fail with `"skipped"`
    /// immediately; in-flight commands are marked skipped, their
    /// continuations receive `"skipped"` now, and their eventual replies
    /// are absorbed silently. The continuation this is called from, if any,
    /// is not cancelled.
    pub fn cancel_all(&self) {
        dispatch::fail_waiting(&self.shared, &CommandError::Skipped);
        dispatch::cancel_pending(&self.shared);
    }

    // ── Lifecycle handlers ──────────────────────────────────────────────

    /// Install or clear the connection-error handler; returns the previous
    /// one.
    pub fn set_on_error(&self, handler: Option<ErrorHandler>) -> Option<ErrorHandler> {
        std::mem::replace(
            &mut self.shared.inner.borrow_mut().handlers.on_error,
            handler,
        )
    }

    /// Install or clear the connection-established handler.
    pub fn set_on_connect(&self, handler: Option<EventHandler>) -> Option<EventHandler> {
        std::mem::replace(
            &mut self.shared.inner.borrow_mut().handlers.on_connect,
            handler,
        )
    }

    /// Install or clear the connection-lost handler.
    pub fn set_on_disconnect(&self, handler: Option<EventHandler>) -> Option<EventHandler> {
        std::mem::replace(
            &mut self.shared.inner.borrow_mut().handlers.on_disconnect,
            handler,
        )
    }

    /// Install or clear the RESP3 push handler.
    pub fn set_on_push(&self, handler: Option<PushHandler>) -> Option<PushHandler> {
        std::mem::replace(&mut self.shared.inner.borrow_mut().handlers.on_push, handler)
    }

    // ── Flow control and timeouts ───────────────────────────────────────

    /// Cap the number of non-persistent in-flight commands (0 = unlimited).
    /// Raising or clearing the cap promotes buffered commands immediately.
    pub fn set_max_pending(&self, max: u32) {
        let raised = {
            let mut inner = self.shared.inner.borrow_mut();
            let prev = inner.cfg.max_pending;
            inner.cfg.max_pending = max;
            prev != 0 && (max == 0 || max > prev)
        };
        if raised {
            dispatch::drain_waiting(&self.shared);
        }
    }

    /// Maximum time a command may sit in the waiting queue, in
    /// milliseconds (0 = no limit).
    pub fn set_waiting_timeout(&self, ms: u64) -> RedisResult<()> {
        let limit = match ms {
            0 => None,
            v => Some(duration_from_ms(v)?),
        };
        self.shared.inner.borrow_mut().cfg.waiting_timeout = limit;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Connection establishment timeout in milliseconds; `None` or 0
    /// disables it. Applies to the next connection attempt.
    pub fn set_connect_timeout(&self, ms: Option<u64>) -> RedisResult<()> {
        let limit = match ms {
            None | Some(0) => None,
            Some(v) => Some(duration_from_ms(v)?),
        };
        self.shared.inner.borrow_mut().cfg.connect_timeout = limit;
        Ok(())
    }

    /// Per-command timeout in milliseconds; `None` or 0 disables it. Takes
    /// effect on the live connection. Expiry is connection-fatal.
    pub fn set_command_timeout(&self, ms: Option<u64>) -> RedisResult<()> {
        let limit = match ms {
            None | Some(0) => None,
            Some(v) => Some(duration_from_ms(v)?),
        };
        self.shared.inner.borrow_mut().cfg.command_timeout = limit;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Configure automatic reconnection. Resets the attempt counter.
    pub fn set_reconnect(&self, enabled: bool, delay_ms: u64, max_attempts: u32) -> RedisResult<()> {
        let delay = duration_from_ms(delay_ms)?;
        let mut inner = self.shared.inner.borrow_mut();
        inner.cfg.reconnect.enabled = enabled;
        inner.cfg.reconnect.delay = delay;
        inner.cfg.reconnect.max_attempts = max_attempts;
        inner.attempts = 0;
        Ok(())
    }

    /// Keep buffered waiting commands across a non-intentional disconnect
    /// when a reconnect will be attempted.
    pub fn set_resume_waiting_on_reconnect(&self, resume: bool) {
        self.shared.inner.borrow_mut().cfg.resume_waiting_on_reconnect = resume;
    }

    /// Event-loop priority for this connection. Values outside `[-2, 2]`
    /// are clamped; the change applies to the live connection without
    /// disturbing pending timer deadlines. Returns the stored value.
    pub fn set_priority(&self, priority: i32) -> i8 {
        let clamped = clamp_priority(priority);
        self.shared.inner.borrow_mut().cfg.priority = clamped;
        self.shared.wake.notify_one();
        clamped
    }

    // ── Socket options (applied at the next connection) ─────────────────

    /// TCP keepalive time and interval in seconds (0 = off).
    pub fn set_keepalive(&self, secs: u32) {
        self.shared.inner.borrow_mut().cfg.keepalive_secs = secs;
    }

    /// `TCP_USER_TIMEOUT` in milliseconds (0 = OS default).
    pub fn set_tcp_user_timeout(&self, ms: u32) {
        self.shared.inner.borrow_mut().cfg.tcp_user_timeout_ms = ms;
    }

    /// Close-on-exec on the socket descriptor.
    pub fn set_cloexec(&self, cloexec: bool) {
        self.shared.inner.borrow_mut().cfg.cloexec = cloexec;
    }

    /// `SO_REUSEADDR` on the socket.
    pub fn set_reuseaddr(&self, reuseaddr: bool) {
        self.shared.inner.borrow_mut().cfg.reuseaddr = reuseaddr;
    }

    /// Resolve the host to IPv4 addresses only. Clears the IPv6 preference.
    pub fn set_prefer_ipv4(&self, prefer: bool) {
        let mut inner = self.shared.inner.borrow_mut();
        inner.cfg.ip_preference = if prefer {
            Some(IpPreference::V4)
        } else if inner.cfg.ip_preference == Some(IpPreference::V4) {
            None
        } else {
            inner.cfg.ip_preference
        };
    }

    /// Resolve the host to IPv6 addresses only. Clears the IPv4 preference.
    pub fn set_prefer_ipv6(&self, prefer: bool) {
        let mut inner = self.shared.inner.borrow_mut();
        inner.cfg.ip_preference = if prefer {
            Some(IpPreference::V6)
        } else if inner.cfg.ip_preference == Some(IpPreference::V6) {
            None
        } else {
            inner.cfg.ip_preference
        };
    }

    /// Local address to bind before connecting.
    pub fn set_source_addr(&self, addr: Option<IpAddr>) {
        self.shared.inner.borrow_mut().cfg.source_addr = addr;
    }

    /// Enable TLS for TCP endpoints. Fails when the configured endpoint is
    /// a Unix-domain socket.
    #[cfg(feature = "tls")]
    pub fn set_tls(&self, tls: Option<TlsOptions>) -> RedisResult<()> {
        let mut inner = self.shared.inner.borrow_mut();
        if tls.is_some() && matches!(inner.endpoint, Some(Endpoint::Unix { .. })) {
            return Err(RedisError::Config("TLS requires a TCP endpoint".into()));
        }
        inner.cfg.tls = tls;
        Ok(())
    }

    // ── Observers ───────────────────────────────────────────────────────

    /// Number of non-persistent in-flight commands.
    pub fn pending_count(&self) -> usize {
        self.shared.inner.borrow().queue.pending_count
    }

    /// Number of locally buffered commands.
    pub fn waiting_count(&self) -> usize {
        self.shared.inner.borrow().queue.waiting_count()
    }

    /// Whether automatic reconnection is enabled.
    pub fn reconnect_enabled(&self) -> bool {
        self.shared.inner.borrow().cfg.reconnect.enabled
    }

    /// Stored event-loop priority.
    pub fn priority(&self) -> i8 {
        self.shared.inner.borrow().cfg.priority
    }

    /// Configured in-flight cap (0 = unlimited).
    pub fn max_pending(&self) -> u32 {
        self.shared.inner.borrow().cfg.max_pending
    }

    /// Waiting timeout in milliseconds (0 = no limit).
    pub fn waiting_timeout(&self) -> u64 {
        self.shared
            .inner
            .borrow()
            .cfg
            .waiting_timeout
            .map_or(0, |d| d.as_millis() as u64)
    }

    /// Connect timeout in milliseconds, if set.
    pub fn connect_timeout(&self) -> Option<u64> {
        self.shared
            .inner
            .borrow()
            .cfg
            .connect_timeout
            .map(|d| d.as_millis() as u64)
    }

    /// Command timeout in milliseconds, if set.
    pub fn command_timeout(&self) -> Option<u64> {
        self.shared
            .inner
            .borrow()
            .cfg
            .command_timeout
            .map(|d| d.as_millis() as u64)
    }

    /// Configured keepalive in seconds (0 = off).
    pub fn keepalive(&self) -> u32 {
        self.shared.inner.borrow().cfg.keepalive_secs
    }

    /// Configured `TCP_USER_TIMEOUT` in milliseconds (0 = OS default).
    pub fn tcp_user_timeout(&self) -> u32 {
        self.shared.inner.borrow().cfg.tcp_user_timeout_ms
    }

    /// Whether close-on-exec is requested.
    pub fn cloexec(&self) -> bool {
        self.shared.inner.borrow().cfg.cloexec
    }

    /// Whether `SO_REUSEADDR` is requested.
    pub fn reuseaddr(&self) -> bool {
        self.shared.inner.borrow().cfg.reuseaddr
    }

    /// Whether resolution is restricted to IPv4.
    pub fn prefer_ipv4(&self) -> bool {
        self.shared.inner.borrow().cfg.ip_preference == Some(IpPreference::V4)
    }

    /// Whether resolution is restricted to IPv6.
    pub fn prefer_ipv6(&self) -> bool {
        self.shared.inner.borrow().cfg.ip_preference == Some(IpPreference::V6)
    }

    /// Configured source address, if any.
    pub fn source_addr(&self) -> Option<IpAddr> {
        self.shared.inner.borrow().cfg.source_addr
    }

    /// Whether TLS is configured.
    pub fn has_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.shared.inner.borrow().cfg.tls.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        connection::begin_shutdown(&self.shared);
    }
}
