//! Connection controller: shared client state, the connection state
//! machine, socket establishment and the reconnect loop.
//!
//! One driver task exists per connection attempt chain. Every task carries
//! the generation it was spawned for; any user action that invalidates the
//! connection (disconnect, new connect, destruction) bumps the generation,
//! and a driver that observes a stale generation exits without touching
//! anything.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::BytesMut;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::Notify;
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::client::{EventHandler, ErrorHandler, PushHandler};
use crate::core::config::{ConnectionConfig, Endpoint, IpPreference};
use crate::core::error::{CommandError, RedisError, RedisResult};
use crate::dispatch;
use crate::driver::{self, DisconnectReason};
use crate::guard::LifecycleGuard;
use crate::queue::CommandQueue;

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    ReconnectPending,
}

/// User-installed lifecycle handlers
#[derive(Default)]
pub(crate) struct Handlers {
    pub on_error: Option<ErrorHandler>,
    pub on_connect: Option<EventHandler>,
    pub on_disconnect: Option<EventHandler>,
    pub on_push: Option<PushHandler>,
}

/// Mutable client state behind the `RefCell`.
pub(crate) struct Inner {
    pub cfg: ConnectionConfig,
    pub endpoint: Option<Endpoint>,
    pub state: ConnState,
    pub generation: u64,
    pub intentional_disconnect: bool,
    pub attempts: u32,
    pub queue: CommandQueue,
    pub outbox: BytesMut,
    pub handlers: Handlers,
}

/// State shared between the client handle and its driver task.
///
/// The re-entrancy guard and the wakeup live outside the `RefCell` so they
/// can be touched while user code holds no borrow.
pub(crate) struct Shared {
    pub inner: RefCell<Inner>,
    pub guard: LifecycleGuard,
    pub wake: Notify,
}

impl Shared {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            inner: RefCell::new(Inner {
                cfg: ConnectionConfig::default(),
                endpoint: None,
                state: ConnState::Idle,
                generation: 0,
                intentional_disconnect: false,
                attempts: 0,
                queue: CommandQueue::default(),
                outbox: BytesMut::with_capacity(4 * 1024),
                handlers: Handlers::default(),
            }),
            guard: LifecycleGuard::default(),
            wake: Notify::new(),
        })
    }
}

/// Whether a driver spawned for `generation` has been superseded.
pub(crate) fn stale(shared: &Shared, generation: u64) -> bool {
    shared.guard.closed() || shared.inner.borrow().generation != generation
}

/// One of the transports the driver can run on.
pub(crate) enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

/// Driver task: connect, run the IO loop, and apply the reconnect policy
/// until superseded or told to stop.
pub(crate) async fn run(shared: Rc<Shared>, generation: u64) {
    loop {
        let (cfg, endpoint) = {
            let inner = shared.inner.borrow();
            (inner.cfg.clone(), inner.endpoint.clone())
        };
        let Some(endpoint) = endpoint else { return };

        debug!(?endpoint, "connecting");
        let connected = match cfg.connect_timeout {
            Some(limit) => match timeout(limit, establish(&cfg, &endpoint)).await {
                Ok(result) => result,
                Err(_) => Err(RedisError::Timeout),
            },
            None => establish(&cfg, &endpoint).await,
        };
        if stale(&shared, generation) {
            return;
        }

        let will_reconnect = match connected {
            Ok(transport) => {
                on_connected(&shared);
                if stale(&shared, generation) {
                    return;
                }
                let reason = match transport {
                    Transport::Tcp(stream) => driver::drive(&shared, generation, stream).await,
                    #[cfg(unix)]
                    Transport::Unix(stream) => driver::drive(&shared, generation, stream).await,
                    #[cfg(feature = "tls")]
                    Transport::Tls(stream) => driver::drive(&shared, generation, *stream).await,
                };
                if stale(&shared, generation) {
                    return;
                }
                handle_disconnect(&shared, reason)
            }
            Err(err) => {
                warn!(%err, "connection attempt failed");
                dispatch::fire_error(&shared, RedisError::Connect(err.to_string()));
                if stale(&shared, generation) {
                    return;
                }
                prepare_reconnect(&shared)
            }
        };

        if !will_reconnect {
            finish_idle(&shared);
            return;
        }
        if !wait_reconnect_delay(&shared, generation).await {
            return;
        }
        if !advance_attempt(&shared) {
            return;
        }
    }
}

/// Mark the connection live, notify the user and promote buffered work.
fn on_connected(shared: &Rc<Shared>) {
    {
        let mut inner = shared.inner.borrow_mut();
        inner.state = ConnState::Connected;
        inner.attempts = 0;
        info!("connected");
    }
    dispatch::fire_connect(shared);
    dispatch::drain_waiting(shared);
}

/// Run the disconnect transition for a connection that was live. Returns
/// whether a reconnect attempt should follow.
fn handle_disconnect(shared: &Rc<Shared>, reason: DisconnectReason) -> bool {
    if matches!(reason, DisconnectReason::Superseded) {
        return false;
    }

    let (will_reconnect, resume_waiting) = {
        let mut inner = shared.inner.borrow_mut();
        let will = !inner.intentional_disconnect && inner.cfg.reconnect.enabled;
        inner.state = if will {
            ConnState::ReconnectPending
        } else {
            ConnState::Idle
        };
        inner.outbox.clear();
        (will, will && inner.cfg.resume_waiting_on_reconnect)
    };

    let command_timeout = matches!(reason, DisconnectReason::CommandTimeout);
    match reason {
        DisconnectReason::Eof => {
            dispatch::fire_error(
                shared,
                RedisError::Connection("server closed the connection".into()),
            );
        }
        DisconnectReason::Io(err) => dispatch::fire_error(shared, RedisError::Io(err)),
        DisconnectReason::Protocol(msg) => {
            dispatch::fire_error(shared, RedisError::Protocol(msg));
        }
        DisconnectReason::CommandTimeout => dispatch::fire_error(shared, RedisError::Timeout),
        DisconnectReason::Superseded => unreachable!(),
    }

    dispatch::fire_disconnect(shared);
    if command_timeout {
        dispatch::fail_pending(shared, &CommandError::Failed("timed out".into()));
    }
    dispatch::fail_pending(shared, &CommandError::Disconnected);
    if !resume_waiting {
        dispatch::fail_waiting(shared, &CommandError::Disconnected);
    }
    will_reconnect
}

/// After a failed connection attempt: keep the waiting queue and retry, or
/// give up.
fn prepare_reconnect(shared: &Rc<Shared>) -> bool {
    let mut inner = shared.inner.borrow_mut();
    let will = !inner.intentional_disconnect && inner.cfg.reconnect.enabled;
    inner.state = if will {
        ConnState::ReconnectPending
    } else {
        ConnState::Idle
    };
    will
}

/// Terminal transition to Idle: nothing may stay buffered.
fn finish_idle(shared: &Rc<Shared>) {
    {
        let mut inner = shared.inner.borrow_mut();
        inner.state = ConnState::Idle;
        inner.outbox.clear();
    }
    dispatch::fail_waiting(shared, &CommandError::Disconnected);
}

/// Sleep out the reconnect delay while still expiring waiting-queue
/// timeouts during the outage. Returns false when superseded.
async fn wait_reconnect_delay(shared: &Rc<Shared>, generation: u64) -> bool {
    let until = Instant::now() + shared.inner.borrow().cfg.reconnect.delay;
    loop {
        if stale(shared, generation) {
            return false;
        }
        let deadline = driver::waiting_deadline(&shared.inner.borrow());
        tokio::select! {
            () = sleep_until(until) => return !stale(shared, generation),
            () = shared.wake.notified() => {}
            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                dispatch::expire_waiting(shared);
                if shared.guard.closed() {
                    return false;
                }
            }
        }
    }
}

/// Count the upcoming attempt against the cap. On exhaustion the preserved
/// waiting queue is cleared and the client goes idle.
fn advance_attempt(shared: &Rc<Shared>) -> bool {
    let give_up = {
        let mut inner = shared.inner.borrow_mut();
        inner.attempts += 1;
        let max = inner.cfg.reconnect.max_attempts;
        if max > 0 && inner.attempts > max {
            inner.state = ConnState::Idle;
            true
        } else {
            debug!(attempt = inner.attempts, "reconnecting");
            inner.state = ConnState::Connecting;
            false
        }
    };
    if give_up {
        warn!("reconnect attempts exhausted");
        dispatch::fire_error(shared, RedisError::Reconnect("max attempts reached".into()));
        dispatch::fail_waiting(shared, &CommandError::Reconnect("max attempts reached".into()));
        false
    } else {
        true
    }
}

/// Open the configured endpoint with all socket options applied.
async fn establish(cfg: &ConnectionConfig, endpoint: &Endpoint) -> RedisResult<Transport> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = open_tcp(cfg, host, *port).await?;
            #[cfg(feature = "tls")]
            if let Some(tls) = cfg.tls.clone() {
                return wrap_tls(stream, host, tls).await;
            }
            Ok(Transport::Tcp(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix { path } => Ok(Transport::Unix(UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(RedisError::Config(
            "unix-domain endpoints are not supported on this platform".into(),
        )),
    }
}

async fn open_tcp(cfg: &ConnectionConfig, host: &str, port: u16) -> RedisResult<TcpStream> {
    let mut addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    match cfg.ip_preference {
        Some(IpPreference::V4) => addrs.retain(SocketAddr::is_ipv4),
        Some(IpPreference::V6) => addrs.retain(SocketAddr::is_ipv6),
        None => {}
    }

    let mut last_err = None;
    for addr in addrs {
        match connect_addr(cfg, addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        RedisError::Connection(format!("no usable address for {host}:{port}"))
    }))
}

async fn connect_addr(cfg: &ConnectionConfig, addr: SocketAddr) -> RedisResult<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if cfg.reuseaddr {
        socket.set_reuseaddr(true)?;
    }
    if let Some(source) = cfg.source_addr {
        socket.bind(SocketAddr::new(source, 0))?;
    }
    apply_socket_options(&socket, cfg)?;

    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn apply_socket_options(socket: &TcpSocket, cfg: &ConnectionConfig) -> RedisResult<()> {
    let sock = socket2::SockRef::from(socket);

    if cfg.keepalive_secs > 0 {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(u64::from(cfg.keepalive_secs)))
            .with_interval(Duration::from_secs(u64::from(cfg.keepalive_secs)));
        sock.set_keepalive(true)?;
        sock.set_tcp_keepalive(&keepalive)?;
    }

    #[cfg(target_os = "linux")]
    if cfg.tcp_user_timeout_ms > 0 {
        sock.set_tcp_user_timeout(Some(Duration::from_millis(u64::from(
            cfg.tcp_user_timeout_ms,
        ))))?;
    }

    #[cfg(unix)]
    if !cfg.cloexec {
        sock.set_cloexec(false)?;
    }

    Ok(())
}

#[cfg(feature = "tls")]
async fn wrap_tls(
    stream: TcpStream,
    host: &str,
    tls: crate::core::config::TlsOptions,
) -> RedisResult<Transport> {
    use std::sync::Arc;

    use tokio_rustls::TlsConnector;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let name = tls.server_name.unwrap_or_else(|| host.to_string());
    let domain = rustls::pki_types::ServerName::try_from(name)
        .map_err(|e| RedisError::Config(format!("invalid TLS server name: {e}")))?;

    let tls_stream = connector.connect(domain, stream).await?;
    Ok(Transport::Tls(Box::new(tls_stream)))
}

/// Request destruction of the client. Safe to call from inside any
/// continuation: teardown is deferred until the last callback frame
/// unwinds.
pub(crate) fn begin_shutdown(shared: &Rc<Shared>) {
    if !shared.guard.request_shutdown() {
        return;
    }
    {
        let mut inner = shared.inner.borrow_mut();
        inner.generation = inner.generation.wrapping_add(1);
        inner.state = ConnState::Idle;
        inner.intentional_disconnect = true;
    }
    shared.wake.notify_one();
    if !shared.guard.in_callback() {
        finish_shutdown(shared);
    }
}

/// Complete destruction: every outstanding continuation observes
/// `"disconnected"` exactly once, then handlers are released.
pub(crate) fn finish_shutdown(shared: &Rc<Shared>) {
    if shared.guard.closed() {
        return;
    }
    shared.guard.mark_closed();

    dispatch::fail_pending(shared, &CommandError::Disconnected);
    dispatch::fail_waiting(shared, &CommandError::Disconnected);

    let mut inner = shared.inner.borrow_mut();
    inner.handlers = Handlers::default();
    inner.outbox.clear();
    drop(inner);

    shared.wake.notify_one();
    debug!("client released");
}
