//! Event-loop adapter: the connected IO loop for one transport.
//!
//! The loop multiplexes three wakeup sources, mirroring the read, write and
//! timer watchers a classic reactor would own: socket readability, write
//! intent (a non-empty outbox signalled through the shared `Notify`), and
//! the earliest of the waiting-queue and command deadlines. Priority maps
//! to cooperative greediness: it bounds how many decoded frames are
//! dispatched before the task yields back to the loop. Deadlines are stored
//! as instants, so live option changes never lose remaining timer time.

use std::io::Cursor;
use std::rc::Rc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::connection::{stale, Inner, Shared};
use crate::dispatch;
use crate::protocol::RespDecoder;

const READ_BUF_SIZE: usize = 8 * 1024;

/// Why the connected IO loop ended.
pub(crate) enum DisconnectReason {
    /// The server closed the connection
    Eof,
    /// A transport read or write failed
    Io(std::io::Error),
    /// The reply stream could not be parsed
    Protocol(String),
    /// The oldest in-flight command outlived the command timeout
    CommandTimeout,
    /// A newer generation took over; exit without side effects
    Superseded,
}

/// Deadline for the head of the waiting queue, if the waiting timeout is
/// enabled and anything is buffered.
pub(crate) fn waiting_deadline(inner: &Inner) -> Option<Instant> {
    let limit = inner.cfg.waiting_timeout?;
    inner.queue.waiting.front().map(|w| w.queued_at + limit)
}

/// Deadline for the oldest in-flight non-persistent command.
fn command_deadline(inner: &Inner) -> Option<Instant> {
    let limit = inner.cfg.command_timeout?;
    inner
        .queue
        .pending
        .iter()
        .find(|e| !e.persist)
        .map(|e| e.sent_at + limit)
}

fn next_deadline(inner: &Inner) -> Option<Instant> {
    match (waiting_deadline(inner), command_deadline(inner)) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// How many frames to dispatch per poll round before yielding.
fn frame_budget(priority: i8) -> usize {
    match priority {
        i8::MIN..=-2 => 1,
        -1 => 4,
        0 => 16,
        1 => 64,
        _ => 256,
    }
}

/// Run the IO loop until the connection dies or the driver is superseded.
pub(crate) async fn drive<S>(shared: &Rc<Shared>, generation: u64, mut stream: S) -> DisconnectReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut inbuf = BytesMut::with_capacity(READ_BUF_SIZE);
    loop {
        if stale(shared, generation) {
            return DisconnectReason::Superseded;
        }

        let outgoing = take_outbox(shared);
        if !outgoing.is_empty() {
            if let Err(err) = stream.write_all(&outgoing).await {
                return DisconnectReason::Io(err);
            }
            // Re-check state before blocking; the write may have raced a
            // disconnect or queued more output.
            continue;
        }

        let deadline = next_deadline(&shared.inner.borrow());
        tokio::select! {
            read = stream.read_buf(&mut inbuf) => match read {
                Ok(0) => return DisconnectReason::Eof,
                Ok(_) => {
                    if let Some(reason) = pump_frames(shared, generation, &mut inbuf).await {
                        return reason;
                    }
                }
                Err(err) => return DisconnectReason::Io(err),
            },
            () = shared.wake.notified() => {}
            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if stale(shared, generation) {
                    return DisconnectReason::Superseded;
                }
                dispatch::expire_waiting(shared);
                if stale(shared, generation) {
                    return DisconnectReason::Superseded;
                }
                if command_timed_out(shared) {
                    debug!("command timeout reached");
                    return DisconnectReason::CommandTimeout;
                }
            }
        }
    }
}

fn take_outbox(shared: &Rc<Shared>) -> Bytes {
    let mut inner = shared.inner.borrow_mut();
    if inner.outbox.is_empty() {
        Bytes::new()
    } else {
        inner.outbox.split().freeze()
    }
}

fn command_timed_out(shared: &Rc<Shared>) -> bool {
    let inner = shared.inner.borrow();
    command_deadline(&inner).is_some_and(|deadline| deadline <= Instant::now())
}

/// Decode and dispatch every complete frame in the read buffer, yielding
/// after each priority-sized batch. Returns `Some` when the loop must end.
async fn pump_frames(
    shared: &Rc<Shared>,
    generation: u64,
    inbuf: &mut BytesMut,
) -> Option<DisconnectReason> {
    let budget = frame_budget(shared.inner.borrow().cfg.priority);
    let mut dispatched = 0usize;
    loop {
        // A frame read on a superseded connection must never reach the
        // current connection's queue.
        if stale(shared, generation) {
            return Some(DisconnectReason::Superseded);
        }
        let frame = {
            let mut cursor = Cursor::new(&inbuf[..]);
            match RespDecoder::decode(&mut cursor) {
                Ok(Some(frame)) => {
                    let consumed = cursor.position() as usize;
                    inbuf.advance(consumed);
                    frame
                }
                Ok(None) => return None,
                Err(err) => return Some(DisconnectReason::Protocol(err.to_string())),
            }
        };

        dispatch::dispatch_frame(shared, frame);
        if stale(shared, generation) {
            return Some(DisconnectReason::Superseded);
        }

        dispatched += 1;
        if dispatched >= budget {
            dispatched = 0;
            tokio::task::yield_now().await;
        }
    }
}
