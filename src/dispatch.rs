//! Reply dispatcher: routes decoded frames to queued entries, invokes
//! continuations, and advances the queues.
//!
//! Every path through user code follows the same discipline: take the
//! callback out of the shared state, drop the borrow, invoke under the
//! lifecycle guard, then re-borrow and reconcile. Continuations may submit,
//! cancel, disconnect, reconnect or drop the client; the reconciliation
//! step looks entries up by id and tolerates any of that.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::{finish_shutdown, ConnState, Shared};
use crate::core::error::{CommandError, RedisError};
use crate::core::value::Reply;
use crate::protocol::{self, RespFrame};
use crate::queue::ReplyCallback;

/// Invoke a continuation under the guard. Panics are contained and logged;
/// a deferred destruction is completed when this was the last frame out.
pub(crate) fn invoke_callback(
    shared: &Rc<Shared>,
    cb: &mut ReplyCallback,
    result: Result<Reply, CommandError>,
) {
    shared.guard.enter();
    if catch_unwind(AssertUnwindSafe(|| cb(result))).is_err() {
        warn!("command continuation panicked");
    }
    if shared.guard.leave() {
        finish_shutdown(shared);
    }
}

/// Fire the `on_error` handler, or log when none is installed.
pub(crate) fn fire_error(shared: &Rc<Shared>, err: RedisError) {
    let taken = shared.inner.borrow_mut().handlers.on_error.take();
    let Some(mut cb) = taken else {
        debug!(%err, "connection error (no handler installed)");
        return;
    };
    shared.guard.enter();
    if catch_unwind(AssertUnwindSafe(|| cb(err))).is_err() {
        warn!("error handler panicked");
    }
    restore_error_handler(shared, cb);
    if shared.guard.leave() {
        finish_shutdown(shared);
    }
}

fn restore_error_handler(shared: &Rc<Shared>, cb: crate::client::ErrorHandler) {
    if shared.guard.closed() {
        return;
    }
    let mut inner = shared.inner.borrow_mut();
    // The handler may have been replaced from inside itself; the newest
    // installation wins.
    if inner.handlers.on_error.is_none() {
        inner.handlers.on_error = Some(cb);
    }
}

/// Fire `on_connect` or `on_disconnect`.
pub(crate) fn fire_connect(shared: &Rc<Shared>) {
    fire_event(shared, true);
}

pub(crate) fn fire_disconnect(shared: &Rc<Shared>) {
    fire_event(shared, false);
}

fn fire_event(shared: &Rc<Shared>, connect: bool) {
    let taken = {
        let mut inner = shared.inner.borrow_mut();
        if connect {
            inner.handlers.on_connect.take()
        } else {
            inner.handlers.on_disconnect.take()
        }
    };
    let Some(mut cb) = taken else { return };
    shared.guard.enter();
    if catch_unwind(AssertUnwindSafe(|| cb())).is_err() {
        warn!("lifecycle handler panicked");
    }
    if !shared.guard.closed() {
        let mut inner = shared.inner.borrow_mut();
        let slot = if connect {
            &mut inner.handlers.on_connect
        } else {
            &mut inner.handlers.on_disconnect
        };
        if slot.is_none() {
            *slot = Some(cb);
        }
    }
    if shared.guard.leave() {
        finish_shutdown(shared);
    }
}

/// Route a RESP3 push frame to the push handler. Consumes no queue entry.
fn fire_push(shared: &Rc<Shared>, frame: RespFrame) {
    let taken = shared.inner.borrow_mut().handlers.on_push.take();
    let Some(mut cb) = taken else {
        debug!("push frame dropped (no handler installed)");
        return;
    };
    let reply = Reply::from(frame);
    shared.guard.enter();
    if catch_unwind(AssertUnwindSafe(|| cb(reply))).is_err() {
        warn!("push handler panicked");
    }
    if !shared.guard.closed() {
        let mut inner = shared.inner.borrow_mut();
        if inner.handlers.on_push.is_none() {
            inner.handlers.on_push = Some(cb);
        }
    }
    if shared.guard.leave() {
        finish_shutdown(shared);
    }
}

/// Dispatch one decoded frame from the wire.
pub(crate) fn dispatch_frame(shared: &Rc<Shared>, frame: RespFrame) {
    if shared.guard.closed() {
        return;
    }

    let subscription = protocol::is_subscription_frame(&frame);
    if matches!(frame, RespFrame::Push(_)) && !subscription {
        fire_push(shared, frame);
        return;
    }

    let target = {
        let inner = shared.inner.borrow();
        if inner.state == ConnState::Connected {
            inner.queue.route_target(subscription)
        } else {
            None
        }
    };
    let Some(id) = target else {
        debug!("reply with no matching pending entry");
        return;
    };

    let unsubscribe = protocol::is_unsubscribe_marker(&frame);

    let (mut cb, persist) = {
        let mut inner = shared.inner.borrow_mut();
        let Some(entry) = inner.queue.find(id) else {
            return;
        };
        if entry.skipped {
            // Cancelled entries absorb their replies without surfacing
            // them; persistent ones drain one marker per channel.
            if entry.persist {
                if unsubscribe {
                    entry.sub_count = entry.sub_count.saturating_sub(1);
                    if entry.sub_count == 0 {
                        inner.queue.remove(id);
                    }
                }
            } else {
                inner.queue.remove(id);
            }
            return;
        }
        let Some(cb) = entry.cb.take() else { return };
        (cb, entry.persist)
    };

    shared.guard.set_current(id);
    let errored = matches!(frame, RespFrame::Error(_) | RespFrame::BulkError(_));
    let result = match frame {
        RespFrame::Error(text) | RespFrame::BulkError(text) => Err(CommandError::Server(text)),
        other => Ok(Reply::from(other)),
    };
    invoke_callback(shared, &mut cb, result);
    shared.guard.set_current(0);
    if shared.guard.closed() {
        return;
    }

    {
        let mut inner = shared.inner.borrow_mut();
        let mut finished = true;
        if let Some(entry) = inner.queue.find(id) {
            // An error reply to a subscribe entry means the subscription
            // never existed; only real markers keep the entry alive.
            if persist && !errored && !entry.skipped {
                if unsubscribe {
                    entry.sub_count = entry.sub_count.saturating_sub(1);
                    if entry.sub_count > 0 {
                        entry.cb = Some(cb);
                        finished = false;
                    }
                } else {
                    entry.cb = Some(cb);
                    finished = false;
                }
            }
            if finished {
                inner.queue.remove(id);
            }
        }
    }

    drain_waiting(shared);
}

/// Promote waiting entries while a slot is free. Preconditions are
/// recomputed every iteration because the connection state can change
/// between promotions.
pub(crate) fn drain_waiting(shared: &Rc<Shared>) {
    let mut promoted = false;
    loop {
        let mut inner = shared.inner.borrow_mut();
        if shared.guard.closed() || inner.state != ConnState::Connected {
            return;
        }
        let max = inner.cfg.max_pending;
        if max > 0 && inner.queue.pending_count >= max as usize {
            break;
        }
        let Some(entry) = inner.queue.waiting.pop_front() else {
            break;
        };
        protocol::encode_command(&entry.args, &mut inner.outbox);
        inner.queue.push_pending(entry.cb, entry.persist, entry.sub_count);
        promoted = true;
    }
    if promoted {
        shared.wake.notify_one();
    }
}

/// Expire waiting entries whose age reached the waiting timeout. FIFO
/// monotonicity lets the walk stop at the first non-expired entry.
pub(crate) fn expire_waiting(shared: &Rc<Shared>) {
    if !shared.guard.begin_waiting_cleanup() {
        return;
    }
    loop {
        let expired = {
            let mut inner = shared.inner.borrow_mut();
            let Some(limit) = inner.cfg.waiting_timeout else {
                break;
            };
            let now = Instant::now();
            let due = inner
                .queue
                .waiting
                .front()
                .is_some_and(|front| front.queued_at + limit <= now);
            if !due {
                break;
            }
            inner.queue.waiting.pop_front()
        };
        let Some(entry) = expired else { break };
        let mut cb = entry.cb;
        invoke_callback(shared, &mut cb, Err(CommandError::WaitingTimeout));
    }
    shared.guard.end_waiting_cleanup();
}

/// Fail every waiting entry with `err`. Used by cancellation, disconnects
/// and destruction; re-entrant calls short-circuit.
pub(crate) fn fail_waiting(shared: &Rc<Shared>, err: &CommandError) {
    if !shared.guard.begin_waiting_cleanup() {
        return;
    }
    loop {
        let front = shared.inner.borrow_mut().queue.waiting.pop_front();
        let Some(entry) = front else { break };
        let mut cb = entry.cb;
        invoke_callback(shared, &mut cb, Err(err.clone()));
    }
    shared.guard.end_waiting_cleanup();
    // The waiting timer is driven off the queue head; wake the driver so it
    // stops or re-arms.
    shared.wake.notify_one();
}

/// Fail and remove every pending entry. The currently executing entry has
/// no callback to invoke and is simply dropped; its continuation is already
/// running with its own reply.
pub(crate) fn fail_pending(shared: &Rc<Shared>, err: &CommandError) {
    if !shared.guard.begin_pending_cleanup() {
        return;
    }
    loop {
        let front = {
            let mut inner = shared.inner.borrow_mut();
            let entry = inner.queue.pending.pop_front();
            if let Some(ref e) = entry {
                if e.counted {
                    inner.queue.pending_count -= 1;
                }
            }
            entry
        };
        let Some(mut entry) = front else { break };
        if let Some(mut cb) = entry.cb.take() {
            invoke_callback(shared, &mut cb, Err(err.clone()));
        }
    }
    shared.guard.end_pending_cleanup();
}

/// Mark every in-flight entry skipped and deliver the `"skipped"` error
/// now. Entries stay queued so their replies, when they land, are absorbed
/// without violating the reply/entry pairing. The currently executing entry
/// is marked but its own invocation is not cancelled.
pub(crate) fn cancel_pending(shared: &Rc<Shared>) {
    if !shared.guard.begin_pending_cleanup() {
        return;
    }
    let ids: Vec<u64> = {
        let inner = shared.inner.borrow();
        inner
            .queue
            .pending
            .iter()
            .filter(|e| !e.skipped)
            .map(|e| e.id)
            .collect()
    };
    for id in ids {
        let cb = {
            let mut inner = shared.inner.borrow_mut();
            let Some(entry) = inner.queue.find(id) else {
                continue;
            };
            if entry.skipped {
                continue;
            }
            entry.skipped = true;
            let cb = entry.cb.take();
            inner.queue.uncount(id);
            cb
        };
        if id == shared.guard.current() {
            continue;
        }
        if let Some(mut cb) = cb {
            invoke_callback(shared, &mut cb, Err(CommandError::Skipped));
        }
    }
    shared.guard.end_pending_cleanup();
}
