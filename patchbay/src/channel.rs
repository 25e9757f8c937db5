//! Blocking call/reply transport over a [`Wire`].
//!
//! Any number of local threads may issue calls concurrently; the physical
//! send path is serialized so frames never interleave, while each caller
//! blocks independently for its own reply, matched by a per-call
//! correlation number. A single receive loop demultiplexes inbound frames:
//! replies unblock their waiting senders, calls queue for dispatch.
//!
//! Inbound dispatch is single-threaded by construction — it is a token
//! owned by one chain at a time — but a thread blocked for its reply will
//! service inbound calls it is entitled to, so a dispatched handler can
//! itself call back across the same connection without deadlock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use patchbay_proto::{
    read_frame_limited, read_hello, write_frame, write_hello, ByteOrder, Frame, FrameKind,
    Message, MessageEncoder, MessageId, OwnedMessage, WireError, KEY_ERROR, MAX_FRAME,
};
use tracing::{debug, trace, warn};

use crate::dispatch::InboundHandler;
use crate::error::{Error, Result};
use crate::wire::{Wire, WireShutdown};

/// Connection-level tuning.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Upper bound accepted for one inbound frame payload.
    max_frame: u32,
}

impl ChannelConfig {
    /// Defaults: frame payloads up to the protocol maximum.
    pub const fn new() -> Self {
        Self {
            max_frame: MAX_FRAME,
        }
    }

    /// Caps inbound frame payloads below the protocol maximum. A peer
    /// frame over the cap is treated as a connection failure.
    pub const fn max_frame(mut self, limit: u32) -> Self {
        self.max_frame = limit;
        self
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// One queued inbound call awaiting dispatch.
struct InboundCall {
    /// Raw operation ID from the frame header.
    id: i32,
    /// Correlation number to echo in the reply frame.
    seq: u32,
    /// Decoded argument payload.
    body: OwnedMessage,
}

/// Reply slot for one outstanding call.
enum PendingReply {
    /// The caller is blocked; no reply yet.
    Waiting,
    /// The reply landed and awaits pickup by its caller.
    Ready(OwnedMessage),
}

/// State guarded by the channel mutex.
struct ChannelState {
    /// Peer byte order; `None` until the hello exchange completes.
    order: Option<ByteOrder>,
    /// Outstanding calls by correlation number.
    pending: HashMap<u32, PendingReply>,
    /// Inbound calls awaiting dispatch.
    inbound: VecDeque<InboundCall>,
    /// True while some thread owns the dispatch chain.
    dispatching: bool,
    /// The thread owning the active dispatch chain.
    dispatch_owner: Option<ThreadId>,
    /// Set once the connection has failed or been closed.
    closed: bool,
}

/// Connection state shared by all channel handles and service threads.
struct Shared {
    /// Serializes physical frame transmission.
    writer: Mutex<Box<dyn Write + Send>>,
    /// Routing, queueing, and teardown state.
    state: Mutex<ChannelState>,
    /// Woken on reply arrival, inbound queueing, dispatch-token release,
    /// handshake completion, and teardown.
    wake: Condvar,
    /// Next correlation number; wrapping is harmless because a number is
    /// only live while its call is outstanding.
    next_seq: AtomicU32,
    /// Unblocks the receive loop during teardown.
    shutdown: WireShutdown,
    /// Services inbound calls.
    handler: Arc<dyn InboundHandler>,
    /// Inbound frame payload bound.
    max_frame: u32,
}

impl Shared {
    /// Locks channel state, surviving poisoning so teardown can proceed
    /// even if a handler panicked on another thread.
    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Synchronous call/reply endpoint over one wire connection.
///
/// Cloning yields another handle to the same connection; all handles share
/// the send path, the receive loop, and teardown state. The connection
/// stays alive until [`close`](Self::close) is called or the wire fails.
#[derive(Clone)]
pub struct Channel {
    /// Shared connection state.
    shared: Arc<Shared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

impl Channel {
    /// Opens a channel over `wire` with default configuration.
    pub fn open<W: Wire>(wire: W, handler: Arc<dyn InboundHandler>) -> Result<Self> {
        Self::open_with(wire, handler, ChannelConfig::default())
    }

    /// Opens a channel over `wire`, spawning its receive and dispatch
    /// threads.
    ///
    /// Our hello goes out immediately; the peer's hello is consumed by the
    /// receive loop, so both ends of an in-process stream pair can open
    /// without deadlocking each other.
    pub fn open_with<W: Wire>(
        wire: W,
        handler: Arc<dyn InboundHandler>,
        config: ChannelConfig,
    ) -> Result<Self> {
        let (reader, mut writer, shutdown) = wire.split()?;
        write_hello(&mut writer)?;

        let shared = Arc::new(Shared {
            writer: Mutex::new(Box::new(writer)),
            state: Mutex::new(ChannelState {
                order: None,
                pending: HashMap::new(),
                inbound: VecDeque::new(),
                dispatching: false,
                dispatch_owner: None,
                closed: false,
            }),
            wake: Condvar::new(),
            next_seq: AtomicU32::new(0),
            shutdown,
            handler,
            max_frame: config.max_frame,
        });

        let recv = Arc::clone(&shared);
        thread::Builder::new()
            .name("patchbay-recv".into())
            .spawn(move || receive_loop(&recv, reader))?;

        let disp = Arc::clone(&shared);
        thread::Builder::new()
            .name("patchbay-dispatch".into())
            .spawn(move || dispatch_loop(&disp))?;

        Ok(Self { shared })
    }

    /// Creates an encoder for a fresh outgoing message.
    pub fn encoder<'a>(&self) -> MessageEncoder<'a> {
        MessageEncoder::new()
    }

    /// Sends `args` as operation `id` and blocks until the peer's reply.
    ///
    /// The message is consumed — there is no way to mutate it once the
    /// send has begun. Concurrent callers are serialized on the wire but
    /// block independently, each for its own reply. A call issued from
    /// inside a dispatch handler interleaves with inbound traffic instead
    /// of deadlocking the connection.
    ///
    /// The reply may be logically empty (a void acknowledgement); an
    /// error-marked reply is surfaced by [`RemoteCaller`](crate::RemoteCaller)
    /// rather than here.
    pub fn call(&self, id: MessageId, args: Message<'_>) -> Result<OwnedMessage> {
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut st = self.shared.lock_state();
            if st.closed {
                return Err(Error::Disconnected);
            }
            st.pending.insert(seq, PendingReply::Waiting);
        }

        let frame = Frame {
            kind: FrameKind::Call,
            seq,
            id: id.raw(),
            body: args,
        };
        if let Err(e) = write_locked(&self.shared, &frame) {
            self.shared.lock_state().pending.remove(&seq);
            // Encode-time rejections (oversized frame, too-deep nesting)
            // leave the stream untouched; an I/O failure means the
            // connection is gone.
            if matches!(e, Error::Io(_) | Error::Wire(WireError::Io(_))) {
                teardown(&self.shared);
                return Err(Error::Disconnected);
            }
            return Err(e);
        }
        trace!(%id, seq, "call sent");
        self.wait_reply(seq)
    }

    /// Reports whether the peer shares our byte order, blocking until the
    /// connection handshake has completed.
    pub fn endianness_matches(&self) -> Result<bool> {
        let mut st = self.shared.lock_state();
        loop {
            if let Some(order) = st.order {
                return Ok(order == ByteOrder::Native);
            }
            if st.closed {
                return Err(Error::Disconnected);
            }
            st = self
                .shared
                .wake
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Tears the connection down: every blocked call unblocks with
    /// [`Error::Disconnected`], the peer observes EOF, and both service
    /// threads exit.
    pub fn close(&self) {
        debug!("channel closing");
        teardown(&self.shared);
    }

    /// Blocks until the reply for `seq` arrives, servicing inbound calls
    /// this thread is entitled to while parked.
    fn wait_reply(&self, seq: u32) -> Result<OwnedMessage> {
        let me = thread::current().id();
        let mut st = self.shared.lock_state();
        loop {
            if matches!(st.pending.get(&seq), Some(PendingReply::Ready(_))) {
                let Some(PendingReply::Ready(body)) = st.pending.remove(&seq) else {
                    unreachable!("slot checked above")
                };
                return Ok(body);
            }
            if st.closed {
                st.pending.remove(&seq);
                return Err(Error::Disconnected);
            }
            if !st.inbound.is_empty() && may_dispatch(&st, me) {
                st = service_next(&self.shared, st, me);
            } else {
                st = self
                    .shared
                    .wake
                    .wait(st)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

/// Whether `thread` may pop an inbound call right now. Dispatch is a token
/// owned by one chain at a time, re-enterable only by the owning thread —
/// that keeps inbound delivery non-concurrent while still letting a
/// blocked handler service the nested calls its own chain produces.
fn may_dispatch(st: &ChannelState, thread: ThreadId) -> bool {
    !st.dispatching || st.dispatch_owner == Some(thread)
}

/// Pops one inbound call, claims the dispatch token, services the call
/// without the lock held, then restores the token.
fn service_next<'a>(
    shared: &'a Shared,
    mut st: MutexGuard<'a, ChannelState>,
    me: ThreadId,
) -> MutexGuard<'a, ChannelState> {
    let Some(call) = st.inbound.pop_front() else {
        return st;
    };
    let prev = (st.dispatching, st.dispatch_owner);
    st.dispatching = true;
    st.dispatch_owner = Some(me);
    drop(st);

    service(shared, &call);

    let mut st = shared.lock_state();
    (st.dispatching, st.dispatch_owner) = prev;
    shared.wake.notify_all();
    st
}

/// Runs the handler for one inbound call and sends its reply frame.
///
/// A handler error becomes a well-formed error-marked reply; an unset
/// reply encoder becomes a valid empty reply. Either way the caller is
/// unblocked and the receive machinery survives.
fn service(shared: &Shared, call: &InboundCall) {
    let decoder = call.body.decoder();
    let mut reply = MessageEncoder::new();
    let body = match MessageId::new(call.id) {
        Ok(id) => match shared.handler.handle(id, &decoder, &mut reply) {
            Ok(()) => reply.finish(),
            Err(e) => {
                debug!(id = call.id, error = %e, "dispatch failed");
                error_reply(&e.to_string())
            }
        },
        Err(_) => error_reply(&format!("invalid operation ID {}", call.id)),
    };

    let frame = Frame {
        kind: FrameKind::Reply,
        seq: call.seq,
        id: 0,
        body,
    };
    if let Err(e) = write_locked(shared, &frame) {
        // The receive loop will observe the broken wire and tear down.
        warn!(seq = call.seq, error = %e, "failed to send reply");
    }
}

/// Builds the well-formed reply reporting a failed dispatch.
fn error_reply(message: &str) -> OwnedMessage {
    let mut enc = MessageEncoder::new();
    if enc.append_str(KEY_ERROR, message).is_err() {
        // Failure text contained a NUL; fall back to a fixed marker so
        // the caller still sees a failed call, not a void success.
        let _ = enc.append_str(KEY_ERROR, "dispatch failed");
    }
    enc.finish()
}

/// Serializes one frame onto the wire under the writer lock, so frames
/// from concurrent senders never interleave.
fn write_locked(shared: &Shared, frame: &Frame<'_>) -> Result<()> {
    let mut writer = shared
        .writer
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    write_frame(&mut **writer, frame)?;
    Ok(())
}

/// Marks the connection failed, wakes every blocked thread, and shuts the
/// wire down so the receive loop cannot stay parked in a read.
fn teardown(shared: &Shared) {
    {
        let mut st = shared.lock_state();
        if st.closed {
            return;
        }
        st.closed = true;
        // A reply that already landed belongs to its caller: the call
        // completed remotely, so the waiter still collects it. Only calls
        // still waiting fail.
        st.pending
            .retain(|_, slot| matches!(slot, PendingReply::Ready(_)));
        st.inbound.clear();
    }
    shared.wake.notify_all();
    if let Err(e) = (shared.shutdown)() {
        trace!(error = %e, "wire shutdown during teardown");
    }
}

/// Receive loop: completes the handshake, then routes replies to their
/// blocked callers and queues inbound calls for dispatch. This is the only
/// thread that reads the wire, which is what guarantees single-threaded
/// delivery of inbound frames.
fn receive_loop(shared: &Shared, mut reader: impl Read) {
    let order = match read_hello(&mut reader) {
        Ok(order) => order,
        Err(e) => {
            warn!(error = %e, "handshake failed");
            teardown(shared);
            return;
        }
    };
    {
        let mut st = shared.lock_state();
        st.order = Some(order);
    }
    shared.wake.notify_all();
    debug!(?order, "connection established");

    loop {
        match read_frame_limited(&mut reader, order, shared.max_frame) {
            Ok(frame) => match frame.kind {
                FrameKind::Reply => {
                    let mut st = shared.lock_state();
                    if let Some(slot) = st.pending.get_mut(&frame.seq) {
                        trace!(seq = frame.seq, "reply delivered");
                        *slot = PendingReply::Ready(frame.body);
                        drop(st);
                        shared.wake.notify_all();
                    } else {
                        warn!(seq = frame.seq, "reply for unknown call dropped");
                    }
                }
                FrameKind::Call => {
                    trace!(seq = frame.seq, id = frame.id, "inbound call queued");
                    let mut st = shared.lock_state();
                    st.inbound.push_back(InboundCall {
                        id: frame.id,
                        seq: frame.seq,
                        body: frame.body,
                    });
                    drop(st);
                    shared.wake.notify_all();
                }
            },
            Err(e) => {
                match &e {
                    WireError::Io(io) if io.kind() == ErrorKind::UnexpectedEof => {
                        debug!("peer closed the connection");
                    }
                    other => warn!(error = %other, "receive failed"),
                }
                teardown(shared);
                return;
            }
        }
    }
}

/// Dispatch thread: services inbound calls whenever no other thread owns
/// the dispatch chain, and exits on teardown.
fn dispatch_loop(shared: &Shared) {
    let me = thread::current().id();
    let mut st = shared.lock_state();
    loop {
        if st.closed {
            return;
        }
        if !st.inbound.is_empty() && may_dispatch(&st, me) {
            st = service_next(shared, st, me);
        } else {
            st = shared
                .wake
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
