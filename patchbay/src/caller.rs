//! Sending-side convenience wrapper: typed calls against a remote target.

use patchbay_proto::{
    EncodeError, InstanceRef, MessageDecoder, MessageEncoder, MessageId, KEY_INSTANCE_REF,
};

use crate::channel::Channel;
use crate::error::{Error, Result};

/// Issues calls over a [`Channel`], optionally bound to one remote
/// instance.
///
/// A bound caller stamps its target's ref into every outgoing message
/// under the reserved instance-ref key, so the peer's dispatcher can
/// resolve the call back to the object it belongs to. The ref itself is
/// opaque on this side; it was minted by the peer and only the peer can
/// interpret it.
#[derive(Debug, Clone)]
pub struct RemoteCaller {
    /// Connection the calls travel over.
    channel: Channel,
    /// Remote instance the calls are addressed to, if any.
    target: Option<InstanceRef>,
}

impl RemoteCaller {
    /// Caller for target-less (factory-level) operations.
    pub fn unbound(channel: Channel) -> Self {
        Self {
            channel,
            target: None,
        }
    }

    /// Caller addressing every operation to `target` on the peer side.
    pub fn bound(channel: Channel, target: InstanceRef) -> Self {
        Self {
            channel,
            target: Some(target),
        }
    }

    /// The remote instance this caller is bound to.
    pub fn target(&self) -> Option<InstanceRef> {
        self.target
    }

    /// The underlying connection.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Sends operation `id` and blocks for the reply.
    ///
    /// `append` fills in the arguments; `read` extracts the result from
    /// the reply exactly once, before this method returns. An error-marked
    /// reply is surfaced as [`Error::Remote`] and `read` never runs.
    pub fn call<'a, R>(
        &self,
        id: MessageId,
        append: impl FnOnce(&mut MessageEncoder<'a>) -> std::result::Result<(), EncodeError>,
        read: impl FnOnce(&MessageDecoder<'_>) -> R,
    ) -> Result<R> {
        let mut enc = MessageEncoder::new();
        if let Some(target) = self.target {
            enc.append_size(KEY_INSTANCE_REF, target.raw())?;
        }
        append(&mut enc)?;

        let reply = self.channel.call(id, enc.finish())?;
        let dec = reply.decoder();
        if let Some(message) = dec.read_error() {
            return Err(Error::Remote {
                message: message.to_owned(),
            });
        }
        Ok(read(&dec))
    }

    /// Sends operation `id` and blocks until the peer acknowledges it,
    /// discarding the (empty) reply payload.
    pub fn notify<'a>(
        &self,
        id: MessageId,
        append: impl FnOnce(&mut MessageEncoder<'a>) -> std::result::Result<(), EncodeError>,
    ) -> Result<()> {
        self.call(id, append, |_| ())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::dispatch::{DispatchError, Dispatcher, InboundHandler};
    use patchbay_proto::Message;

    const SCALE: i32 = 30;
    const INCREMENT: i32 = 31;
    const SHUTDOWN_HINT: i32 = 32;

    fn op(raw: i32) -> MessageId {
        MessageId::new(raw).unwrap()
    }

    fn pair(handler: Arc<dyn InboundHandler>) -> (Channel, Channel) {
        let (sa, sb) = UnixStream::pair().unwrap();
        let ca = Channel::open(sa, Arc::new(Dispatcher::<()>::new())).unwrap();
        let cb = Channel::open(sb, handler).unwrap();
        (ca, cb)
    }

    #[test]
    fn typed_call_round_trip() {
        let disp = Dispatcher::<()>::new();
        disp.on(op(SCALE), |args, reply| {
            let v = args
                .read_f64(0)
                .ok_or(DispatchError::MissingArgument(0))?;
            reply.append_f64(0, v * 3.0)?;
            Ok(())
        });
        let (a, b) = pair(Arc::new(disp));

        let caller = RemoteCaller::unbound(a.clone());
        let result = caller
            .call(
                op(SCALE),
                |enc| enc.append_f64(0, 2.5),
                |dec| dec.read_f64(0),
            )
            .unwrap();
        assert_eq!(result, Some(7.5));

        a.close();
        b.close();
    }

    #[test]
    fn notify_acknowledges_void_operations() {
        let disp = Dispatcher::<()>::new();
        disp.on(op(SHUTDOWN_HINT), |_, _| Ok(()));
        let (a, b) = pair(Arc::new(disp));

        let caller = RemoteCaller::unbound(a.clone());
        caller.notify(op(SHUTDOWN_HINT), |_| Ok(())).unwrap();

        a.close();
        b.close();
    }

    #[test]
    fn remote_failure_surfaces_as_remote_error() {
        let (a, b) = pair(Arc::new(Dispatcher::<()>::new()));

        let caller = RemoteCaller::unbound(a.clone());
        let err = caller
            .call(op(SCALE), |_| Ok(()), |_| ())
            .unwrap_err();
        assert!(matches!(err, Error::Remote { .. }));

        a.close();
        b.close();
    }

    #[test]
    fn bound_caller_reaches_its_instance() {
        struct Counter(AtomicI64);

        let disp = Dispatcher::<Counter>::new();
        disp.on_instance(op(INCREMENT), |counter, args, reply| {
            let delta = args
                .read_i64(0)
                .ok_or(DispatchError::MissingArgument(0))?;
            let value = counter.0.fetch_add(delta, Ordering::SeqCst) + delta;
            reply.append_i64(0, value)?;
            Ok(())
        });
        let disp = Arc::new(disp);
        let r = disp.expose(Arc::new(Counter(AtomicI64::new(0))));
        let (a, b) = pair(disp.clone());

        let caller = RemoteCaller::bound(a.clone(), r);
        let incr = |delta: i64| {
            caller.call(
                op(INCREMENT),
                move |enc| enc.append_i64(0, delta),
                |dec| dec.read_i64(0),
            )
        };
        assert_eq!(incr(3).unwrap(), Some(3));
        assert_eq!(incr(4).unwrap(), Some(7));

        // Retiring the instance turns the ref stale; further calls fail
        // cleanly without killing the connection.
        disp.retire(r);
        assert!(matches!(incr(1), Err(Error::Remote { .. })));
        let probe = a.call(op(INCREMENT), Message::new());
        assert!(probe.is_ok());

        a.close();
        b.close();
    }
}
