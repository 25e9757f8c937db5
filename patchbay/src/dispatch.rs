//! Receiving-side routing: operation tables and the instance registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use patchbay_proto::{InstanceRef, MessageDecoder, MessageEncoder, MessageId, MessageKey};
use tracing::debug;

/// Why an inbound call could not be serviced.
///
/// Every variant reaches the caller as an error-marked reply; the receive
/// machinery itself never dies over a bad call, and a failed dispatch has
/// no partial effect.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// No operation is registered under the message ID.
    #[error("unknown operation ID {0}")]
    UnknownOperation(i32),

    /// The target reference does not name a live local instance — either
    /// it was never minted here or it has been retired.
    #[error("unknown or retired instance ref {0}")]
    UnknownInstance(u64),

    /// A required argument was absent or had the wrong type.
    #[error("missing or mistyped argument for key {0}")]
    MissingArgument(MessageKey),

    /// The operation itself refused the call.
    #[error("{0}")]
    Failed(String),
}

impl From<patchbay_proto::EncodeError> for DispatchError {
    fn from(err: patchbay_proto::EncodeError) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Receiving-side entry point invoked for every inbound call.
///
/// The channel guarantees `handle` is never invoked concurrently with
/// itself, though it may run while other local threads are blocked in
/// their own outbound calls. Returning an error produces an error-marked
/// reply for the caller.
pub trait InboundHandler: Send + Sync {
    /// Services one call: reads arguments from `args` and writes results
    /// into `reply`. Leaving `reply` untouched yields a valid empty reply,
    /// which is how void operations acknowledge completion.
    fn handle(
        &self,
        id: MessageId,
        args: &MessageDecoder<'_>,
        reply: &mut MessageEncoder<'_>,
    ) -> Result<(), DispatchError>;
}

/// Owning-side table mapping minted [`InstanceRef`]s to live objects.
///
/// The ref is the only thing that crosses the process boundary; the peer
/// can do nothing with it except hand it back for lookup here.
#[derive(Debug)]
pub struct InstanceRegistry<T> {
    /// Handle counter and live table, under one lock.
    inner: Mutex<RegistryInner<T>>,
}

/// Mutable registry state.
#[derive(Debug)]
struct RegistryInner<T> {
    /// Next handle to mint. Starts at 1 so 0 never names an instance.
    next: u64,
    /// Live instances by raw handle.
    map: HashMap<u64, Arc<T>>,
}

impl<T> InstanceRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                next: 1,
                map: HashMap::new(),
            }),
        }
    }

    /// Exposes `instance` across the boundary, minting a fresh ref.
    pub fn expose(&self, instance: Arc<T>) -> InstanceRef {
        let mut inner = self.lock();
        let raw = inner.next;
        inner.next += 1;
        inner.map.insert(raw, instance);
        InstanceRef::from_raw(raw)
    }

    /// Looks up a live instance. `None` for refs never minted here or
    /// already retired — the stale-handle protocol error.
    pub fn resolve(&self, r: InstanceRef) -> Option<Arc<T>> {
        self.lock().map.get(&r.raw()).map(Arc::clone)
    }

    /// Invalidates a ref, returning the instance it named. Subsequent
    /// lookups of the same ref fail.
    pub fn retire(&self, r: InstanceRef) -> Option<Arc<T>> {
        self.lock().map.remove(&r.raw())
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    /// `true` if nothing is currently exposed.
    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    /// Locks the registry, surviving poisoning: the table must stay
    /// reachable for teardown even if another thread panicked mid-update.
    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for InstanceRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Operation bound to a target instance.
type TargetOp<T> = Arc<
    dyn Fn(&T, &MessageDecoder<'_>, &mut MessageEncoder<'_>) -> Result<(), DispatchError>
        + Send
        + Sync,
>;

/// Operation with no target (factory-level calls).
type GlobalOp = Arc<
    dyn Fn(&MessageDecoder<'_>, &mut MessageEncoder<'_>) -> Result<(), DispatchError>
        + Send
        + Sync,
>;

/// A registered operation implementation.
enum Op<T> {
    /// Resolved against the instance registry before invocation.
    Target(TargetOp<T>),
    /// Invoked without a target.
    Global(GlobalOp),
}

impl<T> Clone for Op<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Target(f) => Self::Target(Arc::clone(f)),
            Self::Global(f) => Self::Global(Arc::clone(f)),
        }
    }
}

impl<T> std::fmt::Debug for Op<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(_) => f.write_str("Op::Target"),
            Self::Global(_) => f.write_str("Op::Global"),
        }
    }
}

/// Routes inbound calls to operations registered against message IDs,
/// resolving targets through its [`InstanceRegistry`].
///
/// The higher layer owns the call vocabulary: it registers operation
/// implementations here and supplies/consumes instance refs, without ever
/// touching wire bytes.
#[derive(Debug)]
pub struct Dispatcher<T> {
    /// Operation table keyed by raw message ID.
    ops: RwLock<HashMap<i32, Op<T>>>,
    /// Instances this side has exposed across the boundary.
    instances: InstanceRegistry<T>,
}

impl<T: Send + Sync + 'static> Dispatcher<T> {
    /// Creates a dispatcher with no registered operations.
    pub fn new() -> Self {
        Self {
            ops: RwLock::new(HashMap::new()),
            instances: InstanceRegistry::new(),
        }
    }

    /// Registers a target-less operation under `id`.
    pub fn on<F>(&self, id: MessageId, op: F)
    where
        F: Fn(&MessageDecoder<'_>, &mut MessageEncoder<'_>) -> Result<(), DispatchError>
            + Send
            + Sync
            + 'static,
    {
        self.write_ops().insert(id.raw(), Op::Global(Arc::new(op)));
    }

    /// Registers an instance-bound operation under `id`. The dispatch
    /// target is recovered from the reserved instance-ref key and looked
    /// up in this dispatcher's registry before `op` runs.
    pub fn on_instance<F>(&self, id: MessageId, op: F)
    where
        F: Fn(&T, &MessageDecoder<'_>, &mut MessageEncoder<'_>) -> Result<(), DispatchError>
            + Send
            + Sync
            + 'static,
    {
        self.write_ops().insert(id.raw(), Op::Target(Arc::new(op)));
    }

    /// Exposes an instance, minting the ref the peer will call back with.
    pub fn expose(&self, instance: Arc<T>) -> InstanceRef {
        self.instances.expose(instance)
    }

    /// Retires a previously exposed instance; later calls against the
    /// stale ref fail cleanly.
    pub fn retire(&self, r: InstanceRef) -> Option<Arc<T>> {
        self.instances.retire(r)
    }

    /// The underlying instance table.
    pub fn instances(&self) -> &InstanceRegistry<T> {
        &self.instances
    }

    /// Write-locks the operation table, surviving poisoning.
    fn write_ops(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<i32, Op<T>>> {
        self.ops.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetches the operation registered under `id`.
    fn lookup(&self, id: MessageId) -> Option<Op<T>> {
        self.ops
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id.raw())
            .cloned()
    }
}

impl<T: Send + Sync + 'static> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> InboundHandler for Dispatcher<T> {
    fn handle(
        &self,
        id: MessageId,
        args: &MessageDecoder<'_>,
        reply: &mut MessageEncoder<'_>,
    ) -> Result<(), DispatchError> {
        let op = self
            .lookup(id)
            .ok_or(DispatchError::UnknownOperation(id.raw()))?;
        match op {
            Op::Global(f) => f(args, reply),
            Op::Target(f) => {
                let target_ref = args
                    .read_instance_ref()
                    .ok_or(DispatchError::MissingArgument(
                        patchbay_proto::KEY_INSTANCE_REF,
                    ))?;
                let target = self
                    .instances
                    .resolve(target_ref)
                    .ok_or(DispatchError::UnknownInstance(target_ref.raw()))?;
                debug!(%id, %target_ref, "dispatching instance call");
                f(&target, args, reply)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchbay_proto::KEY_INSTANCE_REF;

    fn op(raw: i32) -> MessageId {
        MessageId::new(raw).unwrap()
    }

    #[test]
    fn registry_mints_monotonic_refs() {
        let reg = InstanceRegistry::new();
        let a = reg.expose(Arc::new("a"));
        let b = reg.expose(Arc::new("b"));
        assert_ne!(a, b);
        assert_eq!(reg.resolve(a).as_deref(), Some(&"a"));
        assert_eq!(reg.resolve(b).as_deref(), Some(&"b"));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn retired_ref_is_stale() {
        let reg = InstanceRegistry::new();
        let r = reg.expose(Arc::new(5u32));
        assert_eq!(reg.retire(r).as_deref(), Some(&5));
        assert!(reg.resolve(r).is_none());
        assert!(reg.retire(r).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn zero_ref_never_resolves() {
        let reg = InstanceRegistry::<u32>::new();
        assert!(reg.resolve(InstanceRef::from_raw(0)).is_none());
    }

    #[test]
    fn global_op_round_trip() {
        let disp = Dispatcher::<()>::new();
        disp.on(op(10), |args, reply| {
            let v = args
                .read_i64(0)
                .ok_or(DispatchError::MissingArgument(0))?;
            reply.append_i64(0, v * 2)?;
            Ok(())
        });

        let mut enc = MessageEncoder::new();
        enc.append_i64(0, 21).unwrap();
        let msg = enc.finish();

        let mut reply = MessageEncoder::new();
        disp.handle(op(10), &msg.decoder(), &mut reply).unwrap();
        assert_eq!(reply.finish().decoder().read_i64(0), Some(42));
    }

    #[test]
    fn unknown_operation_reported() {
        let disp = Dispatcher::<()>::new();
        let msg = MessageEncoder::new().finish();
        let mut reply = MessageEncoder::new();
        let err = disp.handle(op(99), &msg.decoder(), &mut reply).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownOperation(99)));
    }

    #[test]
    fn instance_op_resolves_target() {
        struct Gain(f64);
        let disp = Dispatcher::<Gain>::new();
        disp.on_instance(op(20), |gain, args, reply| {
            let input = args
                .read_f64(0)
                .ok_or(DispatchError::MissingArgument(0))?;
            reply.append_f64(0, input * gain.0)?;
            Ok(())
        });
        let r = disp.expose(Arc::new(Gain(0.5)));

        let mut enc = MessageEncoder::new();
        enc.append_size(KEY_INSTANCE_REF, r.raw()).unwrap();
        enc.append_f64(0, 8.0).unwrap();
        let msg = enc.finish();

        let mut reply = MessageEncoder::new();
        disp.handle(op(20), &msg.decoder(), &mut reply).unwrap();
        assert_eq!(reply.finish().decoder().read_f64(0), Some(4.0));
    }

    #[test]
    fn missing_target_ref_reported() {
        let disp = Dispatcher::<u8>::new();
        disp.on_instance(op(21), |_, _, _| Ok(()));

        let msg = MessageEncoder::new().finish();
        let mut reply = MessageEncoder::new();
        let err = disp.handle(op(21), &msg.decoder(), &mut reply).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::MissingArgument(KEY_INSTANCE_REF)
        ));
    }

    #[test]
    fn stale_target_ref_reported() {
        let disp = Dispatcher::<u8>::new();
        disp.on_instance(op(22), |_, _, _| Ok(()));
        let r = disp.expose(Arc::new(1));
        disp.retire(r);

        let mut enc = MessageEncoder::new();
        enc.append_size(KEY_INSTANCE_REF, r.raw()).unwrap();
        let msg = enc.finish();

        let mut reply = MessageEncoder::new();
        let err = disp.handle(op(22), &msg.decoder(), &mut reply).unwrap_err();
        assert!(matches!(err, DispatchError::UnknownInstance(_)));
    }
}
