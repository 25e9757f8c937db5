//! Blocking cross-process call/reply bridge with instance routing.
//!
//! `patchbay` connects two processes that need to drive each other's
//! objects synchronously — the shape of a host application talking to a
//! plug-in it has moved out of process. Either side can originate a call
//! at any time; every call blocks its sending thread until the peer
//! replies, and a handler servicing an inbound call may itself call back
//! across the same connection without deadlocking it.
//!
//! Messages are the self-describing typed payloads of
//! [`patchbay_proto`]; operations are named by [`MessageId`]s agreed
//! between the two sides, and calls addressed to a particular remote
//! object carry an opaque [`InstanceRef`] minted by the object's owner.
//!
//! # Quick start — echo over a socket pair
//!
//! ```no_run
//! use std::os::unix::net::UnixStream;
//! use std::sync::Arc;
//!
//! use patchbay::{Channel, Dispatcher, MessageId, RemoteCaller};
//!
//! let echo = MessageId::new(1)?;
//! let (host_sock, plugin_sock) = UnixStream::pair()?;
//!
//! // Plug-in side: answer ECHO by copying the argument back.
//! let ops = Dispatcher::<()>::new();
//! ops.on(echo, |args, reply| {
//!     if let Some(text) = args.read_str(0) {
//!         reply.append_str(0, text)?;
//!     }
//!     Ok(())
//! });
//! let plugin = Channel::open(plugin_sock, Arc::new(ops))?;
//!
//! // Host side: no inbound operations, just calls out.
//! let host = Channel::open(host_sock, Arc::new(Dispatcher::<()>::new()))?;
//! let caller = RemoteCaller::unbound(host.clone());
//! let reply = caller.call(
//!     echo,
//!     |enc| enc.append_str(0, "ping"),
//!     |dec| dec.read_str(0).map(str::to_owned),
//! )?;
//! assert_eq!(reply.as_deref(), Some("ping"));
//!
//! host.close();
//! plugin.close();
//! # Ok::<(), patchbay::Error>(())
//! ```

mod caller;
mod channel;
mod dispatch;
mod error;
mod wire;

pub use caller::RemoteCaller;
pub use channel::{Channel, ChannelConfig};
pub use dispatch::{DispatchError, Dispatcher, InboundHandler, InstanceRegistry};
pub use error::{Error, Result};
pub use patchbay_proto::{
    InstanceRef, Message, MessageDecoder, MessageEncoder, MessageId, MessageKey, OwnedMessage,
    Value,
};
pub use wire::{Wire, WireShutdown};
