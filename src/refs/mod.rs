//! The remote-reference runtime: handles, owner cells, and distributed GC.

pub(crate) mod cell;
pub(crate) mod chan;
pub(crate) mod channel;
pub(crate) mod future;
pub(crate) mod gc;
pub(crate) mod handle;
pub(crate) mod ops;

pub use self::channel::RemoteChannel;
pub use self::future::RemoteFuture;
