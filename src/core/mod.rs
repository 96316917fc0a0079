//! Core types of the weft runtime.

mod error;
mod types;
mod value;

pub use self::error::Captured;
pub use self::error::ClusterError;
pub use self::error::FaultKind;
pub use self::error::RemoteException;
pub use self::error::RemoteResult;

pub use self::types::NodeId;
pub use self::types::RefId;
pub use self::types::Role;

pub use self::value::Callable;
pub use self::value::Value;

pub(crate) use self::types::RefSource;
pub(crate) use self::value::EncodeScope;
pub(crate) use self::value::decode_scope;
pub(crate) use self::value::encode_scope;
pub(crate) use self::value::with_decode_scope;
pub(crate) use self::value::with_encode_scope;
