//! Fault model of the weft runtime.

mod fault;
mod remote;

pub use self::fault::ClusterError;
pub use self::fault::FaultKind;
pub use self::remote::Captured;
pub use self::remote::RemoteException;
pub use self::remote::RemoteResult;
