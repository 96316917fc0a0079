//! Weft - a multiscale distributed-computing runtime
//!
//! Weft manages a cluster of peer worker processes connected by framed
//! bidirectional streams, and offers remote procedure invocation, remote
//! references (write-once futures and channel references), and pooled
//! execution over those workers. Any worker may itself master a subordinate
//! cluster; cluster-facing operations select the process-group view they
//! address through a [`Role`].
//!
//! [`Role`]: crate::types::Role

mod cluster;
mod core;
mod net;
mod pool;
mod refs;
mod rpc;
mod utils;

pub mod consts;

pub use crate::rpc::CallCtx;
pub use crate::rpc::register;

pub mod error {
  //! Weft fault model.

  pub use crate::core::Captured;
  pub use crate::core::ClusterError;
  pub use crate::core::FaultKind;
  pub use crate::core::RemoteException;
  pub use crate::core::RemoteResult;
}

pub mod types {
  //! Core types of the weft runtime.

  pub use crate::core::Callable;
  pub use crate::core::NodeId;
  pub use crate::core::RefId;
  pub use crate::core::Role;
  pub use crate::core::Value;

  pub use crate::refs::RemoteChannel;
  pub use crate::refs::RemoteFuture;

  pub use crate::cluster::ClusterView;
  pub use crate::cluster::LocalCluster;
  pub use crate::cluster::Node;
  pub use crate::cluster::NodeRef;

  pub use crate::net::LinkCounters;

  pub use crate::pool::CachingPool;
  pub use crate::pool::WorkerPool;
}
