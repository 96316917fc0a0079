use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use triomphe::Arc;

use crate::cluster::group::GroupRef;
use crate::core::Callable;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::Role;
use crate::core::Value;
use crate::net::LinkCounters;
use crate::pool;
use crate::pool::WorkerPool;
use crate::refs::channel::RemoteChannel;
use crate::refs::future::RemoteFuture;
use crate::rpc;

/// A cluster as seen from one node in one role.
///
/// All cluster-facing operations hang off a view: remote calls, handle
/// creation, and pool access. Views are cheap to clone and share the
/// underlying group.
#[derive(Clone)]
pub struct ClusterView {
  group: GroupRef,
}

impl ClusterView {
  pub(crate) fn new(group: GroupRef) -> Self {
    Self { group }
  }

  #[inline]
  pub(crate) fn group(&self) -> &GroupRef {
    &self.group
  }

  /// This node's id in the viewed cluster.
  #[inline]
  pub fn my_id(&self) -> NodeId {
    self.group.my_id()
  }

  /// The role this view plays on its node.
  #[inline]
  pub fn role(&self) -> Role {
    self.group.tag()
  }

  /// All process ids, this node included, in id order.
  pub fn procs(&self) -> Vec<NodeId> {
    self.group.procs()
  }

  /// All worker ids; the master alone when no workers joined yet.
  pub fn workers(&self) -> Vec<NodeId> {
    self.group.workers()
  }

  /// Number of owner cells this node currently backs.
  pub fn refs_len(&self) -> usize {
    self.group.refs_len()
  }

  /// Traffic counters of the link to `pid`, if one exists.
  pub fn counters(&self, pid: NodeId) -> Option<Arc<LinkCounters>> {
    self
      .group
      .peer(pid)
      .ok()
      .map(|peer| Arc::clone(peer.counters()))
  }

  // ---------------------------------------------------------------------------
  // Handles
  // ---------------------------------------------------------------------------

  /// Creates an unset future whose value cell will live on `owner`.
  pub fn future<T>(&self, owner: NodeId) -> RemoteFuture<T> {
    RemoteFuture::fresh(&self.group, owner)
  }

  /// Creates a single-slot remote channel on `owner`.
  pub async fn remote_channel<T>(&self, owner: NodeId) -> Result<RemoteChannel<T>, ClusterError>
  where
    T: Serialize + DeserializeOwned,
  {
    self.remote_channel_with(owner, Some(1)).await
  }

  /// Creates a remote channel on `owner` with an explicit capacity.
  ///
  /// `None` is unbounded; `Some(0)` is a rendezvous channel whose puts
  /// complete only when taken.
  pub async fn remote_channel_with<T>(
    &self,
    owner: NodeId,
    capacity: Option<usize>,
  ) -> Result<RemoteChannel<T>, ClusterError>
  where
    T: Serialize + DeserializeOwned,
  {
    RemoteChannel::create(&self.group, owner, capacity).await
  }

  // ---------------------------------------------------------------------------
  // RPC
  // ---------------------------------------------------------------------------

  /// Starts `func` on `pid`; returns the future naming its result.
  pub async fn remotecall<A, R>(
    &self,
    func: Callable,
    pid: NodeId,
    args: &A,
  ) -> Result<RemoteFuture<R>, ClusterError>
  where
    A: Serialize + ?Sized,
    R: DeserializeOwned,
  {
    let args: Value = self.encode_args(pid, args)?;

    rpc::remotecall_value(&self.group, func, pid, args).await
  }

  /// Runs `func` on `pid` and returns its value, rethrowing remote
  /// failures after unwrapping them.
  pub async fn remotecall_fetch<A, R>(
    &self,
    func: Callable,
    pid: NodeId,
    args: &A,
  ) -> Result<R, ClusterError>
  where
    A: Serialize + ?Sized,
    R: DeserializeOwned,
  {
    let args: Value = self.encode_args(pid, args)?;
    let value: Value = rpc::call_fetch_value(&self.group, func, pid, args).await?;

    value.decode_in(&self.group)
  }

  /// Starts `func` on `pid` and waits for completion before handing back
  /// the result future.
  pub async fn remotecall_wait<A, R>(
    &self,
    func: Callable,
    pid: NodeId,
    args: &A,
  ) -> Result<RemoteFuture<R>, ClusterError>
  where
    A: Serialize + ?Sized,
    R: DeserializeOwned,
  {
    let args: Value = self.encode_args(pid, args)?;

    rpc::remotecall_wait_value(&self.group, func, pid, args).await
  }

  /// Starts `func` on `pid` without any response channel.
  pub async fn remote_do<A>(
    &self,
    func: Callable,
    pid: NodeId,
    args: &A,
  ) -> Result<(), ClusterError>
  where
    A: Serialize + ?Sized,
  {
    let args: Value = self.encode_args(pid, args)?;

    rpc::remote_do_value(&self.group, func, pid, args).await
  }

  // ---------------------------------------------------------------------------
  // Pools
  // ---------------------------------------------------------------------------

  /// The cluster's default worker pool.
  ///
  /// Built lazily on the master from the current workers; other nodes
  /// fetch a forwarding handle from the master on first use.
  pub async fn default_pool(&self) -> Result<WorkerPool, ClusterError> {
    pool::default_pool(self).await
  }

  fn encode_args<A>(&self, pid: NodeId, args: &A) -> Result<Value, ClusterError>
  where
    A: Serialize + ?Sized,
  {
    if pid == self.my_id() {
      Value::encode(args)
    } else {
      Value::encode_to(&self.group, pid, args)
    }
  }
}

impl Debug for ClusterView {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "ClusterView({} as {})", self.my_id(), self.role())
  }
}
