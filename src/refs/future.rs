use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::hash::Hash;
use std::hash::Hasher;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::group::GroupRef;
use crate::cluster::group::ProcessGroup;
use crate::core::Callable;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::RefId;
use crate::core::RemoteResult;
use crate::core::Value;
use crate::refs::cell::CellAccess;
use crate::refs::handle::HandleKind;
use crate::refs::handle::HandleOrigin;
use crate::refs::handle::RefCore;
use crate::refs::handle::deserialize_handle;
use crate::refs::handle::serialize_handle;
use crate::refs::ops;
use crate::rpc;
use crate::rpc::sysfn::FN_FETCH_REF;
use crate::rpc::sysfn::FN_ISREADY_REF;
use crate::rpc::sysfn::FN_PUT_FUTURE;
use crate::rpc::sysfn::FN_WAIT_REF;

/// A write-once reference to a value that lives (or will live) on `owner`.
///
/// Futures are the result handles of `remotecall`; they can also be created
/// directly and filled with `put` from any node holding the handle. The
/// first observation of the value is cached locally: later fetches return
/// the cache without touching the owner, and the handle's claim on the
/// owner cell is released the moment the cache is written.
pub struct RemoteFuture<T> {
  core: Arc<RefCore>,
  _marker: PhantomData<fn() -> T>,
}

impl<T> RemoteFuture<T> {
  pub(crate) fn from_core(core: Arc<RefCore>) -> Self {
    Self {
      core,
      _marker: PhantomData,
    }
  }

  /// Creates a fresh future whose result cell will live on `owner`.
  pub(crate) fn fresh(group: &GroupRef, owner: NodeId) -> Self {
    let rid: RefId = group.next_ref();

    Self::from_core(ProcessGroup::adopt(
      group,
      HandleOrigin::Fresh,
      HandleKind::Future,
      owner,
      rid,
      None,
    ))
  }

  /// The node owning the backing cell.
  #[inline]
  pub fn owner(&self) -> NodeId {
    self.core.owner()
  }

  /// The cluster-wide identity of this reference.
  #[inline]
  pub fn id(&self) -> RefId {
    self.core.rid()
  }

  fn group(&self) -> &GroupRef {
    self.core.group()
  }
}

impl<T> RemoteFuture<T>
where
  T: Serialize + DeserializeOwned,
{
  /// Assigns the future's value.
  ///
  /// Fails with a reference fault if the future was already set, here or on
  /// any other node.
  pub async fn put(&self, value: &T) -> Result<(), ClusterError> {
    let group: &GroupRef = self.group();
    let me: NodeId = group.my_id();

    // The handle mutex orders the cell write and the cache write, so local
    // fetchers woken by the cell observe the cache populated.
    let _guard = self.core.lock().lock().await;

    if self.core.cache().is_some() {
      return Err(ClusterError::reference("future can only be set once"));
    }

    if self.core.is_local() {
      let encoded: Value = Value::encode(value)?;

      ops::put_future(group, self.id(), Ok(encoded.clone()), me).await?;
      self.core.set_cache_silent(Ok(encoded));
    } else {
      let encoded: Value = Value::encode_to(group, self.owner(), value)?;
      let args: Value = Value::encode(&(self.id(), &encoded, me))?;

      rpc::call_fetch_value(group, Callable::func(FN_PUT_FUTURE), self.owner(), args).await?;
      // The owner removed this node from the clientset as part of the put.
      self.core.set_cache_silent(Ok(encoded));
    }

    Ok(())
  }

  /// Returns the future's value, waiting for it to be assigned.
  ///
  /// The first successful observation caches the value (or the captured
  /// remote failure); repeated fetches are local and free.
  pub async fn fetch(&self) -> Result<T, ClusterError> {
    if let Some(item) = self.core.cache() {
      return self.unwrap_item(&item.clone());
    }

    let group: &GroupRef = self.group();

    if self.core.is_local() {
      // Wait on the cell first; a local putter holds the handle mutex
      // across its cell write and cache write, so once the mutex is ours
      // the cache reflects any put that woke us.
      let cell: CellAccess = group.lookup_or_create(self.id());
      let item: RemoteResult = cell.chan.fetch().await?;
      let _guard = self.core.lock().lock().await;

      if self.core.cache().is_none() {
        self.core.set_cache(item);
      }
    } else {
      let args: Value = Value::encode(&(self.id(),))?;
      let item: RemoteResult =
        rpc::call_fetch_item(group, Callable::func(FN_FETCH_REF), self.owner(), args).await?;

      // The winner of the cache race issues the del-client; losers defer
      // to whatever was cached first.
      self.core.set_cache(item);
    }

    match self.core.cache() {
      Some(item) => self.unwrap_item(&item.clone()),
      None => Err(ClusterError::reference("future cache disappeared")),
    }
  }

  /// Waits until the future has a value without consuming or caching it.
  pub async fn wait(&self) -> Result<(), ClusterError> {
    if self.core.cache().is_some() {
      return Ok(());
    }

    let group: &GroupRef = self.group();

    if self.core.is_local() {
      ops::wait_ref(group, self.id()).await
    } else {
      let args: Value = Value::encode(&(self.id(),))?;

      rpc::call_fetch_value(group, Callable::func(FN_WAIT_REF), self.owner(), args).await?;
      Ok(())
    }
  }

  /// Waits for the future with a deadline. Returns `false` on timeout.
  pub async fn timed_wait(&self, limit: Duration) -> Result<bool, ClusterError> {
    match tokio::time::timeout(limit, self.wait()).await {
      Ok(result) => result.map(|_| true),
      Err(_) => Ok(false),
    }
  }

  /// Returns `true` once the future has a value.
  pub async fn is_ready(&self) -> Result<bool, ClusterError> {
    if self.core.cache().is_some() {
      return Ok(true);
    }

    let group: &GroupRef = self.group();

    if self.core.is_local() {
      return Ok(ops::isready_ref(group, self.id()));
    }

    let args: Value = Value::encode(&(self.id(),))?;
    let value: Value =
      rpc::call_fetch_value(group, Callable::func(FN_ISREADY_REF), self.owner(), args).await?;

    value.decode()
  }

  fn unwrap_item(&self, item: &RemoteResult) -> Result<T, ClusterError> {
    match item {
      Ok(value) => value.decode_in(self.group()),
      Err(exc) => Err(ClusterError::from_remote(exc.clone())),
    }
  }
}

impl<T> Clone for RemoteFuture<T> {
  fn clone(&self) -> Self {
    Self::from_core(Arc::clone(&self.core))
  }
}

impl<T> PartialEq for RemoteFuture<T> {
  fn eq(&self, other: &Self) -> bool {
    self.id() == other.id()
  }
}

impl<T> Eq for RemoteFuture<T> {}

impl<T> Hash for RemoteFuture<T> {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.id().hash(state);
  }
}

impl<T> Debug for RemoteFuture<T> {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    Display::fmt(self, f)
  }
}

impl<T> Display for RemoteFuture<T> {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(
      f,
      "Future({}, {}, {})",
      self.owner(),
      self.id().whence,
      self.id().id,
    )
  }
}

impl<T> Serialize for RemoteFuture<T> {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serialize_handle(&self.core, serializer)
  }
}

impl<'de, T> Deserialize<'de> for RemoteFuture<T> {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    deserialize_handle(HandleKind::Future, deserializer).map(Self::from_core)
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::cluster::group::GroupRef;
  use crate::cluster::group::ProcessGroup;
  use crate::core::NodeId;
  use crate::core::Role;
  use crate::refs::future::RemoteFuture;

  fn group() -> GroupRef {
    ProcessGroup::spawn(NodeId::MASTER, Role::Master)
  }

  #[tokio::test]
  async fn test_identity() {
    let group: GroupRef = group();
    let lhs: RemoteFuture<u32> = RemoteFuture::fresh(&group, NodeId::MASTER);
    let rhs: RemoteFuture<u32> = lhs.clone();

    assert_eq!(lhs, rhs);
    assert_ne!(lhs, RemoteFuture::fresh(&group, NodeId::MASTER));
  }

  #[tokio::test]
  async fn test_local_single_assignment() {
    let group: GroupRef = group();
    let future: RemoteFuture<u32> = RemoteFuture::fresh(&group, NodeId::MASTER);

    future.put(&7).await.unwrap();

    let error = future.put(&8).await.unwrap_err();

    assert_eq!(error.kind(), crate::core::FaultKind::Reference);
    assert_eq!(future.fetch().await.unwrap(), 7);
    assert_eq!(future.fetch().await.unwrap(), 7);
  }

  #[tokio::test]
  async fn test_local_fetch_blocks_until_put() {
    let group: GroupRef = group();
    let future: RemoteFuture<u32> = RemoteFuture::fresh(&group, NodeId::MASTER);
    let fetcher = {
      let future: RemoteFuture<u32> = future.clone();

      tokio::spawn(async move { future.fetch().await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!fetcher.is_finished());

    future.put(&9).await.unwrap();
    assert_eq!(fetcher.await.unwrap().unwrap(), 9);
  }

  #[tokio::test]
  async fn test_is_ready() {
    let group: GroupRef = group();
    let future: RemoteFuture<u32> = RemoteFuture::fresh(&group, NodeId::MASTER);

    assert!(!future.is_ready().await.unwrap());
    future.put(&1).await.unwrap();
    assert!(future.is_ready().await.unwrap());
  }
}
