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

use crate::cluster::group::GroupRef;
use crate::cluster::group::ProcessGroup;
use crate::core::Callable;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::RefId;
use crate::core::RemoteResult;
use crate::core::Value;
use crate::refs::handle::HandleKind;
use crate::refs::handle::HandleOrigin;
use crate::refs::handle::RefCore;
use crate::refs::handle::deserialize_handle;
use crate::refs::handle::serialize_handle;
use crate::refs::ops;
use crate::rpc;
use crate::rpc::sysfn::FN_CLOSE_REF;
use crate::rpc::sysfn::FN_FETCH_REF;
use crate::rpc::sysfn::FN_ISEMPTY_REF;
use crate::rpc::sysfn::FN_ISOPEN_REF;
use crate::rpc::sysfn::FN_ISREADY_REF;
use crate::rpc::sysfn::FN_MAKE_CHANNEL;
use crate::rpc::sysfn::FN_PUT_REF;
use crate::rpc::sysfn::FN_TAKE_REF;
use crate::rpc::sysfn::FN_WAIT_REF;

/// A reference to a channel whose storage lives on `owner`.
///
/// Unlike a future, a remote channel carries no local cache: every
/// operation consults the owner cell, short-circuiting to direct cell
/// access when the owner is the local node.
pub struct RemoteChannel<T> {
  core: Arc<RefCore>,
  _marker: PhantomData<fn() -> T>,
}

impl<T> RemoteChannel<T> {
  pub(crate) fn from_core(core: Arc<RefCore>) -> Self {
    Self {
      core,
      _marker: PhantomData,
    }
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

  pub(crate) fn group_ref(&self) -> &GroupRef {
    self.core.group()
  }
}

impl<T> RemoteChannel<T>
where
  T: Serialize + DeserializeOwned,
{
  /// Creates the backing cell on `owner` and returns the handle to it.
  ///
  /// Capacity follows the cell-channel convention: `None` is unbounded,
  /// `Some(0)` a rendezvous.
  pub(crate) async fn create(
    group: &GroupRef,
    owner: NodeId,
    capacity: Option<usize>,
  ) -> Result<Self, ClusterError> {
    let rid: RefId = group.next_ref();

    if owner == group.my_id() {
      ops::make_channel(group, rid, capacity);
    } else {
      let args: Value = Value::encode(&(rid, capacity))?;

      rpc::call_fetch_value(group, Callable::func(FN_MAKE_CHANNEL), owner, args).await?;
    }

    Ok(Self::from_core(ProcessGroup::adopt(
      group,
      HandleOrigin::Fresh,
      HandleKind::Channel,
      owner,
      rid,
      None,
    )))
  }

  /// Appends a value, waiting for capacity.
  pub async fn put(&self, value: &T) -> Result<(), ClusterError> {
    let group: &GroupRef = self.group();
    let me: NodeId = group.my_id();

    if self.core.is_local() {
      let item: RemoteResult = Ok(Value::encode(value)?);

      ops::put_ref(group, self.id(), me, item).await
    } else {
      let encoded: Value = Value::encode_to(group, self.owner(), value)?;
      let args: Value = Value::encode(&(self.id(), me, &encoded))?;

      rpc::call_fetch_value(group, Callable::func(FN_PUT_REF), self.owner(), args).await?;
      Ok(())
    }
  }

  /// Removes and returns the oldest value, waiting for one.
  pub async fn take(&self) -> Result<T, ClusterError> {
    let group: &GroupRef = self.group();
    let me: NodeId = group.my_id();

    let value: Value = if self.core.is_local() {
      let (value, _hold) = ops::take_ref(group, self.id(), me).await?;

      value
    } else {
      let args: Value = Value::encode(&(self.id(), me))?;

      rpc::call_fetch_value(group, Callable::func(FN_TAKE_REF), self.owner(), args).await?
    };

    value.decode_in(group)
  }

  /// Returns a copy of the oldest value without removing it.
  pub async fn fetch(&self) -> Result<T, ClusterError> {
    let group: &GroupRef = self.group();

    let value: Value = if self.core.is_local() {
      match ops::fetch_ref(group, self.id()).await? {
        Ok(value) => value,
        Err(exc) => return Err(ClusterError::from_remote(exc)),
      }
    } else {
      let args: Value = Value::encode(&(self.id(),))?;

      rpc::call_fetch_value(group, Callable::func(FN_FETCH_REF), self.owner(), args).await?
    };

    value.decode_in(group)
  }

  /// Takes the next value, mapping a closed channel to end-of-stream.
  ///
  /// Buffered values drain even after a close; `None` only once the
  /// channel is both closed and empty.
  pub async fn next(&self) -> Result<Option<T>, ClusterError> {
    match self.take().await {
      Ok(value) => Ok(Some(value)),
      Err(error) if error.is_closed() => Ok(None),
      Err(error) => Err(error),
    }
  }

  /// Waits until the channel holds a value without consuming it.
  ///
  /// Not supported on rendezvous channels, which never buffer.
  pub async fn wait(&self) -> Result<(), ClusterError> {
    let group: &GroupRef = self.group();

    if self.core.is_local() {
      return ops::wait_ref(group, self.id()).await;
    }

    let args: Value = Value::encode(&(self.id(),))?;

    rpc::call_fetch_value(group, Callable::func(FN_WAIT_REF), self.owner(), args).await?;
    Ok(())
  }

  /// Waits for a value with a deadline. Returns `false` on timeout.
  pub async fn timed_wait(&self, limit: std::time::Duration) -> Result<bool, ClusterError> {
    match tokio::time::timeout(limit, self.wait()).await {
      Ok(result) => result.map(|_| true),
      Err(_) => Ok(false),
    }
  }

  /// Returns `true` if a take would complete without waiting.
  pub async fn is_ready(&self) -> Result<bool, ClusterError> {
    self.query_bool(FN_ISREADY_REF, ops::isready_ref).await
  }

  /// Returns `true` while the channel accepts puts.
  pub async fn is_open(&self) -> Result<bool, ClusterError> {
    self.query_bool(FN_ISOPEN_REF, ops::isopen_ref).await
  }

  /// Returns `true` if no values are buffered.
  pub async fn is_empty(&self) -> Result<bool, ClusterError> {
    self.query_bool(FN_ISEMPTY_REF, ops::isempty_ref).await
  }

  /// Closes the channel; buffered values stay takeable.
  pub async fn close(&self) -> Result<(), ClusterError> {
    let group: &GroupRef = self.group();

    if self.core.is_local() {
      ops::close_ref(group, self.id());
      return Ok(());
    }

    let args: Value = Value::encode(&(self.id(),))?;

    rpc::call_fetch_value(group, Callable::func(FN_CLOSE_REF), self.owner(), args).await?;
    Ok(())
  }

  async fn query_bool(
    &self,
    name: &'static str,
    local: fn(&GroupRef, RefId) -> bool,
  ) -> Result<bool, ClusterError> {
    let group: &GroupRef = self.group();

    if self.core.is_local() {
      return Ok(local(group, self.id()));
    }

    let args: Value = Value::encode(&(self.id(),))?;
    let value: Value = rpc::call_fetch_value(group, Callable::func(name), self.owner(), args).await?;

    value.decode()
  }
}

impl<T> Clone for RemoteChannel<T> {
  fn clone(&self) -> Self {
    Self::from_core(Arc::clone(&self.core))
  }
}

impl<T> PartialEq for RemoteChannel<T> {
  fn eq(&self, other: &Self) -> bool {
    self.id() == other.id()
  }
}

impl<T> Eq for RemoteChannel<T> {}

impl<T> Hash for RemoteChannel<T> {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.id().hash(state);
  }
}

impl<T> Debug for RemoteChannel<T> {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    Display::fmt(self, f)
  }
}

impl<T> Display for RemoteChannel<T> {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(
      f,
      "RemoteChannel({}, {}, {})",
      self.owner(),
      self.id().whence,
      self.id().id,
    )
  }
}

impl<T> Serialize for RemoteChannel<T> {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serialize_handle(&self.core, serializer)
  }
}

impl<'de, T> Deserialize<'de> for RemoteChannel<T> {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    deserialize_handle(HandleKind::Channel, deserializer).map(Self::from_core)
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
  use crate::refs::channel::RemoteChannel;

  async fn channel(capacity: Option<usize>) -> (GroupRef, RemoteChannel<u32>) {
    let group: GroupRef = ProcessGroup::spawn(NodeId::MASTER, Role::Master);
    let chan: RemoteChannel<u32> = RemoteChannel::create(&group, NodeId::MASTER, capacity)
      .await
      .unwrap();

    (group, chan)
  }

  #[tokio::test]
  async fn test_local_put_take() {
    let (_group, chan) = channel(None).await;

    chan.put(&1).await.unwrap();
    chan.put(&2).await.unwrap();

    assert_eq!(chan.take().await.unwrap(), 1);
    assert_eq!(chan.take().await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_fetch_does_not_consume() {
    let (_group, chan) = channel(Some(4)).await;

    chan.put(&5).await.unwrap();

    assert_eq!(chan.fetch().await.unwrap(), 5);
    assert!(chan.is_ready().await.unwrap());
    assert_eq!(chan.take().await.unwrap(), 5);
    assert!(chan.is_empty().await.unwrap());
  }

  #[tokio::test]
  async fn test_close_then_drain() {
    let (_group, chan) = channel(None).await;

    chan.put(&1).await.unwrap();
    chan.put(&2).await.unwrap();
    chan.close().await.unwrap();

    assert!(!chan.is_open().await.unwrap());
    assert_eq!(chan.next().await.unwrap(), Some(1));
    assert_eq!(chan.next().await.unwrap(), Some(2));
    assert_eq!(chan.next().await.unwrap(), None);

    let error = chan.put(&3).await.unwrap_err();

    assert!(error.is_closed());
  }
}
