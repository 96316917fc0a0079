//! Owner-side operations on reference cells.
//!
//! These are the functions a handle's owner executes, reached either by a
//! direct call when the owner is local or through the system registry when
//! they arrive as a call-fetch from another node.

use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

use crate::cluster::group::GroupRef;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::RefId;
use crate::core::RemoteResult;
use crate::core::Value;
use crate::refs::cell::CellAccess;
use crate::refs::cell::RemoteValue;

/// Puts a future's value, enforcing single assignment.
///
/// The caller holds the value now, so its claim on the cell is released
/// here, on the owner, as part of the same operation.
pub(crate) async fn put_future(
  group: &GroupRef,
  rid: RefId,
  item: RemoteResult,
  caller: NodeId,
) -> Result<(), ClusterError> {
  let cell: CellAccess = group.lookup_or_create(rid);

  if cell.chan.is_ready() {
    return Err(ClusterError::reference("future can only be set once"));
  }

  cell.chan.put(item).await?;
  group.del_client(rid, caller);

  Ok(())
}

/// Puts an item into a channel cell.
///
/// On a rendezvous cell a local putter additionally parks on the synctake
/// mutex, so it cannot return (and cannot finalize the handle) before a
/// remote taker has serialized the value out.
pub(crate) async fn put_ref(
  group: &GroupRef,
  rid: RefId,
  caller: NodeId,
  item: RemoteResult,
) -> Result<(), ClusterError> {
  let cell: CellAccess = group.lookup_or_create(rid);

  cell.chan.put(item).await?;

  if caller == group.my_id() {
    if let Some(synctake) = cell.synctake {
      drop(synctake.lock().await);
    }
  }

  Ok(())
}

/// Takes an item from a channel cell.
///
/// A remote take on a rendezvous cell returns the synctake guard along with
/// the value; the caller must hold it until the value has been written to
/// the wire. An item carrying a remote exception is rethrown here: for a
/// local caller that surfaces it directly, for a remote one it travels back
/// as the captured failure.
pub(crate) async fn take_ref(
  group: &GroupRef,
  rid: RefId,
  caller: NodeId,
) -> Result<(Value, Option<OwnedMutexGuard<()>>), ClusterError> {
  let cell: CellAccess = group.lookup_or_create(rid);

  let guard: Option<OwnedMutexGuard<()>> = match cell.synctake {
    Some(ref synctake) if caller != group.my_id() => {
      Some(Arc::clone(synctake).lock_owned().await)
    }
    _ => None,
  };

  match cell.chan.take().await? {
    Ok(value) => Ok((value, guard)),
    Err(exc) => Err(ClusterError::from_remote(exc)),
  }
}

/// Returns a copy of the cell's next item without consuming it.
pub(crate) async fn fetch_ref(group: &GroupRef, rid: RefId) -> Result<RemoteResult, ClusterError> {
  let cell: CellAccess = group.lookup_or_create(rid);

  Ok(cell.chan.fetch().await?)
}

/// Waits until the cell holds an item.
pub(crate) async fn wait_ref(group: &GroupRef, rid: RefId) -> Result<(), ClusterError> {
  let cell: CellAccess = group.lookup_or_create(rid);

  cell.chan.fetch().await?;

  Ok(())
}

pub(crate) fn isready_ref(group: &GroupRef, rid: RefId) -> bool {
  group.lookup_or_create(rid).chan.is_ready()
}

pub(crate) fn isopen_ref(group: &GroupRef, rid: RefId) -> bool {
  group.lookup_or_create(rid).chan.is_open()
}

pub(crate) fn isempty_ref(group: &GroupRef, rid: RefId) -> bool {
  group.lookup_or_create(rid).chan.is_empty()
}

pub(crate) fn close_ref(group: &GroupRef, rid: RefId) {
  group.lookup_or_create(rid).chan.close();
}

/// Creates the cell backing a remote channel with the requested capacity.
pub(crate) fn make_channel(group: &GroupRef, rid: RefId, capacity: Option<usize>) {
  group.lookup_or_create_with(rid, || RemoteValue::with_capacity(capacity));
}
