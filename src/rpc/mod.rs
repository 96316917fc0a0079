//! Remote procedure invocation.
//!
//! Four primitives compose the call surface: `remotecall` (future result),
//! `remotecall_fetch` (value result), `remotecall_wait` (future result,
//! returned only after the remote computation finished) and `remote_do`
//! (fire-and-forget). All of them accept a target node; the pool layer adds
//! target selection on top.

pub(crate) mod exec;
pub(crate) mod registry;
pub(crate) mod sysfn;

pub use self::registry::CallCtx;
pub use self::registry::register;

use self::registry::Reply;

pub(crate) use self::sysfn::FN_ADD_CLIENTS;
pub(crate) use self::sysfn::FN_DEL_CLIENTS;

use crate::cluster::group::GroupRef;
use crate::core::Callable;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::RefId;
use crate::core::RemoteResult;
use crate::core::Value;
use crate::net::frame::Header;
use crate::net::message::Message;
use crate::refs::cell::CellAccess;
use crate::refs::future::RemoteFuture;

use self::exec::reply_item;
use self::exec::run_thunk;
use self::exec::schedule_call;

/// Starts `func` on `pid` and returns the future naming its result cell.
pub(crate) async fn remotecall_value<R>(
  group: &GroupRef,
  func: Callable,
  pid: NodeId,
  args: Value,
) -> Result<RemoteFuture<R>, ClusterError> {
  let rr: RemoteFuture<R> = RemoteFuture::fresh(group, pid);

  if pid == group.my_id() {
    schedule_call(group, rr.id(), func, args, pid);
  } else {
    let peer = group.peer(pid)?;
    let message: Message = Message::Call { func, args };

    peer.send_msg(Header::response(rr.id()), &message, false).await?;
  }

  Ok(rr)
}

/// Runs `func` on `pid` and returns the raw result item.
///
/// The item distinguishes a value from a captured remote failure; callers
/// that cache results (future fetch) keep the distinction, plain callers
/// unwrap it via [`call_fetch_value`].
pub(crate) async fn call_fetch_item(
  group: &GroupRef,
  func: Callable,
  pid: NodeId,
  args: Value,
) -> Result<RemoteResult, ClusterError> {
  let me: NodeId = group.my_id();

  if pid == me {
    let reply: Reply = run_thunk(group, func, args, me).await;

    return Ok(reply_item(group, reply.result));
  }

  // The transient cell exists only for the duration of the call; its
  // identity never escapes this function.
  let oid: RefId = group.next_ref();
  let cell: CellAccess = group.lookup_or_create(oid);

  group.set_waiting_for(oid, pid);

  let peer = match group.peer(pid) {
    Ok(peer) => peer,
    Err(error) => {
      group.remove_cell(oid);
      return Err(error);
    }
  };

  let message: Message = Message::CallFetch { func, args };

  if let Err(error) = peer.send_msg(Header::response(oid), &message, false).await {
    group.remove_cell(oid);
    return Err(error);
  }

  let item: Result<RemoteResult, _> = cell.chan.take().await;

  group.remove_cell(oid);

  item.map_err(|_| ClusterError::transport(format_args!("worker {pid} terminated")))
}

/// Runs `func` on `pid`, unwrapping remote failures into local errors.
pub(crate) async fn call_fetch_value(
  group: &GroupRef,
  func: Callable,
  pid: NodeId,
  args: Value,
) -> Result<Value, ClusterError> {
  match call_fetch_item(group, func, pid, args).await? {
    Ok(value) => Ok(value),
    Err(exc) => Err(ClusterError::from_remote(exc)),
  }
}

/// Starts `func` on `pid` and waits for it to finish before returning the
/// result future.
pub(crate) async fn remotecall_wait_value<R>(
  group: &GroupRef,
  func: Callable,
  pid: NodeId,
  args: Value,
) -> Result<RemoteFuture<R>, ClusterError> {
  let me: NodeId = group.my_id();

  if pid == me {
    let rr: RemoteFuture<R> = RemoteFuture::fresh(group, pid);
    let cell: CellAccess = schedule_call(group, rr.id(), func, args, me);

    match cell.chan.fetch().await {
      Ok(Ok(_)) => return Ok(rr),
      Ok(Err(exc)) => return Err(ClusterError::from_remote(exc)),
      Err(error) => return Err(error.into()),
    }
  }

  // Completion is observed on a transient notify cell, separate from the
  // result cell the returned future names.
  let prid: RefId = group.next_ref();
  let cell: CellAccess = group.lookup_or_create(prid);

  group.set_waiting_for(prid, pid);

  let rr: RemoteFuture<R> = RemoteFuture::fresh(group, pid);

  let send: Result<(), ClusterError> = async {
    let peer = group.peer(pid)?;
    let message: Message = Message::CallWait { func, args };

    peer.send_msg(Header::new(rr.id(), prid), &message, false).await
  }
  .await;

  if let Err(error) = send {
    group.remove_cell(prid);
    return Err(error);
  }

  let item: Result<RemoteResult, _> = cell.chan.fetch().await;

  group.remove_cell(prid);

  match item {
    Ok(Ok(_)) => Ok(rr),
    Ok(Err(exc)) => Err(ClusterError::from_remote(exc)),
    Err(_) => Err(ClusterError::transport(format_args!(
      "worker {pid} terminated",
    ))),
  }
}

/// Starts `func` on `pid` with no response channel.
///
/// Failures are logged on the executing worker and discarded; submission
/// order on one link is preserved but execution interleaves freely.
pub(crate) async fn remote_do_value(
  group: &GroupRef,
  func: Callable,
  pid: NodeId,
  args: Value,
) -> Result<(), ClusterError> {
  if pid == group.my_id() {
    let group: GroupRef = triomphe::Arc::clone(group);

    tokio::spawn(crate::cluster::node::scope_role(group.tag(), async move {
      let reply: Reply = run_thunk(&group, func, args, group.my_id()).await;

      if let Err(error) = reply.result {
        tracing::error!(%error, "error in remote_do");
      }
    }));

    return Ok(());
  }

  let peer = group.peer(pid)?;
  let message: Message = Message::RemoteDo { func, args };

  peer.send_msg(Header::NULL, &message, false).await
}
