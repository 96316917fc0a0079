//! System functions: the pre-registered half of the function registry.
//!
//! Every owner-side reference operation reachable over the wire lives here,
//! as do the coalesced GC batch appliers and the pool forwarding entry
//! points.

use hashbrown::HashMap;

use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::RefId;
use crate::core::Value;
use crate::pool;
use crate::refs::ops;
use crate::rpc::registry::CallCtx;
use crate::rpc::registry::Reply;
use crate::rpc::registry::SysFn;
use crate::rpc::registry::wrap;
use crate::rpc::registry::wrap_reply;

pub(crate) const FN_FETCH_REF: &str = "sys.fetch_ref";
pub(crate) const FN_TAKE_REF: &str = "sys.take_ref";
pub(crate) const FN_PUT_REF: &str = "sys.put_ref";
pub(crate) const FN_PUT_FUTURE: &str = "sys.put_future";
pub(crate) const FN_WAIT_REF: &str = "sys.wait_ref";
pub(crate) const FN_ISREADY_REF: &str = "sys.isready_ref";
pub(crate) const FN_ISOPEN_REF: &str = "sys.isopen_ref";
pub(crate) const FN_ISEMPTY_REF: &str = "sys.isempty_ref";
pub(crate) const FN_CLOSE_REF: &str = "sys.close_ref";
pub(crate) const FN_MAKE_CHANNEL: &str = "sys.make_channel";
pub(crate) const FN_ADD_CLIENTS: &str = "sys.add_clients";
pub(crate) const FN_DEL_CLIENTS: &str = "sys.del_clients";
pub(crate) const FN_DEFAULT_POOL: &str = "sys.default_pool";
pub(crate) const FN_POOL_OP: &str = "sys.pool_op";
pub(crate) const FN_EXEC_CACHED: &str = "sys.exec_cached";

/// Builds the registry's initial table.
pub(crate) fn system_table() -> HashMap<String, SysFn> {
  let mut table: HashMap<String, SysFn> = HashMap::new();

  table.insert(FN_FETCH_REF.into(), wrap(sys_fetch_ref));
  table.insert(FN_TAKE_REF.into(), wrap_reply(sys_take_ref));
  table.insert(FN_PUT_REF.into(), wrap(sys_put_ref));
  table.insert(FN_PUT_FUTURE.into(), wrap(sys_put_future));
  table.insert(FN_WAIT_REF.into(), wrap(sys_wait_ref));
  table.insert(FN_ISREADY_REF.into(), wrap(sys_isready_ref));
  table.insert(FN_ISOPEN_REF.into(), wrap(sys_isopen_ref));
  table.insert(FN_ISEMPTY_REF.into(), wrap(sys_isempty_ref));
  table.insert(FN_CLOSE_REF.into(), wrap(sys_close_ref));
  table.insert(FN_MAKE_CHANNEL.into(), wrap(sys_make_channel));
  table.insert(FN_ADD_CLIENTS.into(), wrap(sys_add_clients));
  table.insert(FN_DEL_CLIENTS.into(), wrap(sys_del_clients));
  table.insert(FN_DEFAULT_POOL.into(), wrap(pool::sys_default_pool));
  table.insert(FN_POOL_OP.into(), wrap(pool::sys_pool_op));
  table.insert(FN_EXEC_CACHED.into(), wrap_reply(pool::sys_exec_cached));

  table
}

fn unit() -> Result<Value, ClusterError> {
  Ok(Value::unit())
}

async fn sys_fetch_ref(ctx: CallCtx) -> Result<Value, ClusterError> {
  let (rid,): (RefId,) = ctx.args()?;

  match ops::fetch_ref(ctx.view().group(), rid).await? {
    Ok(value) => Ok(value),
    Err(exc) => Err(ClusterError::from_remote(exc)),
  }
}

async fn sys_take_ref(ctx: CallCtx) -> Reply {
  let (rid, caller): (RefId, NodeId) = match ctx.args() {
    Ok(args) => args,
    Err(error) => return Reply::err(error),
  };

  match ops::take_ref(ctx.view().group(), rid, caller).await {
    Ok((value, hold)) => Reply::with_hold(value, hold),
    Err(error) => Reply::err(error),
  }
}

async fn sys_put_ref(ctx: CallCtx) -> Result<Value, ClusterError> {
  let (rid, caller, value): (RefId, NodeId, Value) = ctx.args()?;

  ops::put_ref(ctx.view().group(), rid, caller, Ok(value)).await?;
  unit()
}

async fn sys_put_future(ctx: CallCtx) -> Result<Value, ClusterError> {
  let (rid, value, caller): (RefId, Value, NodeId) = ctx.args()?;

  ops::put_future(ctx.view().group(), rid, Ok(value), caller).await?;
  unit()
}

async fn sys_wait_ref(ctx: CallCtx) -> Result<Value, ClusterError> {
  let (rid,): (RefId,) = ctx.args()?;

  ops::wait_ref(ctx.view().group(), rid).await?;
  unit()
}

async fn sys_isready_ref(ctx: CallCtx) -> Result<Value, ClusterError> {
  let (rid,): (RefId,) = ctx.args()?;

  Value::encode(&ops::isready_ref(ctx.view().group(), rid))
}

async fn sys_isopen_ref(ctx: CallCtx) -> Result<Value, ClusterError> {
  let (rid,): (RefId,) = ctx.args()?;

  Value::encode(&ops::isopen_ref(ctx.view().group(), rid))
}

async fn sys_isempty_ref(ctx: CallCtx) -> Result<Value, ClusterError> {
  let (rid,): (RefId,) = ctx.args()?;

  Value::encode(&ops::isempty_ref(ctx.view().group(), rid))
}

async fn sys_close_ref(ctx: CallCtx) -> Result<Value, ClusterError> {
  let (rid,): (RefId,) = ctx.args()?;

  ops::close_ref(ctx.view().group(), rid);
  unit()
}

async fn sys_make_channel(ctx: CallCtx) -> Result<Value, ClusterError> {
  let (rid, capacity): (RefId, Option<usize>) = ctx.args()?;

  ops::make_channel(ctx.view().group(), rid, capacity);
  unit()
}

async fn sys_add_clients(ctx: CallCtx) -> Result<Value, ClusterError> {
  let pairs: Vec<(RefId, NodeId)> = ctx.args()?;

  ctx.view().group().apply_client_pairs(true, pairs);
  unit()
}

async fn sys_del_clients(ctx: CallCtx) -> Result<Value, ClusterError> {
  let pairs: Vec<(RefId, NodeId)> = ctx.args()?;

  ctx.view().group().apply_client_pairs(false, pairs);
  unit()
}
