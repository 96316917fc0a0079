//! Pooled execution: worker pools and callable-caching pools.

mod caching_pool;
mod worker_pool;

pub use self::caching_pool::CachingPool;
pub use self::worker_pool::WorkerPool;

pub(crate) use self::worker_pool::PoolCore;

use std::sync::Arc;

use crate::cluster::view::ClusterView;
use crate::core::Callable;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::Value;
use crate::refs::channel::RemoteChannel;
use crate::rpc::exec::run_thunk;
use crate::rpc::registry::CallCtx;
use crate::rpc::registry::Reply;
use crate::rpc::sysfn::FN_DEFAULT_POOL;

use self::caching_pool::CacheArg;
use self::worker_pool::PoolOp;

/// Returns the cluster's default pool, building or fetching it on first
/// use.
///
/// The master builds it from its current workers; any other node fetches a
/// forwarding handle from the master, once, and caches it in its group.
pub(crate) async fn default_pool(view: &ClusterView) -> Result<WorkerPool, ClusterError> {
  view
    .group()
    .default_pool()
    .get_or_try_init(|| async {
      if view.my_id().is_master() {
        let workers: Vec<NodeId> = view.group().workers();

        WorkerPool::new_default(view, workers).await
      } else {
        view
          .remotecall_fetch(Callable::func(FN_DEFAULT_POOL), NodeId::MASTER, &())
          .await
      }
    })
    .await
    .cloned()
}

// -----------------------------------------------------------------------------
// System Functions
// -----------------------------------------------------------------------------

/// `sys.default_pool`: hands the master's default pool to a worker.
pub(crate) async fn sys_default_pool(ctx: CallCtx) -> Result<Value, ClusterError> {
  let pool: WorkerPool = default_pool(ctx.view()).await?;

  ctx.reply(&pool)
}

/// `sys.pool_op`: executes a forwarded pool operation on the owner.
pub(crate) async fn sys_pool_op(ctx: CallCtx) -> Result<Value, ClusterError> {
  let (anchor, op): (RemoteChannel<()>, PoolOp) = ctx.args()?;

  let Some(core) = ctx.view().group().find_pool(anchor.id()) else {
    return Err(ClusterError::pool("worker pool no longer exists"));
  };

  pool_op(&core, op).await
}

async fn pool_op(core: &Arc<PoolCore>, op: PoolOp) -> Result<Value, ClusterError> {
  match op {
    PoolOp::Take => Value::encode(&core.take().await?),
    PoolOp::PutBack(pid) => {
      core.put_back(pid);
      Ok(Value::unit())
    }
    PoolOp::Push(pid) => {
      core.push(pid);
      Ok(Value::unit())
    }
    PoolOp::Len => Value::encode(&core.len()),
    PoolOp::IsReady => Value::encode(&core.is_ready()),
    PoolOp::Workers => Value::encode(&core.members()),
  }
}

/// `sys.exec_cached`: runs a callable through the worker-side cache.
pub(crate) async fn sys_exec_cached(ctx: CallCtx) -> Reply {
  let (cache, args): (CacheArg, Value) = match ctx.args() {
    Ok(decoded) => decoded,
    Err(error) => return Reply::err(error),
  };

  let func: Callable = match cache {
    CacheArg::Prime { func, chan } => {
      if let Err(error) = chan.put(&func).await {
        return Reply::err(error);
      }

      func
    }
    CacheArg::Cached { chan } => match chan.fetch().await {
      Ok(func) => func,
      Err(error) => return Reply::err(error),
    },
  };

  run_thunk(ctx.view().group(), func, args, ctx.caller()).await
}
