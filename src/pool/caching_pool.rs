use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc;

use crate::cluster::view::ClusterView;
use crate::core::Callable;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::Value;
use crate::refs::channel::RemoteChannel;
use crate::refs::future::RemoteFuture;
use crate::rpc::sysfn::FN_EXEC_CACHED;

/// Per-worker callable storage instruction carried with each cached call.
#[derive(Serialize, Deserialize)]
pub(crate) enum CacheArg {
  /// First use on this worker: store the callable, then run it.
  Prime {
    func: Callable,
    chan: RemoteChannel<Callable>,
  },
  /// The worker already holds the callable; fetch it from its channel.
  Cached { chan: RemoteChannel<Callable> },
}

/// A worker pool that stores callables on the workers that run them.
///
/// The first dispatch of a callable to a worker ships it together with a
/// fresh single-slot channel on that worker; the worker parks the callable
/// there, and later dispatches send only the channel reference. A callable
/// closing over a large environment therefore crosses each link at most
/// once.
#[derive(Clone)]
pub struct CachingPool {
  pool: super::WorkerPool,
  cache: Arc<Mutex<HashMap<(NodeId, Callable), RemoteChannel<Callable>>>>,
}

impl CachingPool {
  /// Creates a caching pool over the given workers.
  pub async fn new(view: &ClusterView, workers: Vec<NodeId>) -> Result<Self, ClusterError> {
    Ok(Self::from_pool(super::WorkerPool::new(view, workers).await?))
  }

  /// Wraps an existing pool with callable caching.
  pub fn from_pool(pool: super::WorkerPool) -> Self {
    Self {
      pool,
      cache: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  /// The underlying worker pool.
  pub fn pool(&self) -> &super::WorkerPool {
    &self.pool
  }

  /// Drops every cached callable, evicting the remote copies.
  ///
  /// Dropping the channel handles finalizes them; the coalesced del-client
  /// traffic destroys the worker-side cells.
  pub fn clear(&self) {
    self.cache.lock().clear();
  }

  /// `remotecall` through the cache.
  pub async fn remotecall<A, R>(
    &self,
    func: Callable,
    args: &A,
  ) -> Result<RemoteFuture<R>, ClusterError>
  where
    A: Serialize + ?Sized,
    R: Serialize + DeserializeOwned + Send + 'static,
  {
    let view: ClusterView = ClusterView::new(self.pool.group().clone());
    let pid: NodeId = self.pool.take().await?;
    let staged: Result<(CacheArg, Value), ClusterError> =
      self.stage(&view, pid, func, args).await;

    match staged {
      Ok(wire_args) => {
        let result: Result<RemoteFuture<R>, ClusterError> = view
          .remotecall(Callable::func(FN_EXEC_CACHED), pid, &wire_args)
          .await;

        match result {
          Ok(rr) => {
            let pool: super::WorkerPool = self.pool.clone();
            let done: RemoteFuture<R> = rr.clone();

            tokio::spawn(async move {
              let _ = done.wait().await;
              let _ = pool.put_back(pid).await;
            });

            Ok(rr)
          }
          Err(error) => {
            let _ = self.pool.put_back(pid).await;
            Err(error)
          }
        }
      }
      Err(error) => {
        let _ = self.pool.put_back(pid).await;
        Err(error)
      }
    }
  }

  /// `remotecall_fetch` through the cache.
  pub async fn remotecall_fetch<A, R>(&self, func: Callable, args: &A) -> Result<R, ClusterError>
  where
    A: Serialize + ?Sized,
    R: DeserializeOwned,
  {
    let view: ClusterView = ClusterView::new(self.pool.group().clone());
    let pid: NodeId = self.pool.take().await?;

    let result: Result<R, ClusterError> = async {
      let wire_args: (CacheArg, Value) = self.stage(&view, pid, func, args).await?;

      view
        .remotecall_fetch(Callable::func(FN_EXEC_CACHED), pid, &wire_args)
        .await
    }
    .await;

    let _ = self.pool.put_back(pid).await;
    result
  }

  /// `remote_do` through the cache.
  pub async fn remote_do<A>(&self, func: Callable, args: &A) -> Result<(), ClusterError>
  where
    A: Serialize + ?Sized,
  {
    let view: ClusterView = ClusterView::new(self.pool.group().clone());
    let pid: NodeId = self.pool.take().await?;

    let result: Result<(), ClusterError> = async {
      let wire_args: (CacheArg, Value) = self.stage(&view, pid, func, args).await?;

      view
        .remote_do(Callable::func(FN_EXEC_CACHED), pid, &wire_args)
        .await
    }
    .await;

    let _ = self.pool.put_back(pid).await;
    result
  }

  /// Builds the wire arguments for a cached dispatch to `pid`.
  async fn stage<A>(
    &self,
    view: &ClusterView,
    pid: NodeId,
    func: Callable,
    args: &A,
  ) -> Result<(CacheArg, Value), ClusterError>
  where
    A: Serialize + ?Sized,
  {
    let inner: Value = Value::encode_to(view.group(), pid, args)?;
    let cached: Option<RemoteChannel<Callable>> =
      self.cache.lock().get(&(pid, func.clone())).cloned();

    let arg: CacheArg = match cached {
      Some(chan) => CacheArg::Cached { chan },
      None => {
        let chan: RemoteChannel<Callable> =
          RemoteChannel::create(view.group(), pid, Some(1)).await?;

        self
          .cache
          .lock()
          .insert((pid, func.clone()), chan.clone());

        CacheArg::Prime { func, chan }
      }
    };

    Ok((arg, inner))
  }
}

impl Debug for CachingPool {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(
      f,
      "CachingPool({:?}, {} cached)",
      self.pool,
      self.cache.lock().len(),
    )
  }
}
