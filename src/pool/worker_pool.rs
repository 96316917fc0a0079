use hashbrown::HashSet;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de::DeserializeOwned;
use serde::de::Error as DeError;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::cluster::group::GroupRef;
use crate::cluster::view::ClusterView;
use crate::core::Callable;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::refs::channel::RemoteChannel;
use crate::refs::future::RemoteFuture;
use crate::rpc::sysfn::FN_POOL_OP;

/// Owner-side state of a worker pool.
///
/// The pool is addressable cluster-wide through its anchor channel: the
/// anchor's identity is registered (weakly) with the owning group, so a
/// forwarded operation can find the live pool without the anchor cell
/// keeping it alive.
pub(crate) struct PoolCore {
  group: GroupRef,
  anchor: RemoteChannel<()>,
  state: Mutex<PoolState>,
  notify: Notify,
}

struct PoolState {
  queue: VecDeque<NodeId>,
  members: HashSet<NodeId>,
  default: bool,
}

impl PoolCore {
  pub(crate) async fn create(
    view: &ClusterView,
    workers: Vec<NodeId>,
    default: bool,
  ) -> Result<Arc<Self>, ClusterError> {
    let group: &GroupRef = view.group();
    let anchor: RemoteChannel<()> =
      RemoteChannel::create(group, group.my_id(), Some(1)).await?;

    let core: Arc<Self> = Arc::new(Self {
      group: GroupRef::clone(group),
      anchor,
      state: Mutex::new(PoolState {
        members: workers.iter().copied().collect(),
        queue: workers.into(),
        default,
      }),
      notify: Notify::new(),
    });

    group.register_pool(core.anchor.id(), Arc::downgrade(&core));

    Ok(core)
  }

  pub(crate) fn anchor(&self) -> &RemoteChannel<()> {
    &self.anchor
  }

  /// Adds a worker to the pool, making it immediately available.
  pub(crate) fn push(&self, pid: NodeId) {
    let mut state = self.state.lock();

    state.members.insert(pid);
    state.queue.push_back(pid);
    drop(state);
    self.notify.notify_waiters();
  }

  /// Returns a worker to the available queue if it is still a member.
  pub(crate) fn put_back(&self, pid: NodeId) {
    let mut state = self.state.lock();

    if state.members.contains(&pid) {
      state.queue.push_back(pid);
      drop(state);
      self.notify.notify_waiters();
    }
  }

  /// Takes an available worker.
  ///
  /// Workers that left the cluster are discarded on the way. A pool with
  /// no members at all substitutes the master when it is the default pool
  /// and fails with a pool fault otherwise; a pool whose members are all
  /// busy blocks.
  pub(crate) async fn take(&self) -> Result<NodeId, ClusterError> {
    loop {
      let notified = self.notify.notified();

      {
        let mut state = self.state.lock();

        while let Some(pid) = state.queue.pop_front() {
          if !state.members.contains(&pid) {
            continue;
          }

          if self.group.id_in_procs(pid) {
            return Ok(pid);
          }

          // No longer in the cluster; forget it.
          state.members.remove(&pid);
        }

        if state.members.is_empty() {
          if state.default {
            // The master serves in place of absent workers.
            return Ok(self.group.my_id());
          }

          return Err(ClusterError::pool("no active worker available in pool"));
        }
      }

      notified.await;
    }
  }

  /// Number of currently available workers.
  pub(crate) fn len(&self) -> usize {
    self.state.lock().queue.len()
  }

  pub(crate) fn is_ready(&self) -> bool {
    self.len() > 0
  }

  /// The pool's membership, in id order.
  pub(crate) fn members(&self) -> Vec<NodeId> {
    let mut ids: Vec<NodeId> = self.state.lock().members.iter().copied().collect();

    ids.sort_unstable();
    ids
  }
}

// -----------------------------------------------------------------------------
// Pool Op
// -----------------------------------------------------------------------------

/// Forwarded pool operation, executed on the pool's owner.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum PoolOp {
  Take,
  PutBack(NodeId),
  Push(NodeId),
  Len,
  IsReady,
  Workers,
}

// -----------------------------------------------------------------------------
// Worker Pool
// -----------------------------------------------------------------------------

/// A bounded pool of worker ids with take/put discipline.
///
/// Serializing a pool sends only its anchor reference; a deserialized copy
/// on another node forwards every operation to the owner. The pooled RPC
/// variants take a worker, dispatch, and release it when the computation
/// (not merely the submission) has finished.
#[derive(Clone)]
pub struct WorkerPool {
  inner: PoolInner,
}

#[derive(Clone)]
enum PoolInner {
  Local(Arc<PoolCore>),
  Remote(RemoteChannel<()>),
}

impl WorkerPool {
  /// Creates a pool over the given workers, owned by the calling node.
  pub async fn new(view: &ClusterView, workers: Vec<NodeId>) -> Result<Self, ClusterError> {
    Ok(Self {
      inner: PoolInner::Local(PoolCore::create(view, workers, false).await?),
    })
  }

  pub(crate) async fn new_default(
    view: &ClusterView,
    workers: Vec<NodeId>,
  ) -> Result<Self, ClusterError> {
    Ok(Self {
      inner: PoolInner::Local(PoolCore::create(view, workers, true).await?),
    })
  }

  pub(crate) fn group(&self) -> &GroupRef {
    match &self.inner {
      PoolInner::Local(core) => &core.group,
      PoolInner::Remote(anchor) => anchor.group_ref(),
    }
  }

  fn view(&self) -> ClusterView {
    ClusterView::new(GroupRef::clone(self.group()))
  }

  async fn forward<R>(&self, anchor: &RemoteChannel<()>, op: PoolOp) -> Result<R, ClusterError>
  where
    R: DeserializeOwned,
  {
    let view: ClusterView = self.view();
    let args: (&RemoteChannel<()>, PoolOp) = (anchor, op);

    view
      .remotecall_fetch(Callable::func(FN_POOL_OP), anchor.owner(), &args)
      .await
  }

  /// Adds a worker to the pool.
  pub async fn push(&self, pid: NodeId) -> Result<(), ClusterError> {
    match &self.inner {
      PoolInner::Local(core) => {
        core.push(pid);
        Ok(())
      }
      PoolInner::Remote(anchor) => self.forward(anchor, PoolOp::Push(pid)).await
    }
  }

  /// Takes an available worker, blocking while all members are busy.
  pub async fn take(&self) -> Result<NodeId, ClusterError> {
    match &self.inner {
      PoolInner::Local(core) => core.take().await,
      PoolInner::Remote(anchor) => self.forward(anchor, PoolOp::Take).await,
    }
  }

  /// Returns a worker to the pool if it is still a member.
  pub async fn put_back(&self, pid: NodeId) -> Result<(), ClusterError> {
    match &self.inner {
      PoolInner::Local(core) => {
        core.put_back(pid);
        Ok(())
      }
      PoolInner::Remote(anchor) => self.forward(anchor, PoolOp::PutBack(pid)).await
    }
  }

  /// Number of currently available workers.
  pub async fn len(&self) -> Result<usize, ClusterError> {
    match &self.inner {
      PoolInner::Local(core) => Ok(core.len()),
      PoolInner::Remote(anchor) => self.forward(anchor, PoolOp::Len).await,
    }
  }

  /// Returns `true` if a take would complete without waiting.
  pub async fn is_ready(&self) -> Result<bool, ClusterError> {
    match &self.inner {
      PoolInner::Local(core) => Ok(core.is_ready()),
      PoolInner::Remote(anchor) => self.forward(anchor, PoolOp::IsReady).await,
    }
  }

  /// The pool's membership.
  pub async fn workers(&self) -> Result<Vec<NodeId>, ClusterError> {
    match &self.inner {
      PoolInner::Local(core) => Ok(core.members()),
      PoolInner::Remote(anchor) => self.forward(anchor, PoolOp::Workers).await,
    }
  }

  // ---------------------------------------------------------------------------
  // Pooled RPC
  // ---------------------------------------------------------------------------

  /// `remotecall` on a pooled worker.
  ///
  /// The worker is released only after the returned future resolves, so it
  /// is not reused while the computation runs. A submission failure
  /// releases it immediately.
  pub async fn remotecall<A, R>(
    &self,
    func: Callable,
    args: &A,
  ) -> Result<RemoteFuture<R>, ClusterError>
  where
    A: Serialize + ?Sized,
    R: Serialize + DeserializeOwned + Send + 'static,
  {
    let pid: NodeId = self.take().await?;
    let view: ClusterView = self.view();

    match view.remotecall(func, pid, args).await {
      Ok(rr) => {
        let pool: WorkerPool = self.clone();
        let done: RemoteFuture<R> = rr.clone();

        tokio::spawn(async move {
          let _ = done.wait().await;

          if let Err(error) = pool.put_back(pid).await {
            tracing::warn!(%pid, %error, "could not release pooled worker");
          }
        });

        Ok(rr)
      }
      Err(error) => {
        let _ = self.put_back(pid).await;
        Err(error)
      }
    }
  }

  /// `remotecall_fetch` on a pooled worker.
  pub async fn remotecall_fetch<A, R>(&self, func: Callable, args: &A) -> Result<R, ClusterError>
  where
    A: Serialize + ?Sized,
    R: DeserializeOwned,
  {
    let pid: NodeId = self.take().await?;
    let result: Result<R, ClusterError> = self.view().remotecall_fetch(func, pid, args).await;

    let _ = self.put_back(pid).await;
    result
  }

  /// `remotecall_wait` on a pooled worker.
  pub async fn remotecall_wait<A, R>(
    &self,
    func: Callable,
    args: &A,
  ) -> Result<RemoteFuture<R>, ClusterError>
  where
    A: Serialize + ?Sized,
    R: DeserializeOwned,
  {
    let pid: NodeId = self.take().await?;
    let result: Result<RemoteFuture<R>, ClusterError> =
      self.view().remotecall_wait(func, pid, args).await;

    let _ = self.put_back(pid).await;
    result
  }

  /// `remote_do` on a pooled worker.
  pub async fn remote_do<A>(&self, func: Callable, args: &A) -> Result<(), ClusterError>
  where
    A: Serialize + ?Sized,
  {
    let pid: NodeId = self.take().await?;
    let result: Result<(), ClusterError> = self.view().remote_do(func, pid, args).await;

    let _ = self.put_back(pid).await;
    result
  }
}

impl Debug for WorkerPool {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match &self.inner {
      PoolInner::Local(core) => write!(f, "WorkerPool(local, {:?})", core.members()),
      PoolInner::Remote(anchor) => write!(f, "WorkerPool(via {})", anchor.owner()),
    }
  }
}

impl Serialize for WorkerPool {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let anchor: &RemoteChannel<()> = match &self.inner {
      PoolInner::Local(core) => core.anchor(),
      PoolInner::Remote(anchor) => anchor,
    };

    anchor.serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for WorkerPool {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let anchor: RemoteChannel<()> = RemoteChannel::deserialize(deserializer)?;
    let group: &GroupRef = anchor.group_ref();

    if anchor.owner() == group.my_id() {
      // Back on the owner: resolve the live pool through the registry.
      let Some(core) = group.find_pool(anchor.id()) else {
        return Err(D::Error::custom("worker pool no longer exists"));
      };

      return Ok(Self {
        inner: PoolInner::Local(core),
      });
    }

    Ok(Self {
      inner: PoolInner::Remote(anchor),
    })
  }
}
