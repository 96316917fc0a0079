use hashbrown::HashMap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::sync::Arc as StdArc;
use std::sync::Weak;
use tokio::sync::Notify;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use triomphe::Arc;

use crate::consts::CAP_GROUP_HANDLES;
use crate::consts::CAP_GROUP_PEERS;
use crate::consts::CAP_GROUP_REFS;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::RefId;
use crate::core::RefSource;
use crate::core::RemoteResult;
use crate::core::Role;
use crate::net::link::Peer;
use crate::net::link::PeerRef;
use crate::pool::PoolCore;
use crate::pool::WorkerPool;
use crate::refs::cell::CellAccess;
use crate::refs::cell::RemoteValue;
use crate::refs::handle::HandleKind;
use crate::refs::handle::HandleOrigin;
use crate::refs::handle::RefCore;

pub(crate) type GroupRef = Arc<ProcessGroup>;

/// One process's view of one cluster: its id, its peers, and both sides of
/// the reference runtime (owner cells and client handles).
///
/// A process holds up to two groups, one per [`Role`] it plays. All registry
/// state sits behind a single lock which is never held across channel waits,
/// network I/O, or user code.
pub(crate) struct ProcessGroup {
  id: NodeId,
  tag: Role,
  source: RefSource,
  peers: RwLock<HashMap<NodeId, PeerRef>>,
  state: Mutex<GroupState>,
  /// Local del-clients deferred by handle finalizers; drained by the pump.
  pending: Mutex<Vec<(RefId, NodeId)>>,
  notify: Notify,
  pump: Mutex<Option<JoinHandle<()>>>,
  pools: Mutex<HashMap<RefId, Weak<PoolCore>>>,
  default_pool: OnceCell<WorkerPool>,
}

struct GroupState {
  /// Owner-side cells backing references this node owns.
  refs: HashMap<RefId, RemoteValue>,
  /// Client-side weak handle table: finalizer tracking and deduplication of
  /// handles deserialized more than once.
  handles: HashMap<RefId, Weak<RefCore>>,
}

impl ProcessGroup {
  /// Creates the group and starts its GC pump.
  pub(crate) fn spawn(id: NodeId, tag: Role) -> GroupRef {
    let group: GroupRef = Arc::new(Self {
      id,
      tag,
      source: RefSource::new(),
      peers: RwLock::new(HashMap::with_capacity(CAP_GROUP_PEERS)),
      state: Mutex::new(GroupState {
        refs: HashMap::with_capacity(CAP_GROUP_REFS),
        handles: HashMap::with_capacity(CAP_GROUP_HANDLES),
      }),
      pending: Mutex::new(Vec::new()),
      notify: Notify::new(),
      pump: Mutex::new(None),
      pools: Mutex::new(HashMap::new()),
      default_pool: OnceCell::new(),
    });

    *group.pump.lock() = Some(crate::refs::gc::spawn_pump(&group));

    group
  }

  /// This node's id within the group.
  #[inline]
  pub(crate) fn my_id(&self) -> NodeId {
    self.id
  }

  /// Which role view of the node this group is.
  #[inline]
  pub(crate) fn tag(&self) -> Role {
    self.tag
  }

  /// Returns a fresh reference identity created by this node.
  #[inline]
  pub(crate) fn next_ref(&self) -> RefId {
    self.source.next(self.id)
  }

  // ---------------------------------------------------------------------------
  // Peers
  // ---------------------------------------------------------------------------

  pub(crate) fn insert_peer(&self, peer: Peer) -> PeerRef {
    let peer: PeerRef = Arc::new(peer);

    self.peers.write().insert(peer.id(), Arc::clone(&peer));
    peer
  }

  pub(crate) fn remove_peer(&self, id: NodeId) -> Option<PeerRef> {
    self.peers.write().remove(&id)
  }

  /// Returns the link to `id`, failing fast if the peer is unknown or gone.
  pub(crate) fn peer(&self, id: NodeId) -> Result<PeerRef, ClusterError> {
    match self.peers.read().get(&id) {
      Some(peer) => Ok(Arc::clone(peer)),
      None => Err(ClusterError::transport(format_args!(
        "no connection to worker {id}",
      ))),
    }
  }

  pub(crate) fn peers(&self) -> Vec<PeerRef> {
    self.peers.read().values().cloned().collect()
  }

  /// All process ids in the group, this node included, in id order.
  pub(crate) fn procs(&self) -> Vec<NodeId> {
    let mut ids: Vec<NodeId> = self.peers.read().keys().copied().collect();

    ids.push(self.id);
    ids.sort_unstable();
    ids
  }

  /// All worker ids. Falls back to the master alone when the group has no
  /// workers yet.
  pub(crate) fn workers(&self) -> Vec<NodeId> {
    let ids: Vec<NodeId> = self
      .procs()
      .into_iter()
      .filter(|id| !id.is_master())
      .collect();

    if ids.is_empty() {
      return vec![NodeId::MASTER];
    }

    ids
  }

  pub(crate) fn id_in_procs(&self, id: NodeId) -> bool {
    id == self.id || self.peers.read().contains_key(&id)
  }

  // ---------------------------------------------------------------------------
  // Owner Cells
  // ---------------------------------------------------------------------------

  /// Returns the cell backing `rid`, creating it lazily.
  ///
  /// A fresh cell starts with the reference's creator in its clientset.
  pub(crate) fn lookup_or_create(&self, rid: RefId) -> CellAccess {
    self.lookup_or_create_with(rid, RemoteValue::new)
  }

  /// Returns the cell backing `rid`, creating it with `factory` if absent.
  pub(crate) fn lookup_or_create_with(
    &self,
    rid: RefId,
    factory: impl FnOnce() -> RemoteValue,
  ) -> CellAccess {
    let mut state = self.state.lock();

    state
      .refs
      .entry(rid)
      .or_insert_with(|| {
        let mut cell: RemoteValue = factory();

        cell.clients.insert(rid.whence);
        cell
      })
      .access()
  }

  /// Removes the cell backing `rid` regardless of its clientset.
  ///
  /// Used for the transient cells of call-fetch and call-wait, whose
  /// lifetime is the call itself.
  pub(crate) fn remove_cell(&self, rid: RefId) {
    self.state.lock().refs.remove(&rid);
  }

  pub(crate) fn add_client(&self, rid: RefId, client: NodeId) {
    self.add_client_locked(&mut self.state.lock(), rid, client);
  }

  fn add_client_locked(&self, state: &mut GroupState, rid: RefId, client: NodeId) {
    let cell: &mut RemoteValue = state.refs.entry(rid).or_insert_with(|| {
      let mut cell: RemoteValue = RemoteValue::new();

      cell.clients.insert(rid.whence);
      cell
    });

    cell.clients.insert(client);
  }

  pub(crate) fn del_client(&self, rid: RefId, client: NodeId) {
    self.del_client_locked(&mut self.state.lock(), rid, client);
  }

  fn del_client_locked(&self, state: &mut GroupState, rid: RefId, client: NodeId) {
    let Some(cell) = state.refs.get_mut(&rid) else {
      return;
    };

    cell.clients.remove(&client);

    if cell.clients.is_empty() {
      state.refs.remove(&rid);
      tracing::trace!(%rid, "cell destroyed");
    }
  }

  /// Applies a coalesced batch of client mutations.
  pub(crate) fn apply_client_pairs(&self, add: bool, pairs: Vec<(RefId, NodeId)>) {
    let mut state = self.state.lock();

    for (rid, client) in pairs {
      if add {
        self.add_client_locked(&mut state, rid, client);
      } else {
        self.del_client_locked(&mut state, rid, client);
      }
    }
  }

  /// Marks the cell at `rid` as awaiting a response from `pid`.
  pub(crate) fn set_waiting_for(&self, rid: RefId, pid: NodeId) {
    if let Some(cell) = self.state.lock().refs.get_mut(&rid) {
      cell.waiting_for = pid;
    }
  }

  /// Clears and returns every cell awaiting a response from `pid`.
  pub(crate) fn take_waiting_for(&self, pid: NodeId) -> Vec<CellAccess> {
    let mut state = self.state.lock();
    let mut cells: Vec<CellAccess> = Vec::new();

    for cell in state.refs.values_mut() {
      if cell.waiting_for == pid {
        cell.waiting_for = NodeId::NULL;
        cells.push(cell.access());
      }
    }

    cells
  }

  /// Number of live owner cells; observable so callers can assert GC
  /// progress.
  pub(crate) fn refs_len(&self) -> usize {
    self.state.lock().refs.len()
  }

  // ---------------------------------------------------------------------------
  // Client Handles
  // ---------------------------------------------------------------------------

  /// Adopts a handle into the weak table, canonicalizing duplicates.
  ///
  /// If a live handle with the same identity already exists the existing
  /// core is returned; a cached value carried by the newcomer is merged
  /// into it (the merge winner issues the balancing del-client). Otherwise
  /// the newcomer is registered, and, when this node owns the cell and the
  /// handle arrived by decode, the local node is recorded as a client.
  pub(crate) fn adopt(
    this: &GroupRef,
    origin: HandleOrigin,
    kind: HandleKind,
    where_: NodeId,
    rid: RefId,
    cache: Option<RemoteResult>,
  ) -> StdArc<RefCore> {
    let mut state = this.state.lock();

    let existing: Option<StdArc<RefCore>> =
      state.handles.get(&rid).and_then(|weak| weak.upgrade());

    if let Some(core) = existing {
      drop(state);

      if let Some(value) = cache {
        // Merge balances the newcomer's extra reference: the cache winner
        // issues the del-client.
        core.merge_cache(value);
      }

      return core;
    }

    let cached: bool = cache.is_some();
    let core: StdArc<RefCore> =
      RefCore::register(Arc::clone(this), kind, where_, rid, cache);

    state.handles.insert(rid, StdArc::downgrade(&core));

    if origin == HandleOrigin::Decoded && where_ == this.id {
      // The local node became a client via the decode. A future arriving
      // with its value resolved never contacts the cell and is not
      // counted.
      if kind == HandleKind::Channel || !cached {
        this.add_client_locked(&mut state, rid, this.id);
      }
    }

    core
  }

  /// Drops weak-table entries whose handle is gone.
  pub(crate) fn prune_handles(&self) {
    self
      .state
      .lock()
      .handles
      .retain(|_, weak| weak.strong_count() > 0);
  }

  // ---------------------------------------------------------------------------
  // GC Coordination
  // ---------------------------------------------------------------------------

  /// Wakes the GC pump.
  #[inline]
  pub(crate) fn gc_notify(&self) {
    self.notify.notify_one();
  }

  pub(crate) async fn gc_wait(&self) {
    self.notify.notified().await;
  }

  /// Attempts a local del-client without blocking; used by finalizers.
  pub(crate) fn try_local_del(&self, rid: RefId, client: NodeId) -> bool {
    let Some(mut state) = self.state.try_lock() else {
      return false;
    };

    self.del_client_locked(&mut state, rid, client);
    true
  }

  /// Queues a local del-client for the pump; the fallback when a finalizer
  /// could not take the registry lock without blocking.
  pub(crate) fn defer_local_del(&self, rid: RefId, client: NodeId) {
    self.pending.lock().push((rid, client));
    self.gc_notify();
  }

  /// Applies deferred local del-clients.
  pub(crate) fn drain_pending(&self) {
    let pending: Vec<(RefId, NodeId)> = std::mem::take(&mut *self.pending.lock());

    if !pending.is_empty() {
      self.apply_client_pairs(false, pending);
    }
  }

  /// Flushes every flagged link and all deferred local work once.
  pub(crate) async fn drain_gc(&self) {
    self.drain_pending();
    self.prune_handles();

    for peer in self.peers() {
      if peer.gc_flagged() {
        if let Err(error) = peer.flush_gc().await {
          tracing::error!(peer = %peer.id(), %error, "gc flush failed");
        }
      }
    }
  }

  // ---------------------------------------------------------------------------
  // Pools
  // ---------------------------------------------------------------------------

  /// Records a pool addressable through the cell at `rid`.
  pub(crate) fn register_pool(&self, rid: RefId, pool: Weak<PoolCore>) {
    self.pools.lock().insert(rid, pool);
  }

  /// Resolves a pool by the identity of its anchor cell.
  pub(crate) fn find_pool(&self, rid: RefId) -> Option<StdArc<PoolCore>> {
    let mut pools = self.pools.lock();

    match pools.get(&rid) {
      Some(weak) => match weak.upgrade() {
        Some(pool) => Some(pool),
        None => {
          pools.remove(&rid);
          None
        }
      },
      None => None,
    }
  }

  /// The lazily initialized default pool slot.
  pub(crate) fn default_pool(&self) -> &OnceCell<WorkerPool> {
    &self.default_pool
  }

  // ---------------------------------------------------------------------------
  // Teardown
  // ---------------------------------------------------------------------------

  /// Stops the GC pump. Links are torn down by dropping their streams.
  pub(crate) fn shutdown(&self) {
    if let Some(pump) = self.pump.lock().take() {
      pump.abort();
    }
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
  use crate::core::RefId;
  use crate::core::Role;

  #[tokio::test]
  async fn test_cell_lifecycle_follows_clientset() {
    let group: GroupRef = ProcessGroup::spawn(NodeId::MASTER, Role::Master);
    let rid: RefId = RefId::new(NodeId::new(2), 1);

    let _cell = group.lookup_or_create(rid);

    // The creator is a client from birth.
    assert_eq!(group.refs_len(), 1);

    group.add_client(rid, NodeId::new(3));
    group.del_client(rid, NodeId::new(2));
    assert_eq!(group.refs_len(), 1);

    group.del_client(rid, NodeId::new(3));
    assert_eq!(group.refs_len(), 0);
  }

  #[tokio::test]
  async fn test_workers_falls_back_to_master() {
    let group: GroupRef = ProcessGroup::spawn(NodeId::MASTER, Role::Master);

    assert_eq!(group.workers(), vec![NodeId::MASTER]);
  }

  #[tokio::test]
  async fn test_unknown_peer_fails_fast() {
    let group: GroupRef = ProcessGroup::spawn(NodeId::MASTER, Role::Master);

    assert!(group.peer(NodeId::new(9)).is_err());
  }
}
