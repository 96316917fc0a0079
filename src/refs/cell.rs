use hashbrown::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::consts::DEF_CELL_CAPACITY;
use crate::core::NodeId;
use crate::refs::chan::CellChannel;
use crate::refs::chan::QueueChannel;

/// Owner-side storage backing one remote reference.
///
/// Lives in a group's refs table, guarded by the registry lock; the backing
/// channel and the synctake mutex are shared out so channel operations never
/// run under that lock.
pub(crate) struct RemoteValue {
  /// The backing channel holding the cell's payloads.
  pub(crate) chan: Arc<dyn CellChannel>,
  /// Nodes currently known to hold a handle to this cell.
  pub(crate) clients: HashSet<NodeId>,
  /// Peer this cell's creator is awaiting a response from, if any. Used
  /// only for call-fetch / call-wait bookkeeping so link loss can fail the
  /// wait.
  pub(crate) waiting_for: NodeId,
  /// Serializes a local put with a remote take on a rendezvous channel:
  /// the owner holds it from the take until the taken value has been
  /// serialized out, and the local putter blocks on it before returning.
  pub(crate) synctake: Option<Arc<AsyncMutex<()>>>,
}

impl RemoteValue {
  /// Creates a cell with the given backing capacity (`None` = unbounded).
  ///
  /// Rendezvous channels get a synctake mutex, every other capacity does
  /// not.
  pub(crate) fn with_capacity(capacity: Option<usize>) -> Self {
    let chan: Arc<dyn CellChannel> = Arc::new(QueueChannel::new(capacity));
    let synctake: Option<Arc<AsyncMutex<()>>> =
      (chan.capacity() == Some(0)).then(|| Arc::new(AsyncMutex::new(())));

    Self {
      chan,
      clients: HashSet::new(),
      waiting_for: NodeId::NULL,
      synctake,
    }
  }

  /// Creates a cell with the default single-assignment factory.
  #[inline]
  pub(crate) fn new() -> Self {
    Self::with_capacity(Some(DEF_CELL_CAPACITY))
  }

  /// Clones out the parts needed for lock-free channel access.
  #[inline]
  pub(crate) fn access(&self) -> CellAccess {
    CellAccess {
      chan: Arc::clone(&self.chan),
      synctake: self.synctake.clone(),
    }
  }
}

/// Shared view of a cell usable outside the registry lock.
pub(crate) struct CellAccess {
  pub(crate) chan: Arc<dyn CellChannel>,
  pub(crate) synctake: Option<Arc<AsyncMutex<()>>>,
}
