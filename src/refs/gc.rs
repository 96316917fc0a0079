//! Distributed reference-count maintenance.
//!
//! Client additions and deletions are buffered per link and flushed by a
//! single per-group pump task, coalescing cascades of handle finalizations
//! into a handful of `remote_do` batches instead of one message per handle.

use tokio::task::JoinHandle;

use crate::cluster::group::GroupRef;
use crate::core::NodeId;
use crate::core::RefId;

/// Registers `client` with the owner of `rid`.
///
/// Local owners are updated directly; remote owners receive the pair with
/// the next coalesced flush on their link.
pub(crate) fn send_add_client(group: &GroupRef, rid: RefId, owner: NodeId, client: NodeId) {
  if owner == group.my_id() {
    group.add_client(rid, client);
    return;
  }

  match group.peer(owner) {
    Ok(peer) => {
      peer.buffer_add(rid, client);
      group.gc_notify();
    }
    Err(_) => {
      tracing::warn!(%rid, %owner, "add-client for unreachable owner dropped");
    }
  }
}

/// Releases this node's claim on `rid` with its owner.
///
/// Called from handle finalizers, so it must never block: a contended
/// registry lock defers the local deletion to the pump instead of waiting.
pub(crate) fn send_del_client(group: &GroupRef, rid: RefId, owner: NodeId) {
  let me: NodeId = group.my_id();

  if owner == me {
    if !group.try_local_del(rid, me) {
      group.defer_local_del(rid, me);
    }

    return;
  }

  if let Ok(peer) = group.peer(owner) {
    peer.buffer_del(rid, me);
    group.gc_notify();
  }

  // An unreachable owner needs no del-client: its table died with it.
}

// -----------------------------------------------------------------------------
// Pump
// -----------------------------------------------------------------------------

/// Starts the group's GC pump.
///
/// The pump parks on the group's notify condition and, per wakeup, applies
/// deferred local deletions and flushes every flagged link. Errors are
/// logged and never kill the pump.
pub(crate) fn spawn_pump(group: &GroupRef) -> JoinHandle<()> {
  let group: GroupRef = GroupRef::clone(group);

  tokio::spawn(async move {
    loop {
      group.gc_wait().await;

      group.drain_pending();
      group.prune_handles();

      for peer in group.peers() {
        if !peer.gc_flagged() {
          continue;
        }

        if let Err(error) = peer.flush_gc().await {
          tracing::error!(peer = %peer.id(), %error, "gc flush failed");
        }
      }
    }
  })
}
