use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de::Error as DeError;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::Mutex as AsyncMutex;
use triomphe::Arc as SharedArc;

use crate::cluster::group::GroupRef;
use crate::cluster::group::ProcessGroup;
use crate::core::NodeId;
use crate::core::RefId;
use crate::core::RemoteResult;
use crate::core::decode_scope;
use crate::core::encode_scope;
use crate::refs::gc;

/// Which handle flavor a core backs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandleKind {
  /// Single-assignment with a local value cache.
  Future,
  /// Multi-value; every operation consults the owner.
  Channel,
}

/// How a handle came into existence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandleOrigin {
  /// Created locally; the owner cell accounts for the creator on first
  /// touch.
  Fresh,
  /// Reconstructed from the wire; client bookkeeping may be owed.
  Decoded,
}

// -----------------------------------------------------------------------------
// Ref Core
// -----------------------------------------------------------------------------

/// Shared state behind every client-side handle with a given identity.
///
/// Handles deserialized more than once all resolve to the same core through
/// the group's weak table, which is what makes the del-client discipline
/// exactly-once: whichever path caches a future's value issues it, and the
/// drop of the last handle issues it only when no cache was ever written.
pub(crate) struct RefCore {
  group: GroupRef,
  kind: HandleKind,
  where_: NodeId,
  rid: RefId,
  cache: OnceLock<RemoteResult>,
  /// Serializes local put/fetch transitions of a future.
  lock: AsyncMutex<()>,
}

impl RefCore {
  pub(crate) fn register(
    group: GroupRef,
    kind: HandleKind,
    where_: NodeId,
    rid: RefId,
    cache: Option<RemoteResult>,
  ) -> Arc<Self> {
    let slot: OnceLock<RemoteResult> = OnceLock::new();

    if let Some(value) = cache {
      let _ = slot.set(value);
    }

    Arc::new(Self {
      group,
      kind,
      where_,
      rid,
      cache: slot,
      lock: AsyncMutex::new(()),
    })
  }

  #[inline]
  pub(crate) fn group(&self) -> &GroupRef {
    &self.group
  }

  #[inline]
  pub(crate) fn kind(&self) -> HandleKind {
    self.kind
  }

  #[inline]
  pub(crate) fn owner(&self) -> NodeId {
    self.where_
  }

  #[inline]
  pub(crate) fn rid(&self) -> RefId {
    self.rid
  }

  #[inline]
  pub(crate) fn is_local(&self) -> bool {
    self.where_ == self.group.my_id()
  }

  #[inline]
  pub(crate) fn cache(&self) -> Option<&RemoteResult> {
    self.cache.get()
  }

  #[inline]
  pub(crate) fn lock(&self) -> &AsyncMutex<()> {
    &self.lock
  }

  /// Writes the cache; the winner of the unset-to-set transition issues
  /// this node's del-client, releasing its claim on the owner cell.
  pub(crate) fn set_cache(&self, value: RemoteResult) -> bool {
    let won: bool = self.cache.set(value).is_ok();

    if won {
      gc::send_del_client(&self.group, self.rid, self.where_);
    }

    won
  }

  /// Writes the cache without touching client bookkeeping. Used after a
  /// remote put, where the owner already removed the caller itself.
  pub(crate) fn set_cache_silent(&self, value: RemoteResult) {
    let _ = self.cache.set(value);
  }

  /// Merges a cached value carried by a deserialized duplicate.
  #[inline]
  pub(crate) fn merge_cache(&self, value: RemoteResult) {
    self.set_cache(value);
  }
}

impl Drop for RefCore {
  fn drop(&mut self) {
    // A future whose value was cached already released its claim when the
    // cache was written.
    if self.kind == HandleKind::Channel || self.cache.get().is_none() {
      gc::send_del_client(&self.group, self.rid, self.where_);
    }
  }
}

// -----------------------------------------------------------------------------
// Wire Form
// -----------------------------------------------------------------------------

/// Serializes a handle as `(where, whence, id, cache)`.
///
/// When an encode scope is active (the payload is travelling to a known
/// destination), client bookkeeping happens here: a destination that is
/// neither the owner nor receiving a value-resolved future is
/// pre-registered with the owner via an add-client message, so every live
/// handle is counted before the copy lands.
pub(crate) fn serialize_handle<S>(core: &RefCore, serializer: S) -> Result<S::Ok, S::Error>
where
  S: Serializer,
{
  let cache: Option<RemoteResult> = match core.kind() {
    HandleKind::Future => core.cache().cloned(),
    HandleKind::Channel => None,
  };

  if let Some(scope) = encode_scope() {
    if SharedArc::ptr_eq(&scope.group, core.group()) {
      if cache.is_none() && scope.dest != core.owner() {
        gc::send_add_client(&scope.group, core.rid(), core.owner(), scope.dest);
      }
    } else {
      tracing::warn!(
        rid = %core.rid(),
        "handle serialized across process groups; client tracking skipped",
      );
    }
  }

  (core.owner(), core.rid().whence, core.rid().id, cache).serialize(serializer)
}

/// Reconstructs a handle from its wire form, canonicalizing against the
/// decode scope's group.
pub(crate) fn deserialize_handle<'de, D>(
  kind: HandleKind,
  deserializer: D,
) -> Result<Arc<RefCore>, D::Error>
where
  D: Deserializer<'de>,
{
  let (where_, whence, id, cache): (NodeId, NodeId, u64, Option<RemoteResult>) =
    Deserialize::deserialize(deserializer)?;

  let Some(group) = decode_scope() else {
    return Err(D::Error::custom("remote handle decoded outside a cluster scope"));
  };

  Ok(ProcessGroup::adopt(
    &group,
    HandleOrigin::Decoded,
    kind,
    where_,
    RefId::new(whence, id),
    cache,
  ))
}
