use crossbeam_utils::CachePadded;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::core::NodeId;

/// Reference identity of a remote value.
///
/// The pair `(whence, id)` uniquely identifies a reference across the whole
/// cluster: `whence` is the node that created the reference and `id` is drawn
/// from that node's monotonic [`RefSource`]. The owner node (`where`) is *not*
/// part of the identity; handles carry it separately as routing information.
///
/// # Format
///
/// References display as `#ref<whence.id>`, e.g. `#ref<2.17>`.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefId {
  /// The node on which the reference was created.
  pub whence: NodeId,
  /// The creating node's sequence number for this reference.
  pub id: u64,
}

impl RefId {
  /// The null identity, denoting "no response expected" in frame headers.
  pub const NULL: Self = Self {
    whence: NodeId::NULL,
    id: 0,
  };

  /// Creates a reference identity from its parts.
  #[inline]
  pub const fn new(whence: NodeId, id: u64) -> Self {
    Self { whence, id }
  }

  /// Returns `true` if this is the null identity.
  #[inline]
  pub const fn is_null(self) -> bool {
    self.whence.is_null() && self.id == 0
  }
}

impl Debug for RefId {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    Display::fmt(self, f)
  }
}

impl Display for RefId {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    write!(f, "#ref<{}.{}>", self.whence, self.id)
  }
}

// -----------------------------------------------------------------------------
// Ref Source
// -----------------------------------------------------------------------------

/// Monotonic generator producing the `id` component of fresh [`RefId`]s.
///
/// Each process group owns one source; ids start at 1 so that `(whence, 0)`
/// can never collide with [`RefId::NULL`].
pub(crate) struct RefSource {
  next: CachePadded<AtomicU64>,
}

impl RefSource {
  #[inline]
  pub(crate) fn new() -> Self {
    Self {
      next: CachePadded::new(AtomicU64::new(1)),
    }
  }

  /// Returns a fresh reference identity created by `whence`.
  #[inline]
  pub(crate) fn next(&self, whence: NodeId) -> RefId {
    RefId::new(whence, self.next.fetch_add(1, Ordering::Relaxed))
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
