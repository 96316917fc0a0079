use serde::Deserialize;
use serde::Serialize;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result;

/// Cluster-unique integer naming a participating process.
///
/// Ids are assigned per process group: the master is always [`NodeId::MASTER`]
/// and workers receive increasing ids as they join. A process participating in
/// two groups (as a worker of one and the master of a subordinate one) has an
/// independent id in each.
///
/// The reserved value [`NodeId::NULL`] never names a process; it appears in
/// frame headers to mean "no response expected".
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeId(u64);

impl NodeId {
  /// The reserved null id.
  pub const NULL: Self = Self(0);

  /// The id of the group master.
  pub const MASTER: Self = Self(1);

  /// Creates a node id from its raw integer value.
  #[inline]
  pub const fn new(value: u64) -> Self {
    Self(value)
  }

  /// Returns the raw integer value of this id.
  #[inline]
  pub const fn get(self) -> u64 {
    self.0
  }

  /// Returns `true` if this is the reserved null id.
  #[inline]
  pub const fn is_null(self) -> bool {
    self.0 == Self::NULL.0
  }

  /// Returns `true` if this id names the group master.
  #[inline]
  pub const fn is_master(self) -> bool {
    self.0 == Self::MASTER.0
  }
}

impl Debug for NodeId {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    Display::fmt(self, f)
  }
}

impl Display for NodeId {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    write!(f, "{}", self.0)
  }
}

impl From<u64> for NodeId {
  #[inline]
  fn from(value: u64) -> Self {
    Self(value)
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
