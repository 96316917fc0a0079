use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result;

/// Selector for which process-group view an operation consults.
///
/// A process may simultaneously be a worker in one cluster and the master of
/// a subordinate cluster. Every cluster-facing operation resolves a role to
/// pick between the two views:
///
/// - [`Master`]: the group this process masters.
/// - [`Worker`]: the group this process belongs to as a worker.
/// - [`Default`]: whichever group the surrounding dynamic context implies; a
///   thunk executing on behalf of a remote caller inherits the view its
///   message arrived on, while outer calls prefer the mastered group.
///
/// [`Master`]: Role::Master
/// [`Worker`]: Role::Worker
/// [`Default`]: Role::Default
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum Role {
  /// Resolve from the ambient dynamic context.
  #[default]
  Default,
  /// The group this process masters.
  Master,
  /// The group this process belongs to as a worker.
  Worker,
}

impl Display for Role {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    match self {
      Self::Default => f.write_str("default"),
      Self::Master => f.write_str("master"),
      Self::Worker => f.write_str("worker"),
    }
  }
}
