use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::future::Future;
use std::sync::OnceLock;
use triomphe::Arc;

use crate::cluster::group::GroupRef;
use crate::cluster::view::ClusterView;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::Role;

pub type NodeRef = Arc<Node>;

tokio::task_local! {
  static AMBIENT_ROLE: Role;
}

/// Returns the role the current task executes under, if any.
///
/// Message-handler tasks run scoped to the role of the group their message
/// arrived on; everything else sees no ambient role and falls back to the
/// node's static resolution.
pub(crate) fn ambient_role() -> Option<Role> {
  AMBIENT_ROLE.try_with(|role| *role).ok()
}

/// Runs a future with the given ambient role.
pub(crate) async fn scope_role<F>(role: Role, future: F) -> F::Output
where
  F: Future,
{
  AMBIENT_ROLE.scope(role, future).await
}

// -----------------------------------------------------------------------------
// Node
// -----------------------------------------------------------------------------

/// One process of the runtime, holding its role-indexed group views.
///
/// A node is a worker of at most one cluster and the master of at most one
/// subordinate cluster; the two views are independent process groups with
/// independent ids and reference tables.
pub struct Node {
  master: OnceLock<GroupRef>,
  worker: OnceLock<GroupRef>,
}

impl Node {
  pub(crate) fn create() -> NodeRef {
    Arc::new(Self {
      master: OnceLock::new(),
      worker: OnceLock::new(),
    })
  }

  /// Installs a group as this node's view for the group's role.
  pub(crate) fn install(&self, group: GroupRef) -> Result<(), ClusterError> {
    let slot: &OnceLock<GroupRef> = match group.tag() {
      Role::Master => &self.master,
      Role::Worker => &self.worker,
      Role::Default => {
        return Err(ClusterError::reference("a group view needs a concrete role"));
      }
    };

    if slot.set(group).is_err() {
      return Err(ClusterError::reference("node already holds a view for this role"));
    }

    Ok(())
  }

  fn resolve(&self, role: Role) -> Result<&GroupRef, ClusterError> {
    match role {
      Role::Master => self.master.get().ok_or_else(|| {
        ClusterError::reference("this node masters no cluster")
      }),
      Role::Worker => self.worker.get().ok_or_else(|| {
        ClusterError::reference("this node is not a worker of any cluster")
      }),
      Role::Default => {
        if let Some(role) = ambient_role() {
          return self.resolve(role);
        }

        // Outer calls prefer the mastered group when one exists.
        match self.master.get() {
          Some(group) => Ok(group),
          None => self.resolve(Role::Worker),
        }
      }
    }
  }

  /// Returns the cluster view selected by `role`.
  pub fn view(&self, role: Role) -> Result<ClusterView, ClusterError> {
    self.resolve(role).map(|group| ClusterView::new(GroupRef::clone(group)))
  }

  /// This node's id within the group selected by `role`.
  pub fn my_id(&self, role: Role) -> Result<NodeId, ClusterError> {
    self.resolve(role).map(|group| group.my_id())
  }
}

impl Debug for Node {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(
      f,
      "Node(master: {:?}, worker: {:?})",
      self.master.get().map(|group| group.my_id()),
      self.worker.get().map(|group| group.my_id()),
    )
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
