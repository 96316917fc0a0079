//! Process identity, group registry, and cluster bootstrap.

pub(crate) mod group;
pub(crate) mod node;
pub(crate) mod setup;
pub(crate) mod view;

pub use self::node::Node;
pub use self::node::NodeRef;
pub use self::setup::LocalCluster;
pub use self::view::ClusterView;

pub(crate) use self::group::GroupRef;
