//! In-process cluster bootstrap.
//!
//! The transport collaborator shipped with the crate: nodes are wired with
//! in-memory duplex byte pipes, which provide the ordered reliable
//! bidirectional streams the link layer requires. The same machinery backs
//! both top-level clusters and subordinate (multiscale) clusters, where an
//! existing worker node becomes the id-1 master of a fresh group.

use std::time::Duration;
use std::time::SystemTime;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use triomphe::Arc;

use crate::cluster::group::GroupRef;
use crate::cluster::group::ProcessGroup;
use crate::cluster::node::Node;
use crate::cluster::node::NodeRef;
use crate::cluster::view::ClusterView;
use crate::consts::HANDSHAKE_TIMEOUT;
use crate::consts::LEN_COOKIE;
use crate::consts::LEN_VERSION;
use crate::consts::TEARDOWN_TIMEOUT;
use crate::consts::WIRE_VERSION;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::Role;
use crate::net::frame::FrameCodec;
use crate::net::frame::Header;
use crate::net::link::BoxedRead;
use crate::net::link::Peer;
use crate::net::link::PeerRef;
use crate::net::message::Message;
use crate::rpc::exec::serve_link;

const DUPLEX_CAPACITY: usize = 256 * 1024;

type Framed = FramedRead<BoxedRead, FrameCodec>;

/// A cluster of in-process nodes: one master plus `n` workers, fully
/// connected.
pub struct LocalCluster {
  master: NodeRef,
  master_group: GroupRef,
  workers: Vec<(NodeId, NodeRef)>,
  groups: Vec<GroupRef>,
  tasks: Vec<JoinHandle<()>>,
}

impl LocalCluster {
  /// Starts a fresh cluster with `count` workers (cluster ids 2..).
  pub async fn start(count: usize) -> Result<Self, ClusterError> {
    Self::start_under(&Node::create(), count).await
  }

  /// Starts a subordinate cluster mastered by an existing node.
  ///
  /// The node keeps its worker view of the enclosing cluster and gains a
  /// master view of the new one, in which it is id 1.
  pub async fn start_under(master: &NodeRef, count: usize) -> Result<Self, ClusterError> {
    let master_group: GroupRef = ProcessGroup::spawn(NodeId::MASTER, Role::Master);

    master.install(GroupRef::clone(&master_group))?;

    let cookie: [u8; LEN_COOKIE] = generate_cookie();
    let mut groups: Vec<GroupRef> = vec![GroupRef::clone(&master_group)];
    let mut workers: Vec<(NodeId, NodeRef)> = Vec::with_capacity(count);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    for index in 0..count {
      let id: NodeId = NodeId::new(index as u64 + 2);
      let node: NodeRef = Node::create();
      let group: GroupRef = ProcessGroup::spawn(id, Role::Worker);

      node.install(GroupRef::clone(&group))?;
      groups.push(GroupRef::clone(&group));
      workers.push((id, node));
    }

    // Full mesh: the higher id initiates, validating the shared cookie at
    // the lower-id end.
    for lhs in 0..groups.len() {
      for rhs in (lhs + 1)..groups.len() {
        link_pair(&groups[rhs], &groups[lhs], &cookie, &mut tasks).await?;
      }
    }

    // Deliver the roster to every worker; each acknowledges with a
    // join-complete on its serve loop.
    let roster: Vec<NodeId> = master_group.procs();

    for (id, _) in &workers {
      let peer: PeerRef = master_group.peer(*id)?;
      let message: Message = Message::JoinPgrp {
        self_id: *id,
        peers: roster.clone(),
      };

      peer.send_msg(Header::NULL, &message, true).await?;
    }

    tracing::info!(workers = count, "cluster started");

    Ok(Self {
      master: NodeRef::clone(master),
      master_group,
      workers,
      groups,
      tasks,
    })
  }

  /// The master node.
  pub fn master_node(&self) -> &NodeRef {
    &self.master
  }

  /// The master's view of the cluster.
  pub fn master(&self) -> ClusterView {
    ClusterView::new(GroupRef::clone(&self.master_group))
  }

  /// The node running worker `pid`.
  pub fn node(&self, pid: NodeId) -> Option<&NodeRef> {
    self
      .workers
      .iter()
      .find(|(id, _)| *id == pid)
      .map(|(_, node)| node)
  }

  /// Worker `pid`'s view of the cluster.
  pub fn worker(&self, pid: NodeId) -> Result<ClusterView, ClusterError> {
    match self.node(pid) {
      Some(node) => node.view(Role::Worker),
      None => Err(ClusterError::transport(format_args!(
        "no worker {pid} in this cluster",
      ))),
    }
  }

  /// Drains pending GC traffic and tears the cluster down.
  pub async fn shutdown(self) -> Result<(), ClusterError> {
    for group in &self.groups {
      if timeout(TEARDOWN_TIMEOUT, group.drain_gc()).await.is_err() {
        tracing::warn!(id = %group.my_id(), "gc drain timed out at teardown");
      }
    }

    for group in &self.groups {
      for peer in group.peers() {
        peer.mark_terminated();
      }

      group.shutdown();
    }

    for task in self.tasks {
      task.abort();
    }

    Ok(())
  }
}

// -----------------------------------------------------------------------------
// Link Establishment
// -----------------------------------------------------------------------------

/// Connects two groups with a duplex pipe and runs the handshake.
///
/// The initiator opens with the cookie and the fixed-width version string;
/// both sides then exchange identification frames and acks. Only after the
/// ack does either link leave the created state.
async fn link_pair(
  init: &GroupRef,
  resp: &GroupRef,
  cookie: &[u8; LEN_COOKIE],
  tasks: &mut Vec<JoinHandle<()>>,
) -> Result<(), ClusterError> {
  timeout(HANDSHAKE_TIMEOUT, async {
    let (init_stream, resp_stream) = tokio::io::duplex(DUPLEX_CAPACITY);
    let (init_read, mut init_write) = tokio::io::split(init_stream);
    let (resp_read, resp_write) = tokio::io::split(resp_stream);

    // Prelude: cookie, then version, raw on the wire.
    init_write.write_all(cookie).await?;
    init_write.write_all(&version_bytes()).await?;

    let mut resp_read = resp_read;
    let mut prelude: [u8; LEN_COOKIE + LEN_VERSION] = [0; LEN_COOKIE + LEN_VERSION];

    resp_read.read_exact(&mut prelude).await?;

    if prelude[..LEN_COOKIE] != cookie[..] {
      return Err(ClusterError::transport("cluster cookie mismatch"));
    }

    if prelude[LEN_COOKIE..] != version_bytes()[..] {
      return Err(ClusterError::transport("wire version mismatch"));
    }

    let init_peer: PeerRef = init.insert_peer(Peer::new(resp.my_id(), Box::new(init_write)));
    let resp_peer: PeerRef = resp.insert_peer(Peer::new(init.my_id(), Box::new(resp_write)));

    let mut init_framed: Framed = FramedRead::new(
      Box::new(init_read) as BoxedRead,
      FrameCodec::new(Arc::clone(init_peer.counters())),
    );
    let mut resp_framed: Framed = FramedRead::new(
      Box::new(resp_read) as BoxedRead,
      FrameCodec::new(Arc::clone(resp_peer.counters())),
    );

    // Identification: both sides name themselves, then acknowledge. The
    // pipe buffers enough to drive this sequentially.
    let identify = Message::IdentifySocket {
      from: init.my_id(),
    };

    init_peer.send_msg(Header::NULL, &identify, true).await?;

    let identify = Message::IdentifySocket {
      from: resp.my_id(),
    };

    resp_peer.send_msg(Header::NULL, &identify, true).await?;

    expect_identify(&mut init_framed, resp.my_id()).await?;
    expect_identify(&mut resp_framed, init.my_id()).await?;

    init_peer.send_msg(Header::NULL, &Message::IdentifySocketAck, true).await?;
    resp_peer.send_msg(Header::NULL, &Message::IdentifySocketAck, true).await?;

    expect_ack(&mut init_framed).await?;
    expect_ack(&mut resp_framed).await?;

    init_peer.mark_connected();
    resp_peer.mark_connected();

    tasks.push(tokio::spawn(serve_link(
      GroupRef::clone(init),
      init_peer,
      init_framed,
    )));
    tasks.push(tokio::spawn(serve_link(
      GroupRef::clone(resp),
      resp_peer,
      resp_framed,
    )));

    Ok(())
  })
  .await
  .map_err(|_| ClusterError::transport("handshake timed out"))?
}

async fn next_message(framed: &mut Framed) -> Result<Message, ClusterError> {
  use futures::StreamExt;

  match framed.next().await {
    Some(frame) => Message::decode(&frame?.body),
    None => Err(ClusterError::transport("link closed during handshake")),
  }
}

async fn expect_identify(framed: &mut Framed, from: NodeId) -> Result<(), ClusterError> {
  match next_message(framed).await? {
    Message::IdentifySocket { from: id } if id == from => Ok(()),
    Message::IdentifySocket { from: id } => Err(ClusterError::transport(format_args!(
      "peer identified as {id}, expected {from}",
    ))),
    other => Err(ClusterError::protocol(format_args!(
      "expected identification, got {}",
      other.name(),
    ))),
  }
}

async fn expect_ack(framed: &mut Framed) -> Result<(), ClusterError> {
  match next_message(framed).await? {
    Message::IdentifySocketAck => Ok(()),
    other => Err(ClusterError::protocol(format_args!(
      "expected identification ack, got {}",
      other.name(),
    ))),
  }
}

fn version_bytes() -> [u8; LEN_VERSION] {
  let mut bytes: [u8; LEN_VERSION] = [b' '; LEN_VERSION];

  bytes[..WIRE_VERSION.len()].copy_from_slice(WIRE_VERSION.as_bytes());
  bytes
}

/// Derives a per-cluster cookie from wall-clock entropy and the process id.
fn generate_cookie() -> [u8; LEN_COOKIE] {
  let now: Duration = SystemTime::now()
    .duration_since(SystemTime::UNIX_EPOCH)
    .unwrap_or(Duration::ZERO);

  let mut seed: u64 = now.as_secs()
    ^ ((now.subsec_nanos() as u64) << 32)
    ^ (std::process::id() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);

  let mut cookie: [u8; LEN_COOKIE] = [0; LEN_COOKIE];

  for chunk in cookie.chunks_mut(8) {
    // splitmix64 step
    seed = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut mixed: u64 = seed;
    mixed = (mixed ^ (mixed >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    mixed = (mixed ^ (mixed >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    mixed ^= mixed >> 31;
    chunk.copy_from_slice(&mixed.to_le_bytes()[..chunk.len()]);
  }

  cookie
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::cluster::setup::LocalCluster;
  use crate::cluster::setup::generate_cookie;
  use crate::core::NodeId;

  #[test]
  fn test_cookie_varies() {
    let first: [u8; 16] = generate_cookie();

    std::thread::sleep(std::time::Duration::from_millis(2));

    assert_ne!(first, generate_cookie());
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_start_wires_full_mesh() {
    let cluster: LocalCluster = LocalCluster::start(2).await.unwrap();

    assert_eq!(
      cluster.master().procs(),
      vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)],
    );
    assert_eq!(
      cluster.worker(NodeId::new(3)).unwrap().procs(),
      vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)],
    );

    cluster.shutdown().await.unwrap();
  }
}
