//! End-to-end scenarios over in-process clusters: RPC primitives, remote
//! references, distributed GC, and multiscale groups.

mod common;

use std::time::Duration;

use weft::error::FaultKind;
use weft::types::Callable;
use weft::types::ClusterView;
use weft::types::LocalCluster;
use weft::types::NodeId;
use weft::types::RemoteChannel;
use weft::types::RemoteFuture;
use weft::types::Role;

use common::SETUP;
use common::eventually;

const W2: NodeId = NodeId::new(2);
const W3: NodeId = NodeId::new(3);

async fn cluster() -> LocalCluster {
  *SETUP;
  LocalCluster::start(2).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn remotecall_fetch_round_trips_values() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();

  let num: u64 = master
    .remotecall_fetch(Callable::func("identity_u64"), W2, &17u64)
    .await
    .unwrap();

  assert_eq!(num, 17);

  let text: String = master
    .remotecall_fetch(Callable::func("identity_string"), W3, "hello")
    .await
    .unwrap();

  assert_eq!(text, "hello");

  let blob: Vec<u8> = master
    .remotecall_fetch(Callable::func("identity_bytes"), W2, &vec![7u8; 4096])
    .await
    .unwrap();

  assert_eq!(blob, vec![7u8; 4096]);

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn remotecall_returns_a_fetchable_future() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();

  let sum: RemoteFuture<u64> = master
    .remotecall(Callable::func("add"), W2, &(20u64, 22u64))
    .await
    .unwrap();

  assert_eq!(sum.fetch().await.unwrap(), 42);

  // The value is cached: a second fetch answers locally, with no new
  // frames on the link. Let the del-client flush from the first fetch
  // settle before snapshotting traffic.
  tokio::time::sleep(Duration::from_millis(100)).await;

  let counters = master.counters(W2).unwrap();
  let frames: u64 = counters.frames_tx();

  assert_eq!(sum.fetch().await.unwrap(), 42);
  assert_eq!(counters.frames_tx(), frames);

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn future_is_single_assignment() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();

  let future: RemoteFuture<u64> = master.future(W2);

  future.put(&7).await.unwrap();

  let error = future.put(&8).await.unwrap_err();

  assert_eq!(error.kind(), FaultKind::Reference);
  assert_eq!(future.fetch().await.unwrap(), 7);
  assert_eq!(future.fetch().await.unwrap(), 7);

  // A shared copy of the handle sees the same resolved state.
  assert!(future.clone().put(&9).await.is_err());

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn third_party_channel_put_and_take() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();

  // All four placements of (putter, taker) over the two workers.
  for (putter, taker) in [(W2, W3), (W3, W2), (W2, W2), (W3, W3)] {
    let chan: RemoteChannel<u64> = master.remote_channel(NodeId::MASTER).await.unwrap();

    master
      .remote_do(Callable::func("chan_put"), putter, &(&chan, 5u64))
      .await
      .unwrap();

    let taken: u64 = master
      .remotecall_fetch(Callable::func("chan_take"), taker, &(&chan,))
      .await
      .unwrap();

    assert_eq!(taken, 5);
  }

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rendezvous_take_hands_over_exactly_once() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();

  // Unbuffered channel owned by worker 2; the putter runs on the owner,
  // the taker on worker 3, exercising the synctake discipline.
  let chan: RemoteChannel<u64> = master.remote_channel_with(W2, Some(0)).await.unwrap();

  master
    .remote_do(Callable::func("chan_put"), W2, &(&chan, 11u64))
    .await
    .unwrap();

  let taken: u64 = master
    .remotecall_fetch(Callable::func("chan_take"), W3, &(&chan,))
    .await
    .unwrap();

  assert_eq!(taken, 11);

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_close_drains_buffered_items() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();

  let chan: RemoteChannel<u64> = master.remote_channel_with(W2, None).await.unwrap();

  chan.put(&1).await.unwrap();
  chan.put(&2).await.unwrap();
  chan.close().await.unwrap();

  assert!(!chan.is_open().await.unwrap());
  assert_eq!(chan.next().await.unwrap(), Some(1));
  assert_eq!(chan.next().await.unwrap(), Some(2));
  assert_eq!(chan.next().await.unwrap(), None);

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn remotecall_wait_returns_after_completion() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();

  let done: RemoteFuture<NodeId> = master
    .remotecall_wait(Callable::func("sleep_then_id"), W2, &50u64)
    .await
    .unwrap();

  // The computation already finished, so the result cell is ready.
  assert!(done.is_ready().await.unwrap());
  assert_eq!(done.fetch().await.unwrap(), W2);

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_failures_are_unwrapped() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();

  let error = master
    .remotecall_fetch::<_, u64>(Callable::func("boom"), W2, &())
    .await
    .unwrap_err();

  assert_eq!(error.kind(), FaultKind::User);
  assert_eq!(error.remote().unwrap().pid, W2);

  let error = master
    .remotecall_fetch::<_, u64>(Callable::func("panics"), W3, &())
    .await
    .unwrap_err();

  assert_eq!(error.kind(), FaultKind::User);
  assert!(error.message().contains("panicked"));

  // A future resolves to the same failure on fetch.
  let failed: RemoteFuture<u64> = master
    .remotecall(Callable::func("boom"), W2, &())
    .await
    .unwrap();

  assert_eq!(failed.fetch().await.unwrap_err().kind(), FaultKind::User);

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_function_reports_user_fault() {
  let cluster: LocalCluster = cluster().await;

  let error = cluster
    .master()
    .remotecall_fetch::<_, u64>(Callable::func("no_such_fn"), W2, &())
    .await
    .unwrap_err();

  assert_eq!(error.kind(), FaultKind::User);
  assert!(error.message().contains("not registered"));

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_futures_shrink_owner_refs_with_coalesced_dels() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();
  let on_worker: ClusterView = cluster.worker(W2).unwrap();

  // Settle startup traffic, then snapshot.
  let warm: u64 = master
    .remotecall_fetch(Callable::func("identity_u64"), W2, &0u64)
    .await
    .unwrap();

  assert_eq!(warm, 0);

  let baseline: usize = on_worker.refs_len();
  let mut futures: Vec<RemoteFuture<u64>> = Vec::new();

  for index in 0..300u64 {
    futures.push(
      master
        .remotecall(Callable::func("identity_u64"), W2, &index)
        .await
        .unwrap(),
    );
  }

  // Let every computation land in its cell before measuring del traffic.
  let last: u64 = master
    .remotecall_fetch(Callable::func("identity_u64"), W2, &1u64)
    .await
    .unwrap();

  assert_eq!(last, 1);
  assert!(
    eventually(Duration::from_secs(5), || {
      on_worker.refs_len() >= baseline + 300
    })
    .await,
    "expected 300 owner cells, saw {}",
    on_worker.refs_len(),
  );

  let counters = master.counters(W2).unwrap();
  let frames_before: u64 = counters.frames_tx();

  drop(futures);

  assert!(
    eventually(Duration::from_secs(5), || on_worker.refs_len() <= baseline).await,
    "owner refs did not shrink back: {} > {}",
    on_worker.refs_len(),
    baseline,
  );

  // Deletions were coalesced: far fewer frames than dropped handles.
  let frames_spent: u64 = counters.frames_tx() - frames_before;

  assert!(
    frames_spent < 60,
    "expected coalesced del batches, saw {frames_spent} frames for 300 drops",
  );

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn handles_canonicalize_on_identity() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();

  let chan: RemoteChannel<u64> = master.remote_channel(W2).await.unwrap();
  let copy: RemoteChannel<u64> = chan.clone();

  assert_eq!(chan, copy);
  assert_eq!(chan.id(), copy.id());

  use std::collections::hash_map::DefaultHasher;
  use std::hash::Hash;
  use std::hash::Hasher;

  let hash = |value: &RemoteChannel<u64>| {
    let mut hasher: DefaultHasher = DefaultHasher::new();

    value.hash(&mut hasher);
    hasher.finish()
  };

  assert_eq!(hash(&chan), hash(&copy));

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_can_master_a_subordinate_cluster() {
  let cluster: LocalCluster = cluster().await;
  let node = cluster.node(W2).unwrap().clone();

  // Worker 2 of the outer cluster becomes id 1 of a sub-cluster.
  let sub: LocalCluster = LocalCluster::start_under(&node, 1).await.unwrap();

  assert_eq!(node.my_id(Role::Worker).unwrap(), W2);
  assert_eq!(node.my_id(Role::Master).unwrap(), NodeId::MASTER);

  // Reach a sub-worker through the node's master view.
  let inner: ClusterView = node.view(Role::Master).unwrap();
  let value: u64 = inner
    .remotecall_fetch(Callable::func("identity_u64"), W2, &99u64)
    .await
    .unwrap();

  assert_eq!(value, 99);

  // The outer cluster still works through the worker view.
  let outer: ClusterView = node.view(Role::Worker).unwrap();
  let value: u64 = outer
    .remotecall_fetch(Callable::func("identity_u64"), NodeId::MASTER, &7u64)
    .await
    .unwrap();

  assert_eq!(value, 7);

  sub.shutdown().await.unwrap();
  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_wait_expires_on_unset_future() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();

  let future: RemoteFuture<u64> = master.future(W2);

  assert!(!future.timed_wait(Duration::from_millis(50)).await.unwrap());

  future.put(&3).await.unwrap();
  assert!(future.timed_wait(Duration::from_millis(50)).await.unwrap());

  cluster.shutdown().await.unwrap();
}
