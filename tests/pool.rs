//! Pooled execution scenarios: worker pools, the default pool, and the
//! callable-caching pool.

mod common;

use std::time::Duration;

use weft::error::FaultKind;
use weft::types::CachingPool;
use weft::types::Callable;
use weft::types::ClusterView;
use weft::types::LocalCluster;
use weft::types::NodeId;
use weft::types::RemoteFuture;
use weft::types::WorkerPool;

use common::SETUP;

const W2: NodeId = NodeId::new(2);
const W3: NodeId = NodeId::new(3);

async fn cluster() -> LocalCluster {
  *SETUP;
  LocalCluster::start(2).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_distributes_work_evenly() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();
  let pool: WorkerPool = WorkerPool::new(&master, vec![W2, W3]).await.unwrap();

  let mut futures: Vec<RemoteFuture<NodeId>> = Vec::new();

  for _ in 0..4 {
    futures.push(
      pool
        .remotecall(Callable::func("sleep_then_id"), &100u64)
        .await
        .unwrap(),
    );
  }

  let mut on_w2: usize = 0;
  let mut on_w3: usize = 0;

  for future in &futures {
    match future.fetch().await.unwrap() {
      id if id == W2 => on_w2 += 1,
      id if id == W3 => on_w3 += 1,
      id => panic!("ran on unexpected worker {id}"),
    }
  }

  assert_eq!(on_w2, 2);
  assert_eq!(on_w3, 2);

  // Workers return to the pool once their computations are observed done.
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

  while pool.len().await.unwrap() < 2 {
    assert!(tokio::time::Instant::now() < deadline, "workers never released");
    tokio::time::sleep(Duration::from_millis(20)).await;
  }

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_with_no_members_fails_while_default_substitutes_master() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();

  let empty: WorkerPool = WorkerPool::new(&master, vec![]).await.unwrap();
  let error = empty.take().await.unwrap_err();

  assert_eq!(error.kind(), FaultKind::Pool);

  // A default pool of a worker-less cluster hands out the master itself.
  let lonely: LocalCluster = LocalCluster::start(0).await.unwrap();
  let value: u64 = lonely
    .master()
    .default_pool()
    .await
    .unwrap()
    .remotecall_fetch(Callable::func("identity_u64"), &23u64)
    .await
    .unwrap();

  assert_eq!(value, 23);

  lonely.shutdown().await.unwrap();
  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn workers_fetch_the_default_pool_from_the_master() {
  let cluster: LocalCluster = cluster().await;
  let on_worker: ClusterView = cluster.worker(W3).unwrap();

  // First access forwards to the master and caches the handle.
  let pool: WorkerPool = on_worker.default_pool().await.unwrap();

  assert_eq!(pool.workers().await.unwrap(), vec![W2, W3]);

  let value: u64 = pool
    .remotecall_fetch(Callable::func("identity_u64"), &5u64)
    .await
    .unwrap();

  assert_eq!(value, 5);

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_releases_worker_on_submission_failure() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();
  let pool: WorkerPool = WorkerPool::new(&master, vec![W2]).await.unwrap();

  // An unregistered function fails at execution, not submission; the
  // worker still comes back.
  let _ = pool
    .remotecall_fetch::<_, u64>(Callable::func("no_such_fn"), &())
    .await
    .unwrap_err();

  assert_eq!(pool.len().await.unwrap(), 1);
  assert_eq!(pool.take().await.unwrap(), W2);

  cluster.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn caching_pool_ships_the_environment_once_per_worker() {
  let cluster: LocalCluster = cluster().await;
  let master: ClusterView = cluster.master();

  let env: Vec<u8> = vec![42u8; 200_000];
  let func: Callable = Callable::closure("len_plus", &env).unwrap();
  let pool: CachingPool = CachingPool::new(&master, vec![W2, W3]).await.unwrap();

  let counters_w2 = master.counters(W2).unwrap();
  let counters_w3 = master.counters(W3).unwrap();

  let mut total_before: u64 = counters_w2.bytes_tx() + counters_w3.bytes_tx();
  let mut heavy_sends: usize = 0;

  for index in 0..10u64 {
    let value: u64 = pool
      .remotecall_fetch(func.clone(), &index)
      .await
      .unwrap();

    assert_eq!(value, 200_000 + index);

    let total_after: u64 = counters_w2.bytes_tx() + counters_w3.bytes_tx();

    if total_after - total_before > 100_000 {
      heavy_sends += 1;
    }

    total_before = total_after;
  }

  // The closure environment crossed each link at most once.
  assert_eq!(heavy_sends, 2, "environment was re-sent to a cached worker");

  pool.clear();

  cluster.shutdown().await.unwrap();
}
